// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named inter-process notification events, backed by auto-reset Win32
//! events. `signal` wakes at most one waiter; `wait` blocks until the event
//! is set and consumes it.

use crate::platform::windows::security::SecurityAttributes;
use mlos_shm::channel::ChannelEvent;
use std::ffi::{CStr, CString};
use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use winapi::um::synchapi::{CreateEventA, SetEvent, WaitForSingleObject};
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

pub struct NamedEvent {
    handle: OwnedHandle,
    name: CString,
}

// SAFETY: SetEvent/WaitForSingleObject are thread-safe on the same handle.
unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    pub fn create_or_open(name: CString) -> io::Result<NamedEvent> {
        let object_name = CString::new(format!(
            "Local\\{}",
            String::from_utf8_lossy(name.as_bytes().strip_prefix(b"/").unwrap_or(name.as_bytes()))
        ))?;
        let mut security = SecurityAttributes::owner_restricted()?;
        let handle = unsafe {
            CreateEventA(
                security.as_mut_ptr(),
                0, // auto-reset
                0, // initially unsignaled
                object_name.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedEvent {
            handle: unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) },
            name,
        })
    }

    pub fn name(&self) -> &CStr {
        self.name.as_c_str()
    }

    pub fn signal(&self) -> io::Result<()> {
        if unsafe { SetEvent(self.handle.as_raw_handle() as HANDLE) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&self) -> io::Result<()> {
        let result = unsafe { WaitForSingleObject(self.handle.as_raw_handle() as HANDLE, INFINITE) };
        if result != WAIT_OBJECT_0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Kernel objects disappear with their last handle; nothing to unlink.
    pub fn set_cleanup_on_close(&mut self, _cleanup: bool) {}
}

impl ChannelEvent for NamedEvent {
    fn signal(&self) -> io::Result<()> {
        NamedEvent::signal(self)
    }

    fn wait(&self) -> io::Result<()> {
        NamedEvent::wait(self)
    }
}

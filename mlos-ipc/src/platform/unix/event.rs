// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named inter-process notification events, backed by POSIX named
//! semaphores.
//!
//! `signal` posts the semaphore and wakes at most one waiter, but multiple
//! posts coalesce into the semaphore count, so a waiter can also return
//! without a fresh post. The channel protocol re-checks its state after
//! every wakeup, which makes both behaviors harmless.

use mlos_shm::channel::ChannelEvent;
use std::ffi::{CStr, CString};
use std::io;
use std::ptr::NonNull;

pub struct NamedEvent {
    sem: NonNull<libc::sem_t>,
    name: CString,
    cleanup_on_close: bool,
}

// SAFETY: sem_post/sem_wait are async-signal-safe and thread-safe on the
// same sem_t.
unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    /// Opens the named semaphore, creating it with a zero count when it
    /// does not exist yet. Names must start with a `/`.
    pub fn create_or_open(name: CString) -> io::Result<NamedEvent> {
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
                0 as libc::c_uint,
            )
        };
        if std::ptr::eq(sem, libc::SEM_FAILED) {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedEvent {
            // SEM_FAILED is the only null-ish failure value
            sem: unsafe { NonNull::new_unchecked(sem) },
            name,
            cleanup_on_close: false,
        })
    }

    pub fn name(&self) -> &CStr {
        self.name.as_c_str()
    }

    /// Wakes at most one waiter.
    pub fn signal(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until signaled.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// When set, dropping the event unlinks the semaphore name.
    pub fn set_cleanup_on_close(&mut self, cleanup: bool) {
        self.cleanup_on_close = cleanup;
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        unsafe {
            _ = libc::sem_close(self.sem.as_ptr());
        }
        if self.cleanup_on_close {
            unsafe {
                _ = libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

impl ChannelEvent for NamedEvent {
    fn signal(&self) -> io::Result<()> {
        NamedEvent::signal(self)
    }

    fn wait(&self) -> io::Result<()> {
        NamedEvent::wait(self)
    }
}

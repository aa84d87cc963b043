// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::platform::windows::security::SecurityAttributes;
use crate::platform::{
    page_aligned_size, FileBackedHandle, MappedMem, MemoryHandle, NamedShmHandle, RegionHandle,
    ShmHandle, ShmPath,
};
use std::ffi::{CStr, CString};
use std::io::{self, Error};
use std::mem::MaybeUninit;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::sync::atomic::{AtomicU32, Ordering};
use winapi::shared::minwindef::DWORD;
use winapi::um::memoryapi::{MapViewOfFile, UnmapViewOfFile, VirtualQuery, FILE_MAP_WRITE};
use winapi::um::winbase::{CreateFileMappingA, OpenFileMappingA};
use winapi::shared::winerror::ERROR_ALREADY_EXISTS;
use winapi::um::winnt::{HANDLE, LPCSTR, MEMORY_BASIC_INFORMATION, PAGE_READWRITE};

impl FromRawHandle for RegionHandle {
    /// # Safety
    /// `handle` must be a valid, open file mapping handle; the region
    /// handle takes exclusive ownership of it.
    unsafe fn from_raw_handle(handle: RawHandle) -> RegionHandle {
        OwnedHandle::from_raw_handle(handle).into()
    }
}

impl AsRawHandle for RegionHandle {
    fn as_raw_handle(&self) -> RawHandle {
        self.inner.as_raw_handle()
    }
}

pub(crate) fn mmap_handle<T: FileBackedHandle>(mut handle: T) -> io::Result<MappedMem<T>> {
    let shm = handle.get_shm_mut();
    let ptr = unsafe {
        MapViewOfFile(shm.handle.as_raw_handle() as HANDLE, FILE_MAP_WRITE, 0, 0, 0)
    };
    if ptr.is_null() {
        return Err(Error::last_os_error());
    }
    if shm.size == 0 {
        // A freshly opened mapping does not know its size yet. Query it.
        shm.size = unsafe {
            let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
            if VirtualQuery(
                ptr,
                info.as_mut_ptr(),
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            ) == 0
            {
                return Err(Error::last_os_error());
            }
            info.assume_init().RegionSize
        };
    }
    Ok(MappedMem { ptr, mem: handle })
}

pub(crate) fn munmap_handle<T: MemoryHandle>(mapped: &mut MappedMem<T>) {
    unsafe {
        UnmapViewOfFile(mapped.ptr.cast_const());
    }
}

fn alloc_shm(name: LPCSTR, size: usize) -> io::Result<(RawHandle, bool)> {
    let mut security = SecurityAttributes::owner_restricted()?;
    let handle = unsafe {
        CreateFileMappingA(
            winapi::um::handleapi::INVALID_HANDLE_VALUE,
            security.as_mut_ptr(),
            PAGE_READWRITE,
            (size as u64 >> 32) as DWORD,
            size as DWORD,
            name,
        ) as RawHandle
    };
    let last_error = Error::last_os_error();
    if handle.is_null() {
        return Err(last_error);
    }
    let already_existed = last_error.raw_os_error() == Some(ERROR_ALREADY_EXISTS as i32);
    Ok((handle, already_existed))
}

static ANON_HANDLE_COUNTER: AtomicU32 = AtomicU32::new(0);

impl ShmHandle {
    /// Windows file mappings need a name to be re-openable from another
    /// process; generate a unique one per anonymous region.
    pub fn new(size: usize) -> anyhow::Result<ShmHandle> {
        let size = page_aligned_size(size);
        let name = CString::new(format!(
            "Local\\mlos-anon-region-{}-{}",
            std::process::id(),
            ANON_HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst)
        ))?;
        let (handle, _) = alloc_shm(name.as_ptr() as LPCSTR, size)?;
        Ok(ShmHandle {
            handle: unsafe { RegionHandle::from_raw_handle(handle) },
            size,
        })
    }
}

impl NamedShmHandle {
    fn format_name(path: &CStr) -> CString {
        // Global\ is reserved for session 0; one exchange per session is
        // enough. Strip the POSIX-style leading slash.
        #[allow(clippy::unwrap_used)]
        CString::new(format!(
            "Local\\{}",
            String::from_utf8_lossy(&path.to_bytes()[1..])
        ))
        .unwrap()
    }

    pub fn create_new(path: CString, size: usize) -> io::Result<NamedShmHandle> {
        let size = page_aligned_size(size);
        let name = Self::format_name(&path);
        let (handle, already_existed) = alloc_shm(name.as_ptr() as LPCSTR, size)?;
        if already_existed {
            unsafe { winapi::um::handleapi::CloseHandle(handle as HANDLE) };
            return Err(Error::from(io::ErrorKind::AlreadyExists));
        }
        Self::new(handle, Some(path), size)
    }

    pub fn create_or_open(path: CString, size: usize) -> io::Result<NamedShmHandle> {
        let size = page_aligned_size(size);
        let name = Self::format_name(&path);
        let (handle, _) = alloc_shm(name.as_ptr() as LPCSTR, size)?;
        Self::new(handle, Some(path), size)
    }

    pub fn open_existing(path: &CStr) -> io::Result<NamedShmHandle> {
        let name = Self::format_name(path);
        let handle = unsafe { OpenFileMappingA(FILE_MAP_WRITE, 0, name.as_ptr() as LPCSTR) };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }
        // Size is resolved by the first mapping via VirtualQuery.
        Self::new(handle as RawHandle, Some(path.to_owned()), 0)
    }

    fn new(handle: RawHandle, path: Option<CString>, size: usize) -> io::Result<NamedShmHandle> {
        Ok(NamedShmHandle {
            inner: ShmHandle {
                handle: unsafe { RegionHandle::from_raw_handle(handle) },
                size,
            },
            path: path.map(|name| ShmPath {
                name,
                cleanup_on_close: false,
            }),
        })
    }
}

impl Drop for ShmPath {
    fn drop(&mut self) {
        // Named file mappings vanish with their last handle; there is no
        // unlink step on Windows.
    }
}

// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared memory region handles.
//!
//! [`ShmHandle`] is an anonymous region that lives only as long as its file
//! descriptor; [`NamedShmHandle`] is backed by an OS-visible name that other
//! processes open. Mapping either yields a [`MappedMem`] whose lifetime
//! scopes the mapping. Regions have a fixed size chosen at creation; there
//! is no grow path.

use crate::platform::{mmap_handle, munmap_handle};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

#[cfg(not(windows))]
pub type OwnedFileHandle = io_lifetimes::OwnedFd;
#[cfg(windows)]
pub type OwnedFileHandle = std::os::windows::io::OwnedHandle;

/// Reference-counted descriptor of one shared memory region.
///
/// A region can be referenced from several places at once — a live mapping,
/// the fd-exchange store, a context about to map it — and on Linux an
/// anonymous region exists *only* through its descriptors. Clones share the
/// OS handle, so the region's backing store survives until the last clone
/// goes away.
#[derive(Clone, Debug)]
pub struct RegionHandle {
    pub(crate) inner: Arc<OwnedFileHandle>,
}

impl From<OwnedFileHandle> for RegionHandle {
    fn from(handle: OwnedFileHandle) -> RegionHandle {
        RegionHandle {
            inner: Arc::new(handle),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShmHandle {
    pub(crate) handle: RegionHandle,
    pub(crate) size: usize,
}

impl ShmHandle {
    /// Adopts an already-shared region descriptor, e.g. one handed out by
    /// the fd exchange store.
    pub fn from_handle(handle: RegionHandle, size: usize) -> ShmHandle {
        ShmHandle { handle, size }
    }

    pub fn descriptor(&self) -> &RegionHandle {
        &self.handle
    }
}

pub struct MappedMem<T>
where
    T: MemoryHandle,
{
    #[cfg(unix)]
    pub(crate) ptr: *mut libc::c_void,
    #[cfg(windows)]
    pub(crate) ptr: *mut winapi::ctypes::c_void,
    pub(crate) mem: T,
}

#[derive(Debug)]
pub(crate) struct ShmPath {
    pub(crate) name: CString,
    pub(crate) cleanup_on_close: bool,
}

#[derive(Debug)]
pub struct NamedShmHandle {
    pub(crate) inner: ShmHandle,
    pub(crate) path: Option<ShmPath>,
}

impl NamedShmHandle {
    pub fn get_path(&self) -> &[u8] {
        if let Some(ref shm_path) = &self.path {
            shm_path.name.as_bytes()
        } else {
            b""
        }
    }

    /// When set, dropping the handle (or its mapping) unlinks the backing
    /// name. The last detacher of a region flips this before release.
    pub fn set_cleanup_on_close(&mut self, cleanup: bool) {
        if let Some(ref mut path) = self.path {
            path.cleanup_on_close = cleanup;
        }
    }
}

pub(crate) fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

pub trait MemoryHandle {
    fn get_size(&self) -> usize;
}

impl<T> MemoryHandle for T
where
    T: FileBackedHandle,
{
    fn get_size(&self) -> usize {
        self.get_shm().size
    }
}

pub trait FileBackedHandle
where
    Self: Sized,
{
    fn map(self) -> io::Result<MappedMem<Self>>;
    fn get_shm(&self) -> &ShmHandle;
    fn get_shm_mut(&mut self) -> &mut ShmHandle;
}

impl FileBackedHandle for ShmHandle {
    fn map(self) -> io::Result<MappedMem<ShmHandle>> {
        mmap_handle(self)
    }

    fn get_shm(&self) -> &ShmHandle {
        self
    }
    fn get_shm_mut(&mut self) -> &mut ShmHandle {
        self
    }
}

impl FileBackedHandle for NamedShmHandle {
    fn map(self) -> io::Result<MappedMem<NamedShmHandle>> {
        mmap_handle(self)
    }

    fn get_shm(&self) -> &ShmHandle {
        &self.inner
    }
    fn get_shm_mut(&mut self) -> &mut ShmHandle {
        &mut self.inner
    }
}

impl<T: MemoryHandle> MappedMem<T> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.mem.get_size()) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.mem.get_size()) }
    }

    /// Base of the mapping for the shared-memory structures layered on top.
    pub fn base_ptr(&self) -> NonNull<u8> {
        // mmap never returns null on success
        unsafe { NonNull::new_unchecked(self.ptr as *mut u8) }
    }

    pub fn get_size(&self) -> usize {
        self.mem.get_size()
    }

    pub fn memory(&self) -> &T {
        &self.mem
    }
}

impl<T: MemoryHandle> AsRef<[u8]> for MappedMem<T> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl MappedMem<NamedShmHandle> {
    pub fn get_path(&self) -> &[u8] {
        self.mem.get_path()
    }

    pub fn set_cleanup_on_close(&mut self, cleanup: bool) {
        self.mem.set_cleanup_on_close(cleanup);
    }
}

impl<T: FileBackedHandle> From<MappedMem<T>> for ShmHandle {
    fn from(handle: MappedMem<T>) -> ShmHandle {
        ShmHandle {
            handle: handle.mem.get_shm().handle.clone(),
            size: handle.mem.get_shm().size,
        }
    }
}

impl<T> Drop for MappedMem<T>
where
    T: MemoryHandle,
{
    fn drop(&mut self) {
        munmap_handle(self);
    }
}

impl From<ShmHandle> for RegionHandle {
    fn from(shm: ShmHandle) -> Self {
        shm.handle
    }
}

unsafe impl<T> Sync for MappedMem<T> where T: FileBackedHandle {}
unsafe impl<T> Send for MappedMem<T> where T: FileBackedHandle {}

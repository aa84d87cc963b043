// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::platform::{
    page_aligned_size, FileBackedHandle, MappedMem, MemoryHandle, NamedShmHandle, RegionHandle,
    ShmHandle, ShmPath,
};
use io_lifetimes::OwnedFd;
use libc::off_t;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::MetadataExt;
use std::os::unix::prelude::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

impl FromRawFd for RegionHandle {
    /// # Safety
    /// `fd` must be a valid, open region descriptor; the handle takes
    /// exclusive ownership of it.
    unsafe fn from_raw_fd(fd: RawFd) -> RegionHandle {
        OwnedFd::from_raw_fd(fd).into()
    }
}

impl AsRawFd for RegionHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

pub(crate) fn mmap_handle<T: FileBackedHandle>(handle: T) -> io::Result<MappedMem<T>> {
    let fd: RawFd = handle.get_shm().handle.as_raw_fd();
    let length = NonZeroUsize::new(handle.get_shm().size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty region"))?;
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            BorrowedFd::borrow_raw(fd),
            0,
        )?
    };
    Ok(MappedMem {
        ptr: ptr.as_ptr(),
        mem: handle,
    })
}

pub(crate) fn munmap_handle<T: MemoryHandle>(mapped: &mut MappedMem<T>) {
    if let Some(ptr) = NonNull::new(mapped.ptr) {
        unsafe {
            _ = munmap(ptr, mapped.mem.get_size());
        }
    }
}

static ANON_SHM_ID: AtomicI32 = AtomicI32::new(0);

impl ShmHandle {
    #[cfg(target_os = "linux")]
    fn open_anon_shm() -> anyhow::Result<RawFd> {
        if let Ok(memfd) = memfd::MemfdOptions::default().create("mlos-anon-region") {
            Ok(memfd.into_raw_fd())
        } else {
            Self::open_anon_shm_generic()
        }
    }

    fn open_anon_shm_generic() -> anyhow::Result<RawFd> {
        let path = format!(
            "/mlos-shm-anon-{}-{}",
            unsafe { libc::getpid() },
            ANON_SHM_ID.fetch_add(1, Ordering::SeqCst)
        );
        // Unlinked right away: only the descriptor keeps the region alive,
        // which is the whole point of the anonymous transport.
        let result = shm_open(
            path.as_bytes(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        _ = shm_unlink(path.as_bytes());
        Ok(result?.into_raw_fd())
    }

    #[cfg(not(target_os = "linux"))]
    fn open_anon_shm() -> anyhow::Result<RawFd> {
        Self::open_anon_shm_generic()
    }

    /// Creates an anonymous region of at least `size` bytes (rounded up to
    /// page granularity).
    pub fn new(size: usize) -> anyhow::Result<ShmHandle> {
        let size = page_aligned_size(size);
        let fd = Self::open_anon_shm()?;
        let handle = unsafe { RegionHandle::from_raw_fd(fd) };
        ftruncate(unsafe { BorrowedFd::borrow_raw(fd) }, size as off_t)?;
        Ok(ShmHandle { handle, size })
    }

    /// Wraps a region descriptor received from the fd exchange. `size` is
    /// the creating side's declared region size.
    pub fn open_anonymous(fd: OwnedFd, size: usize) -> ShmHandle {
        ShmHandle {
            handle: RegionHandle::from(fd),
            size,
        }
    }
}

impl NamedShmHandle {
    /// Creates the named region, failing with `AlreadyExists` when the name
    /// is already backed.
    pub fn create_new(path: CString, size: usize) -> io::Result<NamedShmHandle> {
        Self::create_flags(path, size, OFlag::O_CREAT | OFlag::O_EXCL)
    }

    pub fn create_or_open(path: CString, size: usize) -> io::Result<NamedShmHandle> {
        Self::create_flags(path, size, OFlag::O_CREAT)
    }

    fn create_flags(path: CString, size: usize, flags: OFlag) -> io::Result<NamedShmHandle> {
        let size = page_aligned_size(size);
        let fd = shm_open(
            path.as_c_str(),
            flags | OFlag::O_RDWR,
            Mode::S_IWUSR | Mode::S_IRUSR,
        )?;
        ftruncate(&fd, size as off_t)?;
        Self::new(fd.into_raw_fd(), Some(path), size)
    }

    /// Opens a region somebody else created; the size comes from the
    /// backing file. The name is retained so this opener can still unlink
    /// it when it turns out to be the last detacher.
    pub fn open_existing(path: &CStr) -> io::Result<NamedShmHandle> {
        let fd = shm_open(path, OFlag::O_RDWR, Mode::empty())?;
        let file: File = fd.into();
        let size = file.metadata()?.size() as usize;
        Self::new(file.into_raw_fd(), Some(path.to_owned()), size)
    }

    fn new(fd: RawFd, path: Option<CString>, size: usize) -> io::Result<NamedShmHandle> {
        Ok(NamedShmHandle {
            inner: ShmHandle {
                handle: unsafe { RegionHandle::from_raw_fd(fd) },
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
        if self.cleanup_on_close {
            _ = shm_unlink(self.name.as_c_str());
        }
    }
}

//! Physically-addressed cache-control device.
//!
//! Direct-physical buffers live in a physically contiguous region reached
//! through a vendor char device. The device sets cacheability for
//! subsequent mappings, performs cache maintenance by physical address,
//! and its fd is the mapping target for hardware-window mmaps.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd};
use std::fs::OpenOptions;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Physical address range handed to the cache-maintenance ioctls.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    /// Physical start address.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
}

/// Control device for direct-physical buffers.
///
/// `open` runs once per [`Mapper`](crate::Mapper) under its map lock and
/// must be idempotent; the fd stays open for the mapper's lifetime.
pub trait ControlDevice: Send + Sync {
    /// Open the device node.
    fn open(&self) -> Result<()>;

    /// Set cacheability of subsequent mappings.
    fn set_cacheable(&self, cacheable: bool) -> Result<()>;

    /// Write dirty lines of the range back to memory.
    fn cache_clean(&self, range: PhysRange) -> Result<()>;

    /// Clean and invalidate the range so device writes become visible.
    fn cache_flush(&self, range: PhysRange) -> Result<()>;

    /// Fd used for hardware-window mmaps; `None` until opened.
    fn fd(&self) -> Option<BorrowedFd<'_>>;
}

const IOC_WRITE: u32 = 1;
const IOC_MAGIC: u32 = b'M' as u32;

const fn iow(nr: u32, size: usize) -> libc::c_ulong {
    ((IOC_WRITE << 30) | ((size as u32) << 16) | (IOC_MAGIC << 8) | nr) as libc::c_ulong
}

const MEM_SET_CACHEABLE: libc::c_ulong = iow(1, std::mem::size_of::<u32>());
const MEM_PADDR_CACHE_FLUSH: libc::c_ulong = iow(2, std::mem::size_of::<PhysRange>());
const MEM_PADDR_CACHE_CLEAN: libc::c_ulong = iow(3, std::mem::size_of::<PhysRange>());

/// [`ControlDevice`] backed by a vendor char device node.
pub struct MemControlDevice {
    path: PathBuf,
    fd: OnceLock<OwnedFd>,
}

impl MemControlDevice {
    /// Conventional device node path on the reference platform.
    pub const DEFAULT_PATH: &'static str = "/dev/exynos-mem";

    /// Create an unopened control device for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fd: OnceLock::new(),
        }
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &T) -> Result<()> {
        let fd = self
            .fd
            .get()
            .ok_or_else(|| Error::Backend("control device not opened".into()))?;
        // SAFETY: fd is an open char device; arg outlives the call.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request, arg as *const T) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(Error::System(rustix::io::Errno::from_raw_os_error(errno)));
        }
        Ok(())
    }
}

impl ControlDevice for MemControlDevice {
    fn open(&self) -> Result<()> {
        if self.fd.get().is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::Backend(format!("{}: {e}", self.path.display())))?;
        let _ = self.fd.set(OwnedFd::from(file));
        Ok(())
    }

    fn set_cacheable(&self, cacheable: bool) -> Result<()> {
        self.ioctl(MEM_SET_CACHEABLE, &u32::from(cacheable))
    }

    fn cache_clean(&self, range: PhysRange) -> Result<()> {
        self.ioctl(MEM_PADDR_CACHE_CLEAN, &range)
    }

    fn cache_flush(&self, range: PhysRange) -> Result<()> {
        self.ioctl(MEM_PADDR_CACHE_FLUSH, &range)
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.get().map(|fd| fd.as_fd())
    }
}

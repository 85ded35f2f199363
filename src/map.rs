//! Address-space binding: the per-backend map and unmap syscalls.
//!
//! Fd-backed regions cannot always be mapped starting at a non-page-aligned
//! logical offset, so the whole preceding region is mapped and the logical
//! offset is applied in virtual-address space. [`MappedRange`] keeps the
//! true mapping base and length so teardown never re-derives either.

use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use tracing::warn;

/// A live mapping created by the binder.
#[derive(Debug)]
pub(crate) struct MappedRange {
    /// Logical payload base handed to callers: map base plus the
    /// descriptor's byte offset.
    pub base: NonNull<u8>,
    map_base: NonNull<u8>,
    map_len: usize,
}

// SAFETY: the pointers reference a shared file mapping that stays valid
// until `unmap`; the mapper serializes creation and teardown.
unsafe impl Send for MappedRange {}
unsafe impl Sync for MappedRange {}

fn map_shared(
    fd: BorrowedFd<'_>,
    len: usize,
    file_offset: u64,
    logical_offset: usize,
) -> Result<MappedRange> {
    // SAFETY: anonymous placement, length and offset are caller-checked;
    // the fd is a live shared-memory object.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            file_offset,
        )?
    };
    let map_base = NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::Backend("mmap returned null".into()))?;
    // logical_offset < len for every caller below.
    // SAFETY: the offset stays inside the mapping just created.
    let base = unsafe { NonNull::new_unchecked(map_base.as_ptr().add(logical_offset)) };
    Ok(MappedRange {
        base,
        map_base,
        map_len: len,
    })
}

/// Map a device-buffer: `size` bytes at file offset 0, payload at `offset`
/// into the mapping.
pub(crate) fn map_device_buffer(
    fd: BorrowedFd<'_>,
    size: usize,
    offset: usize,
) -> Result<MappedRange> {
    map_shared(fd, size, 0, offset)
}

/// Map a direct-physical buffer from its own fd. The region cannot be
/// mapped at the logical offset, so `size + offset` bytes are mapped from
/// file offset 0 and the offset applied afterwards.
pub(crate) fn map_direct_fd(fd: BorrowedFd<'_>, size: usize, offset: usize) -> Result<MappedRange> {
    map_shared(fd, size + offset, 0, offset)
}

/// Map a hardware window through the control device: `window_kib` KiB
/// starting at `paddr - offset` in device space.
pub(crate) fn map_direct_window(
    ctl: BorrowedFd<'_>,
    window_kib: u32,
    paddr: u64,
    offset: usize,
) -> Result<MappedRange> {
    let len = window_kib as usize * 1024;
    map_shared(ctl, len, paddr - offset as u64, offset)
}

/// Release a mapping. Failure is logged and swallowed: teardown is best
/// effort and must never block the caller.
pub(crate) fn unmap(range: MappedRange) {
    // SAFETY: map_base/map_len describe exactly one live mapping that no
    // caller touches after this point.
    if let Err(err) = unsafe { rustix::mm::munmap(range.map_base.as_ptr().cast(), range.map_len) } {
        warn!(%err, "munmap failed, leaking mapping");
    }
}

//! Cross-process buffer descriptor.
//!
//! A descriptor is produced by the external allocator and travels to
//! consumer processes over IPC. Its payload fields are immutable once
//! allocated; this crate never constructs them, it only validates the
//! structure and derives a process-local identity for its own state table.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use bitflags::bitflags;
use std::os::unix::io::RawFd;

bitflags! {
    /// Backend-selection and cache-behavior bits carried by a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Part of the framebuffer; pre-mapped by the display path and
        /// never touched by this crate.
        const FRAMEBUFFER = 1 << 0;
        /// Referenced by an opaque secure id and mapped through the
        /// shared secure-memory service.
        const SECURE_SHARED = 1 << 1;
        /// Referenced by fd; synced through the device-buffer allocator.
        const DEVICE_BUFFER = 1 << 2;
        /// Physically contiguous region reached through the control device.
        const DIRECT_IOCTL = 1 << 3;
        /// Buffer also feeds an HDMI-class hardware consumer.
        const HDMI = 1 << 4;
        /// Mapping is uncached; unlock performs no cache maintenance.
        const NON_CACHEABLE = 1 << 5;
    }
}

/// Opaque, process-independent identifier for secure-shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecureId(pub u32);

/// Magic value stamped into every well-formed descriptor.
pub const DESCRIPTOR_MAGIC: u32 = 0x6266_6d70; // "bfmp"
/// Descriptor layout version this crate understands.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// A shared graphics buffer as seen by consumer processes.
///
/// The allocator fills every field including `magic` and `version`; the
/// receiving process hands the descriptor to [`Mapper`](crate::Mapper)
/// operations by reference. The transport duplicates `fd` per process, so
/// it is only meaningful locally.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    /// Structural magic, checked by [`validate`](Self::validate).
    pub magic: u32,
    /// Structural version, checked by [`validate`](Self::validate).
    pub version: u32,
    /// Pixel format of the payload.
    pub format: PixelFormat,
    /// Visible width in pixels.
    pub width: u32,
    /// Row stride in pixels.
    pub stride: u32,
    /// Payload size in bytes.
    pub size: usize,
    /// Byte offset of the logical payload from the backend-mapped base.
    pub offset: usize,
    /// U and V plane byte offsets from the mapped base, for planar layouts.
    pub plane_offsets: [usize; 2],
    /// Backend-selection bits.
    pub flags: BufferFlags,
    /// Physical address; meaningful only for direct-physical buffers.
    pub paddr: u64,
    /// Cross-process identifier for secure-shared buffers.
    pub secure_id: SecureId,
    /// Per-process duplicate of the transport fd; valid for fd-backed buffers.
    pub fd: RawFd,
    /// Pid of the allocating process (informational).
    pub owner_pid: u32,
    /// Hardware-window size in KiB used by the ioctl-mapped path.
    pub window_kib: u32,
}

impl BufferDescriptor {
    /// Build a descriptor with the structural fields stamped in.
    ///
    /// This mirrors what the allocator does on its side; the remaining
    /// payload fields start zeroed and are filled by the allocator (or by
    /// tests) before the descriptor is shipped.
    pub fn new(
        format: PixelFormat,
        width: u32,
        stride: u32,
        size: usize,
        flags: BufferFlags,
    ) -> Self {
        Self {
            magic: DESCRIPTOR_MAGIC,
            version: DESCRIPTOR_VERSION,
            format,
            width,
            stride,
            size,
            offset: 0,
            plane_offsets: [0, 0],
            flags,
            paddr: 0,
            secure_id: SecureId(0),
            fd: -1,
            owner_pid: 0,
            window_kib: 0,
        }
    }

    /// Structural integrity check. The first act of every module operation,
    /// before any backend is touched.
    pub fn validate(&self) -> Result<()> {
        if self.magic != DESCRIPTOR_MAGIC {
            return Err(Error::InvalidDescriptor("bad magic"));
        }
        if self.version != DESCRIPTOR_VERSION {
            return Err(Error::InvalidDescriptor("unknown version"));
        }
        if self.size == 0 {
            return Err(Error::InvalidDescriptor("zero size"));
        }
        Ok(())
    }

    /// Row stride in bytes, as recorded for partial flushes.
    pub(crate) fn stride_bytes(&self) -> u32 {
        self.stride * self.format.bytes_per_pixel()
    }

    /// Process-local identity for the per-process state table.
    ///
    /// Keyed by whatever reference the owning backend actually uses, so a
    /// descriptor received twice over independent paths lands on the same
    /// entry and is never double-mapped or double-unmapped.
    pub(crate) fn key(&self) -> BufferKey {
        match Backend::resolve(self.flags) {
            Backend::SecureShared | Backend::Framebuffer => BufferKey::Secure(self.secure_id),
            Backend::DirectWindow => BufferKey::Phys(self.paddr),
            _ => BufferKey::Fd(self.fd),
        }
    }
}

/// Identity of a buffer within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BufferKey {
    /// Secure-shared buffers are identified by their cross-process id.
    Secure(SecureId),
    /// Fd-backed buffers are identified by the local fd.
    Fd(RawFd),
    /// Window-mapped buffers are identified by physical address.
    Phys(u64),
}

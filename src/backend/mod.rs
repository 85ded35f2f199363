//! Backend resolution and the service interfaces the core consumes.
//!
//! Buffers arrive with a flag bitset naming one of several mutually
//! incompatible physical-memory backends. [`Backend::resolve`] turns the
//! bits into a closed variant set exactly once, at registration; the
//! variant is then carried in per-process state so later operations never
//! re-derive it from the ambiguous bits.
//!
//! The traits here are the seams to the external collaborators: the secure
//! shared-memory service, the device-buffer allocator and the
//! physically-addressed control device. Production hosts plug in their
//! platform bindings; tests plug in memfd-backed fakes.

mod control;
mod device;
mod secure;

pub use control::{ControlDevice, MemControlDevice, PhysRange};
pub use device::{DeviceBufferAllocator, DeviceClient, SyncDirection};
pub use secure::{SecureMemoryService, SsmHandle, SyncOp, SyncRange};

use crate::descriptor::BufferFlags;

/// The backend that owns a buffer, decided once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Pre-mapped by the display path; registration is a no-op.
    Framebuffer,
    /// Secure-id referenced, mapped by the shared secure-memory service.
    SecureShared,
    /// Fd referenced, mapped directly and synced via the allocator client.
    DeviceBuffer,
    /// Physically contiguous, mapped as a hardware window through the
    /// control device.
    DirectWindow,
    /// Physically contiguous, mapped from the buffer's own fd.
    DirectFd,
    /// Flag combination this process cannot register.
    Unsupported,
}

impl Backend {
    /// Resolve the owning backend from descriptor flags.
    ///
    /// Pure function over the bitset. Precedence: framebuffer bypasses
    /// everything, then secure-shared, then device-buffer, then the
    /// direct-physical sub-cases. An HDMI-only direct buffer with no
    /// mappable bit set cannot be registered.
    pub fn resolve(flags: BufferFlags) -> Backend {
        if flags.contains(BufferFlags::FRAMEBUFFER) {
            Backend::Framebuffer
        } else if flags.contains(BufferFlags::SECURE_SHARED) {
            Backend::SecureShared
        } else if flags.contains(BufferFlags::DEVICE_BUFFER) {
            Backend::DeviceBuffer
        } else if flags == (BufferFlags::DIRECT_IOCTL | BufferFlags::HDMI) {
            Backend::Unsupported
        } else if flags.intersects(BufferFlags::DIRECT_IOCTL | BufferFlags::HDMI) {
            Backend::DirectWindow
        } else {
            Backend::DirectFd
        }
    }
}

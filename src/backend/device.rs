//! Device-buffer allocator client interface.

use crate::error::Result;
use std::os::unix::io::RawFd;

/// Opaque client context handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceClient(pub u64);

/// Direction of a device-buffer sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Make device writes visible to the CPU and re-arm for the device.
    DeviceToCpu,
    /// Push CPU writes out for the device.
    CpuToDevice,
}

/// The cross-process buffer-sharing allocator (dma-buf style).
///
/// Mapping an fd-backed buffer is an ordinary shared mmap done by the
/// address-space binder; the client context exists for the sync requests
/// issued at unlock and is destroyed at unregistration.
pub trait DeviceBufferAllocator: Send + Sync {
    /// Create a client context for this process.
    fn create_client(&self) -> Result<DeviceClient>;

    /// Destroy a client context.
    fn destroy_client(&self, client: DeviceClient);

    /// Sync `len` bytes at `offset` of the buffer behind `fd`.
    fn sync(
        &self,
        client: DeviceClient,
        fd: RawFd,
        direction: SyncDirection,
        len: usize,
        offset: usize,
    ) -> Result<()>;
}

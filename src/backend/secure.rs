//! Shared secure-memory service interface.

use crate::descriptor::SecureId;
use crate::error::Result;
use std::ptr::NonNull;

/// Opaque local handle to a secure-shared buffer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SsmHandle(pub u64);

/// Cache-maintenance operation requested through the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Write dirty CPU cache lines back to memory.
    Clean,
    /// Clean, then discard the lines so a later read fetches fresh memory.
    /// Needed when a hardware consumer writes the buffer after the CPU.
    CleanAndInvalidate,
}

/// Sub-range of a mapping, in bytes relative to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRange {
    /// Start offset from the mapped base.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

/// The kernel service that maps secure-id referenced buffers.
///
/// The service performs the mmap-equivalent internally; the core never
/// issues an explicit mmap for this backend, it only retrieves the pointer
/// the service already holds. `open` runs once per [`Mapper`](crate::Mapper)
/// under its map lock and must be idempotent.
pub trait SecureMemoryService: Send + Sync {
    /// Open the service. Called once per mapper, before any other call.
    fn open(&self) -> Result<()>;

    /// Create a local handle from a cross-process secure id.
    fn create_handle(&self, id: SecureId) -> Option<SsmHandle>;

    /// Pointer the service mapped for this handle, if the mapping exists.
    fn mapped_pointer(&self, handle: SsmHandle) -> Option<NonNull<u8>>;

    /// Release the mapped pointer. Must precede `release_reference`.
    fn release_mapped_pointer(&self, handle: SsmHandle);

    /// Drop the handle's reference on the underlying buffer.
    fn release_reference(&self, handle: SsmHandle);

    /// Cache maintenance over `range`, or the whole mapping when `None`.
    fn sync(&self, handle: SsmHandle, op: SyncOp, range: Option<SyncRange>) -> Result<()>;
}

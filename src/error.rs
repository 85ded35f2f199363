//! Error types for bufmap.

use thiserror::Error;

/// Result type alias using bufmap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer registration and mapping operations.
///
/// Validation failures are always detected before any backend is touched.
/// Cache-maintenance failures never surface here: unlock swallows them and
/// reports a degraded [`SyncOutcome`](crate::mapper::SyncOutcome) instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Descriptor failed structural validation (bad magic, version or size).
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(&'static str),

    /// The descriptor's flag combination names no backend this process can map.
    #[error("unsupported backend flags {0:#06x}")]
    UnsupportedBackend(u32),

    /// Backend open, handle-create or map failure during registration.
    /// Any partially acquired handle has been released.
    #[error("backend error: {0}")]
    Backend(String),

    /// The buffer was never registered in this process.
    #[error("buffer not registered in this process")]
    NotRegistered,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

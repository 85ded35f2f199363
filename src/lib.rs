//! # bufmap
//!
//! Registration, mapping and cache-coherency lifecycle for physically
//! backed graphics buffers shared across process boundaries.
//!
//! A separate allocator component carves out buffers and ships an opaque
//! descriptor over IPC; this crate is the consumer-side half. It turns the
//! descriptor into a locally valid virtual-memory mapping, tracks lock
//! state, and performs the cache maintenance the owning backend needs when
//! the CPU releases the buffer.
//!
//! ## Architecture
//!
//! - [`Backend::resolve`](backend::Backend::resolve): decides which of the
//!   mutually incompatible physical-memory backends owns a buffer —
//!   secure-id shared memory, a dma-buf style allocator, or a physically
//!   contiguous region behind a vendor control device.
//! - [`Mapper`]: the per-process context holding all formerly global state
//!   (lazily opened service handles, the region list) plus the per-buffer
//!   registration table.
//! - Lock/unlock: lock is pure bookkeeping and pointer arithmetic (single
//!   pointer or one per YUV plane); unlock issues the backend's
//!   clean/invalidate operation, restricted to the last-locked rectangle
//!   when partial flushing is enabled.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bufmap::{BackendServices, Mapper, MapperConfig, Usage, Rect};
//!
//! let mapper = Mapper::new(MapperConfig::default(), platform_services());
//!
//! mapper.register(&descriptor)?;
//! let addr = mapper.lock(&descriptor, Usage::SW_WRITE, Rect::default())?;
//! // ... CPU access through addr ...
//! let outcome = mapper.unlock(&descriptor)?;
//! mapper.unregister(&descriptor)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod descriptor;
pub mod error;
pub mod format;
mod map;
pub mod mapper;
pub mod region;

pub use descriptor::{BufferDescriptor, BufferFlags, SecureId};
pub use error::{Error, Result};
pub use format::PixelFormat;
pub use mapper::{BackendServices, LockedAddr, Mapper, MapperConfig, SyncOutcome, Usage};
pub use region::Rect;

//! Last-locked-rectangle tracking for partial cache flushes.
//!
//! Flushing a whole buffer on every unlock is wasteful when the caller only
//! touched a few rows. Each secure-shared (or framebuffer) buffer gets a
//! record of the rectangle its last lock declared; unlock then restricts
//! the flush to the rows that rectangle covers.

use crate::descriptor::SecureId;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Rectangle of a buffer touched by a lock, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    /// Left edge.
    pub left: u32,
    /// Top edge.
    pub top: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Per-buffer record of the last-locked rectangle.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RegionRecord {
    pub rect: Rect,
    /// Row stride in bytes, derived from the descriptor at registration.
    pub stride_bytes: u32,
    pub locked: bool,
    pub write_locked: bool,
}

impl RegionRecord {
    /// Byte span of the recorded rectangle relative to the mapped base:
    /// `[stride * top, stride * top + stride * height)`. Whole rows are
    /// flushed; the left edge does not narrow the span.
    pub fn flush_span(&self) -> (usize, usize) {
        let stride = self.stride_bytes as usize;
        (stride * self.rect.top as usize, stride * self.rect.height as usize)
    }
}

/// Process-wide map of region records, keyed by secure id.
///
/// Guarded by its own lock so lock/unlock bookkeeping never contends with
/// the registration map lock.
#[derive(Debug, Default)]
pub(crate) struct RegionMap {
    records: Mutex<HashMap<SecureId, RegionRecord>>,
}

impl RegionMap {
    /// Start tracking a buffer. Re-registration refreshes the record.
    pub fn insert(&self, id: SecureId, stride_bytes: u32) {
        self.records.lock().unwrap().insert(
            id,
            RegionRecord {
                stride_bytes,
                ..RegionRecord::default()
            },
        );
    }

    /// Stop tracking a buffer. A miss is harmless; double unregistration
    /// and framebuffer-only paths hit it routinely.
    pub fn remove(&self, id: SecureId) -> bool {
        let removed = self.records.lock().unwrap().remove(&id).is_some();
        if !removed {
            debug!(id = id.0, "no region record to release");
        }
        removed
    }

    /// Record the rectangle a lock declared. No-op for untracked buffers.
    pub fn update(&self, id: SecureId, rect: Rect, write: bool) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.rect = rect;
            record.locked = true;
            record.write_locked = write;
        }
    }

    /// Snapshot of a buffer's record.
    pub fn get(&self, id: SecureId) -> Option<RegionRecord> {
        self.records.lock().unwrap().get(&id).copied()
    }
}

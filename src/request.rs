//! Caller-owned atomic request log.
//!
//! The allocator stages its property writes into an [`AtomicRequest`] owned by
//! the caller. The request is an append-only log with an index cursor: every
//! speculative path during the search snapshots the cursor up front and
//! truncates back to it when the path is abandoned, so only the writes of the
//! winning configuration survive. The caller may add its own writes (mode,
//! ACTIVE, out-fences) to the same request and submits the whole log with
//! [`AtomicRequest::build`].

use drm::control::atomic::AtomicModeReq;
use drm::control::{property, RawResourceHandle};

/// A single staged property write.
#[derive(Debug, Clone, Copy)]
pub struct PropertyWrite {
    /// Raw id of the object the write targets.
    pub object: RawResourceHandle,
    /// The property written.
    pub property: property::Handle,
    /// The raw value.
    pub value: property::RawValue,
}

/// Snapshot of the request cursor.
///
/// Rewinding to a cursor drops every write staged after it was taken.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor(usize);

/// An append-only log of pending atomic property writes.
///
/// Duplicate writes to the same (object, property) pair are allowed; later
/// writes take precedence when the request is committed.
#[derive(Debug, Default, Clone)]
pub struct AtomicRequest {
    writes: Vec<PropertyWrite>,
}

impl AtomicRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw property write for the given object.
    pub fn add_property(
        &mut self,
        object: impl Into<RawResourceHandle>,
        property: property::Handle,
        value: property::RawValue,
    ) {
        self.writes.push(PropertyWrite {
            object: object.into(),
            property,
            value,
        });
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether no writes have been staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Drops all staged writes.
    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Builds a [`AtomicModeReq`] from the staged writes, ready to be passed
    /// to [`atomic_commit`](drm::control::Device::atomic_commit).
    pub fn build(&self) -> AtomicModeReq {
        let mut req = AtomicModeReq::new();
        for write in &self.writes {
            req.add_raw_property(write.object, write.property, write.value);
        }
        req
    }

    /// The staged writes, in staging order. Later writes to the same
    /// (object, property) pair shadow earlier ones.
    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub(crate) fn cursor(&self) -> Cursor {
        Cursor(self.writes.len())
    }

    pub(crate) fn rewind(&mut self, cursor: Cursor) {
        self.writes.truncate(cursor.0);
    }
}

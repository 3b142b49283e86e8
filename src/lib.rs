#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like KMS
#![allow(clippy::upper_case_acronyms)]

//! **Hardware plane offloading for KMS**
//!
//! Display controllers expose a set of hardware planes that can scan out
//! client buffers directly, without going through the GPU. This crate decides
//! which client layer each plane should display: clients describe their
//! layers per output, [`Device::apply`] probes the driver with TEST_ONLY
//! atomic commits to find the assignment placing the most layers on planes,
//! and stages the winning configuration into a caller-owned [`AtomicRequest`].
//! Layers that do not fit fall back to the client's own composition.
//!
//! Driver constraints cannot be enumerated up front, asking the kernel is the
//! only reliable oracle. The search therefore builds configurations one plane
//! at a time, verifying every candidate with a test commit and backtracking
//! on rejection; see the allocator module docs for the details. Results are
//! cached across frames: when no layer changed in a way that affects
//! placement, the previous assignment is confirmed with a single test commit.
//!
//! Logging goes through [`tracing`]; install a subscriber to route and filter
//! it. All calls are synchronous and single-threaded, callers on the same
//! device serialize [`Device::apply`] across outputs themselves.
//!
//! ## How to use it
//!
//! ```no_run
//! use std::fs::OpenOptions;
//!
//! use drm::control::AtomicCommitFlags;
//! use drm_offload::{AtomicRequest, Device, PropertyIndex};
//!
//! let file = OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("/dev/dri/card0")
//!     .unwrap();
//!
//! let mut device = Device::new(&file).unwrap();
//! device.register_all_planes().unwrap();
//!
//! let crtc = device.crtcs()[0];
//! let output = device.create_output(crtc).unwrap();
//!
//! let layer = device.create_layer(output).unwrap();
//! # let fb_id: u64 = 0;
//! device.set_layer_property(layer, PropertyIndex::FbId, fb_id).unwrap();
//! device.set_layer_property(layer, PropertyIndex::CrtcW, 1920).unwrap();
//! device.set_layer_property(layer, PropertyIndex::CrtcH, 1080).unwrap();
//! device.set_layer_property(layer, PropertyIndex::SrcW, 1920 << 16).unwrap();
//! device.set_layer_property(layer, PropertyIndex::SrcH, 1080 << 16).unwrap();
//!
//! // every frame: update layer properties, then let the allocator decide
//! let mut req = AtomicRequest::new();
//! device.apply(output, &mut req, AtomicCommitFlags::empty()).unwrap();
//!
//! if device.layer_needs_composition(layer).unwrap() {
//!     // render this layer with the GPU fallback instead
//! }
//!
//! // add your own CRTC-level writes to `req`, then submit `req.build()`
//! // as a real atomic commit
//! ```

mod alloc;
mod device;
mod error;
mod layer;
mod output;
mod plane;
mod property;
mod request;

pub use device::Device;
pub use error::{AccessError, Error};
pub use layer::LayerId;
pub use output::OutputId;
pub use plane::Plane;
pub use property::PropertyIndex;
pub use request::{AtomicRequest, PropertyWrite};

use drm::control::RawResourceHandle;

/// Raw object id of a drm handle, for logging and value writes.
pub(crate) fn raw_handle(handle: impl Into<RawResourceHandle>) -> u32 {
    handle.into().get()
}

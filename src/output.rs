//! Per-CRTC output model.

use drm::control::crtc;

use crate::layer::LayerId;

/// Stable identifier of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub(crate) u32);

/// The set of layers competing for the planes of one CRTC.
#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) crtc: crtc::Handle,
    pub(crate) crtc_index: usize,
    /// Layers in client stacking order (insertion order).
    pub(crate) layers: Vec<LayerId>,
    /// Layer designated to receive the composited fallback image.
    pub(crate) composition_layer: Option<LayerId>,
    /// Set when a layer was added or removed, or the composition layer
    /// designation changed. Forces a fresh allocation.
    pub(crate) layers_changed: bool,
    /// Consecutive frames the previous allocation was reused for.
    pub(crate) reuse_count: u32,
}

impl Output {
    pub(crate) fn new(crtc: crtc::Handle, crtc_index: usize) -> Self {
        Self {
            crtc,
            crtc_index,
            layers: Vec::new(),
            composition_layer: None,
            layers_changed: false,
            reuse_count: 0,
        }
    }
}

//! Client layer model.
//!
//! A layer is the client-visible unit of display: a property bag describing a
//! framebuffer and where it goes on the CRTC. The allocator binds layers to
//! hardware planes, or leaves them for the client's composition fallback.

use drm::control::plane;
use tracing::debug;

use crate::output::OutputId;
use crate::property::PropertyIndex;

/// Number of page-flips between two priority aging ticks.
pub(crate) const PRIORITY_PERIOD: u32 = 60;

/// Stable identifier of a layer.
///
/// Ids stay valid until the layer is destroyed and are never reused by the
/// device that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) u32);

/// A property set on a layer, along with the value it had when the previous
/// allocation was committed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayerProperty {
    pub(crate) index: PropertyIndex,
    pub(crate) value: u64,
    pub(crate) prev_value: u64,
}

/// Cached framebuffer metadata, refreshed from the driver on every apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FbInfo {
    pub(crate) id: u64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: u32,
    pub(crate) modifier: u64,
    pub(crate) has_modifier: bool,
}

impl FbInfo {
    /// Whether swapping from `prev` to `self` invalidates the previous plane
    /// allocation. Only the scanout-relevant fields count.
    fn needs_realloc(a: Option<&FbInfo>, b: Option<&FbInfo>) -> bool {
        match (a, b) {
            (None, None) => false,
            (Some(a), Some(b)) => {
                a.width != b.width
                    || a.height != b.height
                    || a.format != b.format
                    || a.modifier != b.modifier
            }
            _ => true,
        }
    }
}

/// Destination rectangle of a layer in CRTC coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Rect {
    pub(crate) x: i32,
    pub(crate) y: i32,
    pub(crate) w: i32,
    pub(crate) h: i32,
}

impl Rect {
    pub(crate) fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.x.saturating_add(other.w)
            && other.x < self.x.saturating_add(self.w)
            && self.y < other.y.saturating_add(other.h)
            && other.y < self.y.saturating_add(self.h)
    }
}

#[derive(Debug)]
pub(crate) struct Layer {
    pub(crate) id: LayerId,
    pub(crate) output: OutputId,
    pub(crate) props: Vec<LayerProperty>,
    /// Plane currently displaying this layer.
    pub(crate) plane: Option<plane::Handle>,
    /// Planes this layer was staged on during the last allocation.
    pub(crate) candidates: Vec<plane::Handle>,
    pub(crate) force_composition: bool,
    pub(crate) changed: bool,
    pub(crate) fb_info: Option<FbInfo>,
    pub(crate) prev_fb_info: Option<FbInfo>,
    pub(crate) current_priority: u32,
    pub(crate) pending_priority: u32,
}

impl Layer {
    pub(crate) fn new(id: LayerId, output: OutputId) -> Self {
        Self {
            id,
            output,
            props: Vec::new(),
            plane: None,
            candidates: Vec::new(),
            force_composition: false,
            changed: false,
            fb_info: None,
            prev_fb_info: None,
            current_priority: 0,
            pending_priority: 0,
        }
    }

    pub(crate) fn properties(&self) -> &[LayerProperty] {
        &self.props
    }

    pub(crate) fn property(&self, index: PropertyIndex) -> Option<&LayerProperty> {
        self.props.iter().find(|prop| prop.index == index)
    }

    pub(crate) fn property_value(&self, index: PropertyIndex) -> Option<u64> {
        self.property(index).map(|prop| prop.value)
    }

    /// Sets a property value, adding it to the bag if it was unset.
    pub(crate) fn set_property(&mut self, index: PropertyIndex, value: u64) {
        match self.props.iter_mut().find(|prop| prop.index == index) {
            Some(prop) => prop.value = value,
            None => {
                self.props.push(LayerProperty {
                    index,
                    value,
                    prev_value: 0,
                });
                self.changed = true;
            }
        }

        // a client attaching a buffer again takes the layer out of forced
        // composition
        if index == PropertyIndex::FbId && self.force_composition {
            self.force_composition = false;
            self.changed = true;
        }
    }

    pub(crate) fn unset_property(&mut self, index: PropertyIndex) {
        if let Some(pos) = self.props.iter().position(|prop| prop.index == index) {
            self.props.swap_remove(pos);
            self.changed = true;
        }
    }

    pub(crate) fn mark_composited(&mut self) {
        if self.force_composition {
            return;
        }
        self.set_property(PropertyIndex::FbId, 0);
        self.force_composition = true;
        self.changed = true;
    }

    pub(crate) fn fb_id(&self) -> Option<u64> {
        self.property_value(PropertyIndex::FbId).filter(|id| *id != 0)
    }

    pub(crate) fn zpos(&self) -> Option<i32> {
        self.property_value(PropertyIndex::Zpos).map(|z| z as i32)
    }

    pub(crate) fn visible(&self) -> bool {
        if self.property_value(PropertyIndex::Alpha) == Some(0) {
            return false;
        }
        self.force_composition || self.fb_id().is_some()
    }

    pub(crate) fn rect(&self) -> Rect {
        Rect {
            x: self.property_value(PropertyIndex::CrtcX).unwrap_or(0) as i32,
            y: self.property_value(PropertyIndex::CrtcY).unwrap_or(0) as i32,
            w: self.property_value(PropertyIndex::CrtcW).unwrap_or(0) as i32,
            h: self.property_value(PropertyIndex::CrtcH).unwrap_or(0) as i32,
        }
    }

    /// Whether two layers are both visible and their destination rectangles
    /// overlap.
    pub(crate) fn intersects(&self, other: &Layer) -> bool {
        self.visible() && other.visible() && self.rect().overlaps(&other.rect())
    }

    /// Snapshots the current state as the baseline for the next reuse check.
    pub(crate) fn clean(&mut self) {
        self.changed = false;
        self.prev_fb_info = self.fb_info;
        for prop in &mut self.props {
            prop.prev_value = prop.value;
        }
    }

    /// Tracks framebuffer turnover. Every [`PRIORITY_PERIOD`] page-flips the
    /// pending counter is promoted to the current priority.
    pub(crate) fn update_priority(&mut self, age: bool) {
        if let Some(prop) = self.property(PropertyIndex::FbId) {
            if prop.prev_value != prop.value {
                self.pending_priority += 1;
            }
        }

        if age {
            if self.current_priority != self.pending_priority {
                debug!(
                    layer = self.id.0,
                    from = self.current_priority,
                    to = self.pending_priority,
                    "layer priority changed"
                );
            }
            self.current_priority = self.pending_priority;
            self.pending_priority = 0;
        }
    }

    /// Whether the state of this layer still matches the previous allocation.
    ///
    /// ALPHA tweaks strictly inside (0, 0xFFFF), fence and damage updates and
    /// framebuffer swaps with identical scanout parameters do not require a
    /// fresh allocation.
    pub(crate) fn needs_realloc(&self) -> bool {
        if self.changed {
            return true;
        }

        for prop in &self.props {
            if prop.index == PropertyIndex::FbId {
                if prop.value == 0 && prop.prev_value == 0 {
                    continue;
                }
                if prop.value == 0 || prop.prev_value == 0 {
                    return true;
                }
                if FbInfo::needs_realloc(self.fb_info.as_ref(), self.prev_fb_info.as_ref()) {
                    return true;
                }
                continue;
            }

            if prop.value == prop.prev_value {
                continue;
            }

            match prop.index {
                PropertyIndex::Alpha => {
                    if prop.value == 0
                        || prop.prev_value == 0
                        || prop.value == 0xFFFF
                        || prop.prev_value == 0xFFFF
                    {
                        return true;
                    }
                }
                PropertyIndex::InFenceFd | PropertyIndex::FbDamageClips => {}
                _ => return true,
            }
        }

        false
    }

    pub(crate) fn add_candidate(&mut self, plane: plane::Handle) {
        if !self.candidates.contains(&plane) {
            self.candidates.push(plane);
        }
    }

    pub(crate) fn reset_candidates(&mut self) {
        self.candidates.clear();
    }
}

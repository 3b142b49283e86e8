//! Hardware plane model.
//!
//! A [`Plane`] mirrors one KMS plane object: its driver properties, hardware
//! type, stacking position and the format/modifier matrix advertised through
//! the `IN_FORMATS` blob. Planes stage property writes into the caller's
//! request when the allocator pairs them with a layer.

use drm::control::{crtc, plane, PlaneType};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::trace;

use crate::layer::{FbInfo, Layer, LayerId};
use crate::property::{PlaneProperty, PropertyIndex};
use crate::raw_handle;
use crate::request::AtomicRequest;

/// Why a configuration could not be staged on a plane.
///
/// Both cases mean "this plane cannot display this layer" and are treated as
/// pruning signals by the search, never as fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageError {
    /// The plane does not expose a property the layer needs.
    Missing(PropertyIndex),
    /// The kernel metadata rejected the value.
    Rejected(PropertyIndex),
}

/// A registered hardware plane.
#[derive(Debug)]
pub struct Plane {
    handle: plane::Handle,
    ty: PlaneType,
    zpos: i32,
    pub(crate) compatible_crtcs: Vec<crtc::Handle>,
    props: Vec<PlaneProperty>,
    pub(crate) in_formats: Option<FormatModifierSet>,
    /// Layer currently displayed by this plane.
    pub(crate) layer: Option<LayerId>,
}

impl Plane {
    pub(crate) fn new(
        handle: plane::Handle,
        ty: PlaneType,
        zpos: i32,
        compatible_crtcs: Vec<crtc::Handle>,
        props: Vec<PlaneProperty>,
        in_formats: Option<FormatModifierSet>,
    ) -> Self {
        Self {
            handle,
            ty,
            zpos,
            compatible_crtcs,
            props,
            in_formats,
            layer: None,
        }
    }

    /// The drm handle of this plane.
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// The hardware type of this plane.
    pub fn plane_type(&self) -> PlaneType {
        self.ty
    }

    /// The stacking position of this plane, either read from the driver's
    /// `zpos` property or synthesized from the plane type.
    pub fn zpos(&self) -> i32 {
        self.zpos
    }

    pub(crate) fn property(&self, index: PropertyIndex) -> Option<&PlaneProperty> {
        self.props.iter().find(|prop| prop.index == index)
    }

    /// Stages all property writes turning this plane into "displays `layer`
    /// on `crtc`", or into "disabled" when no layer is given.
    ///
    /// The request is rewound to its entry state on every failure path.
    pub(crate) fn stage(
        &self,
        layer: Option<(&Layer, crtc::Handle)>,
        req: &mut AtomicRequest,
    ) -> Result<(), StageError> {
        let cursor = req.cursor();
        let result = self.stage_writes(layer, req);
        if result.is_err() {
            req.rewind(cursor);
        }
        result
    }

    fn stage_writes(
        &self,
        layer: Option<(&Layer, crtc::Handle)>,
        req: &mut AtomicRequest,
    ) -> Result<(), StageError> {
        let Some((layer, crtc)) = layer else {
            self.write(req, PropertyIndex::FbId, 0)?;
            self.write(req, PropertyIndex::CrtcId, 0)?;
            return Ok(());
        };

        self.write(req, PropertyIndex::CrtcId, raw_handle(crtc) as u64)?;

        for prop in layer.properties() {
            // zpos is read-only input for the allocator, never written back
            if prop.index == PropertyIndex::Zpos {
                continue;
            }

            let Some(plane_prop) = self.property(prop.index) else {
                let noop_default = match prop.index {
                    PropertyIndex::Alpha => prop.value == 0xFFFF,
                    PropertyIndex::Rotation => prop.value == drm_ffi::DRM_MODE_ROTATE_0 as u64,
                    PropertyIndex::ScalingFilter | PropertyIndex::PixelBlendMode => prop.value == 0,
                    PropertyIndex::FbDamageClips => true,
                    _ => false,
                };
                if noop_default {
                    continue;
                }
                trace!(
                    plane = raw_handle(self.handle),
                    property = prop.index.name(),
                    "plane is missing a property set on the layer"
                );
                return Err(StageError::Missing(prop.index));
            };

            self.write_validated(req, plane_prop, prop.value)?;
        }

        Ok(())
    }

    fn write(
        &self,
        req: &mut AtomicRequest,
        index: PropertyIndex,
        value: u64,
    ) -> Result<(), StageError> {
        let Some(plane_prop) = self.property(index) else {
            trace!(
                plane = raw_handle(self.handle),
                property = index.name(),
                "plane is missing a required property"
            );
            return Err(StageError::Missing(index));
        };
        self.write_validated(req, plane_prop, value)
    }

    fn write_validated(
        &self,
        req: &mut AtomicRequest,
        plane_prop: &PlaneProperty,
        value: u64,
    ) -> Result<(), StageError> {
        if !plane_prop.validate(value) {
            trace!(
                plane = raw_handle(self.handle),
                property = plane_prop.index.name(),
                value,
                "value rejected by property metadata"
            );
            return Err(StageError::Rejected(plane_prop.index));
        }
        req.add_property(self.handle, plane_prop.handle, value);
        Ok(())
    }

    /// Whether this plane can scan out the given framebuffer, judged by the
    /// `IN_FORMATS` matrix. Returns `true` when there is not enough
    /// information to reject (no modifier on the framebuffer, or no blob on
    /// the plane).
    pub(crate) fn supports_framebuffer(&self, fb: Option<&FbInfo>) -> bool {
        let (Some(fb), Some(set)) = (fb, self.in_formats.as_ref()) else {
            return true;
        };
        if !fb.has_modifier {
            return true;
        }
        let supported = set.supports(fb.format, fb.modifier);
        if !supported {
            trace!(
                plane = raw_handle(self.handle),
                format = ?DrmFourcc::try_from(fb.format).map_err(|err| err.0),
                modifier = ?DrmModifier::from(fb.modifier),
                "framebuffer not listed in IN_FORMATS"
            );
        }
        supported
    }
}

/// Synthesizes a zpos for a plane whose driver does not expose one.
///
/// Overlays registered after the first (primary) plane are assumed to sit
/// above it, earlier ones below.
pub(crate) fn guess_zpos(ty: PlaneType, handle: plane::Handle, first: Option<&Plane>) -> i32 {
    match ty {
        PlaneType::Primary => 0,
        PlaneType::Cursor => 2,
        PlaneType::Overlay => match first {
            None => 0,
            Some(first) if raw_handle(handle) < raw_handle(first.handle) => -1,
            Some(_) => 1,
        },
    }
}

/// Parsed `IN_FORMATS` blob: the format array plus one bitmap window per
/// modifier.
#[derive(Debug, Clone, Default)]
pub(crate) struct FormatModifierSet {
    formats: Vec<u32>,
    modifiers: Vec<ModifierWindow>,
}

#[derive(Debug, Clone, Copy)]
struct ModifierWindow {
    modifier: u64,
    offset: u32,
    formats: u64,
}

// struct drm_format_modifier_blob layout
const BLOB_VERSION: u32 = 1;
const BLOB_COUNT_FORMATS: usize = 8;
const BLOB_FORMATS_OFFSET: usize = 12;
const BLOB_COUNT_MODIFIERS: usize = 16;
const BLOB_MODIFIERS_OFFSET: usize = 20;
const MODIFIER_ENTRY_SIZE: usize = 24;

fn read_u32(blob: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(
        blob.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

fn read_u64(blob: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_ne_bytes(
        blob.get(offset..offset + 8)?.try_into().ok()?,
    ))
}

impl FormatModifierSet {
    /// Parses a raw `IN_FORMATS` property blob. Returns `None` when the blob
    /// is truncated or has an unknown version.
    pub(crate) fn parse(blob: &[u8]) -> Option<Self> {
        if read_u32(blob, 0)? != BLOB_VERSION {
            return None;
        }

        let count_formats = read_u32(blob, BLOB_COUNT_FORMATS)? as usize;
        let formats_offset = read_u32(blob, BLOB_FORMATS_OFFSET)? as usize;
        let count_modifiers = read_u32(blob, BLOB_COUNT_MODIFIERS)? as usize;
        let modifiers_offset = read_u32(blob, BLOB_MODIFIERS_OFFSET)? as usize;

        let mut formats = Vec::with_capacity(count_formats);
        for i in 0..count_formats {
            formats.push(read_u32(blob, formats_offset.checked_add(i * 4)?)?);
        }

        let mut modifiers = Vec::with_capacity(count_modifiers);
        for i in 0..count_modifiers {
            let base = modifiers_offset.checked_add(i * MODIFIER_ENTRY_SIZE)?;
            modifiers.push(ModifierWindow {
                formats: read_u64(blob, base)?,
                offset: read_u32(blob, base + 8)?,
                modifier: read_u64(blob, base + 16)?,
            });
        }

        Some(Self { formats, modifiers })
    }

    fn supports(&self, format: u32, modifier: u64) -> bool {
        let Some(format_index) = self.formats.iter().position(|f| *f == format) else {
            return false;
        };
        let Some(window) = self.modifiers.iter().find(|m| m.modifier == modifier) else {
            return false;
        };

        let offset = window.offset as usize;
        if format_index < offset || format_index >= offset + 64 {
            return false;
        }
        window.formats & (1u64 << (format_index - offset)) != 0
    }
}

//! Typed view over KMS plane and layer properties.
//!
//! Kernel property names are mapped to a small closed enum at plane
//! registration; everything downstream indexes by [`PropertyIndex`], never by
//! string. For each driver property the kernel's declared value constraints
//! are captured as a [`PropertyKind`] and used to reject invalid writes before
//! they ever reach a test commit.

use drm::control::property;

/// The set of recognized KMS property names.
///
/// Unknown property names are ignored during plane registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyIndex {
    /// `type`
    Type,
    /// `FB_ID`
    FbId,
    /// `CRTC_ID`
    CrtcId,
    /// `CRTC_X`
    CrtcX,
    /// `CRTC_Y`
    CrtcY,
    /// `CRTC_W`
    CrtcW,
    /// `CRTC_H`
    CrtcH,
    /// `SRC_X`
    SrcX,
    /// `SRC_Y`
    SrcY,
    /// `SRC_W`
    SrcW,
    /// `SRC_H`
    SrcH,
    /// `zpos`
    Zpos,
    /// `alpha`
    Alpha,
    /// `rotation`
    Rotation,
    /// `SCALING FILTER`
    ScalingFilter,
    /// `pixel blend mode`
    PixelBlendMode,
    /// `FB_DAMAGE_CLIPS`
    FbDamageClips,
    /// `IN_FENCE_FD`
    InFenceFd,
    /// `IN_FORMATS`
    InFormats,
}

impl PropertyIndex {
    /// Maps a kernel property name to its index.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "type" => Self::Type,
            "FB_ID" => Self::FbId,
            "CRTC_ID" => Self::CrtcId,
            "CRTC_X" => Self::CrtcX,
            "CRTC_Y" => Self::CrtcY,
            "CRTC_W" => Self::CrtcW,
            "CRTC_H" => Self::CrtcH,
            "SRC_X" => Self::SrcX,
            "SRC_Y" => Self::SrcY,
            "SRC_W" => Self::SrcW,
            "SRC_H" => Self::SrcH,
            "zpos" => Self::Zpos,
            "alpha" => Self::Alpha,
            "rotation" => Self::Rotation,
            "SCALING FILTER" => Self::ScalingFilter,
            "pixel blend mode" => Self::PixelBlendMode,
            "FB_DAMAGE_CLIPS" => Self::FbDamageClips,
            "IN_FENCE_FD" => Self::InFenceFd,
            "IN_FORMATS" => Self::InFormats,
            _ => return None,
        })
    }

    /// The kernel name of this property.
    pub fn name(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::FbId => "FB_ID",
            Self::CrtcId => "CRTC_ID",
            Self::CrtcX => "CRTC_X",
            Self::CrtcY => "CRTC_Y",
            Self::CrtcW => "CRTC_W",
            Self::CrtcH => "CRTC_H",
            Self::SrcX => "SRC_X",
            Self::SrcY => "SRC_Y",
            Self::SrcW => "SRC_W",
            Self::SrcH => "SRC_H",
            Self::Zpos => "zpos",
            Self::Alpha => "alpha",
            Self::Rotation => "rotation",
            Self::ScalingFilter => "SCALING FILTER",
            Self::PixelBlendMode => "pixel blend mode",
            Self::FbDamageClips => "FB_DAMAGE_CLIPS",
            Self::InFenceFd => "IN_FENCE_FD",
            Self::InFormats => "IN_FORMATS",
        }
    }
}

/// Driver-declared value constraints of a plane property.
#[derive(Debug, Clone)]
pub(crate) enum PropertyKind {
    /// Unsigned range, bounds inclusive.
    Range { min: u64, max: u64 },
    /// Signed range, bounds inclusive.
    SignedRange { min: i64, max: i64 },
    /// One of a set of discrete values.
    Enum { values: Vec<u64> },
    /// Any combination of the declared bits.
    Bitmask { mask: u64 },
    /// No constraint known to us (objects, blobs, booleans).
    Other,
}

/// A driver property observed on a plane.
#[derive(Debug, Clone)]
pub(crate) struct PlaneProperty {
    pub(crate) index: PropertyIndex,
    pub(crate) handle: property::Handle,
    pub(crate) kind: PropertyKind,
    pub(crate) immutable: bool,
}

impl PlaneProperty {
    /// Checks a value against the kernel's metadata for this property.
    pub(crate) fn validate(&self, value: u64) -> bool {
        if self.immutable {
            return false;
        }
        match &self.kind {
            PropertyKind::Range { min, max } => (*min..=*max).contains(&value),
            PropertyKind::SignedRange { min, max } => (*min..=*max).contains(&(value as i64)),
            PropertyKind::Enum { values } => values.contains(&value),
            PropertyKind::Bitmask { mask } => value & !mask == 0,
            PropertyKind::Other => true,
        }
    }
}

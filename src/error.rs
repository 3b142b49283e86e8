use std::io;
use std::path::PathBuf;

use drm::control::{crtc, plane};

use crate::layer::LayerId;
use crate::output::OutputId;

/// Errors returned by [`Device`](crate::Device) operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device encountered an access error while talking to the kernel
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Tried to register a plane that is already registered
    #[error("Plane `{0:?}` is already registered")]
    PlaneExists(plane::Handle),
    /// The driver did not expose the mandatory `type` property on a plane
    #[error("Plane `{0:?}` is missing the required `type` property")]
    MissingPlaneType(plane::Handle),
    /// A plane is missing a property required to stage a configuration
    #[error("Plane `{plane:?}` is missing the `{name}` property")]
    MissingPlaneProperty {
        /// Plane the property was looked up on
        plane: plane::Handle,
        /// Kernel name of the missing property
        name: &'static str,
    },
    /// The given plane is not registered with this device
    #[error("Plane `{0:?}` is not registered with this device")]
    UnknownPlane(plane::Handle),
    /// The given crtc does not belong to this device
    #[error("Crtc `{0:?}` does not belong to this device")]
    UnknownCrtc(crtc::Handle),
    /// The given output was destroyed or belongs to another device
    #[error("Output `{0:?}` does not exist on this device")]
    UnknownOutput(OutputId),
    /// The given layer was destroyed or belongs to another device
    #[error("Layer `{0:?}` does not exist on this device")]
    UnknownLayer(LayerId),
    /// The given layer belongs to a different output
    #[error("Layer `{0:?}` does not belong to output `{1:?}`")]
    ForeignLayer(LayerId, OutputId),
    /// CRTC_ID is managed by the allocator and cannot be set on a layer
    #[error("Refusing to set CRTC_ID on a layer")]
    LayerCrtcForbidden,
}

/// Error type of the underlying device access.
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying kernel error
    pub source: io::Error,
}

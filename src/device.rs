//! Device wrapper.
//!
//! A [`Device`] owns a duplicated drm file descriptor and everything hanging
//! off it: the ordered plane list, the outputs and their layers. All other
//! entities are addressed through it by id, which keeps the cyclic
//! plane/layer/output references of the problem domain out of the ownership
//! graph.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use drm::control::{crtc, plane, property, AtomicCommitFlags, Device as ControlDevice, PlaneType, ResourceHandles};
use rustix::io::Errno;
use tracing::{debug, error, info_span, warn};

use crate::error::{AccessError, Error};
use crate::layer::{FbInfo, Layer, LayerId, PRIORITY_PERIOD};
use crate::output::{Output, OutputId};
use crate::plane::{guess_zpos, FormatModifierSet, Plane};
use crate::property::{PlaneProperty, PropertyIndex, PropertyKind};
use crate::raw_handle;
use crate::request::AtomicRequest;

/// The drm file descriptor owned by a [`Device`].
#[derive(Debug)]
pub struct DeviceFd(OwnedFd);

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DeviceFd {}
impl ControlDevice for DeviceFd {}

impl DeviceFd {
    /// Returns the path of the open device if possible.
    pub(crate) fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.0.as_raw_fd())).ok()
    }
}

/// Outcome of a TEST_ONLY commit probe.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Probe {
    /// The kernel accepts the staged configuration.
    Accepted,
    /// The kernel rejected the staged configuration.
    Rejected(Errno),
}

// drm-ffi and drm-rs error types both convert losslessly into io::Error.
pub(crate) fn ffi_err(err: impl Into<io::Error>) -> io::Error {
    err.into()
}

/// Asks the kernel whether the staged configuration would be accepted,
/// retrying on transient failures.
///
/// The kernel returns EINVAL for an unsupported configuration, ERANGE for
/// CRTC coordinate overflow and ENOSPC for invalid SRC coordinates; all three
/// are reported as [`Probe::Rejected`]. Everything else is fatal.
#[profiling::function]
pub(crate) fn test_commit(
    fd: &DeviceFd,
    req: &AtomicRequest,
    flags: AtomicCommitFlags,
) -> Result<Probe, Error> {
    // a test commit never flips, the event flag must not leak into it
    let flags = flags.difference(AtomicCommitFlags::PAGE_FLIP_EVENT) | AtomicCommitFlags::TEST_ONLY;

    loop {
        let Err(err) = fd.atomic_commit(flags, req.build()) else {
            return Ok(Probe::Accepted);
        };
        let err = ffi_err(err);
        match err.raw_os_error().map(Errno::from_raw_os_error) {
            Some(Errno::INTR | Errno::AGAIN) => continue,
            Some(errno @ (Errno::INVAL | Errno::RANGE | Errno::NOSPC)) => {
                return Ok(Probe::Rejected(errno))
            }
            _ => {
                error!("atomic test commit failed: {}", err);
                return Err(Error::Access(AccessError {
                    errmsg: "Atomic test commit failed",
                    dev: fd.dev_path(),
                    source: err,
                }));
            }
        }
    }
}

/// An open KMS device and the planes, outputs and layers registered on it.
#[derive(Debug)]
pub struct Device {
    pub(crate) fd: DeviceFd,
    resources: ResourceHandles,
    pub(crate) inner: DeviceInner,
    pub(crate) span: tracing::Span,
}

/// Everything of a [`Device`] that does not need the file descriptor.
#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub(crate) crtcs: Vec<crtc::Handle>,
    /// Ordered plane list: primary planes first, then the remaining planes
    /// by descending zpos.
    pub(crate) planes: Vec<Plane>,
    pub(crate) outputs: HashMap<OutputId, Output>,
    pub(crate) layers: HashMap<LayerId, Layer>,
    next_output: u32,
    next_layer: u32,
    /// Test commits issued by the most recent allocation.
    pub(crate) test_commits: u32,
    page_flips: u32,
}

impl DeviceInner {
    pub(crate) fn new(crtcs: Vec<crtc::Handle>) -> Self {
        Self {
            crtcs,
            planes: Vec::new(),
            outputs: HashMap::new(),
            layers: HashMap::new(),
            next_output: 0,
            next_layer: 0,
            test_commits: 0,
            page_flips: 0,
        }
    }

    /// Inserts a plane at its ordered position: primary planes are prepended,
    /// any other plane goes in front of the first non-primary plane with a
    /// lower or equal zpos.
    pub(crate) fn insert_plane(&mut self, plane: Plane) {
        if plane.plane_type() == PlaneType::Primary {
            self.planes.insert(0, plane);
            return;
        }
        let position = self.planes.iter().position(|cur| {
            cur.plane_type() != PlaneType::Primary && plane.zpos() >= cur.zpos()
        });
        match position {
            Some(position) => self.planes.insert(position, plane),
            None => self.planes.push(plane),
        }
    }

    pub(crate) fn tick_priorities(&mut self) {
        self.page_flips += 1;
        let age = self.page_flips >= PRIORITY_PERIOD;
        if age {
            self.page_flips = 0;
        }
        for layer in self.layers.values_mut() {
            layer.update_priority(age);
        }
    }

    pub(crate) fn output(&self, id: OutputId) -> Result<&Output, Error> {
        self.outputs.get(&id).ok_or(Error::UnknownOutput(id))
    }

    pub(crate) fn layer(&self, id: LayerId) -> Result<&Layer, Error> {
        self.layers.get(&id).ok_or(Error::UnknownLayer(id))
    }

    pub(crate) fn create_output(&mut self, crtc: crtc::Handle) -> Result<OutputId, Error> {
        let crtc_index = self
            .crtcs
            .iter()
            .position(|c| *c == crtc)
            .ok_or(Error::UnknownCrtc(crtc))?;
        let id = OutputId(self.next_output);
        self.next_output += 1;
        self.outputs.insert(id, Output::new(crtc, crtc_index));
        Ok(id)
    }

    /// Destroys an output. Its layers survive and must be destroyed by the
    /// client; any plane still scanning one of them out is released.
    pub(crate) fn destroy_output(&mut self, id: OutputId) -> Result<(), Error> {
        let output = self.outputs.remove(&id).ok_or(Error::UnknownOutput(id))?;
        for layer_id in output.layers {
            if let Some(layer) = self.layers.get_mut(&layer_id) {
                if let Some(plane_handle) = layer.plane.take() {
                    if let Some(plane) = self.planes.iter_mut().find(|p| p.handle() == plane_handle)
                    {
                        plane.layer = None;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn create_layer(&mut self, output: OutputId) -> Result<LayerId, Error> {
        let out = self.outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
        let id = LayerId(self.next_layer);
        self.next_layer += 1;
        out.layers.push(id);
        out.layers_changed = true;
        self.layers.insert(id, Layer::new(id, output));
        Ok(id)
    }

    pub(crate) fn destroy_layer(&mut self, id: LayerId) -> Result<(), Error> {
        let layer = self.layers.remove(&id).ok_or(Error::UnknownLayer(id))?;
        if let Some(output) = self.outputs.get_mut(&layer.output) {
            output.layers.retain(|l| *l != id);
            output.layers_changed = true;
            if output.composition_layer == Some(id) {
                output.composition_layer = None;
            }
        }
        if let Some(plane_handle) = layer.plane {
            if let Some(plane) = self.planes.iter_mut().find(|p| p.handle() == plane_handle) {
                plane.layer = None;
            }
        }
        Ok(())
    }

    pub(crate) fn set_layer_property(
        &mut self,
        id: LayerId,
        index: PropertyIndex,
        value: u64,
    ) -> Result<(), Error> {
        if index == PropertyIndex::CrtcId {
            error!("refusing to set CRTC_ID on a layer");
            return Err(Error::LayerCrtcForbidden);
        }
        let layer = self.layers.get_mut(&id).ok_or(Error::UnknownLayer(id))?;
        layer.set_property(index, value);
        Ok(())
    }

    pub(crate) fn unset_layer_property(
        &mut self,
        id: LayerId,
        index: PropertyIndex,
    ) -> Result<(), Error> {
        let layer = self.layers.get_mut(&id).ok_or(Error::UnknownLayer(id))?;
        layer.unset_property(index);
        Ok(())
    }

    pub(crate) fn mark_composited(&mut self, id: LayerId) -> Result<(), Error> {
        let layer = self.layers.get_mut(&id).ok_or(Error::UnknownLayer(id))?;
        layer.mark_composited();
        Ok(())
    }

    pub(crate) fn set_composition_layer(
        &mut self,
        output: OutputId,
        layer: LayerId,
    ) -> Result<(), Error> {
        let owner = self.layer(layer)?.output;
        if owner != output {
            return Err(Error::ForeignLayer(layer, output));
        }
        let out = self.outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
        if out.composition_layer != Some(layer) {
            out.layers_changed = true;
        }
        out.composition_layer = Some(layer);
        Ok(())
    }

    pub(crate) fn layer_needs_composition(&self, id: LayerId) -> Result<bool, Error> {
        let layer = self.layer(id)?;
        Ok(layer.visible() && layer.plane.is_none())
    }

    pub(crate) fn output_needs_composition(&self, id: OutputId) -> Result<bool, Error> {
        let output = self.output(id)?;
        for layer_id in &output.layers {
            if self.layer_needs_composition(*layer_id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Device {
    /// Creates a device on top of an open drm node. The file descriptor is
    /// duplicated; the caller keeps ownership of the one passed in.
    pub fn new(fd: impl AsFd) -> Result<Self, Error> {
        let owned = fd.as_fd().try_clone_to_owned().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to duplicate drm file descriptor",
                dev: None,
                source,
            })
        })?;
        let fd = DeviceFd(owned);
        let span = info_span!("drm_offload", dev = ?fd.dev_path());

        let resources = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: fd.dev_path(),
                source: ffi_err(source),
            })
        })?;
        let crtcs = resources.crtcs().to_vec();

        Ok(Device {
            fd,
            resources,
            inner: DeviceInner::new(crtcs),
            span,
        })
    }

    /// Registers every plane the driver exposes.
    pub fn register_all_planes(&mut self) -> Result<(), Error> {
        let planes = self.fd.plane_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading planes",
                dev: self.fd.dev_path(),
                source: ffi_err(source),
            })
        })?;
        for plane in planes {
            self.register_plane(plane)?;
        }
        Ok(())
    }

    /// Registers a single plane, reading its properties, zpos and IN_FORMATS
    /// matrix from the driver.
    pub fn register_plane(&mut self, handle: plane::Handle) -> Result<(), Error> {
        let _guard = self.span.enter();

        if self.inner.planes.iter().any(|p| p.handle() == handle) {
            error!(plane = raw_handle(handle), "tried to register plane twice");
            return Err(Error::PlaneExists(handle));
        }

        let info = self.fd.get_plane(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to load plane info",
                dev: self.fd.dev_path(),
                source: ffi_err(source),
            })
        })?;
        let compatible_crtcs = self.resources.filter_crtcs(info.possible_crtcs());

        let props = self.fd.get_properties(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to load plane properties",
                dev: self.fd.dev_path(),
                source: ffi_err(source),
            })
        })?;

        let mut table = Vec::new();
        let mut ty = None;
        let mut zpos = None;
        let mut in_formats = None;

        for (prop_handle, raw_value) in props {
            let Ok(prop_info) = self.fd.get_property(prop_handle) else {
                continue;
            };
            let Ok(name) = prop_info.name().to_str() else {
                continue;
            };
            let Some(index) = PropertyIndex::from_name(name) else {
                continue;
            };

            match index {
                PropertyIndex::Type => ty = plane_type_from_value(raw_value),
                PropertyIndex::Zpos => zpos = Some(raw_value as i32),
                PropertyIndex::InFormats => {
                    let data = self.fd.get_property_blob(raw_value).map_err(|source| {
                        Error::Access(AccessError {
                            errmsg: "Failed to read the IN_FORMATS blob",
                            dev: self.fd.dev_path(),
                            source: ffi_err(source),
                        })
                    })?;
                    in_formats = FormatModifierSet::parse(&data);
                    if in_formats.is_none() {
                        warn!(plane = raw_handle(handle), "ignoring malformed IN_FORMATS blob");
                    }
                }
                _ => {}
            }

            let kind = property_kind(&self.fd, prop_handle, &prop_info);
            table.push(PlaneProperty {
                index,
                handle: prop_handle,
                kind,
                immutable: !prop_info.mutable(),
            });
        }

        let Some(ty) = ty else {
            error!(plane = raw_handle(handle), "plane is missing the `type` property");
            return Err(Error::MissingPlaneType(handle));
        };
        let zpos = zpos.unwrap_or_else(|| guess_zpos(ty, handle, self.inner.planes.first()));

        debug!(plane = raw_handle(handle), ?ty, zpos, "registered plane");
        self.inner.insert_plane(Plane::new(
            handle,
            ty,
            zpos,
            compatible_crtcs,
            table,
            in_formats,
        ));
        Ok(())
    }

    /// Removes a plane from the device, releasing the layer it displays.
    pub fn unregister_plane(&mut self, handle: plane::Handle) -> Result<(), Error> {
        let position = self
            .inner
            .planes
            .iter()
            .position(|p| p.handle() == handle)
            .ok_or(Error::UnknownPlane(handle))?;
        let plane = self.inner.planes.remove(position);
        if let Some(layer) = plane.layer {
            if let Some(layer) = self.inner.layers.get_mut(&layer) {
                layer.plane = None;
            }
        }
        Ok(())
    }

    /// The registered planes, in allocation order.
    pub fn planes(&self) -> &[Plane] {
        &self.inner.planes
    }

    /// Looks up a registered plane.
    pub fn plane(&self, handle: plane::Handle) -> Option<&Plane> {
        self.inner.planes.iter().find(|p| p.handle() == handle)
    }

    /// The crtcs of this device, in driver order.
    pub fn crtcs(&self) -> &[crtc::Handle] {
        &self.inner.crtcs
    }

    /// Number of test commits issued by the most recent allocation.
    pub fn test_commit_count(&self) -> u32 {
        self.inner.test_commits
    }

    /// Creates an output for the given crtc.
    pub fn create_output(&mut self, crtc: crtc::Handle) -> Result<OutputId, Error> {
        self.inner.create_output(crtc)
    }

    /// Destroys an output. Its layers survive and must be destroyed by the
    /// client.
    pub fn destroy_output(&mut self, output: OutputId) -> Result<(), Error> {
        self.inner.destroy_output(output)
    }

    /// Designates the layer receiving the composited fallback image of every
    /// layer the allocator cannot place. The layer must belong to the output.
    pub fn set_composition_layer(&mut self, output: OutputId, layer: LayerId) -> Result<(), Error> {
        self.inner.set_composition_layer(output, layer)
    }

    /// Whether any visible layer of the output is missing a plane and needs
    /// the composition fallback.
    pub fn output_needs_composition(&self, output: OutputId) -> Result<bool, Error> {
        self.inner.output_needs_composition(output)
    }

    /// Consecutive frames the previous allocation of this output has been
    /// reused for.
    pub fn output_reuse_count(&self, output: OutputId) -> Result<u32, Error> {
        Ok(self.inner.output(output)?.reuse_count)
    }

    /// Creates a layer on the given output.
    pub fn create_layer(&mut self, output: OutputId) -> Result<LayerId, Error> {
        self.inner.create_layer(output)
    }

    /// Destroys a layer, releasing its plane.
    pub fn destroy_layer(&mut self, layer: LayerId) -> Result<(), Error> {
        self.inner.destroy_layer(layer)
    }

    /// Sets a property on a layer. Setting CRTC_ID is rejected, the allocator
    /// manages it.
    pub fn set_layer_property(
        &mut self,
        layer: LayerId,
        index: PropertyIndex,
        value: u64,
    ) -> Result<(), Error> {
        self.inner.set_layer_property(layer, index, value)
    }

    /// Removes a property from a layer.
    pub fn unset_layer_property(&mut self, layer: LayerId, index: PropertyIndex) -> Result<(), Error> {
        self.inner.unset_layer_property(layer, index)
    }

    /// Forces the layer into composition: clears its framebuffer and keeps it
    /// visible so overlapping layers are constrained correctly. Setting FB_ID
    /// again undoes this.
    pub fn mark_composited(&mut self, layer: LayerId) -> Result<(), Error> {
        self.inner.mark_composited(layer)
    }

    /// The plane currently displaying this layer, if any.
    pub fn layer_plane(&self, layer: LayerId) -> Result<Option<plane::Handle>, Error> {
        Ok(self.inner.layer(layer)?.plane)
    }

    /// Whether the layer is currently visible.
    pub fn layer_visible(&self, layer: LayerId) -> Result<bool, Error> {
        Ok(self.inner.layer(layer)?.visible())
    }

    /// Whether the layer is visible but has no plane, so its content must be
    /// composited by the client.
    pub fn layer_needs_composition(&self, layer: LayerId) -> Result<bool, Error> {
        self.inner.layer_needs_composition(layer)
    }

    /// Whether the plane was staged as a candidate for this layer during the
    /// last allocation.
    pub fn is_candidate_plane(&self, layer: LayerId, plane: plane::Handle) -> Result<bool, Error> {
        Ok(self.inner.layer(layer)?.candidates.contains(&plane))
    }

    /// Refreshes the cached framebuffer metadata of every layer on the
    /// output.
    pub(crate) fn refresh_framebuffers(&mut self, output: OutputId) -> Result<(), Error> {
        let layer_ids = self.inner.output(output)?.layers.clone();
        for id in layer_ids {
            let layer = self
                .inner
                .layers
                .get_mut(&id)
                .expect("output refers to a destroyed layer");
            cache_fb_info(&self.fd, layer)?;
        }
        Ok(())
    }
}

fn plane_type_from_value(value: u64) -> Option<PlaneType> {
    match value {
        0 => Some(PlaneType::Overlay),
        1 => Some(PlaneType::Primary),
        2 => Some(PlaneType::Cursor),
        _ => None,
    }
}

fn property_kind(fd: &DeviceFd, handle: property::Handle, info: &property::Info) -> PropertyKind {
    match info.value_type() {
        property::ValueType::UnsignedRange(min, max) => PropertyKind::Range { min, max },
        property::ValueType::SignedRange(min, max) => PropertyKind::SignedRange { min, max },
        property::ValueType::Enum(values) => PropertyKind::Enum {
            values: values.values().0.to_vec(),
        },
        property::ValueType::Bitmask => PropertyKind::Bitmask {
            mask: bitmask_bits(fd, handle),
        },
        _ => PropertyKind::Other,
    }
}

/// Collects the legal bits of a bitmask property. drm-rs does not expose the
/// enum entries of bitmask properties, so this reads them through drm-ffi.
fn bitmask_bits(fd: &DeviceFd, handle: property::Handle) -> u64 {
    let mut values = Vec::new();
    let mut enums = Vec::new();
    match drm_ffi::mode::get_property(
        fd.as_fd(),
        raw_handle(handle),
        Some(&mut values),
        Some(&mut enums),
    ) {
        Ok(_) => enums.iter().fold(0u64, |mask, entry| mask | (1u64 << entry.value)),
        Err(err) => {
            // without the bits we cannot pre-validate, let the kernel judge
            warn!(property = raw_handle(handle), "failed to read bitmask bits: {}", ffi_err(err));
            !0
        }
    }
}

/// Fetches framebuffer metadata by FB_ID (GETFB2) and caches the
/// scanout-relevant fields on the layer.
///
/// The kernel hands us fresh GEM handles for every call, these are closed
/// right away (each distinct handle exactly once). An EINVAL reply means the
/// framebuffer is gone; the layer keeps working with cleared metadata.
fn cache_fb_info(fd: &DeviceFd, layer: &mut Layer) -> Result<(), Error> {
    let Some(fb_id) = layer.fb_id() else {
        layer.fb_info = None;
        return Ok(());
    };

    // framebuffer metadata is immutable for a given id
    if layer.fb_info.map(|info| info.id) == Some(fb_id) {
        return Ok(());
    }

    let info = match drm_ffi::mode::get_framebuffer2(fd.as_fd(), fb_id as u32) {
        Ok(info) => info,
        Err(err) => {
            let err = ffi_err(err);
            if err.raw_os_error() == Some(Errno::INVAL.raw_os_error()) {
                // the framebuffer is gone, the layer stays usable with
                // cleared metadata
                layer.fb_info = None;
                return Ok(());
            }
            return Err(Error::Access(AccessError {
                errmsg: "Failed to load framebuffer metadata",
                dev: fd.dev_path(),
                source: err,
            }));
        }
    };

    let mut handles = info.handles;
    for i in 0..handles.len() {
        if handles[i] == 0 {
            continue;
        }
        if let Err(err) = drm_ffi::gem::close(fd.as_fd(), handles[i]) {
            warn!("failed to close framebuffer GEM handle: {}", ffi_err(err));
            continue;
        }
        // a handle may back multiple framebuffer planes, close it only once
        for j in i + 1..handles.len() {
            if handles[j] == handles[i] {
                handles[j] = 0;
            }
        }
        handles[i] = 0;
    }

    layer.fb_info = Some(FbInfo {
        id: fb_id,
        width: info.width,
        height: info.height,
        format: info.pixel_format,
        modifier: info.modifier[0],
        has_modifier: info.flags & drm_ffi::DRM_MODE_FB_MODIFIERS != 0,
    });
    Ok(())
}

//! Client buffer import and per-surface GPU state.
//!
//! Each surface owns a [`SurfaceState`] tracking the GPU images its
//! current buffer resolved to. Four import paths exist: shared memory
//! (uploaded, with damage-scoped re-uploads), dmabuf (zero-copy, with a
//! per-plane fallback when combined import fails), the legacy buffer query
//! (capability-gated, format guessed from a coarse channel layout), and
//! solid colors (no image at all). Multi-plane imports are all-or-nothing:
//! a failure on any plane releases every image created so far and leaves
//! the previous contents untouched.

use crate::capabilities::Capabilities;
use crate::device::{DmabufAttributes, GpuDevice, TextureId};
use crate::error::RenderError;
use crate::format::{
    descriptor, dmabuf_fallback_planes, guess_from_component_layout, Format, FormatDescriptor,
    PlaneDescriptor, Swizzle,
};
use crate::geometry::{Rect, Region};
use crate::shader::{ShaderRequirements, ShaderVariant};
use tracing::{debug, trace, warn};

/// A shared-memory buffer as seen at commit time. The memory stays owned
/// by the caller for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct ShmBufferSpec<'a> {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    /// Bytes per row of plane 0.
    pub stride: u32,
    /// The whole pool slice backing the buffer, planes in declared order.
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Contents {
    None,
    Shm { stride: u32 },
    Dmabuf { external: bool },
    Legacy,
    Solid([f32; 4]),
}

/// GPU-side state of one surface's current buffer.
#[derive(Debug)]
pub struct SurfaceState {
    contents: Contents,
    textures: Vec<TextureId>,
    desc: Option<&'static FormatDescriptor>,
    width: u32,
    height: u32,
}

impl SurfaceState {
    pub fn new() -> Self {
        SurfaceState {
            contents: Contents::None,
            textures: Vec::new(),
            desc: None,
            width: 0,
            height: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn textures(&self) -> &[TextureId] {
        &self.textures
    }

    /// Whether the attached contents carry no meaningful alpha.
    pub fn is_opaque(&self) -> bool {
        match self.contents {
            Contents::Solid(color) => color[3] >= 1.0,
            Contents::None => false,
            _ => self.desc.map(|d| d.opaque).unwrap_or(false),
        }
    }

    pub fn solid_color(&self) -> Option<[f32; 4]> {
        match self.contents {
            Contents::Solid(color) => Some(color),
            _ => None,
        }
    }

    pub fn has_contents(&self) -> bool {
        self.contents != Contents::None
    }

    /// The shader key fields determined by the buffer itself. The caller
    /// fills in view-dependent fields (tint, color pipeline, texcoord
    /// source).
    pub fn shader_requirements(&self) -> ShaderRequirements {
        match self.contents {
            Contents::None | Contents::Solid(_) => ShaderRequirements::fallback(),
            Contents::Dmabuf { external: true } => ShaderRequirements {
                variant: ShaderVariant::External,
                input_is_premult: true,
                channel_order: Swizzle::IDENTITY,
                ..Default::default()
            },
            _ => {
                let desc = self.desc.expect("textured contents always carry a descriptor");
                ShaderRequirements {
                    variant: desc.variant,
                    // Wayland RGBA buffers carry premultiplied alpha.
                    input_is_premult: true,
                    channel_order: desc.swizzle,
                    ..Default::default()
                }
            }
        }
    }

    /// Attaches a shared-memory buffer.
    ///
    /// When the new buffer matches the previous one in format and size the
    /// existing images are kept and only `damage` is re-uploaded; any other
    /// change reallocates and uploads everything.
    pub fn attach_shm(
        &mut self,
        device: &mut dyn GpuDevice,
        spec: &ShmBufferSpec<'_>,
        damage: &Region,
    ) -> Result<(), RenderError> {
        let desc = descriptor(spec.format);
        validate_shm(spec, desc)?;

        // A pitch-only change keeps the images; uploads simply use the
        // new row length.
        let reusable = matches!(self.contents, Contents::Shm { .. })
            && self.desc == Some(desc)
            && self.width == spec.width
            && self.height == spec.height;

        if !reusable {
            let mut textures = Vec::with_capacity(desc.planes.len());
            for plane in desc.planes {
                let (w, h) = plane_size(spec.width, spec.height, plane);
                match device.create_texture(plane.texel, w, h) {
                    Ok(texture) => textures.push(texture),
                    Err(err) => {
                        for texture in textures {
                            device.destroy_texture(texture);
                        }
                        return Err(err);
                    }
                }
            }
            self.release(device);
            self.textures = textures;
            self.desc = Some(desc);
            self.width = spec.width;
            self.height = spec.height;
            self.contents = Contents::Shm { stride: spec.stride };
            debug!(format = ?spec.format, width = spec.width, height = spec.height,
                   planes = desc.planes.len(), "allocated shm surface images");
            let full = Region::from_rect(Rect::new(0, 0, spec.width as i32, spec.height as i32));
            return self.upload_damage(device, spec, &full);
        }

        let stride_changed =
            !matches!(self.contents, Contents::Shm { stride } if stride == spec.stride);
        self.contents = Contents::Shm { stride: spec.stride };
        if stride_changed {
            let full = Region::from_rect(Rect::new(0, 0, spec.width as i32, spec.height as i32));
            return self.upload_damage(device, spec, &full);
        }
        self.upload_damage(device, spec, damage)
    }

    /// Re-uploads the damaged rows of the currently attached
    /// shared-memory buffer without touching the allocation. The flushed
    /// buffer must match the attached one in format, size and stride.
    /// Zero-copy contents (dmabuf, legacy) need no flush and ignore the
    /// call.
    pub fn flush_damage(
        &mut self,
        device: &mut dyn GpuDevice,
        spec: &ShmBufferSpec<'_>,
        damage: &Region,
    ) -> Result<(), RenderError> {
        match self.contents {
            Contents::Shm { stride } => {
                let desc = descriptor(spec.format);
                validate_shm(spec, desc)?;
                if stride != spec.stride
                    || self.desc != Some(desc)
                    || self.width != spec.width
                    || self.height != spec.height
                {
                    return Err(RenderError::InvalidParameter(
                        "flushed buffer does not match the attached one".into(),
                    ));
                }
                self.upload_damage(device, spec, damage)
            }
            Contents::None => Err(RenderError::InvalidParameter(
                "flush without an attached buffer".into(),
            )),
            _ => Ok(()),
        }
    }

    fn upload_damage(
        &mut self,
        device: &mut dyn GpuDevice,
        spec: &ShmBufferSpec<'_>,
        damage: &Region,
    ) -> Result<(), RenderError> {
        let desc = self.desc.expect("upload only happens after allocation");
        let buffer_rect = Rect::new(0, 0, spec.width as i32, spec.height as i32);
        for rect in damage.intersected(buffer_rect).rects() {
            for (index, plane) in desc.planes.iter().enumerate() {
                let plane_rect = scale_rect_to_plane(rect, plane);
                if plane_rect.is_empty() {
                    continue;
                }
                let stride = plane_stride(desc, spec.stride, plane);
                let offset = plane_offset(desc, spec, index);
                trace!(plane = index, ?plane_rect, "uploading shm damage");
                device.upload_texture(
                    self.textures[index],
                    plane_rect,
                    stride,
                    &spec.data[offset..],
                )?;
            }
        }
        Ok(())
    }

    /// Attaches a dmabuf. Combined import is tried first; for planar YUV
    /// formats a per-plane fallback converts in the fragment stage instead.
    pub fn attach_dmabuf(
        &mut self,
        device: &mut dyn GpuDevice,
        attrs: &DmabufAttributes,
    ) -> Result<(), RenderError> {
        if !device.capabilities().contains(Capabilities::DMABUF_IMPORT) {
            return Err(RenderError::MissingCapability(Capabilities::DMABUF_IMPORT));
        }
        let desc = descriptor(attrs.format);
        if attrs.planes.len() != desc.planes.len() {
            return Err(RenderError::ImportFailed(format!(
                "{:?} requires {} planes, buffer has {}",
                attrs.format,
                desc.planes.len(),
                attrs.planes.len()
            )));
        }

        let native_ok = desc.planes.len() == 1
            || device
                .capabilities()
                .contains(Capabilities::NATIVE_YUV_SAMPLING);
        if native_ok {
            match device.import_dmabuf(attrs) {
                Ok(texture) => {
                    self.release(device);
                    self.textures = vec![texture];
                    self.desc = Some(desc);
                    self.width = attrs.width;
                    self.height = attrs.height;
                    self.contents = Contents::Dmabuf { external: true };
                    return Ok(());
                }
                Err(err) if dmabuf_fallback_planes(attrs.format).is_some() => {
                    warn!(format = ?attrs.format, %err,
                          "combined dmabuf import failed, importing per plane");
                }
                Err(err) => return Err(err),
            }
        }

        let planes = dmabuf_fallback_planes(attrs.format).ok_or_else(|| {
            RenderError::ImportFailed(format!(
                "no per-plane fallback for {:?} and combined import is unavailable",
                attrs.format
            ))
        })?;
        let mut textures = Vec::with_capacity(planes.len());
        for (index, plane) in planes.iter().enumerate() {
            let (w, h) = plane_size(attrs.width, attrs.height, plane);
            match device.import_dmabuf_plane(attrs, index, plane.texel, w, h) {
                Ok(texture) => textures.push(texture),
                Err(err) => {
                    // All-or-nothing: the surface keeps its previous contents.
                    for texture in textures {
                        device.destroy_texture(texture);
                    }
                    return Err(err);
                }
            }
        }
        self.release(device);
        self.textures = textures;
        self.desc = Some(desc);
        self.width = attrs.width;
        self.height = attrs.height;
        self.contents = Contents::Dmabuf { external: false };
        Ok(())
    }

    /// Attaches a buffer through the legacy query entry point. The true
    /// pixel format is not queryable; it is guessed from the reported
    /// channel layout assuming 8 bits per component.
    pub fn attach_legacy(
        &mut self,
        device: &mut dyn GpuDevice,
        handle: u64,
    ) -> Result<(), RenderError> {
        if !device
            .capabilities()
            .contains(Capabilities::LEGACY_BUFFER_QUERY)
        {
            return Err(RenderError::MissingCapability(
                Capabilities::LEGACY_BUFFER_QUERY,
            ));
        }
        let info = device.query_legacy_buffer(handle)?;
        let format = guess_from_component_layout(info.layout);
        let desc = descriptor(format);
        let mut textures = Vec::with_capacity(desc.planes.len());
        for index in 0..desc.planes.len() {
            match device.import_legacy_plane(handle, index as u32) {
                Ok(texture) => textures.push(texture),
                Err(err) => {
                    for texture in textures {
                        device.destroy_texture(texture);
                    }
                    return Err(err);
                }
            }
        }
        self.release(device);
        self.textures = textures;
        self.desc = Some(desc);
        self.width = info.width;
        self.height = info.height;
        self.contents = Contents::Legacy;
        Ok(())
    }

    /// Attaches a flat color. No GPU image is involved; the surface draws
    /// with the solid program.
    pub fn attach_solid(&mut self, device: &mut dyn GpuDevice, color: [f32; 4], width: u32, height: u32) {
        self.release(device);
        self.desc = None;
        self.width = width;
        self.height = height;
        self.contents = Contents::Solid(color);
    }

    /// Releases all GPU images. The state returns to unattached.
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for texture in self.textures.drain(..) {
            device.destroy_texture(texture);
        }
        self.contents = Contents::None;
    }
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_shm(spec: &ShmBufferSpec<'_>, desc: &FormatDescriptor) -> Result<(), RenderError> {
    if spec.width == 0 || spec.height == 0 {
        return Err(RenderError::InvalidParameter("zero-sized shm buffer".into()));
    }
    if spec.stride < spec.width * desc.bytes_per_pixel {
        return Err(RenderError::InvalidParameter(format!(
            "stride {} too small for width {} ({:?})",
            spec.stride, spec.width, desc.format
        )));
    }
    let mut needed = 0usize;
    for (index, plane) in desc.planes.iter().enumerate() {
        let offset = plane_offset_for(desc, spec.stride, spec.height, index);
        let stride = plane_stride(desc, spec.stride, plane) as usize;
        let rows = plane_size(spec.width, spec.height, plane).1 as usize;
        needed = needed.max(offset + stride * rows);
    }
    if spec.data.len() < needed {
        return Err(RenderError::InvalidParameter(format!(
            "shm pool holds {} bytes, buffer needs {}",
            spec.data.len(),
            needed
        )));
    }
    Ok(())
}

fn plane_size(width: u32, height: u32, plane: &PlaneDescriptor) -> (u32, u32) {
    (
        width.div_ceil(plane.width_divisor),
        height.div_ceil(plane.height_divisor),
    )
}

/// Bytes per row of one plane, derived from the plane-0 stride.
fn plane_stride(desc: &FormatDescriptor, stride: u32, plane: &PlaneDescriptor) -> u32 {
    stride * plane.texel.bytes_per_texel() / (desc.bytes_per_pixel * plane.width_divisor)
}

fn plane_offset(desc: &FormatDescriptor, spec: &ShmBufferSpec<'_>, index: usize) -> usize {
    plane_offset_for(desc, spec.stride, spec.height, index)
}

fn plane_offset_for(desc: &FormatDescriptor, stride: u32, height: u32, index: usize) -> usize {
    // Packed 4:2:2 planes are two views of the same memory.
    if desc.variant == ShaderVariant::YXuxv {
        return 0;
    }
    let mut offset = 0usize;
    for plane in &desc.planes[..index] {
        let rows = height.div_ceil(plane.height_divisor) as usize;
        offset += plane_stride(desc, stride, plane) as usize * rows;
    }
    offset
}

/// Maps a buffer-space damage rect onto a subsampled plane, expanding to
/// cover every touched plane texel.
fn scale_rect_to_plane(rect: &Rect, plane: &PlaneDescriptor) -> Rect {
    let wd = plane.width_divisor as i32;
    let hd = plane.height_divisor as i32;
    let x0 = rect.x.div_euclid(wd);
    let y0 = rect.y.div_euclid(hd);
    let x1 = (rect.right() + wd - 1).div_euclid(wd);
    let y1 = (rect.bottom() + hd - 1).div_euclid(hd);
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::DmabufPlane;

    fn rgba_spec(data: &[u8], width: u32, height: u32) -> ShmBufferSpec<'_> {
        ShmBufferSpec {
            width,
            height,
            format: Format::Argb8888,
            stride: width * 4,
            data,
        }
    }

    #[test]
    fn shm_attach_allocates_declared_plane_count() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        // NV12 2x2: 4 bytes Y + 2 bytes CbCr.
        let data = [0u8; 6];
        let spec = ShmBufferSpec {
            width: 2,
            height: 2,
            format: Format::Nv12,
            stride: 2,
            data: &data,
        };
        state.attach_shm(&mut device, &spec, &Region::new()).unwrap();
        assert_eq!(state.textures().len(), 2);
        assert_eq!(device.texture_size(state.textures()[1]), (1, 1));
    }

    #[test]
    fn shm_reattach_same_geometry_reuses_images() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let data = vec![0u8; 4 * 4 * 4];
        state
            .attach_shm(&mut device, &rgba_spec(&data, 4, 4), &Region::new())
            .unwrap();
        let first = state.textures()[0];
        state
            .attach_shm(
                &mut device,
                &rgba_spec(&data, 4, 4),
                &Region::from_rect(Rect::new(0, 0, 1, 1)),
            )
            .unwrap();
        assert_eq!(state.textures()[0], first);
        assert_eq!(device.live_texture_count(), 1);
    }

    #[test]
    fn shm_resize_reallocates() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let small = vec![0u8; 4 * 4 * 4];
        let large = vec![0u8; 8 * 8 * 4];
        state
            .attach_shm(&mut device, &rgba_spec(&small, 4, 4), &Region::new())
            .unwrap();
        let first = state.textures()[0];
        state
            .attach_shm(&mut device, &rgba_spec(&large, 8, 8), &Region::new())
            .unwrap();
        assert_ne!(state.textures()[0], first);
        assert_eq!(device.live_texture_count(), 1);
        assert_eq!(device.texture_size(state.textures()[0]), (8, 8));
    }

    #[test]
    fn shm_stride_change_keeps_images_and_uploads_everything() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let tight = vec![0u8; 4 * 4 * 4];
        state
            .attach_shm(&mut device, &rgba_spec(&tight, 4, 4), &Region::new())
            .unwrap();
        let first = state.textures()[0];
        device.clear_upload_log();

        // Same geometry, wider pitch: the images survive, the whole
        // buffer re-uploads.
        let padded = vec![0u8; 24 * 4];
        state
            .attach_shm(
                &mut device,
                &ShmBufferSpec {
                    width: 4,
                    height: 4,
                    format: Format::Argb8888,
                    stride: 24,
                    data: &padded,
                },
                &Region::from_rect(Rect::new(0, 0, 1, 1)),
            )
            .unwrap();
        assert_eq!(state.textures()[0], first);
        assert_eq!(device.live_texture_count(), 1);
        let uploads = device.upload_log();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, Rect::new(0, 0, 4, 4));
    }

    #[test]
    fn shm_rejects_undersized_pool() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let data = vec![0u8; 7];
        let err = state
            .attach_shm(&mut device, &rgba_spec(&data, 4, 4), &Region::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidParameter(_)));
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn shm_damage_upload_touches_subsampled_planes() {
        // A 1x1 damage rect on YUV420 must still update the chroma texel
        // covering it.
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let data = vec![128u8; 4 * 4 + 2 * 2 + 2 * 2];
        let spec = ShmBufferSpec {
            width: 4,
            height: 4,
            format: Format::Yuv420,
            stride: 4,
            data: &data,
        };
        state.attach_shm(&mut device, &spec, &Region::new()).unwrap();
        device.clear_upload_log();
        state
            .attach_shm(
                &mut device,
                &spec,
                &Region::from_rect(Rect::new(3, 3, 1, 1)),
            )
            .unwrap();
        let uploads = device.upload_log();
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[1].1, Rect::new(1, 1, 1, 1));
        assert_eq!(uploads[2].1, Rect::new(1, 1, 1, 1));
    }

    #[test]
    fn flush_uploads_only_the_damaged_rect() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let data = vec![0u8; 4 * 4 * 4];
        state
            .attach_shm(&mut device, &rgba_spec(&data, 4, 4), &Region::new())
            .unwrap();
        device.clear_upload_log();
        state
            .flush_damage(
                &mut device,
                &rgba_spec(&data, 4, 4),
                &Region::from_rect(Rect::new(1, 2, 2, 1)),
            )
            .unwrap();
        let uploads = device.upload_log();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, Rect::new(1, 2, 2, 1));
    }

    #[test]
    fn flush_rejects_a_mismatched_buffer() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        let small = vec![0u8; 4 * 4 * 4];
        let large = vec![0u8; 8 * 8 * 4];
        state
            .attach_shm(&mut device, &rgba_spec(&small, 4, 4), &Region::new())
            .unwrap();
        let err = state
            .flush_damage(&mut device, &rgba_spec(&large, 8, 8), &Region::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidParameter(_)));
    }

    fn nv12_dmabuf() -> DmabufAttributes {
        DmabufAttributes {
            width: 4,
            height: 4,
            format: Format::Nv12,
            modifier: None,
            planes: vec![
                DmabufPlane { fd: 10, offset: 0, stride: 4 },
                DmabufPlane { fd: 10, offset: 16, stride: 4 },
            ],
        }
    }

    #[test]
    fn dmabuf_requires_the_capability() {
        let mut device = FakeDevice::new();
        device.set_capabilities(Capabilities::empty());
        let mut state = SurfaceState::new();
        let err = state.attach_dmabuf(&mut device, &nv12_dmabuf()).unwrap_err();
        assert!(matches!(err, RenderError::MissingCapability(_)));
    }

    #[test]
    fn dmabuf_combined_import_yields_one_external_image() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        state.attach_dmabuf(&mut device, &nv12_dmabuf()).unwrap();
        assert_eq!(state.textures().len(), 1);
        assert_eq!(
            state.shader_requirements().variant,
            ShaderVariant::External
        );
    }

    #[test]
    fn dmabuf_falls_back_to_per_plane_import() {
        let mut device = FakeDevice::new();
        device.fail_next_dmabuf_imports(1);
        let mut state = SurfaceState::new();
        state.attach_dmabuf(&mut device, &nv12_dmabuf()).unwrap();
        assert_eq!(state.textures().len(), 2);
        assert_eq!(state.shader_requirements().variant, ShaderVariant::YUv);
    }

    #[test]
    fn dmabuf_partial_plane_failure_releases_everything() {
        let mut device = FakeDevice::new();
        // Combined import fails, then the second per-plane import fails.
        device.fail_next_dmabuf_imports(1);
        device.fail_plane_import(1);
        let mut state = SurfaceState::new();
        assert!(state.attach_dmabuf(&mut device, &nv12_dmabuf()).is_err());
        assert_eq!(device.live_texture_count(), 0);
        assert!(!state.has_contents());
    }

    #[test]
    fn legacy_attach_guesses_format_from_layout() {
        let mut device = FakeDevice::new();
        device.register_legacy_buffer(
            7,
            crate::device::LegacyBufferInfo {
                width: 16,
                height: 16,
                layout: crate::format::LegacyChannelLayout::YUv,
            },
        );
        let mut state = SurfaceState::new();
        state.attach_legacy(&mut device, 7).unwrap();
        assert_eq!(state.textures().len(), 2);
        assert_eq!(state.size(), (16, 16));
        assert_eq!(state.shader_requirements().variant, ShaderVariant::YUv);
    }

    #[test]
    fn solid_attach_carries_no_images() {
        let mut device = FakeDevice::new();
        let mut state = SurfaceState::new();
        state.attach_solid(&mut device, [1.0, 0.0, 0.0, 1.0], 32, 32);
        assert!(state.textures().is_empty());
        assert!(state.is_opaque());
        assert_eq!(
            state.shader_requirements().variant,
            ShaderVariant::Solid
        );
        state.attach_solid(&mut device, [0.0, 0.0, 0.0, 0.5], 32, 32);
        assert!(!state.is_opaque());
    }
}

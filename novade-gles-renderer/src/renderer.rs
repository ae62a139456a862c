//! The renderer facade consumed by the compositor core.
//!
//! One [`GlesRenderer`] owns the GPU device, the process-wide program and
//! color-transform caches, all surfaces and all outputs. The device
//! implementation is chosen exactly once at construction; everything else
//! dispatches through the [`GpuDevice`] trait. All methods run on the
//! single render thread.

use crate::buffer::{ShmBufferSpec, SurfaceState};
use crate::capabilities::Capabilities;
use crate::color::ColorTransformCache;
use crate::device::{DmabufAttributes, FenceId, GpuDevice, NativeWindow, TextureId};
use crate::error::RenderError;
use crate::format::{shm_formats, Format};
use crate::geometry::{Rect, Region};
use crate::output::{
    BorderImage, BorderSide, CaptureCallback, Frame, Output, RepaintReport, RepaintResources,
    SurfaceId,
};
use crate::renderbuffer::{CpuBufferTarget, RenderbufferId};
use crate::shader::ProgramCache;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub u64);

pub struct GlesRenderer {
    device: Box<dyn GpuDevice>,
    programs: ProgramCache,
    colors: ColorTransformCache,
    surfaces: HashMap<SurfaceId, SurfaceState>,
    /// Frame fence each surface's buffer release waits on. Fences are
    /// owned by their output; entries are dropped once signaled.
    release_fences: HashMap<SurfaceId, FenceId>,
    outputs: HashMap<OutputId, Output>,
    wireframe: Option<TextureId>,
    highlight_damage: bool,
    highlight_serial: usize,
    next_surface: u64,
    next_output: u64,
}

/// Colors cycled by the damage-highlight overlay, alpha is the mix
/// weight.
const HIGHLIGHT_COLORS: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.25],
    [0.0, 1.0, 0.0, 0.25],
    [0.0, 0.0, 1.0, 0.25],
];

impl GlesRenderer {
    /// Builds a renderer on top of an already-created device. The device
    /// implementation is fixed for the renderer's lifetime.
    pub fn new(device: Box<dyn GpuDevice>) -> Self {
        info!(capabilities = ?device.capabilities(), "renderer created");
        GlesRenderer {
            device,
            programs: ProgramCache::new(),
            colors: ColorTransformCache::new(),
            surfaces: HashMap::new(),
            release_fences: HashMap::new(),
            outputs: HashMap::new(),
            wireframe: None,
            highlight_damage: false,
            highlight_serial: 0,
            next_surface: 1,
            next_output: 1,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.device.capabilities()
    }

    // ---- surfaces ----

    pub fn create_surface(&mut self) -> SurfaceId {
        let id = SurfaceId(self.next_surface);
        self.next_surface += 1;
        self.surfaces.insert(id, SurfaceState::new());
        id
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) {
        if let Some(mut state) = self.surfaces.remove(&id) {
            state.release(&mut *self.device);
        }
        self.release_fences.remove(&id);
    }

    fn surface_mut(&mut self, id: SurfaceId) -> Result<&mut SurfaceState, RenderError> {
        self.surfaces
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))
    }

    /// Attaches a shared-memory buffer and uploads `damage` (everything,
    /// on first attach or reallocation).
    pub fn attach_shm(
        &mut self,
        surface: SurfaceId,
        spec: &ShmBufferSpec<'_>,
        damage: &Region,
    ) -> Result<(), RenderError> {
        let device = &mut *self.device;
        let state = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))?;
        state.attach_shm(device, spec, damage)
    }

    /// Re-uploads damaged regions of the attached shared-memory buffer
    /// without reallocating, for commits that change contents but not
    /// the buffer itself.
    pub fn flush_damage(
        &mut self,
        surface: SurfaceId,
        spec: &ShmBufferSpec<'_>,
        damage: &Region,
    ) -> Result<(), RenderError> {
        let device = &mut *self.device;
        let state = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))?;
        state.flush_damage(device, spec, damage)
    }

    pub fn attach_dmabuf(
        &mut self,
        surface: SurfaceId,
        attrs: &DmabufAttributes,
    ) -> Result<(), RenderError> {
        let device = &mut *self.device;
        let state = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))?;
        state.attach_dmabuf(device, attrs)
    }

    pub fn attach_legacy(&mut self, surface: SurfaceId, handle: u64) -> Result<(), RenderError> {
        let device = &mut *self.device;
        let state = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))?;
        state.attach_legacy(device, handle)
    }

    pub fn attach_solid(
        &mut self,
        surface: SurfaceId,
        color: [f32; 4],
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        let device = &mut *self.device;
        let state = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))?;
        state.attach_solid(device, color, width, height);
        Ok(())
    }

    pub fn surface_is_opaque(&self, surface: SurfaceId) -> bool {
        self.surfaces
            .get(&surface)
            .map(|s| s.is_opaque())
            .unwrap_or(false)
    }

    /// Whether the client may reuse the memory behind this surface's
    /// previous buffer: true once the last frame that sampled it has
    /// completed on the GPU.
    pub fn surface_release_ready(&mut self, surface: SurfaceId) -> bool {
        match self.release_fences.get(&surface) {
            None => true,
            Some(&fence) => {
                if self.device.fence_signaled(fence) {
                    self.release_fences.remove(&surface);
                    true
                } else {
                    false
                }
            }
        }
    }

    // ---- dmabuf advertisement ----

    /// Probes whether the given dmabuf can be imported, releasing the
    /// probe image immediately.
    pub fn test_import_dmabuf(&mut self, attrs: &DmabufAttributes) -> bool {
        if !self.capabilities().contains(Capabilities::DMABUF_IMPORT) {
            return false;
        }
        match self.device.import_dmabuf(attrs) {
            Ok(texture) => {
                self.device.destroy_texture(texture);
                true
            }
            Err(err) => {
                warn!(format = ?attrs.format, %err, "dmabuf probe failed");
                false
            }
        }
    }

    pub fn supported_dmabuf_formats(&self) -> Vec<Format> {
        if !self.capabilities().contains(Capabilities::DMABUF_IMPORT) {
            return Vec::new();
        }
        shm_formats().map(|d| d.format).collect()
    }

    // ---- outputs ----

    pub fn create_output(&mut self, name: impl Into<String>) -> OutputId {
        let id = OutputId(self.next_output);
        self.next_output += 1;
        self.outputs.insert(id, Output::new(name));
        id
    }

    fn output_mut(&mut self, id: OutputId) -> Result<&mut Output, RenderError> {
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))
    }

    pub fn enable_output_window(
        &mut self,
        id: OutputId,
        window: NativeWindow,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        let device = &mut *self.device;
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?
            .enable_window(device, window, width, height)
    }

    pub fn enable_output_offscreen(
        &mut self,
        id: OutputId,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        self.output_mut(id)?.enable_offscreen(width, height)
    }

    pub fn resize_output(
        &mut self,
        id: OutputId,
        fb_width: u32,
        fb_height: u32,
        area: Rect,
    ) -> Result<(), RenderError> {
        let device = &mut *self.device;
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?
            .resize(device, fb_width, fb_height, area)
    }

    pub fn set_output_color_transform(
        &mut self,
        id: OutputId,
        transform: Option<Arc<crate::color::ColorTransform>>,
    ) -> Result<(), RenderError> {
        self.output_mut(id)?.set_color_transform(transform);
        Ok(())
    }

    /// Uploads a border decoration image and installs it on one side of
    /// the output.
    pub fn output_set_border(
        &mut self,
        id: OutputId,
        side: BorderSide,
        image: Option<(u32, u32, &[u8])>,
    ) -> Result<(), RenderError> {
        let border = match image {
            None => None,
            Some((width, height, rgba)) => {
                if rgba.len() < (width * height * 4) as usize {
                    return Err(RenderError::InvalidParameter(
                        "border image smaller than its dimensions".into(),
                    ));
                }
                let texture = self
                    .device
                    .create_texture(crate::format::TexelFormat::Rgba8, width, height)?;
                self.device.upload_texture(
                    texture,
                    Rect::new(0, 0, width as i32, height as i32),
                    width * 4,
                    rgba,
                )?;
                Some(BorderImage {
                    texture,
                    width,
                    height,
                })
            }
        };
        let device = &mut *self.device;
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?
            .set_border(device, side, border);
        Ok(())
    }

    pub fn create_cpu_renderbuffer(
        &mut self,
        id: OutputId,
        width: u32,
        height: u32,
        cpu: CpuBufferTarget,
        on_discard: Option<Box<dyn FnOnce(RenderbufferId)>>,
    ) -> Result<RenderbufferId, RenderError> {
        let device = &mut *self.device;
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?
            .create_cpu_renderbuffer(device, width, height, cpu, on_discard)
    }

    pub fn create_dmabuf_renderbuffer(
        &mut self,
        id: OutputId,
        attrs: &DmabufAttributes,
        on_discard: Option<Box<dyn FnOnce(RenderbufferId)>>,
    ) -> Result<RenderbufferId, RenderError> {
        let device = &mut *self.device;
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?
            .create_dmabuf_renderbuffer(device, attrs, on_discard)
    }

    pub fn destroy_renderbuffer(&mut self, id: OutputId, rb: RenderbufferId) {
        if let Some(output) = self.outputs.get_mut(&id) {
            output.destroy_renderbuffer(&mut *self.device, rb);
        }
    }

    /// Repaints one output and replaces the release fences of every
    /// surface the frame sampled.
    pub fn repaint_output(
        &mut self,
        id: OutputId,
        frame: &Frame<'_>,
    ) -> Result<RepaintReport, RenderError> {
        // Clear signaled release fences before the output retires them.
        let tracked: Vec<(SurfaceId, FenceId)> = self
            .release_fences
            .iter()
            .map(|(&surface, &fence)| (surface, fence))
            .collect();
        for (surface, fence) in tracked {
            if self.device.fence_signaled(fence) {
                self.release_fences.remove(&surface);
            }
        }

        let output = self
            .outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?;
        let highlight = if self.highlight_damage {
            let color = HIGHLIGHT_COLORS[self.highlight_serial % HIGHLIGHT_COLORS.len()];
            self.highlight_serial += 1;
            Some(color)
        } else {
            None
        };
        let mut resources = RepaintResources {
            device: &mut *self.device,
            programs: &mut self.programs,
            colors: &mut self.colors,
            surfaces: &mut self.surfaces,
            wireframe: self.wireframe,
            highlight,
            external_fences: self.release_fences.values().copied().collect(),
        };
        let report = output.repaint(&mut resources, frame)?;

        if let Some(fence) = report.fence {
            for &surface in &report.painted {
                self.release_fences.insert(surface, fence);
            }
        }
        Ok(report)
    }

    /// Reads pixels back synchronously in the requested format, rows
    /// top-down, tightly packed.
    pub fn read_pixels(
        &mut self,
        id: OutputId,
        format: Format,
        rect: Rect,
    ) -> Result<Vec<u8>, RenderError> {
        let device = &mut *self.device;
        let output = self
            .outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?;
        let rgba = output.read_pixels(device, rect)?;
        Ok(convert_from_rgba(&rgba, format))
    }

    /// Queues an asynchronous capture completed from [`Self::dispatch`].
    pub fn capture_output(
        &mut self,
        id: OutputId,
        rect: Rect,
        callback: CaptureCallback,
    ) -> Result<(), RenderError> {
        self.output_mut(id)?.schedule_capture(rect, callback)
    }

    /// Exports the output's current frame fence as a pollable fd.
    pub fn create_fence_fd(&mut self, id: OutputId) -> Result<RawFd, RenderError> {
        let device = &mut *self.device;
        self.outputs
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidParameter("unknown output".into()))?
            .create_fence_fd(device)
    }

    /// Event-loop hook: completes fence-gated captures and drops signaled
    /// release fences. Call when a fence fd polls readable or on a timer
    /// fallback.
    pub fn dispatch(&mut self) {
        let device = &mut *self.device;
        let mut signaled = Vec::new();
        for (&surface, &fence) in self.release_fences.iter() {
            signaled.push((surface, fence));
        }
        for (surface, fence) in signaled {
            if device.fence_signaled(fence) {
                self.release_fences.remove(&surface);
            }
        }
        let external: Vec<FenceId> = self.release_fences.values().copied().collect();
        for output in self.outputs.values_mut() {
            output.dispatch_pending(&mut *self.device, &external);
        }
    }

    /// Toggles the damage-highlight debug overlay: every repainted
    /// region is tinted with a color cycling per frame, making stale or
    /// excessive damage visible.
    pub fn set_damage_highlight(&mut self, enabled: bool) {
        self.highlight_damage = enabled;
    }

    /// Toggles the wireframe debug overlay on every subsequent draw.
    pub fn set_wireframe_debug(&mut self, enabled: bool) -> Result<(), RenderError> {
        if enabled && self.wireframe.is_none() {
            // An 8x8 grid cell; edges light up, the interior stays black.
            let size = 8u32;
            let mut pixels = vec![0u8; (size * size * 4) as usize];
            for i in 0..size {
                for &(x, y) in &[(i, 0), (0, i)] {
                    let off = ((y * size + x) * 4) as usize;
                    pixels[off..off + 4].copy_from_slice(&[64, 255, 64, 255]);
                }
            }
            let texture =
                self.device
                    .create_texture(crate::format::TexelFormat::Rgba8, size, size)?;
            self.device.upload_texture(
                texture,
                Rect::new(0, 0, size as i32, size as i32),
                size * 4,
                &pixels,
            )?;
            self.wireframe = Some(texture);
        }
        if !enabled {
            if let Some(texture) = self.wireframe.take() {
                self.device.destroy_texture(texture);
            }
        }
        Ok(())
    }

    pub fn destroy_output(&mut self, id: OutputId) {
        if let Some(mut output) = self.outputs.remove(&id) {
            // The output destroys its fences unconditionally; buffers
            // waiting on them are releasable now.
            self.release_fences
                .retain(|_, fence| !output.owns_fence(*fence));
            output.destroy(&mut *self.device);
        }
    }

    /// Full teardown: all outputs, surfaces and caches.
    pub fn destroy(&mut self) {
        let ids: Vec<OutputId> = self.outputs.keys().copied().collect();
        for id in ids {
            self.destroy_output(id);
        }
        let surfaces: Vec<SurfaceId> = self.surfaces.keys().copied().collect();
        for id in surfaces {
            self.destroy_surface(id);
        }
        self.programs.clear(&mut *self.device);
        self.colors.clear(&mut *self.device);
        if let Some(texture) = self.wireframe.take() {
            self.device.destroy_texture(texture);
        }
    }
}

/// Repacks tightly-packed RGBA8 rows into the byte order of `format`.
/// Planar formats pass through unchanged.
pub(crate) fn convert_from_rgba(rgba: &[u8], format: Format) -> Vec<u8> {
    match format {
        Format::Abgr8888 => rgba.to_vec(),
        Format::Xbgr8888 => {
            let mut out = rgba.to_vec();
            for px in out.chunks_exact_mut(4) {
                px[3] = 0xff;
            }
            out
        }
        Format::Argb8888 | Format::Xrgb8888 => {
            let mut out = Vec::with_capacity(rgba.len());
            let opaque = format == Format::Xrgb8888;
            for px in rgba.chunks_exact(4) {
                out.extend_from_slice(&[px[2], px[1], px[0], if opaque { 0xff } else { px[3] }]);
            }
            out
        }
        _ => rgba.to_vec(),
    }
}

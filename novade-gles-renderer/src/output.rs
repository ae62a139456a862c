//! Per-output repaint orchestration.
//!
//! An [`Output`] walks `Disabled -> Enabled -> Repainting -> Enabled` each
//! frame, with `Destroyed` terminal from any state. One repaint selects a
//! renderbuffer, optionally redirects into a high-precision shadow target
//! when the output itself carries a color transform, replays the frame's
//! paint nodes back-to-front (opaque mesh unblended, blended mesh
//! blended), redraws dirty borders, services capture requests, fences the
//! frame and presents. A failed context-current or swap abandons only this
//! output's frame, with rate-limited logging.

use crate::buffer::SurfaceState;
use crate::capabilities::Capabilities;
use crate::color::{ColorTransform, ColorTransformCache, GpuColorTransform};
use crate::device::{
    DrawCall, DrawMode, FenceId, GpuDevice, NativeWindow, TargetId, TextureId, Uniforms, Vertex,
};
use crate::error::RenderError;
use crate::geometry::{Mat3, Rect, Region};
use crate::mesh::{MeshAdd, MeshBuilder};
use crate::renderbuffer::{
    BorderSides, CpuBufferTarget, RenderbufferId, RenderbufferKind, RenderbufferManager,
};
use crate::shader::{ProgramCache, ShaderRequirements, TexCoordSource};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Lifecycle of one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepaintState {
    Disabled,
    Enabled,
    Repainting,
    Destroyed,
}

/// Ephemeral per-surface-per-output drawable descriptor supplied by the
/// scene graph each frame. Consumed, never stored.
pub struct PaintNode {
    pub surface: SurfaceId,
    /// Surface-local to output coordinates.
    pub transform: Mat3,
    pub alpha: f32,
    /// Output-space clip applied to every draw of this node.
    pub scissor: Option<Rect>,
    pub color_transform: Option<Arc<ColorTransform>>,
    /// Surface-local region known to be fully opaque.
    pub opaque_region: Region,
}

/// Everything the scene graph hands over for one repaint.
pub struct Frame<'a> {
    /// Output-space damage accumulated since the last repaint request.
    pub damage: &'a Region,
    /// Back-to-front paint order.
    pub nodes: &'a [PaintNode],
    /// Explicit target; `None` selects from the window pool.
    pub renderbuffer: Option<RenderbufferId>,
}

/// Outcome of one repaint.
pub struct RepaintReport {
    pub renderbuffer: RenderbufferId,
    pub fence: Option<FenceId>,
    /// Surfaces painted this frame; their release fences were replaced.
    pub painted: Vec<SurfaceId>,
    /// Surfaces whose program failed to compile and were drawn with the
    /// fallback. Only these owners should be notified.
    pub fallback: Vec<SurfaceId>,
}

/// Shared renderer machinery a repaint borrows.
pub struct RepaintResources<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub programs: &'a mut ProgramCache,
    pub colors: &'a mut ColorTransformCache,
    pub surfaces: &'a mut HashMap<SurfaceId, SurfaceState>,
    /// Wireframe debug texture; forces the wireframe shader stage on.
    pub wireframe: Option<TextureId>,
    /// Damage-highlight tint; forces the tint shader stage on so the
    /// regions repainted this frame flash visibly.
    pub highlight: Option<[f32; 4]>,
    /// Fences still referenced outside this output (surface release
    /// tracking); retired entries among them are kept alive.
    pub external_fences: Vec<FenceId>,
}

pub type CaptureCallback = Box<dyn FnOnce(Result<Vec<u8>, RenderError>)>;

struct PendingCapture {
    rect: Rect,
    target: TargetId,
    fence: FenceId,
    callback: CaptureCallback,
}

/// Output border decoration: an RGBA image drawn outside the composited
/// area.
pub struct BorderImage {
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderSide {
    Top,
    Bottom,
    Left,
    Right,
}

impl BorderSide {
    fn flag(self) -> BorderSides {
        match self {
            BorderSide::Top => BorderSides::TOP,
            BorderSide::Bottom => BorderSides::BOTTOM,
            BorderSide::Left => BorderSides::LEFT,
            BorderSide::Right => BorderSides::RIGHT,
        }
    }
}

/// Log the first few occurrences, then one in every 64.
#[derive(Debug, Default)]
struct RateLimited {
    count: u64,
}

impl RateLimited {
    fn should_log(&mut self) -> bool {
        self.count += 1;
        self.count <= 3 || self.count % 64 == 0
    }
}

pub struct Output {
    name: String,
    state: RepaintState,
    window_target: Option<TargetId>,
    fb_width: u32,
    fb_height: u32,
    /// Composited area inside the framebuffer; borders fill the rest.
    area: Rect,
    pub(crate) renderbuffers: RenderbufferManager,
    shadow: Option<TargetId>,
    color_transform: Option<Arc<ColorTransform>>,
    borders: [Option<BorderImage>; 4],
    render_fence: Option<FenceId>,
    /// Fences replaced while possibly unsignaled; destroyed once signaled.
    retired_fences: Vec<FenceId>,
    queued_captures: Vec<(Rect, CaptureCallback)>,
    pending_captures: Vec<PendingCapture>,
    context_failures: RateLimited,
    swap_failures: RateLimited,
}

impl Output {
    pub fn new(name: impl Into<String>) -> Self {
        Output {
            name: name.into(),
            state: RepaintState::Disabled,
            window_target: None,
            fb_width: 0,
            fb_height: 0,
            area: Rect::default(),
            renderbuffers: RenderbufferManager::new(),
            shadow: None,
            color_transform: None,
            borders: [None, None, None, None],
            render_fence: None,
            retired_fences: Vec::new(),
            queued_captures: Vec::new(),
            pending_captures: Vec::new(),
            context_failures: RateLimited::default(),
            swap_failures: RateLimited::default(),
        }
    }

    pub fn state(&self) -> RepaintState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_alive(&self) -> Result<(), RenderError> {
        match self.state {
            RepaintState::Destroyed => Err(RenderError::InvalidState(format!(
                "output {} is destroyed",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Attaches a window surface and enables the output.
    pub fn enable_window(
        &mut self,
        device: &mut dyn GpuDevice,
        window: NativeWindow,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        self.check_alive()?;
        let target = device.create_window_target(window, width, height)?;
        self.window_target = Some(target);
        self.fb_width = width;
        self.fb_height = height;
        self.area = Rect::new(0, 0, width as i32, height as i32);
        self.state = RepaintState::Enabled;
        info!(output = %self.name, width, height, "output enabled");
        Ok(())
    }

    /// Enables the output for caller-provided renderbuffers only (no
    /// window surface).
    pub fn enable_offscreen(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.check_alive()?;
        self.fb_width = width;
        self.fb_height = height;
        self.area = Rect::new(0, 0, width as i32, height as i32);
        self.state = RepaintState::Enabled;
        Ok(())
    }

    pub fn resize(
        &mut self,
        device: &mut dyn GpuDevice,
        fb_width: u32,
        fb_height: u32,
        area: Rect,
    ) -> Result<(), RenderError> {
        self.check_alive()?;
        self.fb_width = fb_width;
        self.fb_height = fb_height;
        self.area = area;
        if let Some(target) = self.window_target {
            device.resize_target(target, fb_width, fb_height)?;
        }
        if let Some(shadow) = self.shadow.take() {
            device.destroy_target(shadow);
        }
        self.renderbuffers
            .add_damage(&Region::from_rect(Rect::new(
                0,
                0,
                fb_width as i32,
                fb_height as i32,
            )));
        self.renderbuffers.damage_borders(BorderSides::all());
        Ok(())
    }

    /// Sets the post-composite color transform applied to the whole
    /// output via the shadow target.
    pub fn set_color_transform(&mut self, transform: Option<Arc<ColorTransform>>) {
        self.color_transform = transform;
        self.renderbuffers.add_damage(&Region::from_rect(Rect::new(
            0,
            0,
            self.fb_width as i32,
            self.fb_height as i32,
        )));
    }

    pub fn set_border(
        &mut self,
        device: &mut dyn GpuDevice,
        side: BorderSide,
        image: Option<BorderImage>,
    ) {
        let slot = &mut self.borders[side as usize];
        if let Some(old) = slot.take() {
            device.destroy_texture(old.texture);
        }
        *slot = image;
        self.renderbuffers.damage_borders(side.flag());
    }

    pub fn create_cpu_renderbuffer(
        &mut self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
        cpu: CpuBufferTarget,
        on_discard: Option<Box<dyn FnOnce(RenderbufferId)>>,
    ) -> Result<RenderbufferId, RenderError> {
        self.check_alive()?;
        self.renderbuffers
            .create_cpu_buffer(device, width, height, cpu, on_discard)
    }

    pub fn create_dmabuf_renderbuffer(
        &mut self,
        device: &mut dyn GpuDevice,
        attrs: &crate::device::DmabufAttributes,
        on_discard: Option<Box<dyn FnOnce(RenderbufferId)>>,
    ) -> Result<RenderbufferId, RenderError> {
        self.check_alive()?;
        self.renderbuffers.create_dmabuf(device, attrs, on_discard)
    }

    pub fn destroy_renderbuffer(&mut self, device: &mut dyn GpuDevice, id: RenderbufferId) {
        self.renderbuffers.destroy(device, id);
    }

    /// Exports this output's current render fence as a pollable fd.
    pub fn create_fence_fd(
        &mut self,
        device: &mut dyn GpuDevice,
    ) -> Result<std::os::fd::RawFd, RenderError> {
        let fence = self.render_fence.ok_or_else(|| {
            RenderError::InvalidState("no render fence for this output yet".into())
        })?;
        device.export_fence_fd(fence)
    }

    fn check_read_rect(&self, rect: &Rect) -> Result<(), RenderError> {
        let fb = Rect::new(0, 0, self.fb_width as i32, self.fb_height as i32);
        if rect.is_empty() || !fb.contains(rect) {
            return Err(RenderError::InvalidParameter(format!(
                "read rect {rect:?} outside the {}x{} framebuffer",
                self.fb_width, self.fb_height
            )));
        }
        Ok(())
    }

    /// Queues an asynchronous pixel capture, completed by
    /// [`Self::dispatch_pending`] once the frame fence signals. Falls back
    /// to a synchronous read when fences cannot be exported.
    pub fn schedule_capture(
        &mut self,
        rect: Rect,
        callback: CaptureCallback,
    ) -> Result<(), RenderError> {
        self.check_alive()?;
        self.check_read_rect(&rect)?;
        self.queued_captures.push((rect, callback));
        Ok(())
    }

    /// One repaint, end to end.
    pub fn repaint(
        &mut self,
        res: &mut RepaintResources<'_>,
        frame: &Frame<'_>,
    ) -> Result<RepaintReport, RenderError> {
        match self.state {
            RepaintState::Enabled => {}
            state => {
                return Err(RenderError::InvalidState(format!(
                    "repaint in state {state:?}"
                )))
            }
        }
        self.state = RepaintState::Repainting;
        let result = self.repaint_inner(res, frame);
        if self.state == RepaintState::Repainting {
            self.state = RepaintState::Enabled;
        }
        result
    }

    fn repaint_inner(
        &mut self,
        res: &mut RepaintResources<'_>,
        frame: &Frame<'_>,
    ) -> Result<RepaintReport, RenderError> {
        // Dead color transforms are collected at frame boundaries.
        res.colors.prune(res.device);
        self.retire_signaled_fences(res.device, &res.external_fences);

        self.renderbuffers.add_damage(frame.damage);

        let rb_id = match frame.renderbuffer {
            Some(id) => {
                let rb = self.renderbuffers.get(id).ok_or_else(|| {
                    RenderError::InvalidParameter("unknown renderbuffer".into())
                })?;
                if rb.is_stale() {
                    return Err(RenderError::InvalidState(
                        "repaint into discarded renderbuffer".into(),
                    ));
                }
                id
            }
            None => {
                let target = self.window_target.ok_or_else(|| {
                    RenderError::InvalidState("output has no window target".into())
                })?;
                self.renderbuffers
                    .acquire_window(res.device, target, self.fb_width, self.fb_height)
            }
        };
        let (rb_target, rb_kind, rb_damage, border_damage) = {
            let rb = self.renderbuffers.get(rb_id).expect("selected above");
            (
                rb.target(),
                rb.kind(),
                rb.damage().clone(),
                rb.border_damage(),
            )
        };

        // Shadow redirection for the output color transform.
        let output_transform = match &self.color_transform {
            Some(transform) => Some(res.colors.realize(res.device, transform)?),
            None => None,
        };
        let draw_target = if output_transform.is_some() {
            if self.shadow.is_none() {
                let high = res
                    .device
                    .capabilities()
                    .contains(Capabilities::HALF_FLOAT_RENDERTARGET);
                self.shadow =
                    Some(res.device.create_offscreen_target(self.fb_width, self.fb_height, high)?);
            }
            self.shadow.expect("created above")
        } else {
            rb_target
        };

        if let Err(err) = res.device.make_current(Some(draw_target)) {
            if self.context_failures.should_log() {
                error!(output = %self.name, %err, "cannot make context current, skipping frame");
            }
            return Err(err);
        }

        let mut report = RepaintReport {
            renderbuffer: rb_id,
            fence: None,
            painted: Vec::new(),
            fallback: Vec::new(),
        };

        for node in frame.nodes {
            match self.paint_node(res, node, &rb_damage) {
                Ok(used_fallback) => {
                    report.painted.push(node.surface);
                    if used_fallback {
                        report.fallback.push(node.surface);
                    }
                }
                Err(err) if err.is_client_error() => {
                    // Only the offending surface is skipped.
                    warn!(output = %self.name, surface = ?node.surface, %err,
                          "skipping surface this frame");
                    report.fallback.push(node.surface);
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(transform) = output_transform {
            self.blit_shadow(res, rb_target, transform, &rb_damage)?;
        }

        if !border_damage.is_empty() {
            self.draw_borders(res, border_damage)?;
        }

        let fence = match res.device.create_fence() {
            Ok(fence) => Some(fence),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(output = %self.name, %err, "no frame fence this frame");
                None
            }
        };
        report.fence = fence;

        // Async captures ride on the frame fence; without one, read now.
        let queued = std::mem::take(&mut self.queued_captures);
        for (rect, callback) in queued {
            match fence {
                Some(fence)
                    if res
                        .device
                        .capabilities()
                        .contains(Capabilities::NATIVE_FENCE_FD) =>
                {
                    self.pending_captures.push(PendingCapture {
                        rect,
                        target: rb_target,
                        fence,
                        callback,
                    });
                }
                _ => {
                    let mut pixels = vec![0u8; (rect.width * rect.height * 4) as usize];
                    let result = res.device.read_pixels(rect, &mut pixels).map(|_| pixels);
                    callback(result);
                }
            }
        }

        // Present.
        match rb_kind {
            RenderbufferKind::Window => {
                let damage_rects = if res
                    .device
                    .capabilities()
                    .contains(Capabilities::PARTIAL_SWAP)
                {
                    Some(rb_damage.rects().to_vec())
                } else {
                    None
                };
                if let Err(err) = res.device.swap(rb_target, damage_rects.as_deref()) {
                    if self.swap_failures.should_log() {
                        error!(output = %self.name, %err, "presentation failed");
                    }
                    return Err(err);
                }
            }
            RenderbufferKind::CpuBuffer => {
                res.device.flush();
                self.copy_back(res.device, rb_id)?;
            }
            RenderbufferKind::Dmabuf => res.device.flush(),
        }

        // Replace the output's render fence; the old one retires once it
        // has signaled.
        if let Some(old) = self.render_fence.take() {
            self.retired_fences.push(old);
        }
        self.render_fence = fence;

        self.renderbuffers.mark_painted(rb_id);
        self.renderbuffers.end_frame();
        debug!(output = %self.name, nodes = frame.nodes.len(),
               damage_rects = rb_damage.rects().len(), "frame painted");
        Ok(report)
    }

    /// Draws one paint node: opaque mesh without blending, then blended
    /// mesh with blending. Returns whether the fallback program was used.
    fn paint_node(
        &mut self,
        res: &mut RepaintResources<'_>,
        node: &PaintNode,
        damage: &Region,
    ) -> Result<bool, RenderError> {
        let surface = res
            .surfaces
            .get(&node.surface)
            .ok_or_else(|| RenderError::InvalidParameter("unknown surface".into()))?;
        if !surface.has_contents() {
            return Ok(false);
        }
        let (sw, sh) = surface.size();
        if sw == 0 || sh == 0 {
            return Ok(false);
        }
        let Some(inverse) = node.transform.invert_affine() else {
            return Ok(false);
        };
        let kind = node.transform.classify();

        let mut requirements = surface.shader_requirements();
        requirements.texcoord = TexCoordSource::Surface;
        let realized = match &node.color_transform {
            Some(transform) => res.colors.realize(res.device, transform)?,
            None => GpuColorTransform::IDENTITY,
        };
        requirements.pre_curve = realized.pre_kind();
        requirements.mapping = realized.mapping_kind();
        requirements.post_curve = realized.post_kind();
        if res.wireframe.is_some() {
            requirements.wireframe = true;
        }
        if res.highlight.is_some() {
            requirements.tint = true;
        }

        let selection = res.programs.get(res.device, &requirements)?;

        let surface_rect = Rect::new(0, 0, sw as i32, sh as i32);
        // Alpha below one makes nominally opaque pixels translucent.
        let opaque = if node.alpha >= 1.0 && !selection.is_fallback {
            node.opaque_region.intersected(surface_rect)
        } else {
            Region::new()
        };
        let mut blended = Region::from_rect(surface_rect);
        for rect in opaque.rects() {
            blended.subtract_rect(*rect);
        }

        let projection = Mat3::orthographic(self.fb_width as f32, self.fb_height as f32)
            .multiply(&node.transform);
        let surface_to_buffer = Mat3::scale(1.0 / sw as f32, 1.0 / sh as f32);
        let solid_color = surface.solid_color().unwrap_or([0.0, 0.0, 0.0, 1.0]);
        let fallback_color = [0.3, 0.0, 0.3, 1.0];
        let textures = surface.textures().to_vec();

        let uniforms = Uniforms {
            projection,
            surface_to_buffer,
            view_alpha: node.alpha,
            textures: &textures,
            solid_color: if selection.is_fallback && surface.solid_color().is_none() {
                fallback_color
            } else {
                solid_color
            },
            tint: res.highlight.unwrap_or([0.0; 4]),
            pre_curve: realized.pre,
            mapping: realized.mapping,
            post_curve: realized.post,
            wireframe_texture: res.wireframe,
        };

        let used_fallback = selection.is_fallback;
        let mut builder = MeshBuilder::new();
        for (region, blend) in [(&opaque, false), (&blended, true)] {
            if region.is_empty() {
                continue;
            }
            builder.clear();
            for damage_rect in damage.rects() {
                for clip in region.rects() {
                    loop {
                        match builder.add_damage_rect(damage_rect, &inverse, kind, clip) {
                            MeshAdd::Added | MeshAdd::Skipped => break,
                            MeshAdd::Full => {
                                Self::draw_batch(
                                    res.device,
                                    selection.program,
                                    &builder,
                                    &uniforms,
                                    blend,
                                    node.scissor,
                                )?;
                                builder.clear();
                            }
                        }
                    }
                }
            }
            if !builder.is_empty() {
                Self::draw_batch(
                    res.device,
                    selection.program,
                    &builder,
                    &uniforms,
                    blend,
                    node.scissor,
                )?;
            }
        }
        Ok(used_fallback)
    }

    fn draw_batch(
        device: &mut dyn GpuDevice,
        program: crate::device::ProgramId,
        builder: &MeshBuilder,
        uniforms: &Uniforms<'_>,
        blend: bool,
        scissor: Option<Rect>,
    ) -> Result<(), RenderError> {
        device.draw(&DrawCall {
            program,
            mode: DrawMode::TriangleStrip,
            vertices: builder.vertices(),
            indices: builder.indices(),
            uniforms: uniforms.clone(),
            blend,
            scissor,
        })
    }

    /// Applies the output color transform while copying the shadow target
    /// into the renderbuffer.
    fn blit_shadow(
        &mut self,
        res: &mut RepaintResources<'_>,
        rb_target: TargetId,
        transform: GpuColorTransform,
        damage: &Region,
    ) -> Result<(), RenderError> {
        let shadow = self.shadow.expect("blit only after shadow draw");
        let texture = res
            .device
            .offscreen_texture(shadow)
            .ok_or_else(|| RenderError::InvalidState("shadow target has no texture".into()))?;
        res.device.make_current(Some(rb_target))?;

        let mut requirements = ShaderRequirements {
            texcoord: TexCoordSource::Attrib,
            input_is_premult: true,
            ..Default::default()
        };
        requirements.pre_curve = transform.pre_kind();
        requirements.mapping = transform.mapping_kind();
        requirements.post_curve = transform.post_kind();
        let selection = res.programs.get(res.device, &requirements)?;

        let w = self.fb_width as f32;
        let h = self.fb_height as f32;
        let textures = [texture];
        let uniforms = Uniforms {
            projection: Mat3::orthographic(w, h),
            surface_to_buffer: Mat3::IDENTITY,
            view_alpha: 1.0,
            textures: &textures,
            solid_color: [0.0; 4],
            tint: [0.0; 4],
            pre_curve: transform.pre,
            mapping: transform.mapping,
            post_curve: transform.post,
            wireframe_texture: None,
        };

        // One quad per damage rect, texcoords matching the rect.
        for rect in damage.rects() {
            let x0 = rect.x as f32;
            let y0 = rect.y as f32;
            let x1 = rect.right() as f32;
            let y1 = rect.bottom() as f32;
            let vertices = [
                vertex_uv(x0, y0, x0 / w, y0 / h),
                vertex_uv(x1, y0, x1 / w, y0 / h),
                vertex_uv(x0, y1, x0 / w, y1 / h),
                vertex_uv(x1, y1, x1 / w, y1 / h),
            ];
            res.device.draw(&DrawCall {
                program: selection.program,
                mode: DrawMode::TriangleStrip,
                vertices: &vertices,
                indices: &[0, 1, 2, 3],
                uniforms: uniforms.clone(),
                blend: false,
                scissor: None,
            })?;
        }
        Ok(())
    }

    fn draw_borders(
        &mut self,
        res: &mut RepaintResources<'_>,
        dirty: BorderSides,
    ) -> Result<(), RenderError> {
        let fb = Rect::new(0, 0, self.fb_width as i32, self.fb_height as i32);
        let sides = [
            (
                BorderSide::Top,
                Rect::new(0, 0, fb.width, self.area.y),
            ),
            (
                BorderSide::Bottom,
                Rect::new(0, self.area.bottom(), fb.width, fb.height - self.area.bottom()),
            ),
            (
                BorderSide::Left,
                Rect::new(0, self.area.y, self.area.x, self.area.height),
            ),
            (
                BorderSide::Right,
                Rect::new(
                    self.area.right(),
                    self.area.y,
                    fb.width - self.area.right(),
                    self.area.height,
                ),
            ),
        ];
        for (side, rect) in sides {
            if !dirty.contains(side.flag()) || rect.is_empty() {
                continue;
            }
            let Some(image) = &self.borders[side as usize] else {
                continue;
            };
            let requirements = ShaderRequirements {
                texcoord: TexCoordSource::Attrib,
                input_is_premult: true,
                ..Default::default()
            };
            let selection = res.programs.get(res.device, &requirements)?;
            let x0 = rect.x as f32;
            let y0 = rect.y as f32;
            let x1 = rect.right() as f32;
            let y1 = rect.bottom() as f32;
            // Border images tile by repeating their last texel via clamp.
            let u1 = rect.width as f32 / image.width as f32;
            let v1 = rect.height as f32 / image.height as f32;
            let vertices = [
                vertex_uv(x0, y0, 0.0, 0.0),
                vertex_uv(x1, y0, u1, 0.0),
                vertex_uv(x0, y1, 0.0, v1),
                vertex_uv(x1, y1, u1, v1),
            ];
            let textures = [image.texture];
            let uniforms = Uniforms {
                projection: Mat3::orthographic(self.fb_width as f32, self.fb_height as f32),
                surface_to_buffer: Mat3::IDENTITY,
                view_alpha: 1.0,
                textures: &textures,
                solid_color: [0.0; 4],
                tint: [0.0; 4],
                pre_curve: crate::device::CurveUniform::None,
                mapping: crate::device::MappingUniform::Identity,
                post_curve: crate::device::CurveUniform::None,
                wireframe_texture: None,
            };
            res.device.draw(&DrawCall {
                program: selection.program,
                mode: DrawMode::TriangleStrip,
                vertices: &vertices,
                indices: &[0, 1, 2, 3],
                uniforms,
                blend: false,
                scissor: None,
            })?;
        }
        Ok(())
    }

    /// Copies a painted CPU renderbuffer into the caller's memory,
    /// honoring the destination stride.
    fn copy_back(
        &mut self,
        device: &mut dyn GpuDevice,
        rb_id: RenderbufferId,
    ) -> Result<(), RenderError> {
        let rb = self.renderbuffers.get(rb_id).expect("painted renderbuffer");
        let Some(cpu) = rb.cpu_target().cloned() else {
            return Ok(());
        };
        let (width, height) = rb.size();
        let mut pixels = vec![0u8; (width * height * 4) as usize];
        device.read_pixels(Rect::new(0, 0, width as i32, height as i32), &mut pixels)?;
        let converted = crate::renderer::convert_from_rgba(&pixels, cpu.format);
        let bpp = crate::format::descriptor(cpu.format).bytes_per_pixel as usize;
        let mut memory = cpu
            .memory
            .lock()
            .map_err(|_| RenderError::InvalidState("poisoned cpu buffer lock".into()))?;
        for row in 0..height as usize {
            let src = &converted[row * width as usize * bpp..(row + 1) * width as usize * bpp];
            let dst_off = row * cpu.stride as usize;
            memory[dst_off..dst_off + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    /// Synchronous RGBA8 readback from the output's window target.
    pub fn read_pixels(
        &mut self,
        device: &mut dyn GpuDevice,
        rect: Rect,
    ) -> Result<Vec<u8>, RenderError> {
        self.check_alive()?;
        self.check_read_rect(&rect)?;
        let target = self
            .window_target
            .ok_or_else(|| RenderError::InvalidState("output has no window target".into()))?;
        device.make_current(Some(target))?;
        let mut pixels = vec![0u8; (rect.width * rect.height * 4) as usize];
        device.read_pixels(rect, &mut pixels)?;
        Ok(pixels)
    }

    /// Polls pending fences: completes async captures whose frame has
    /// finished and destroys retired fences that have signaled and are
    /// not in `external`.
    pub fn dispatch_pending(&mut self, device: &mut dyn GpuDevice, external: &[FenceId]) {
        let mut remaining = Vec::new();
        for capture in self.pending_captures.drain(..) {
            if device.fence_signaled(capture.fence) {
                let result = device.make_current(Some(capture.target)).and_then(|_| {
                    let mut pixels =
                        vec![0u8; (capture.rect.width * capture.rect.height * 4) as usize];
                    device.read_pixels(capture.rect, &mut pixels)?;
                    Ok(pixels)
                });
                (capture.callback)(result);
            } else {
                remaining.push(capture);
            }
        }
        self.pending_captures = remaining;
        self.retire_signaled_fences(device, external);
    }

    /// Destroys retired fences that have signaled, except those a pending
    /// capture or the caller still references; those stay retired until
    /// the last reference drops.
    fn retire_signaled_fences(&mut self, device: &mut dyn GpuDevice, external: &[FenceId]) {
        let mut keep = Vec::new();
        for fence in self.retired_fences.drain(..) {
            let referenced = external.contains(&fence)
                || self.pending_captures.iter().any(|c| c.fence == fence);
            if !referenced && device.fence_signaled(fence) {
                device.destroy_fence(fence);
            } else {
                keep.push(fence);
            }
        }
        self.retired_fences = keep;
    }

    /// Whether this output created (and will eventually destroy) `fence`.
    pub(crate) fn owns_fence(&self, fence: FenceId) -> bool {
        self.render_fence == Some(fence) || self.retired_fences.contains(&fence)
    }

    /// Tears the output down: cancels pending captures, releases fences,
    /// renderbuffers and GPU targets. Terminal.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        if self.state == RepaintState::Destroyed {
            return;
        }
        for capture in self.pending_captures.drain(..) {
            (capture.callback)(Err(RenderError::InvalidState(
                "output destroyed before capture completed".into(),
            )));
        }
        for (_, callback) in self.queued_captures.drain(..) {
            callback(Err(RenderError::InvalidState(
                "output destroyed before capture completed".into(),
            )));
        }
        if let Some(fence) = self.render_fence.take() {
            device.destroy_fence(fence);
        }
        for fence in self.retired_fences.drain(..) {
            device.destroy_fence(fence);
        }
        self.renderbuffers.discard_all(device);
        if let Some(shadow) = self.shadow.take() {
            device.destroy_target(shadow);
        }
        for slot in &mut self.borders {
            if let Some(border) = slot.take() {
                device.destroy_texture(border.texture);
            }
        }
        if let Some(target) = self.window_target.take() {
            device.destroy_target(target);
        }
        self.state = RepaintState::Destroyed;
        info!(output = %self.name, "output destroyed");
    }
}

fn vertex_uv(x: f32, y: f32, u: f32, v: f32) -> Vertex {
    Vertex {
        position: [x, y],
        texcoord: [u, v],
    }
}

//! CPU reference implementation of [`GpuDevice`].
//!
//! Rasterizes draws into plain pixel buffers with the same observable
//! semantics as the GLES device: nearest-neighbor sampling, the fragment
//! pipeline of `glsl.rs` (swizzle, YUV reconstruction, curves, mapping,
//! premultiplied blending), buffer-age reporting and immediately-signaled
//! fences. Failure injection hooks let tests exercise every fallback path
//! without a GPU.

use super::{
    CurveUniform, DmabufAttributes, DrawCall, DrawMode, FenceId, GpuDevice, LegacyBufferInfo,
    MappingUniform, NativeWindow, ProgramId, TargetId, TextureId, Uniforms,
};
use crate::capabilities::Capabilities;
use crate::color::{sample_curve_lut_row, sample_lut3d, ParametricParams};
use crate::error::RenderError;
use crate::format::{Channel, Swizzle, TexelFormat};
use crate::geometry::Rect;
use crate::shader::{CurveKind, MappingKind, ShaderRequirements, ShaderVariant, TexCoordSource};
use std::collections::HashMap;
use std::os::fd::RawFd;

enum TextureData {
    /// Byte texels as uploaded, `bytes_per_texel` wide.
    Pixels { texel: TexelFormat, data: Vec<u8> },
    /// Curve LUT rows, `width * 4` f32 samples.
    CurveLut { data: Vec<f32> },
    /// 3D LUT of RGB triples.
    Lut3d { size: usize, data: Vec<f32> },
    /// Backing image of an offscreen target; pixels live on the target.
    RenderTarget(TargetId),
}

struct FakeTexture {
    width: u32,
    height: u32,
    data: TextureData,
}

enum TargetKind {
    Window,
    Offscreen { texture: TextureId },
    Dmabuf,
}

struct FakeTarget {
    kind: TargetKind,
    width: u32,
    height: u32,
    /// Linear RGBA, row 0 at the top.
    pixels: Vec<[f32; 4]>,
    age: u32,
}

pub struct FakeDevice {
    capabilities: Capabilities,
    textures: HashMap<u64, FakeTexture>,
    programs: HashMap<u64, ShaderRequirements>,
    targets: HashMap<u64, FakeTarget>,
    fences: HashMap<u64, bool>,
    legacy_buffers: HashMap<u64, LegacyBufferInfo>,
    current: Option<TargetId>,
    next_id: u64,
    next_fd: RawFd,
    fail_compiles: u32,
    fail_dmabuf_imports: u32,
    failing_planes: Vec<usize>,
    upload_log: Vec<(TextureId, Rect)>,
    last_swap_damage: Option<Option<Vec<Rect>>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice {
            capabilities: Capabilities::all(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            targets: HashMap::new(),
            fences: HashMap::new(),
            legacy_buffers: HashMap::new(),
            current: None,
            next_id: 1,
            // Sentinel descriptors; never handed to the OS.
            next_fd: 1000,
            fail_compiles: 0,
            fail_dmabuf_imports: 0,
            failing_planes: Vec::new(),
            upload_log: Vec::new(),
            last_swap_damage: None,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn fail_next_compiles(&mut self, count: u32) {
        self.fail_compiles = count;
    }

    pub fn fail_next_dmabuf_imports(&mut self, count: u32) {
        self.fail_dmabuf_imports = count;
    }

    /// Makes the per-plane import of the given plane index fail once.
    pub fn fail_plane_import(&mut self, plane: usize) {
        self.failing_planes.push(plane);
    }

    pub fn register_legacy_buffer(&mut self, handle: u64, info: LegacyBufferInfo) {
        self.legacy_buffers.insert(handle, info);
    }

    pub fn set_buffer_age(&mut self, target: TargetId, age: u32) {
        if let Some(t) = self.targets.get_mut(&target.0) {
            t.age = age;
        }
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures
            .values()
            .filter(|t| !matches!(t.data, TextureData::RenderTarget(_)))
            .count()
    }

    pub fn live_target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn program_alive(&self, program: ProgramId) -> bool {
        self.programs.contains_key(&program.0)
    }

    pub fn texture_size(&self, texture: TextureId) -> (u32, u32) {
        let t = &self.textures[&texture.0];
        (t.width, t.height)
    }

    pub fn upload_log(&self) -> &[(TextureId, Rect)] {
        &self.upload_log
    }

    pub fn clear_upload_log(&mut self) {
        self.upload_log.clear();
    }

    /// Damage list of the most recent swap; `None` if no swap happened,
    /// `Some(None)` for a full-frame swap.
    pub fn last_swap_damage(&self) -> Option<Option<Vec<Rect>>> {
        self.last_swap_damage.clone()
    }

    pub fn target_pixel(&self, target: TargetId, x: u32, y: u32) -> [f32; 4] {
        let t = &self.targets[&target.0];
        t.pixels[(y * t.width + x) as usize]
    }

    fn sample_bytes(&self, texture: TextureId, u: f32, v: f32) -> [f32; 4] {
        let Some(t) = self.textures.get(&texture.0) else {
            return [0.0, 0.0, 0.0, 1.0];
        };
        match &t.data {
            TextureData::Pixels { texel, data } => {
                let x = ((u * t.width as f32) as i64).clamp(0, t.width as i64 - 1) as usize;
                let y = ((v * t.height as f32) as i64).clamp(0, t.height as i64 - 1) as usize;
                let bpp = texel.bytes_per_texel() as usize;
                let base = (y * t.width as usize + x) * bpp;
                let byte = |i: usize| {
                    if i < bpp {
                        data[base + i] as f32 / 255.0
                    } else if i == 3 {
                        1.0
                    } else {
                        0.0
                    }
                };
                [byte(0), byte(1), byte(2), byte(3)]
            }
            TextureData::RenderTarget(target) => {
                let Some(rt) = self.targets.get(&target.0) else {
                    return [0.0, 0.0, 0.0, 1.0];
                };
                let x = ((u * rt.width as f32) as i64).clamp(0, rt.width as i64 - 1) as usize;
                let y = ((v * rt.height as f32) as i64).clamp(0, rt.height as i64 - 1) as usize;
                rt.pixels[y * rt.width as usize + x]
            }
            _ => [0.0, 0.0, 0.0, 1.0],
        }
    }

    fn eval_curve(&self, curve: &CurveUniform, rgb: [f32; 3]) -> [f32; 3] {
        match curve {
            CurveUniform::None => rgb,
            CurveUniform::Parametric(params) => {
                let mut out = [0.0; 3];
                for c in 0..3 {
                    out[c] = params.eval_channel(c, rgb[c]);
                }
                out
            }
            CurveUniform::Lut {
                texture,
                scale,
                offset,
            } => {
                let Some(FakeTexture {
                    width,
                    data: TextureData::CurveLut { data },
                    ..
                }) = self.textures.get(&texture.0)
                else {
                    return rgb;
                };
                let len = *width as usize;
                let mut out = [0.0; 3];
                for c in 0..3 {
                    let row = &data[c * len..(c + 1) * len];
                    out[c] = sample_curve_lut_row(row, *scale, *offset, rgb[c]);
                }
                out
            }
        }
    }

    fn eval_mapping(&self, mapping: &MappingUniform, rgb: [f32; 3]) -> [f32; 3] {
        match mapping {
            MappingUniform::Identity => rgb,
            MappingUniform::Matrix { matrix: m, offset } => [
                m[0] * rgb[0] + m[3] * rgb[1] + m[6] * rgb[2] + offset[0],
                m[1] * rgb[0] + m[4] * rgb[1] + m[7] * rgb[2] + offset[1],
                m[2] * rgb[0] + m[5] * rgb[1] + m[8] * rgb[2] + offset[2],
            ],
            MappingUniform::Lut3D { texture, .. } => {
                let Some(FakeTexture {
                    data: TextureData::Lut3d { size, data },
                    ..
                }) = self.textures.get(&texture.0)
                else {
                    return rgb;
                };
                sample_lut3d(*size, data, rgb)
            }
        }
    }

    fn apply_swizzle(sample: [f32; 4], swizzle: &Swizzle) -> [f32; 4] {
        let pick = |c: Channel| match c {
            Channel::R => sample[0],
            Channel::G => sample[1],
            Channel::B => sample[2],
            Channel::A => sample[3],
            Channel::One => 1.0,
        };
        [
            pick(swizzle.r),
            pick(swizzle.g),
            pick(swizzle.b),
            pick(swizzle.a),
        ]
    }

    fn shade(
        &self,
        requirements: &ShaderRequirements,
        uniforms: &Uniforms<'_>,
        u: f32,
        v: f32,
    ) -> [f32; 4] {
        let mut color = match requirements.variant {
            ShaderVariant::Solid => uniforms.solid_color,
            ShaderVariant::External => self.sample_bytes(uniforms.textures[0], u, v),
            ShaderVariant::Rgba => Self::apply_swizzle(
                self.sample_bytes(uniforms.textures[0], u, v),
                &requirements.channel_order,
            ),
            ShaderVariant::YUv | ShaderVariant::YUV | ShaderVariant::YXuxv => {
                let y = 1.163_834 * (self.sample_bytes(uniforms.textures[0], u, v)[0] - 0.0625);
                let (cb, cr) = match requirements.variant {
                    ShaderVariant::YUv => {
                        let s = self.sample_bytes(uniforms.textures[1], u, v);
                        (s[0] - 0.5, s[1] - 0.5)
                    }
                    ShaderVariant::YXuxv => {
                        let s = self.sample_bytes(uniforms.textures[1], u, v);
                        (s[1] - 0.5, s[3] - 0.5)
                    }
                    _ => (
                        self.sample_bytes(uniforms.textures[1], u, v)[0] - 0.5,
                        self.sample_bytes(uniforms.textures[2], u, v)[0] - 0.5,
                    ),
                };
                [
                    y + 1.596_026_8 * cr,
                    y - 0.391_762_3 * cb - 0.812_967_6 * cr,
                    y + 2.017_232_1 * cb,
                    1.0,
                ]
            }
        };

        let has_pipeline = requirements.pre_curve != CurveKind::None
            || requirements.mapping != MappingKind::Identity
            || requirements.post_curve != CurveKind::None;
        let premult_in = requirements.input_is_premult && requirements.variant != ShaderVariant::Solid;
        if premult_in && has_pipeline && color[3] > 0.0 {
            for c in 0..3 {
                color[c] /= color[3];
            }
        }

        let rgb = self.eval_curve(&uniforms.pre_curve, [color[0], color[1], color[2]]);
        let rgb = self.eval_mapping(&uniforms.mapping, rgb);
        let mut rgb = self.eval_curve(&uniforms.post_curve, rgb);

        if requirements.tint {
            for c in 0..3 {
                rgb[c] = rgb[c] * (1.0 - uniforms.tint[3]) + uniforms.tint[c] * uniforms.tint[3];
            }
        }

        let still_premult = premult_in && !has_pipeline;
        let mut out = [rgb[0], rgb[1], rgb[2], color[3]];
        if !still_premult {
            for c in 0..3 {
                out[c] *= out[3];
            }
        }
        for value in &mut out {
            *value *= uniforms.view_alpha;
        }
        out
    }
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for FakeDevice {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_texture(
        &mut self,
        texel: TexelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RenderError> {
        let id = self.alloc_id();
        let size = (width * height * texel.bytes_per_texel()) as usize;
        self.textures.insert(
            id,
            FakeTexture {
                width,
                height,
                data: TextureData::Pixels {
                    texel,
                    data: vec![0; size],
                },
            },
        );
        Ok(TextureId(id))
    }

    fn upload_texture(
        &mut self,
        texture: TextureId,
        rect: Rect,
        stride: u32,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let t = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| RenderError::InvalidState("upload to unknown texture".into()))?;
        let TextureData::Pixels { texel, data: pixels } = &mut t.data else {
            return Err(RenderError::InvalidState("upload to non-pixel texture".into()));
        };
        let bpp = texel.bytes_per_texel() as usize;
        let width = t.width as usize;
        for row in 0..rect.height as usize {
            let src_off = (rect.y as usize + row) * stride as usize + rect.x as usize * bpp;
            let dst_off = ((rect.y as usize + row) * width + rect.x as usize) * bpp;
            let len = rect.width as usize * bpp;
            pixels[dst_off..dst_off + len].copy_from_slice(&data[src_off..src_off + len]);
        }
        self.upload_log.push((texture, rect));
        Ok(())
    }

    fn create_curve_lut(&mut self, width: u32, data: &[f32]) -> Result<TextureId, RenderError> {
        if data.len() != width as usize * 4 {
            return Err(RenderError::InvalidParameter("curve LUT size mismatch".into()));
        }
        let id = self.alloc_id();
        self.textures.insert(
            id,
            FakeTexture {
                width,
                height: 4,
                data: TextureData::CurveLut { data: data.to_vec() },
            },
        );
        Ok(TextureId(id))
    }

    fn create_lut3d(&mut self, size: u32, data: &[f32]) -> Result<TextureId, RenderError> {
        if data.len() != (size * size * size * 3) as usize {
            return Err(RenderError::InvalidParameter("3D LUT size mismatch".into()));
        }
        let id = self.alloc_id();
        self.textures.insert(
            id,
            FakeTexture {
                width: size,
                height: size,
                data: TextureData::Lut3d {
                    size: size as usize,
                    data: data.to_vec(),
                },
            },
        );
        Ok(TextureId(id))
    }

    fn import_dmabuf(&mut self, attrs: &DmabufAttributes) -> Result<TextureId, RenderError> {
        if self.fail_dmabuf_imports > 0 {
            self.fail_dmabuf_imports -= 1;
            return Err(RenderError::ImportFailed("combined import rejected".into()));
        }
        let id = self.alloc_id();
        let size = (attrs.width * attrs.height * 4) as usize;
        self.textures.insert(
            id,
            FakeTexture {
                width: attrs.width,
                height: attrs.height,
                data: TextureData::Pixels {
                    texel: TexelFormat::Rgba8,
                    data: vec![0; size],
                },
            },
        );
        Ok(TextureId(id))
    }

    fn import_dmabuf_plane(
        &mut self,
        _attrs: &DmabufAttributes,
        plane: usize,
        texel: TexelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RenderError> {
        if let Some(pos) = self.failing_planes.iter().position(|&p| p == plane) {
            self.failing_planes.remove(pos);
            return Err(RenderError::ImportFailed(format!("plane {plane} rejected")));
        }
        self.create_texture(texel, width, height)
    }

    fn query_legacy_buffer(&mut self, handle: u64) -> Result<LegacyBufferInfo, RenderError> {
        self.legacy_buffers
            .get(&handle)
            .copied()
            .ok_or_else(|| RenderError::ImportFailed("unknown legacy buffer".into()))
    }

    fn import_legacy_plane(&mut self, handle: u64, _plane: u32) -> Result<TextureId, RenderError> {
        let info = self.query_legacy_buffer(handle)?;
        self.create_texture(TexelFormat::Rgba8, info.width, info.height)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
    }

    fn compile_program(
        &mut self,
        requirements: &ShaderRequirements,
    ) -> Result<ProgramId, RenderError> {
        if self.fail_compiles > 0 {
            self.fail_compiles -= 1;
            return Err(RenderError::ShaderCompilation {
                shader: format!("{requirements:?}"),
                log: "injected failure".into(),
            });
        }
        let id = self.alloc_id();
        self.programs.insert(id, *requirements);
        Ok(ProgramId(id))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
    }

    fn create_window_target(
        &mut self,
        _window: NativeWindow,
        width: u32,
        height: u32,
    ) -> Result<TargetId, RenderError> {
        let id = self.alloc_id();
        self.targets.insert(
            id,
            FakeTarget {
                kind: TargetKind::Window,
                width,
                height,
                pixels: vec![[0.0; 4]; (width * height) as usize],
                age: 0,
            },
        );
        Ok(TargetId(id))
    }

    fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        _high_precision: bool,
    ) -> Result<TargetId, RenderError> {
        let target_id = self.alloc_id();
        let texture_id = self.alloc_id();
        self.textures.insert(
            texture_id,
            FakeTexture {
                width,
                height,
                data: TextureData::RenderTarget(TargetId(target_id)),
            },
        );
        self.targets.insert(
            target_id,
            FakeTarget {
                kind: TargetKind::Offscreen {
                    texture: TextureId(texture_id),
                },
                width,
                height,
                pixels: vec![[0.0; 4]; (width * height) as usize],
                age: 0,
            },
        );
        Ok(TargetId(target_id))
    }

    fn create_dmabuf_target(&mut self, attrs: &DmabufAttributes) -> Result<TargetId, RenderError> {
        let id = self.alloc_id();
        self.targets.insert(
            id,
            FakeTarget {
                kind: TargetKind::Dmabuf,
                width: attrs.width,
                height: attrs.height,
                pixels: vec![[0.0; 4]; (attrs.width * attrs.height) as usize],
                age: 0,
            },
        );
        Ok(TargetId(id))
    }

    fn offscreen_texture(&self, target: TargetId) -> Option<TextureId> {
        match self.targets.get(&target.0)?.kind {
            TargetKind::Offscreen { texture } => Some(texture),
            _ => None,
        }
    }

    fn resize_target(
        &mut self,
        target: TargetId,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        let t = self
            .targets
            .get_mut(&target.0)
            .ok_or_else(|| RenderError::InvalidState("resize of unknown target".into()))?;
        t.width = width;
        t.height = height;
        t.pixels = vec![[0.0; 4]; (width * height) as usize];
        t.age = 0;
        if let TargetKind::Offscreen { texture } = t.kind {
            if let Some(tex) = self.textures.get_mut(&texture.0) {
                tex.width = width;
                tex.height = height;
            }
        }
        Ok(())
    }

    fn destroy_target(&mut self, target: TargetId) {
        if let Some(t) = self.targets.remove(&target.0) {
            if let TargetKind::Offscreen { texture } = t.kind {
                self.textures.remove(&texture.0);
            }
        }
        if self.current == Some(target) {
            self.current = None;
        }
    }

    fn make_current(&mut self, target: Option<TargetId>) -> Result<(), RenderError> {
        if let Some(target) = target {
            if !self.targets.contains_key(&target.0) {
                return Err(RenderError::ContextCurrent("unknown target".into()));
            }
        }
        self.current = target;
        Ok(())
    }

    fn buffer_age(&mut self, target: TargetId) -> u32 {
        if !self.capabilities.contains(Capabilities::BUFFER_AGE) {
            return 0;
        }
        self.targets.get(&target.0).map(|t| t.age).unwrap_or(0)
    }

    fn clear(&mut self, color: [f32; 4], scissor: Option<Rect>) {
        let Some(current) = self.current else { return };
        let Some(t) = self.targets.get_mut(&current.0) else {
            return;
        };
        let full = Rect::new(0, 0, t.width as i32, t.height as i32);
        let rect = scissor
            .and_then(|s| s.intersection(&full))
            .unwrap_or(full);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                t.pixels[(y as u32 * t.width + x as u32) as usize] = color;
            }
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), RenderError> {
        let requirements = *self
            .programs
            .get(&call.program.0)
            .ok_or_else(|| RenderError::InvalidState("draw with unknown program".into()))?;
        let current = self
            .current
            .ok_or_else(|| RenderError::InvalidState("draw without a current target".into()))?;
        let (width, height) = {
            let t = &self.targets[&current.0];
            (t.width, t.height)
        };

        let triangles: Vec<[u16; 3]> = match call.mode {
            DrawMode::Triangles => call
                .indices
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect(),
            DrawMode::TriangleStrip => (0..call.indices.len().saturating_sub(2))
                .map(|i| [call.indices[i], call.indices[i + 1], call.indices[i + 2]])
                .collect(),
        };

        // Screen-space vertex positions plus interpolated texcoords.
        let screen: Vec<([f32; 2], [f32; 2])> = call
            .vertices
            .iter()
            .map(|v| {
                let (cx, cy) = call.uniforms.projection.apply(v.position[0], v.position[1]);
                let sx = (cx + 1.0) * 0.5 * width as f32;
                let sy = (1.0 - cy) * 0.5 * height as f32;
                let tex = match requirements.texcoord {
                    TexCoordSource::Surface => {
                        let (u, v2) = call
                            .uniforms
                            .surface_to_buffer
                            .apply(v.position[0], v.position[1]);
                        [u, v2]
                    }
                    TexCoordSource::Attrib => v.texcoord,
                };
                ([sx, sy], tex)
            })
            .collect();

        let scissor = call.scissor;
        // Each pixel is shaded at most once per draw, matching the GPU's
        // guarantee for watertight meshes (strip triangles share edges).
        let mut covered = vec![false; (width * height) as usize];
        for tri in triangles {
            let [a, b, c] = [
                screen[tri[0] as usize],
                screen[tri[1] as usize],
                screen[tri[2] as usize],
            ];
            let area = (b.0[0] - a.0[0]) * (c.0[1] - a.0[1]) - (b.0[1] - a.0[1]) * (c.0[0] - a.0[0]);
            if area.abs() < 1e-9 {
                continue; // degenerate chaining triangle
            }
            let min_x = a.0[0].min(b.0[0]).min(c.0[0]).floor().max(0.0) as i32;
            let max_x = (a.0[0].max(b.0[0]).max(c.0[0]).ceil() as i32).min(width as i32);
            let min_y = a.0[1].min(b.0[1]).min(c.0[1]).floor().max(0.0) as i32;
            let max_y = (a.0[1].max(b.0[1]).max(c.0[1]).ceil() as i32).min(height as i32);
            for py in min_y..max_y {
                for px in min_x..max_x {
                    if let Some(s) = scissor {
                        if px < s.x || px >= s.right() || py < s.y || py >= s.bottom() {
                            continue;
                        }
                    }
                    let p = [px as f32 + 0.5, py as f32 + 0.5];
                    let la = ((c.0[0] - b.0[0]) * (p[1] - b.0[1])
                        - (c.0[1] - b.0[1]) * (p[0] - b.0[0]))
                        / area;
                    let lb = ((a.0[0] - c.0[0]) * (p[1] - c.0[1])
                        - (a.0[1] - c.0[1]) * (p[0] - c.0[0]))
                        / area;
                    let lc = 1.0 - la - lb;
                    let eps = -1e-4;
                    if la < eps || lb < eps || lc < eps {
                        continue;
                    }
                    let mask_idx = (py as u32 * width + px as u32) as usize;
                    if covered[mask_idx] {
                        continue;
                    }
                    covered[mask_idx] = true;
                    let u = la * a.1[0] + lb * b.1[0] + lc * c.1[0];
                    let v = la * a.1[1] + lb * b.1[1] + lc * c.1[1];
                    let src = self.shade(&requirements, &call.uniforms, u, v);
                    let t = self.targets.get_mut(&current.0).expect("current target exists");
                    let idx = (py as u32 * t.width + px as u32) as usize;
                    if call.blend {
                        let dst = t.pixels[idx];
                        let inv = 1.0 - src[3];
                        t.pixels[idx] = [
                            src[0] + dst[0] * inv,
                            src[1] + dst[1] * inv,
                            src[2] + dst[2] * inv,
                            src[3] + dst[3] * inv,
                        ];
                    } else {
                        t.pixels[idx] = src;
                    }
                }
            }
        }
        Ok(())
    }

    fn swap(&mut self, target: TargetId, damage: Option<&[Rect]>) -> Result<(), RenderError> {
        if !self.targets.contains_key(&target.0) {
            return Err(RenderError::SwapFailed("unknown target".into()));
        }
        self.last_swap_damage = Some(damage.map(|d| d.to_vec()));
        Ok(())
    }

    fn flush(&mut self) {}

    fn read_pixels(&mut self, rect: Rect, dst: &mut [u8]) -> Result<(), RenderError> {
        let current = self
            .current
            .ok_or_else(|| RenderError::InvalidState("read without a current target".into()))?;
        let t = &self.targets[&current.0];
        let expected = (rect.width * rect.height * 4) as usize;
        if dst.len() < expected {
            return Err(RenderError::InvalidParameter("read buffer too small".into()));
        }
        for row in 0..rect.height {
            for col in 0..rect.width {
                let px = t.pixels
                    [((rect.y + row) as u32 * t.width + (rect.x + col) as u32) as usize];
                let off = ((row * rect.width + col) * 4) as usize;
                for c in 0..4 {
                    dst[off + c] = (px[c].clamp(0.0, 1.0) * 255.0).round() as u8;
                }
            }
        }
        Ok(())
    }

    fn create_fence(&mut self) -> Result<FenceId, RenderError> {
        let id = self.alloc_id();
        // The CPU device completes work synchronously.
        self.fences.insert(id, true);
        Ok(FenceId(id))
    }

    fn export_fence_fd(&mut self, fence: FenceId) -> Result<RawFd, RenderError> {
        if !self.capabilities.contains(Capabilities::NATIVE_FENCE_FD) {
            return Err(RenderError::MissingCapability(Capabilities::NATIVE_FENCE_FD));
        }
        if !self.fences.contains_key(&fence.0) {
            return Err(RenderError::InvalidState("export of unknown fence".into()));
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        Ok(fd)
    }

    fn fence_signaled(&mut self, fence: FenceId) -> bool {
        self.fences.get(&fence.0).copied().unwrap_or(false)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Vertex;
    use crate::geometry::Mat3;

    fn full_quad() -> ([Vertex; 4], [u16; 4]) {
        (
            [
                Vertex::at(0.0, 0.0),
                Vertex::at(4.0, 0.0),
                Vertex::at(0.0, 4.0),
                Vertex::at(4.0, 4.0),
            ],
            [0, 1, 2, 3],
        )
    }

    #[test]
    fn solid_draw_fills_the_target() {
        let mut device = FakeDevice::new();
        let target = device.create_offscreen_target(4, 4, false).unwrap();
        device.make_current(Some(target)).unwrap();
        let program = device
            .compile_program(&ShaderRequirements::fallback())
            .unwrap();
        let (vertices, indices) = full_quad();
        let uniforms = Uniforms::untextured(Mat3::orthographic(4.0, 4.0), [0.0, 1.0, 0.0, 1.0]);
        device
            .draw(&DrawCall {
                program,
                mode: DrawMode::TriangleStrip,
                vertices: &vertices,
                indices: &indices,
                uniforms,
                blend: false,
                scissor: None,
            })
            .unwrap();
        assert_eq!(device.target_pixel(target, 0, 0), [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(device.target_pixel(target, 3, 3), [0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn scissor_limits_the_draw() {
        let mut device = FakeDevice::new();
        let target = device.create_offscreen_target(4, 4, false).unwrap();
        device.make_current(Some(target)).unwrap();
        let program = device
            .compile_program(&ShaderRequirements::fallback())
            .unwrap();
        let (vertices, indices) = full_quad();
        let uniforms = Uniforms::untextured(Mat3::orthographic(4.0, 4.0), [1.0, 1.0, 1.0, 1.0]);
        device
            .draw(&DrawCall {
                program,
                mode: DrawMode::TriangleStrip,
                vertices: &vertices,
                indices: &indices,
                uniforms,
                blend: false,
                scissor: Some(Rect::new(0, 0, 2, 2)),
            })
            .unwrap();
        assert_eq!(device.target_pixel(target, 1, 1)[0], 1.0);
        assert_eq!(device.target_pixel(target, 3, 3)[0], 0.0);
    }

    #[test]
    fn textured_draw_samples_with_the_buffer_matrix() {
        let mut device = FakeDevice::new();
        let target = device.create_offscreen_target(2, 2, false).unwrap();
        device.make_current(Some(target)).unwrap();
        let texture = device.create_texture(TexelFormat::Rgba8, 2, 2).unwrap();
        // Distinct per-texel red values.
        let data: Vec<u8> = vec![
            10, 0, 0, 255, 20, 0, 0, 255, //
            30, 0, 0, 255, 40, 0, 0, 255,
        ];
        device
            .upload_texture(texture, Rect::new(0, 0, 2, 2), 8, &data)
            .unwrap();
        let program = device
            .compile_program(&ShaderRequirements {
                variant: ShaderVariant::Rgba,
                input_is_premult: true,
                ..Default::default()
            })
            .unwrap();
        let (vertices, indices) = (
            [
                Vertex::at(0.0, 0.0),
                Vertex::at(2.0, 0.0),
                Vertex::at(0.0, 2.0),
                Vertex::at(2.0, 2.0),
            ],
            [0u16, 1, 2, 3],
        );
        let textures = [texture];
        let mut uniforms = Uniforms::untextured(Mat3::orthographic(2.0, 2.0), [0.0; 4]);
        uniforms.textures = &textures;
        uniforms.surface_to_buffer = Mat3::scale(0.5, 0.5);
        device
            .draw(&DrawCall {
                program,
                mode: DrawMode::TriangleStrip,
                vertices: &vertices,
                indices: &indices,
                uniforms,
                blend: false,
                scissor: None,
            })
            .unwrap();
        let mut out = vec![0u8; 16];
        device.read_pixels(Rect::new(0, 0, 2, 2), &mut out).unwrap();
        assert_eq!(out[0], 10);
        assert_eq!(out[4], 20);
        assert_eq!(out[8], 30);
        assert_eq!(out[12], 40);
    }

    #[test]
    fn blending_composites_over_the_destination() {
        let mut device = FakeDevice::new();
        let target = device.create_offscreen_target(1, 1, false).unwrap();
        device.make_current(Some(target)).unwrap();
        device.clear([1.0, 0.0, 0.0, 1.0], None);
        let program = device
            .compile_program(&ShaderRequirements::fallback())
            .unwrap();
        let vertices = [
            Vertex::at(0.0, 0.0),
            Vertex::at(1.0, 0.0),
            Vertex::at(0.0, 1.0),
            Vertex::at(1.0, 1.0),
        ];
        let indices = [0u16, 1, 2, 3];
        // Half-transparent black over red: premultiplied output.
        let uniforms = Uniforms::untextured(Mat3::orthographic(1.0, 1.0), [0.0, 0.0, 0.0, 0.5]);
        device
            .draw(&DrawCall {
                program,
                mode: DrawMode::TriangleStrip,
                vertices: &vertices,
                indices: &indices,
                uniforms,
                blend: true,
                scissor: None,
            })
            .unwrap();
        let px = device.target_pixel(target, 0, 0);
        assert!((px[0] - 0.5).abs() < 1e-5);
        assert!((px[3] - 1.0).abs() < 1e-5);
    }
}

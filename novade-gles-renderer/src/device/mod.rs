//! The GPU seam of the renderer.
//!
//! Everything that touches the graphics API goes through [`GpuDevice`].
//! The production implementation ([`gl::GlDevice`]) drives GLES through
//! glow and EGL; the test suite drives the same contract with a CPU
//! reference device. The implementation is chosen once, when the renderer
//! is constructed, never per call.

use crate::capabilities::Capabilities;
use crate::color::ParametricParams;
use crate::error::RenderError;
use crate::format::{Format, LegacyChannelLayout, TexelFormat};
use crate::geometry::{Mat3, Rect};
use crate::shader::ShaderRequirements;
use bytemuck::{Pod, Zeroable};
use std::os::fd::RawFd;

#[cfg(feature = "egl")]
pub mod gl;
#[cfg(feature = "egl")]
mod glsl;

#[cfg(test)]
pub(crate) mod fake;

macro_rules! handle_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

handle_id!(
    /// Opaque handle to a GPU image.
    TextureId
);
handle_id!(
    /// Opaque handle to a compiled, linked program.
    ProgramId
);
handle_id!(
    /// Opaque handle to a render target (window surface or FBO).
    TargetId
);
handle_id!(
    /// Opaque handle to a GPU completion fence.
    FenceId
);

/// A native window surface handle owned by the windowing backend.
#[derive(Debug, Clone, Copy)]
pub struct NativeWindow(pub *mut core::ffi::c_void);

/// One plane of a dmabuf.
#[derive(Debug, Clone)]
pub struct DmabufPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// A dmabuf as submitted by a client or scanout allocator. The file
/// descriptors remain owned by the caller.
#[derive(Debug, Clone)]
pub struct DmabufAttributes {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub modifier: Option<u64>,
    pub planes: Vec<DmabufPlane>,
}

/// What the legacy buffer query entry point reports about a buffer.
#[derive(Debug, Clone, Copy)]
pub struct LegacyBufferInfo {
    pub width: u32,
    pub height: u32,
    pub layout: LegacyChannelLayout,
}

/// A mesh vertex. Positions are surface-local; texture coordinates are
/// used only by programs with an attribute texcoord source.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub texcoord: [f32; 2],
}

impl Vertex {
    pub fn at(x: f32, y: f32) -> Self {
        Vertex {
            position: [x, y],
            texcoord: [0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawMode {
    Triangles,
    #[default]
    TriangleStrip,
}

/// Uniform payload for a color-curve stage.
#[derive(Debug, Clone, Copy, Default)]
pub enum CurveUniform {
    #[default]
    None,
    Lut {
        texture: TextureId,
        /// Texture-coordinate scale mapping [0,1] input onto texel centers.
        scale: f32,
        offset: f32,
    },
    Parametric(ParametricParams),
}

/// Uniform payload for the color-mapping stage.
#[derive(Debug, Clone, Copy, Default)]
pub enum MappingUniform {
    #[default]
    Identity,
    Matrix {
        /// Column-major 3×3 color matrix.
        matrix: [f32; 9],
        offset: [f32; 3],
    },
    Lut3D {
        texture: TextureId,
        scale: f32,
        offset: f32,
        size: u32,
    },
}

/// The complete uniform contract of a draw: projection, surface-to-buffer
/// matrix, view alpha, up to three input textures, tint, and the three
/// color-pipeline stages.
#[derive(Debug, Clone)]
pub struct Uniforms<'a> {
    pub projection: Mat3,
    pub surface_to_buffer: Mat3,
    pub view_alpha: f32,
    pub textures: &'a [TextureId],
    pub solid_color: [f32; 4],
    pub tint: [f32; 4],
    pub pre_curve: CurveUniform,
    pub mapping: MappingUniform,
    pub post_curve: CurveUniform,
    pub wireframe_texture: Option<TextureId>,
}

impl<'a> Uniforms<'a> {
    /// Minimal uniforms: identity matrices, opaque, no color pipeline.
    pub fn untextured(projection: Mat3, solid_color: [f32; 4]) -> Self {
        Uniforms {
            projection,
            surface_to_buffer: Mat3::IDENTITY,
            view_alpha: 1.0,
            textures: &[],
            solid_color,
            tint: [0.0; 4],
            pre_curve: CurveUniform::None,
            mapping: MappingUniform::Identity,
            post_curve: CurveUniform::None,
            wireframe_texture: None,
        }
    }
}

/// One draw against the current render target.
#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub mode: DrawMode,
    pub vertices: &'a [Vertex],
    pub indices: &'a [u16],
    pub uniforms: Uniforms<'a>,
    pub blend: bool,
    pub scissor: Option<Rect>,
}

/// The renderer's view of a GPU.
///
/// All methods are called from the single render thread. Resource handles
/// are plain ids; double-destroy and use-after-destroy are programming
/// errors the implementations log rather than UB.
pub trait GpuDevice {
    fn capabilities(&self) -> Capabilities;

    // Textures.
    fn create_texture(
        &mut self,
        texel: TexelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RenderError>;
    /// Uploads a sub-rectangle of client pixels into a texture created by
    /// [`Self::create_texture`]. `stride` is in bytes.
    fn upload_texture(
        &mut self,
        texture: TextureId,
        rect: Rect,
        stride: u32,
        data: &[u8],
    ) -> Result<(), RenderError>;
    /// Creates the fixed 4-row curve LUT texture. `data` holds `width * 4`
    /// samples, row-major, one curve channel per row (row 3 unused).
    fn create_curve_lut(&mut self, width: u32, data: &[f32]) -> Result<TextureId, RenderError>;
    /// Creates a `size`³ 3D LUT of RGB triples (`data.len() == size³ * 3`).
    fn create_lut3d(&mut self, size: u32, data: &[f32]) -> Result<TextureId, RenderError>;
    /// Combined multi-plane dmabuf import; produces one externally-sampled
    /// image covering all planes.
    fn import_dmabuf(&mut self, attrs: &DmabufAttributes) -> Result<TextureId, RenderError>;
    /// Imports one plane of a dmabuf as a single-plane image of the given
    /// texel format and plane resolution.
    fn import_dmabuf_plane(
        &mut self,
        attrs: &DmabufAttributes,
        plane: usize,
        texel: TexelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RenderError>;
    /// Capability-gated legacy buffer query ([`Capabilities::LEGACY_BUFFER_QUERY`]).
    fn query_legacy_buffer(&mut self, handle: u64) -> Result<LegacyBufferInfo, RenderError>;
    fn import_legacy_plane(&mut self, handle: u64, plane: u32) -> Result<TextureId, RenderError>;
    fn destroy_texture(&mut self, texture: TextureId);

    // Programs.
    fn compile_program(
        &mut self,
        requirements: &ShaderRequirements,
    ) -> Result<ProgramId, RenderError>;
    fn destroy_program(&mut self, program: ProgramId);

    // Render targets.
    fn create_window_target(
        &mut self,
        window: NativeWindow,
        width: u32,
        height: u32,
    ) -> Result<TargetId, RenderError>;
    fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        high_precision: bool,
    ) -> Result<TargetId, RenderError>;
    fn create_dmabuf_target(&mut self, attrs: &DmabufAttributes) -> Result<TargetId, RenderError>;
    /// The texture backing an offscreen target, for blitting it back.
    fn offscreen_texture(&self, target: TargetId) -> Option<TextureId>;
    fn resize_target(&mut self, target: TargetId, width: u32, height: u32)
        -> Result<(), RenderError>;
    fn destroy_target(&mut self, target: TargetId);

    // Frame execution.
    fn make_current(&mut self, target: Option<TargetId>) -> Result<(), RenderError>;
    /// Age of the target's current back buffer in frames; 0 means unknown
    /// content (full repaint required).
    fn buffer_age(&mut self, target: TargetId) -> u32;
    fn clear(&mut self, color: [f32; 4], scissor: Option<Rect>);
    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), RenderError>;
    /// Presents a window target, using `damage` for a partial swap when
    /// the capability was negotiated.
    fn swap(&mut self, target: TargetId, damage: Option<&[Rect]>) -> Result<(), RenderError>;
    /// Flushes queued work without presenting (offscreen targets).
    fn flush(&mut self);
    /// Reads back RGBA8 pixels from the current target into `dst`
    /// (`rect.width * rect.height * 4` bytes, tightly packed, top-down).
    fn read_pixels(&mut self, rect: Rect, dst: &mut [u8]) -> Result<(), RenderError>;

    // Fences.
    fn create_fence(&mut self) -> Result<FenceId, RenderError>;
    /// Duplicates the fence as a pollable fd. Requires
    /// [`Capabilities::NATIVE_FENCE_FD`].
    fn export_fence_fd(&mut self, fence: FenceId) -> Result<RawFd, RenderError>;
    fn fence_signaled(&mut self, fence: FenceId) -> bool;
    fn destroy_fence(&mut self, fence: FenceId);
}

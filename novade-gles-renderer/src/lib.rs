//! # NovaDE GLES Renderer (`novade-gles-renderer`)
//!
//! `novade-gles-renderer` is the GPU-accelerated rendering backend of the
//! NovaDE compositor. It turns per-frame scene descriptions into GLES 2
//! draw calls: client buffers become GPU images, accumulated damage
//! becomes triangle-strip meshes, and each output repaints only what
//! changed since the frame its back buffer last held.
//!
//! ## Responsibilities
//!
//! - **Buffer import**: shared-memory, dmabuf, legacy EGL-queryable and
//!   solid-color surface contents ([`buffer::SurfaceState`]), with
//!   per-plane fallbacks when combined YUV import is unavailable.
//! - **Damage meshes**: damage rectangles clipped against opaque and
//!   blended surface regions and triangulated into indexed strips
//!   ([`mesh::MeshBuilder`]).
//! - **Shader programs**: one program per [`shader::ShaderRequirements`]
//!   key, cached most-recently-used first with a guaranteed fallback
//!   ([`shader::ProgramCache`]).
//! - **Color management**: parametric and sampled tone curves plus 3D
//!   LUT mappings, realized once per transform into GPU textures
//!   ([`color::ColorTransformCache`]).
//! - **Renderbuffers**: buffer-age aware reuse pool with per-entry
//!   damage accumulation ([`renderbuffer::RenderbufferManager`]).
//! - **Repaint**: the per-output frame state machine, shadow targets
//!   for output-wide color transforms, borders, captures and GPU
//!   fences ([`output::Output`], [`renderer::GlesRenderer`]).
//!
//! The GPU itself sits behind the [`device::GpuDevice`] trait; the
//! production implementation drives GLES through `glow` and `khronos-egl`
//! (enabled by the default `egl` feature), and the test suite exercises
//! the full pipeline against a CPU reference device.

pub mod buffer;
pub mod capabilities;
pub mod color;
pub mod device;
pub mod error;
pub mod format;
pub mod geometry;
pub mod mesh;
pub mod output;
pub mod renderbuffer;
pub mod renderer;
pub mod shader;

pub use capabilities::Capabilities;
pub use error::RenderError;
pub use format::Format;
pub use geometry::{Rect, Region, Transform};
pub use output::{Frame, PaintNode, RepaintReport, SurfaceId};
pub use renderbuffer::RenderbufferId;
pub use renderer::{GlesRenderer, OutputId};

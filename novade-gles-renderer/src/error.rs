//! Renderer error taxonomy.
//!
//! Errors fall into four classes with different recovery policies:
//! missing capabilities (degrade at startup, never fatal), transient GPU
//! failures (abandon one frame for one output), client-caused failures
//! (penalize only the offending surface), and GPU resource exhaustion
//! (fatal, since driver state can no longer be trusted).

use crate::capabilities::Capabilities;
use crate::format::Format;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// A required feature was not discovered at context creation. The
    /// affected code path is disabled for the session.
    #[error("missing GPU capability: {0:?}")]
    MissingCapability(Capabilities),

    /// Making the GPU context current failed. Abandons the current
    /// repaint for that output only.
    #[error("failed to make the GPU context current: {0}")]
    ContextCurrent(String),

    /// Presenting the finished frame failed.
    #[error("failed to present frame: {0}")]
    SwapFailed(String),

    /// A client submitted a buffer in a format the renderer cannot
    /// consume. Only that client is affected.
    #[error("unsupported buffer format {0:?}")]
    UnsupportedFormat(Format),

    /// Importing a client buffer failed part-way; any partially created
    /// GPU objects have already been released.
    #[error("buffer import failed: {0}")]
    ImportFailed(String),

    /// Shader compilation or linking failed. Drawing continues with the
    /// fallback program.
    #[error("shader compilation failed for {shader}: {log}")]
    ShaderCompilation { shader: String, log: String },

    /// The driver reported out-of-memory. No degraded path exists once GPU
    /// state may be inconsistent, so callers must treat this as fatal.
    #[error("GPU resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// An operation was attempted against an output or renderbuffer in the
    /// wrong lifecycle state.
    #[error("invalid renderer state: {0}")]
    InvalidState(String),

    /// A caller-supplied argument was rejected before touching the GPU.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Backend-specific failure that does not fit the classes above.
    #[error("GPU device error: {0}")]
    Device(String),
}

impl RenderError {
    /// Whether the compositor must shut the renderer down rather than
    /// retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::ResourceExhaustion(_))
    }

    /// Whether the error is scoped to a single client/surface rather than
    /// the renderer as a whole.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RenderError::UnsupportedFormat(_)
                | RenderError::ImportFailed(_)
                | RenderError::ShaderCompilation { .. }
        )
    }
}

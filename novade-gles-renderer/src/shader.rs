//! Shader requirements keys and the compiled-program cache.
//!
//! Every draw is described by a [`ShaderRequirements`] value; the cache
//! maps each distinct value to exactly one compiled program. The key is a
//! plain value type with derived structural equality, so comparison never
//! depends on memory layout and reserved combinations cannot alias.

use crate::device::{GpuDevice, ProgramId};
use crate::error::RenderError;
use crate::format::Swizzle;
use tracing::{debug, warn};

/// Where the fragment stage gets its texture coordinate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TexCoordSource {
    /// Computed in the vertex stage from the surface-to-buffer matrix.
    #[default]
    Surface,
    /// Taken from an explicit per-vertex attribute (borders, blits).
    Attrib,
}

/// How the input planes are reassembled into an RGBA sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderVariant {
    /// No texture at all; a flat color uniform.
    Solid,
    /// One RGBA-class plane.
    #[default]
    Rgba,
    /// External (natively sampled YUV) image.
    External,
    /// Two planes: Y + interleaved UV.
    YUv,
    /// Three planes: Y, U, V.
    YUV,
    /// Luma view + chroma view of packed 4:2:2 memory.
    YXuxv,
}

/// Kind tag for a color curve stage, as far as program text is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CurveKind {
    #[default]
    None,
    Lut,
    Parametric,
}

/// Kind tag for the color mapping stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MappingKind {
    #[default]
    Identity,
    Matrix,
    Lut3D,
}

/// Complete description of the program a draw needs.
///
/// Two keys compare equal iff they require the same program text; there
/// are no unused bits to leak into the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderRequirements {
    pub texcoord: TexCoordSource,
    pub variant: ShaderVariant,
    /// Input already has premultiplied alpha.
    pub input_is_premult: bool,
    pub tint: bool,
    pub wireframe: bool,
    pub pre_curve: CurveKind,
    pub mapping: MappingKind,
    pub post_curve: CurveKind,
    /// Channel order of plane 0 as uploaded.
    pub channel_order: Swizzle,
}

impl ShaderRequirements {
    /// Requirements of the fixed fallback program: untextured, untinted
    /// solid color with no color pipeline. Guaranteed to compile on every
    /// GLES2 implementation we run on.
    pub fn fallback() -> Self {
        ShaderRequirements {
            variant: ShaderVariant::Solid,
            ..Default::default()
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSelection {
    pub program: ProgramId,
    /// The requested program failed to compile and the fixed fallback was
    /// substituted. The caller reports this to the owning surface only;
    /// the frame itself continues.
    pub is_fallback: bool,
}

struct CacheEntry {
    requirements: ShaderRequirements,
    program: ProgramId,
}

/// Most-recently-used ordered program cache.
///
/// Entry 0 is the most recently used program; garbage collection trims
/// from the tail.
pub struct ProgramCache {
    entries: Vec<CacheEntry>,
    fallback: Option<ProgramId>,
    max_entries: usize,
}

/// Cache size past which least-recently-used programs are evicted.
const DEFAULT_MAX_PROGRAMS: usize = 32;

impl ProgramCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            fallback: None,
            max_entries: DEFAULT_MAX_PROGRAMS,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up (or lazily compiles) the program for `requirements`.
    ///
    /// Compile failure does not abort the frame: the fixed fallback is
    /// compiled on demand and substituted, flagged in the returned
    /// selection. Only if even the fallback fails is an error returned.
    pub fn get(
        &mut self,
        device: &mut dyn GpuDevice,
        requirements: &ShaderRequirements,
    ) -> Result<ProgramSelection, RenderError> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.requirements == *requirements)
        {
            let entry = self.entries.remove(pos);
            let program = entry.program;
            self.entries.insert(0, entry);
            return Ok(ProgramSelection {
                program,
                is_fallback: false,
            });
        }

        match device.compile_program(requirements) {
            Ok(program) => {
                self.entries.insert(
                    0,
                    CacheEntry {
                        requirements: *requirements,
                        program,
                    },
                );
                if self.entries.len() > self.max_entries {
                    // Evict from the least recently used end.
                    if let Some(old) = self.entries.pop() {
                        debug!(?old.requirements, "evicting shader program");
                        device.destroy_program(old.program);
                    }
                }
                Ok(ProgramSelection {
                    program,
                    is_fallback: false,
                })
            }
            Err(err) => {
                warn!(?requirements, %err, "program compile failed, using fallback");
                let fallback = self.fallback_program(device)?;
                Ok(ProgramSelection {
                    program: fallback,
                    is_fallback: true,
                })
            }
        }
    }

    /// The fixed fallback program, compiled at most once.
    pub fn fallback_program(
        &mut self,
        device: &mut dyn GpuDevice,
    ) -> Result<ProgramId, RenderError> {
        if let Some(program) = self.fallback {
            return Ok(program);
        }
        let program = device.compile_program(&ShaderRequirements::fallback())?;
        self.fallback = Some(program);
        Ok(program)
    }

    /// Releases every cached program.
    pub fn clear(&mut self, device: &mut dyn GpuDevice) {
        for entry in self.entries.drain(..) {
            device.destroy_program(entry.program);
        }
        if let Some(fallback) = self.fallback.take() {
            device.destroy_program(fallback);
        }
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

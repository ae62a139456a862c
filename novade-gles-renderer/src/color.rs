//! Color transformation pipeline.
//!
//! A [`ColorTransform`] is an externally owned description of up to three
//! stages: a pre-curve, a mapping, and a post-curve. The renderer lazily
//! realizes GPU resources for a transform (LUT textures, uniform payloads)
//! and caches them against the transform's identity. Ownership is tracked
//! with weak back-references instead of destroy listeners: dead entries
//! are pruned at frame boundaries, releasing their GPU objects exactly
//! once.

use crate::device::{CurveUniform, GpuDevice, MappingUniform, TextureId};
use crate::error::RenderError;
use crate::shader::{CurveKind, MappingKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Length of the shaper LUT produced when decomposing an opaque transform.
pub const SHAPER_LUT_LEN: usize = 1024;
/// Edge resolution of the 3D LUT produced for opaque transforms.
pub const DECOMPOSED_LUT3D_SIZE: usize = 33;

/// Evaluation order of the power-law segment of a parametric curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveOrder {
    /// `(a·x + b)^g` at or above the breakpoint.
    PowerOfLinear,
    /// `a·x^g + b` at or above the breakpoint.
    LinearPlusPower,
}

/// Parametric tone curve: five parameters `{g, a, b, c, d}` per channel.
///
/// Below the breakpoint `d` the curve is linear (`c·x`); at or above it,
/// power-law per [`CurveOrder`]. Negative inputs are mirrored
/// (`f(-x) = -f(x)`). When `clamp_input` is set, input is clamped to
/// [0, 1] before evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParametricParams {
    pub order: CurveOrder,
    pub clamp_input: bool,
    /// `[g, a, b, c, d]` per channel.
    pub params: [[f32; 5]; 3],
}

impl ParametricParams {
    pub fn eval_channel(&self, channel: usize, x: f32) -> f32 {
        let x = if self.clamp_input { x.clamp(0.0, 1.0) } else { x };
        if x < 0.0 {
            return -self.eval_channel_non_negative(channel, -x);
        }
        self.eval_channel_non_negative(channel, x)
    }

    fn eval_channel_non_negative(&self, channel: usize, x: f32) -> f32 {
        let [g, a, b, c, d] = self.params[channel];
        if x < d {
            c * x
        } else {
            match self.order {
                CurveOrder::PowerOfLinear => (a * x + b).max(0.0).powf(g),
                CurveOrder::LinearPlusPower => a * x.max(0.0).powf(g) + b,
            }
        }
    }
}

/// One curve stage of a transform description.
#[derive(Debug, Clone)]
pub enum CurveSpec {
    Parametric(ParametricParams),
    /// One 1D table per channel; all three tables share a caller-chosen
    /// length.
    Lut { channels: [Vec<f32>; 3] },
}

impl CurveSpec {
    pub fn kind(&self) -> CurveKind {
        match self {
            CurveSpec::Parametric(_) => CurveKind::Parametric,
            CurveSpec::Lut { .. } => CurveKind::Lut,
        }
    }

    /// Builds the identity function as a LUT of the given length.
    pub fn identity_lut(len: usize) -> CurveSpec {
        let ramp: Vec<f32> = (0..len)
            .map(|i| i as f32 / (len - 1).max(1) as f32)
            .collect();
        CurveSpec::Lut {
            channels: [ramp.clone(), ramp.clone(), ramp],
        }
    }

    pub fn eval_channel(&self, channel: usize, x: f32) -> f32 {
        match self {
            CurveSpec::Parametric(p) => p.eval_channel(channel, x),
            CurveSpec::Lut { channels } => eval_lut(&channels[channel], x),
        }
    }
}

/// Linear interpolation over a 1D table; input clamped to [0, 1].
pub fn eval_lut(table: &[f32], x: f32) -> f32 {
    if table.is_empty() {
        return x;
    }
    if table.len() == 1 {
        return table[0];
    }
    let x = x.clamp(0.0, 1.0);
    let pos = x * (table.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(table.len() - 1);
    let frac = pos - lo as f32;
    table[lo] * (1.0 - frac) + table[hi] * frac
}

/// The mapping stage of a transform description.
#[derive(Debug, Clone)]
pub enum MappingSpec {
    Identity,
    /// 3×3 column-major matrix with an optional additive offset.
    Matrix { matrix: [f32; 9], offset: [f32; 3] },
    /// A `size`³ grid of RGB triples, red-major
    /// (`index = r + g·size + b·size²`).
    Lut3D { size: usize, samples: Vec<f32> },
}

impl MappingSpec {
    pub fn kind(&self) -> MappingKind {
        match self {
            MappingSpec::Identity => MappingKind::Identity,
            MappingSpec::Matrix { .. } => MappingKind::Matrix,
            MappingSpec::Lut3D { .. } => MappingKind::Lut3D,
        }
    }

    pub fn eval(&self, rgb: [f32; 3]) -> [f32; 3] {
        match self {
            MappingSpec::Identity => rgb,
            MappingSpec::Matrix { matrix: m, offset } => [
                m[0] * rgb[0] + m[3] * rgb[1] + m[6] * rgb[2] + offset[0],
                m[1] * rgb[0] + m[4] * rgb[1] + m[7] * rgb[2] + offset[1],
                m[2] * rgb[0] + m[5] * rgb[1] + m[8] * rgb[2] + offset[2],
            ],
            MappingSpec::Lut3D { size, samples } => sample_lut3d(*size, samples, rgb),
        }
    }
}

/// Trilinear interpolation into a red-major 3D LUT of RGB triples.
pub fn sample_lut3d(size: usize, samples: &[f32], rgb: [f32; 3]) -> [f32; 3] {
    debug_assert!(size >= 2);
    let fetch = |r: usize, g: usize, b: usize| -> [f32; 3] {
        let idx = (r + g * size + b * size * size) * 3;
        [samples[idx], samples[idx + 1], samples[idx + 2]]
    };
    let mut coord = [0usize; 3];
    let mut frac = [0f32; 3];
    for (i, value) in rgb.iter().enumerate() {
        let pos = value.clamp(0.0, 1.0) * (size - 1) as f32;
        let lo = (pos.floor() as usize).min(size - 2);
        coord[i] = lo;
        frac[i] = pos - lo as f32;
    }
    let mut out = [0f32; 3];
    for corner in 0..8 {
        let dr = corner & 1;
        let dg = (corner >> 1) & 1;
        let db = (corner >> 2) & 1;
        let w = (if dr == 1 { frac[0] } else { 1.0 - frac[0] })
            * (if dg == 1 { frac[1] } else { 1.0 - frac[1] })
            * (if db == 1 { frac[2] } else { 1.0 - frac[2] });
        let sample = fetch(coord[0] + dr, coord[1] + dg, coord[2] + db);
        for c in 0..3 {
            out[c] += w * sample[c];
        }
    }
    out
}

/// Emulates GPU sampling of a curve LUT row with the texel-center scale
/// and offset applied: coordinate 0 hits the center of the first texel and
/// 1 the center of the last, so sampling is pure interpolation.
pub fn sample_curve_lut_row(table: &[f32], scale: f32, offset: f32, x: f32) -> f32 {
    let len = table.len() as f32;
    let coord = x.clamp(0.0, 1.0) * scale + offset;
    let pos = (coord * len - 0.5).clamp(0.0, len - 1.0);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(table.len() - 1);
    let frac = pos - lo as f32;
    table[lo] * (1.0 - frac) + table[hi] * frac
}

enum TransformRepr {
    /// Directly representable pipeline.
    Pipeline {
        pre: Option<CurveSpec>,
        mapping: MappingSpec,
        post: Option<CurveSpec>,
    },
    /// Opaque transform that can only be sampled; realized by
    /// decomposition into a shaper LUT plus a 3D LUT.
    Sampled(Box<dyn Fn([f32; 3]) -> [f32; 3]>),
}

/// An externally owned, shareable color transform description.
///
/// The renderer holds only [`Weak`] references; GPU resources realized for
/// a transform live exactly as long as the owning [`Arc`] does (observed
/// at frame boundaries).
pub struct ColorTransform {
    repr: TransformRepr,
}

impl fmt::Debug for ColorTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            TransformRepr::Pipeline { pre, mapping, post } => f
                .debug_struct("ColorTransform")
                .field("pre", &pre.as_ref().map(CurveSpec::kind))
                .field("mapping", &mapping.kind())
                .field("post", &post.as_ref().map(CurveSpec::kind))
                .finish(),
            TransformRepr::Sampled(_) => f.write_str("ColorTransform::Sampled"),
        }
    }
}

impl ColorTransform {
    pub fn pipeline(
        pre: Option<CurveSpec>,
        mapping: MappingSpec,
        post: Option<CurveSpec>,
    ) -> Arc<Self> {
        Arc::new(ColorTransform {
            repr: TransformRepr::Pipeline { pre, mapping, post },
        })
    }

    pub fn identity() -> Arc<Self> {
        Self::pipeline(None, MappingSpec::Identity, None)
    }

    /// Wraps an opaque transform that can only be point-sampled.
    pub fn sampled(sampler: impl Fn([f32; 3]) -> [f32; 3] + 'static) -> Arc<Self> {
        Arc::new(ColorTransform {
            repr: TransformRepr::Sampled(Box::new(sampler)),
        })
    }

    /// CPU evaluation of the full transform, used for decomposition and by
    /// the reference device.
    pub fn eval(&self, rgb: [f32; 3]) -> [f32; 3] {
        match &self.repr {
            TransformRepr::Pipeline { pre, mapping, post } => {
                let mut v = rgb;
                if let Some(curve) = pre {
                    for c in 0..3 {
                        v[c] = curve.eval_channel(c, v[c]);
                    }
                }
                v = mapping.eval(v);
                if let Some(curve) = post {
                    for c in 0..3 {
                        v[c] = curve.eval_channel(c, v[c]);
                    }
                }
                v
            }
            TransformRepr::Sampled(f) => f(rgb),
        }
    }
}

/// GPU-side realization of a transform: uniform payloads plus any LUT
/// textures. Either fully realized or absent, never partial.
#[derive(Debug, Clone, Copy)]
pub struct GpuColorTransform {
    pub pre: CurveUniform,
    pub mapping: MappingUniform,
    pub post: CurveUniform,
}

impl GpuColorTransform {
    pub const IDENTITY: GpuColorTransform = GpuColorTransform {
        pre: CurveUniform::None,
        mapping: MappingUniform::Identity,
        post: CurveUniform::None,
    };

    pub fn pre_kind(&self) -> CurveKind {
        curve_kind(&self.pre)
    }

    pub fn post_kind(&self) -> CurveKind {
        curve_kind(&self.post)
    }

    pub fn mapping_kind(&self) -> MappingKind {
        match self.mapping {
            MappingUniform::Identity => MappingKind::Identity,
            MappingUniform::Matrix { .. } => MappingKind::Matrix,
            MappingUniform::Lut3D { .. } => MappingKind::Lut3D,
        }
    }
}

fn curve_kind(curve: &CurveUniform) -> CurveKind {
    match curve {
        CurveUniform::None => CurveKind::None,
        CurveUniform::Lut { .. } => CurveKind::Lut,
        CurveUniform::Parametric(_) => CurveKind::Parametric,
    }
}

struct CacheEntry {
    owner: Weak<ColorTransform>,
    realized: GpuColorTransform,
    textures: Vec<TextureId>,
}

/// Cache of realized transforms, keyed by the owning `Arc`'s identity.
#[derive(Default)]
pub struct ColorTransformCache {
    entries: HashMap<usize, CacheEntry>,
}

impl ColorTransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the realized GPU resources for `transform`, creating them
    /// on first use. Re-requesting a cached transform performs no GPU
    /// work.
    pub fn realize(
        &mut self,
        device: &mut dyn GpuDevice,
        transform: &Arc<ColorTransform>,
    ) -> Result<GpuColorTransform, RenderError> {
        let key = Arc::as_ptr(transform) as usize;
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.realized);
        }

        let mut textures = Vec::new();
        let realized = match &transform.repr {
            TransformRepr::Pipeline { pre, mapping, post } => {
                let result = (|| -> Result<GpuColorTransform, RenderError> {
                    let pre = realize_curve(device, pre.as_ref(), &mut textures)?;
                    let mapping = realize_mapping(device, mapping, &mut textures)?;
                    let post = realize_curve(device, post.as_ref(), &mut textures)?;
                    Ok(GpuColorTransform { pre, mapping, post })
                })();
                match result {
                    Ok(realized) => realized,
                    Err(err) => {
                        // All-or-nothing: release whatever was created.
                        for texture in textures {
                            device.destroy_texture(texture);
                        }
                        return Err(err);
                    }
                }
            }
            TransformRepr::Sampled(_) => {
                match realize_decomposed(device, transform, &mut textures) {
                    Ok(realized) => realized,
                    Err(err) => {
                        for texture in textures {
                            device.destroy_texture(texture);
                        }
                        return Err(err);
                    }
                }
            }
        };

        self.entries.insert(
            key,
            CacheEntry {
                owner: Arc::downgrade(transform),
                realized,
                textures,
            },
        );
        Ok(realized)
    }

    /// Drops entries whose owning transform has been destroyed, releasing
    /// their GPU resources. Called at frame boundaries.
    pub fn prune(&mut self, device: &mut dyn GpuDevice) {
        self.entries.retain(|_, entry| {
            if entry.owner.strong_count() > 0 {
                true
            } else {
                debug!(textures = entry.textures.len(), "releasing color transform resources");
                for texture in entry.textures.drain(..) {
                    device.destroy_texture(texture);
                }
                false
            }
        });
    }

    /// Releases everything, regardless of owner liveness. Renderer
    /// teardown only.
    pub fn clear(&mut self, device: &mut dyn GpuDevice) {
        for (_, mut entry) in self.entries.drain() {
            for texture in entry.textures.drain(..) {
                device.destroy_texture(texture);
            }
        }
    }
}

/// Scale/offset pair mapping [0,1] onto texel centers of a row of `len`
/// texels: 0 maps to the center of the first texel, 1 to the center of the
/// last, so the GPU only ever interpolates.
pub fn lut_scale_offset(len: usize) -> (f32, f32) {
    let len = len as f32;
    ((len - 1.0) / len, 0.5 / len)
}

fn realize_curve(
    device: &mut dyn GpuDevice,
    curve: Option<&CurveSpec>,
    textures: &mut Vec<TextureId>,
) -> Result<CurveUniform, RenderError> {
    match curve {
        None => Ok(CurveUniform::None),
        Some(CurveSpec::Parametric(params)) => Ok(CurveUniform::Parametric(*params)),
        Some(CurveSpec::Lut { channels }) => {
            let len = channels[0].len();
            if len < 2 || channels.iter().any(|c| c.len() != len) {
                return Err(RenderError::InvalidParameter(
                    "curve LUT channels must share a length of at least 2".into(),
                ));
            }
            // Fixed 4-row layout; the spare row keeps the texture height a
            // constant known to the sampler.
            let mut data = vec![0f32; len * 4];
            for (row, channel) in channels.iter().enumerate() {
                data[row * len..(row + 1) * len].copy_from_slice(channel);
            }
            let texture = device.create_curve_lut(len as u32, &data)?;
            textures.push(texture);
            let (scale, offset) = lut_scale_offset(len);
            Ok(CurveUniform::Lut {
                texture,
                scale,
                offset,
            })
        }
    }
}

fn realize_mapping(
    device: &mut dyn GpuDevice,
    mapping: &MappingSpec,
    textures: &mut Vec<TextureId>,
) -> Result<MappingUniform, RenderError> {
    match mapping {
        MappingSpec::Identity => Ok(MappingUniform::Identity),
        MappingSpec::Matrix { matrix, offset } => Ok(MappingUniform::Matrix {
            matrix: *matrix,
            offset: *offset,
        }),
        MappingSpec::Lut3D { size, samples } => {
            if *size < 2 || samples.len() != size * size * size * 3 {
                return Err(RenderError::InvalidParameter(
                    "3D LUT size does not match sample count".into(),
                ));
            }
            let texture = device.create_lut3d(*size as u32, samples)?;
            textures.push(texture);
            let (scale, offset) = lut_scale_offset(*size);
            Ok(MappingUniform::Lut3D {
                texture,
                scale,
                offset,
                size: *size as u32,
            })
        }
    }
}

/// Decomposes an opaque transform into a shaper 1D LUT followed by a 3D
/// LUT sampled at each grid point.
fn realize_decomposed(
    device: &mut dyn GpuDevice,
    transform: &ColorTransform,
    textures: &mut Vec<TextureId>,
) -> Result<GpuColorTransform, RenderError> {
    // The shaper encodes the identity today; it exists so grid inputs are
    // uniformly spaced regardless of what preceded the 3D stage.
    let shaper = CurveSpec::identity_lut(SHAPER_LUT_LEN);
    let pre = realize_curve(device, Some(&shaper), textures)?;

    let size = DECOMPOSED_LUT3D_SIZE;
    let step = 1.0 / (size - 1) as f32;
    let mut samples = Vec::with_capacity(size * size * size * 3);
    for b in 0..size {
        for g in 0..size {
            for r in 0..size {
                let out = transform.eval([r as f32 * step, g as f32 * step, b as f32 * step]);
                samples.extend_from_slice(&out);
            }
        }
    }
    let mapping = realize_mapping(
        device,
        &MappingSpec::Lut3D { size, samples },
        textures,
    )?;
    Ok(GpuColorTransform {
        pre,
        mapping,
        post: CurveUniform::None,
    })
}

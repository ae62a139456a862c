//! Pixel-format descriptor tables.
//!
//! Every import path resolves a client format to one static
//! [`FormatDescriptor`] up front. The descriptor declares the exact GPU
//! plane layout (count, per-plane texel format, subsampling divisors) and
//! the shader-side channel swizzle, so the importer never improvises: a
//! 2-plane format always yields exactly 2 images, and sampling order is
//! documented per format rather than guessed per buffer.

use crate::shader::ShaderVariant;

/// Client-visible pixel formats accepted by the renderer, named after
/// their fourcc codes (little-endian byte order, as on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    /// 2-plane YUV 4:2:0: full-res Y plane, half-res interleaved CbCr.
    Nv12,
    /// 3-plane YUV 4:2:0: full-res Y, half-res Cb, half-res Cr.
    Yuv420,
    /// 3-plane YUV 4:4:4, one full-resolution plane per component.
    Yuv444,
    /// Packed YUV 4:2:2, emulated as a luma view plus a chroma view of the
    /// same memory.
    Yuyv,
}

/// GPU texel layout of a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexelFormat {
    /// One byte per texel, sampled into `.r`.
    R8,
    /// Two bytes per texel, sampled into `.rg`.
    Rg88,
    /// Four bytes per texel.
    Rgba8,
}

impl TexelFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TexelFormat::R8 => 1,
            TexelFormat::Rg88 => 2,
            TexelFormat::Rgba8 => 4,
        }
    }
}

/// Source channel for one output component of the sampling swizzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    R,
    G,
    B,
    A,
    One,
}

/// Channel swizzle applied when sampling plane 0 of an RGB format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle {
    pub r: Channel,
    pub g: Channel,
    pub b: Channel,
    pub a: Channel,
}

impl Swizzle {
    pub const IDENTITY: Swizzle = Swizzle {
        r: Channel::R,
        g: Channel::G,
        b: Channel::B,
        a: Channel::A,
    };
    /// Little-endian [AX]RGB memory uploaded as RGBA texels.
    pub const BGRA: Swizzle = Swizzle {
        r: Channel::B,
        g: Channel::G,
        b: Channel::R,
        a: Channel::A,
    };
    pub const BGR1: Swizzle = Swizzle {
        r: Channel::B,
        g: Channel::G,
        b: Channel::R,
        a: Channel::One,
    };
    pub const RGB1: Swizzle = Swizzle {
        r: Channel::R,
        g: Channel::G,
        b: Channel::B,
        a: Channel::One,
    };
}

impl Default for Swizzle {
    fn default() -> Self {
        Swizzle::IDENTITY
    }
}

/// One plane of a format: texel layout plus resolution divisors relative
/// to the full buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDescriptor {
    pub texel: TexelFormat,
    pub width_divisor: u32,
    pub height_divisor: u32,
}

const fn plane(texel: TexelFormat, width_divisor: u32, height_divisor: u32) -> PlaneDescriptor {
    PlaneDescriptor {
        texel,
        width_divisor,
        height_divisor,
    }
}

/// Everything the importer and shader selection need to know about a
/// format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatDescriptor {
    pub format: Format,
    /// Bytes per pixel of plane 0 in client memory.
    pub bytes_per_pixel: u32,
    /// Declared GPU plane layout. Import must produce exactly this many
    /// images or fail without leaving partial objects behind.
    pub planes: &'static [PlaneDescriptor],
    /// Sampling swizzle for single-plane RGB formats.
    pub swizzle: Swizzle,
    /// Shader variant required to reassemble the planes into RGBA.
    pub variant: ShaderVariant,
    /// Whether the format carries no meaningful alpha.
    pub opaque: bool,
}

static ARGB8888: FormatDescriptor = FormatDescriptor {
    format: Format::Argb8888,
    bytes_per_pixel: 4,
    planes: &[plane(TexelFormat::Rgba8, 1, 1)],
    swizzle: Swizzle::BGRA,
    variant: ShaderVariant::Rgba,
    opaque: false,
};

static XRGB8888: FormatDescriptor = FormatDescriptor {
    format: Format::Xrgb8888,
    bytes_per_pixel: 4,
    planes: &[plane(TexelFormat::Rgba8, 1, 1)],
    swizzle: Swizzle::BGR1,
    variant: ShaderVariant::Rgba,
    opaque: true,
};

static ABGR8888: FormatDescriptor = FormatDescriptor {
    format: Format::Abgr8888,
    bytes_per_pixel: 4,
    planes: &[plane(TexelFormat::Rgba8, 1, 1)],
    swizzle: Swizzle::IDENTITY,
    variant: ShaderVariant::Rgba,
    opaque: false,
};

static XBGR8888: FormatDescriptor = FormatDescriptor {
    format: Format::Xbgr8888,
    bytes_per_pixel: 4,
    planes: &[plane(TexelFormat::Rgba8, 1, 1)],
    swizzle: Swizzle::RGB1,
    variant: ShaderVariant::Rgba,
    opaque: true,
};

// NV12 splits into a full-resolution R plane (Y) and a half-resolution RG
// plane (CbCr interleaved).
static NV12: FormatDescriptor = FormatDescriptor {
    format: Format::Nv12,
    bytes_per_pixel: 1,
    planes: &[plane(TexelFormat::R8, 1, 1), plane(TexelFormat::Rg88, 2, 2)],
    swizzle: Swizzle::IDENTITY,
    variant: ShaderVariant::YUv,
    opaque: true,
};

static YUV420: FormatDescriptor = FormatDescriptor {
    format: Format::Yuv420,
    bytes_per_pixel: 1,
    planes: &[
        plane(TexelFormat::R8, 1, 1),
        plane(TexelFormat::R8, 2, 2),
        plane(TexelFormat::R8, 2, 2),
    ],
    swizzle: Swizzle::IDENTITY,
    variant: ShaderVariant::YUV,
    opaque: true,
};

static YUV444: FormatDescriptor = FormatDescriptor {
    format: Format::Yuv444,
    bytes_per_pixel: 1,
    planes: &[
        plane(TexelFormat::R8, 1, 1),
        plane(TexelFormat::R8, 1, 1),
        plane(TexelFormat::R8, 1, 1),
    ],
    swizzle: Swizzle::IDENTITY,
    variant: ShaderVariant::YUV,
    opaque: true,
};

// Packed YUYV is viewed twice: an RG plane at full width carrying Y in the
// red channel, and an RGBA plane at half width carrying U/V in green and
// alpha positions.
static YUYV: FormatDescriptor = FormatDescriptor {
    format: Format::Yuyv,
    bytes_per_pixel: 2,
    planes: &[plane(TexelFormat::Rg88, 1, 1), plane(TexelFormat::Rgba8, 2, 1)],
    swizzle: Swizzle::IDENTITY,
    variant: ShaderVariant::YXuxv,
    opaque: true,
};

static ALL_FORMATS: [&FormatDescriptor; 8] = [
    &ARGB8888, &XRGB8888, &ABGR8888, &XBGR8888, &NV12, &YUV420, &YUV444, &YUYV,
];

/// Descriptor lookup for any accepted format.
pub fn descriptor(format: Format) -> &'static FormatDescriptor {
    match format {
        Format::Argb8888 => &ARGB8888,
        Format::Xrgb8888 => &XRGB8888,
        Format::Abgr8888 => &ABGR8888,
        Format::Xbgr8888 => &XBGR8888,
        Format::Nv12 => &NV12,
        Format::Yuv420 => &YUV420,
        Format::Yuv444 => &YUV444,
        Format::Yuyv => &YUYV,
    }
}

/// Formats accepted on the shared-memory path.
pub fn shm_formats() -> impl Iterator<Item = &'static FormatDescriptor> {
    ALL_FORMATS.iter().copied()
}

/// Per-plane fallback descriptors used when a combined multi-plane dmabuf
/// import fails: each plane is re-imported as a single-plane dmabuf of the
/// listed texel format. Only formats in this table take the fallback path.
pub fn dmabuf_fallback_planes(format: Format) -> Option<&'static [PlaneDescriptor]> {
    match format {
        Format::Nv12 => Some(NV12.planes),
        Format::Yuv420 => Some(YUV420.planes),
        Format::Yuv444 => Some(YUV444.planes),
        _ => None,
    }
}

/// Channel layout reported by the legacy buffer query entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyChannelLayout {
    Rgb,
    Rgba,
    YUv,
    YUV,
    YXuxv,
}

/// Best-effort format guess for the legacy import path.
///
/// The legacy entry point reports only a coarse channel layout; the true
/// per-component depth is not queryable. This mapping therefore assumes
/// 8 bits per component and is knowingly lossy for deeper buffers. It is a
/// documented heuristic, not a bug to fix here.
pub fn guess_from_component_layout(layout: LegacyChannelLayout) -> Format {
    match layout {
        LegacyChannelLayout::Rgb => Format::Xrgb8888,
        LegacyChannelLayout::Rgba => Format::Argb8888,
        LegacyChannelLayout::YUv => Format::Nv12,
        LegacyChannelLayout::YUV => Format::Yuv420,
        LegacyChannelLayout::YXuxv => Format::Yuyv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_counts_match_declared_layout() {
        assert_eq!(descriptor(Format::Argb8888).planes.len(), 1);
        assert_eq!(descriptor(Format::Nv12).planes.len(), 2);
        assert_eq!(descriptor(Format::Yuv420).planes.len(), 3);
        assert_eq!(descriptor(Format::Yuyv).planes.len(), 2);
    }

    #[test]
    fn nv12_splits_into_r_and_rg_planes() {
        let planes = descriptor(Format::Nv12).planes;
        assert_eq!(planes[0].texel, TexelFormat::R8);
        assert_eq!(planes[0].width_divisor, 1);
        assert_eq!(planes[1].texel, TexelFormat::Rg88);
        assert_eq!(planes[1].width_divisor, 2);
        assert_eq!(planes[1].height_divisor, 2);
    }

    #[test]
    fn opaque_formats_force_alpha_to_one() {
        assert_eq!(descriptor(Format::Xrgb8888).swizzle.a, Channel::One);
        assert_eq!(descriptor(Format::Argb8888).swizzle.a, Channel::A);
    }

    #[test]
    fn legacy_guess_is_defined_for_all_layouts() {
        assert_eq!(
            guess_from_component_layout(LegacyChannelLayout::Rgba),
            Format::Argb8888
        );
        assert_eq!(
            guess_from_component_layout(LegacyChannelLayout::YUv),
            Format::Nv12
        );
    }
}

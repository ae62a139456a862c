//! One-time discovery of graphics-API features.
//!
//! Extension probing happens exactly once, when the GPU context is created.
//! Everything downstream consumes the resulting [`Capabilities`] flags and
//! never re-queries the driver, so a missing feature degrades the renderer
//! deterministically for the whole session.

use bitflags::bitflags;
use tracing::info;

bitflags! {
    /// Features the device layer discovered at context creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// dmabuf buffers can be imported as GPU images.
        const DMABUF_IMPORT = 1 << 0;
        /// dmabuf import understands format modifiers.
        const DMABUF_MODIFIERS = 1 << 1;
        /// Fences can be exported as pollable file descriptors.
        const NATIVE_FENCE_FD = 1 << 2;
        /// The window surface reports how old its back buffer is.
        const BUFFER_AGE = 1 << 3;
        /// Presentation accepts a damage-rect list for partial swaps.
        const PARTIAL_SWAP = 1 << 4;
        /// The legacy protocol buffer query entry point exists.
        const LEGACY_BUFFER_QUERY = 1 << 5;
        /// Multi-plane YUV buffers can be sampled natively in one image.
        const NATIVE_YUV_SAMPLING = 1 << 6;
        /// Half-float renderbuffers are supported, enabling the
        /// high-precision shadow target for output color transforms.
        const HALF_FLOAT_RENDERTARGET = 1 << 7;
        /// 3D textures are available for color-mapping LUTs.
        const LUT_3D = 1 << 8;
    }
}

impl Capabilities {
    /// Derives the flag set from GL and EGL extension name lists.
    ///
    /// Logged once; callers are expected to keep the result for the lifetime
    /// of the context.
    pub fn discover<'a>(
        gl_extensions: impl Iterator<Item = &'a str>,
        egl_extensions: impl Iterator<Item = &'a str>,
    ) -> Capabilities {
        let mut caps = Capabilities::empty();
        for ext in gl_extensions {
            match ext {
                "GL_OES_EGL_image_external" => caps |= Capabilities::NATIVE_YUV_SAMPLING,
                "GL_EXT_color_buffer_half_float" => {
                    caps |= Capabilities::HALF_FLOAT_RENDERTARGET
                }
                "GL_OES_texture_3D" => caps |= Capabilities::LUT_3D,
                _ => {}
            }
        }
        for ext in egl_extensions {
            match ext {
                "EGL_EXT_image_dma_buf_import" => caps |= Capabilities::DMABUF_IMPORT,
                "EGL_EXT_image_dma_buf_import_modifiers" => {
                    caps |= Capabilities::DMABUF_MODIFIERS
                }
                "EGL_ANDROID_native_fence_sync" => caps |= Capabilities::NATIVE_FENCE_FD,
                "EGL_EXT_buffer_age" => caps |= Capabilities::BUFFER_AGE,
                "EGL_EXT_swap_buffers_with_damage" | "EGL_KHR_swap_buffers_with_damage" => {
                    caps |= Capabilities::PARTIAL_SWAP
                }
                "EGL_WL_bind_wayland_display" => caps |= Capabilities::LEGACY_BUFFER_QUERY,
                _ => {}
            }
        }
        info!(capabilities = ?caps, "discovered GPU feature set");
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_maps_extension_names() {
        let gl = ["GL_OES_texture_3D", "GL_EXT_color_buffer_half_float"];
        let egl = [
            "EGL_EXT_image_dma_buf_import",
            "EGL_EXT_buffer_age",
            "EGL_KHR_swap_buffers_with_damage",
        ];
        let caps = Capabilities::discover(gl.into_iter(), egl.into_iter());
        assert!(caps.contains(Capabilities::LUT_3D));
        assert!(caps.contains(Capabilities::DMABUF_IMPORT));
        assert!(caps.contains(Capabilities::BUFFER_AGE));
        assert!(caps.contains(Capabilities::PARTIAL_SWAP));
        assert!(!caps.contains(Capabilities::NATIVE_FENCE_FD));
        assert!(!caps.contains(Capabilities::DMABUF_MODIFIERS));
    }

    #[test]
    fn discovery_of_nothing_is_empty() {
        let caps = Capabilities::discover([].into_iter(), [].into_iter());
        assert!(caps.is_empty());
    }
}

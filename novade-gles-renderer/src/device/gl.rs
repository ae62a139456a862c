//! The production [`GpuDevice`]: GLES 2 through glow, contexts and
//! buffer import through EGL.
//!
//! All EGL extension entry points the renderer relies on are resolved
//! once at construction; a missing entry point clears the matching
//! capability bit instead of failing later. The device keeps plain-id
//! maps for every GPU object so the rest of the crate never touches a
//! raw handle.

use crate::capabilities::Capabilities;
use crate::color::CurveOrder;
use crate::device::glsl::{self, ATTRIB_POSITION, ATTRIB_TEXCOORD};
use crate::device::{
    CurveUniform, DmabufAttributes, DrawCall, DrawMode, FenceId, GpuDevice, LegacyBufferInfo,
    MappingUniform, NativeWindow, ProgramId, TargetId, TextureId, Uniforms, Vertex,
};
use crate::error::RenderError;
use crate::format::{Format, LegacyChannelLayout, TexelFormat};
use crate::geometry::{Mat3, Rect};
use crate::shader::ShaderRequirements;
use glow::HasContext;
use khronos_egl as egl;
use std::collections::HashMap;
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::ptr;
use tracing::{debug, info, warn};

// EGL_EXT_image_dma_buf_import (+ _modifiers).
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;
const EGL_DMA_BUF_PLANE_FD_EXT: [i32; 4] = [0x3272, 0x3275, 0x3278, 0x3440];
const EGL_DMA_BUF_PLANE_OFFSET_EXT: [i32; 4] = [0x3273, 0x3276, 0x3279, 0x3441];
const EGL_DMA_BUF_PLANE_PITCH_EXT: [i32; 4] = [0x3274, 0x3277, 0x327A, 0x3442];
const EGL_DMA_BUF_PLANE_MODIFIER_LO_EXT: [i32; 4] = [0x3443, 0x3445, 0x3447, 0x3449];
const EGL_DMA_BUF_PLANE_MODIFIER_HI_EXT: [i32; 4] = [0x3444, 0x3446, 0x3448, 0x344A];

// EGL_WL_bind_wayland_display.
const EGL_WAYLAND_BUFFER_WL: u32 = 0x31D5;
const EGL_WAYLAND_PLANE_WL: i32 = 0x31D6;
const EGL_TEXTURE_FORMAT: i32 = 0x3080;
const EGL_TEXTURE_RGB: i32 = 0x305D;
const EGL_TEXTURE_RGBA: i32 = 0x305E;
const EGL_TEXTURE_Y_UV_WL: i32 = 0x31D7;
const EGL_TEXTURE_Y_U_V_WL: i32 = 0x31D8;
const EGL_TEXTURE_Y_XUXV_WL: i32 = 0x31D9;

// EGL_KHR_fence_sync / EGL_ANDROID_native_fence_sync.
const EGL_SYNC_FENCE_KHR: u32 = 0x30F9;
const EGL_SYNC_NATIVE_FENCE_ANDROID: u32 = 0x3144;
const EGL_CONDITION_SATISFIED_KHR: i32 = 0x30F6;
const EGL_NO_NATIVE_FENCE_FD_ANDROID: i32 = -1;

const EGL_BUFFER_AGE_EXT: i32 = 0x313D;
const EGL_WIDTH: i32 = 0x3057;
const EGL_HEIGHT: i32 = 0x3056;
const EGL_NONE: i32 = 0x3038;

const GL_TEXTURE_EXTERNAL_OES: u32 = 0x8D65;
const GL_HALF_FLOAT_OES: u32 = 0x8D61;

const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");
const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");
const DRM_FORMAT_ABGR8888: u32 = fourcc(b"AB24");
const DRM_FORMAT_XBGR8888: u32 = fourcc(b"XB24");
const DRM_FORMAT_NV12: u32 = fourcc(b"NV12");
const DRM_FORMAT_YUV420: u32 = fourcc(b"YU12");
const DRM_FORMAT_YUV444: u32 = fourcc(b"YU24");
const DRM_FORMAT_YUYV: u32 = fourcc(b"YUYV");
const DRM_FORMAT_R8: u32 = fourcc(b"R8  ");
const DRM_FORMAT_GR88: u32 = fourcc(b"GR88");

const fn fourcc(code: &[u8; 4]) -> u32 {
    code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

type EglImage = *mut c_void;
type EglSync = *mut c_void;

type PfnCreateImage =
    unsafe extern "C" fn(*mut c_void, *mut c_void, u32, *mut c_void, *const i32) -> EglImage;
type PfnDestroyImage = unsafe extern "C" fn(*mut c_void, EglImage) -> u32;
type PfnImageTargetTexture2D = unsafe extern "C" fn(u32, EglImage);
type PfnCreateSync = unsafe extern "C" fn(*mut c_void, u32, *const i32) -> EglSync;
type PfnDestroySync = unsafe extern "C" fn(*mut c_void, EglSync) -> u32;
type PfnClientWaitSync = unsafe extern "C" fn(*mut c_void, EglSync, i32, u64) -> i32;
type PfnDupNativeFenceFd = unsafe extern "C" fn(*mut c_void, EglSync) -> i32;
type PfnSwapBuffersWithDamage =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *const i32, i32) -> u32;
type PfnQueryWaylandBuffer = unsafe extern "C" fn(*mut c_void, *mut c_void, i32, *mut i32) -> u32;

/// Extension entry points resolved through `eglGetProcAddress`.
#[derive(Default)]
struct ExtensionFns {
    create_image: Option<PfnCreateImage>,
    destroy_image: Option<PfnDestroyImage>,
    image_target_texture_2d: Option<PfnImageTargetTexture2D>,
    create_sync: Option<PfnCreateSync>,
    destroy_sync: Option<PfnDestroySync>,
    client_wait_sync: Option<PfnClientWaitSync>,
    dup_native_fence_fd: Option<PfnDupNativeFenceFd>,
    swap_buffers_with_damage: Option<PfnSwapBuffersWithDamage>,
    query_wayland_buffer: Option<PfnQueryWaylandBuffer>,
}

struct TextureEntry {
    raw: glow::Texture,
    /// `TEXTURE_2D`, `TEXTURE_EXTERNAL_OES` or `TEXTURE_3D`.
    bind_target: u32,
    /// Upload format/type for [`GpuDevice::upload_texture`]; imported
    /// images keep the allocation values but are never uploaded to.
    format: u32,
    data_type: u32,
    bytes_per_texel: u32,
    image: Option<EglImage>,
}

struct ProgramEntry {
    raw: glow::Program,
    locations: Locations,
}

#[derive(Default)]
struct StageLocations {
    lut_scale: Option<glow::UniformLocation>,
    lut_offset: Option<glow::UniformLocation>,
    g: Option<glow::UniformLocation>,
    a: Option<glow::UniformLocation>,
    b: Option<glow::UniformLocation>,
    c: Option<glow::UniformLocation>,
    d: Option<glow::UniformLocation>,
    order: Option<glow::UniformLocation>,
    clamp: Option<glow::UniformLocation>,
}

#[derive(Default)]
struct Locations {
    projection: Option<glow::UniformLocation>,
    surface_to_buffer: Option<glow::UniformLocation>,
    alpha: Option<glow::UniformLocation>,
    color: Option<glow::UniformLocation>,
    tint: Option<glow::UniformLocation>,
    mapping_matrix: Option<glow::UniformLocation>,
    mapping_offset: Option<glow::UniformLocation>,
    mapping_scale: Option<glow::UniformLocation>,
    mapping_offset3d: Option<glow::UniformLocation>,
    pre: StageLocations,
    post: StageLocations,
}

// Texture units are assigned statically; the matching sampler uniforms
// are set once at link time.
const UNIT_PLANE0: i32 = 0;
const UNIT_PLANE1: i32 = 1;
const UNIT_PLANE2: i32 = 2;
const UNIT_PRE_LUT: i32 = 3;
const UNIT_MAPPING_LUT: i32 = 4;
const UNIT_POST_LUT: i32 = 5;
const UNIT_WIREFRAME: i32 = 6;

enum TargetKind {
    Window {
        surface: egl::Surface,
    },
    Offscreen {
        fbo: glow::Framebuffer,
        texture: TextureId,
    },
    Dmabuf {
        fbo: glow::Framebuffer,
        texture: glow::Texture,
        image: EglImage,
    },
}

struct TargetEntry {
    kind: TargetKind,
    width: u32,
    height: u32,
}

impl TargetEntry {
    /// Offscreen rendering is flipped so texture row 0 holds the top of
    /// the image, matching the compositor's top-down convention.
    fn flipped(&self) -> bool {
        !matches!(self.kind, TargetKind::Window { .. })
    }
}

struct FenceEntry {
    sync: EglSync,
    native: bool,
}

/// GLES 2 device over an EGL display.
pub struct GlDevice {
    egl: egl::DynamicInstance<egl::EGL1_4>,
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
    /// Tiny pbuffer used to make the context current without a window
    /// surface; `None` when the display supports surfaceless contexts.
    sync_surface: Option<egl::Surface>,
    gl: glow::Context,
    // Keeps GLES symbols resolvable for the lifetime of the context.
    _gles_library: Option<libloading::Library>,
    exts: ExtensionFns,
    capabilities: Capabilities,
    has_texture_rg: bool,
    has_texture_float: bool,
    has_unpack_subimage: bool,
    vbo: glow::Buffer,
    ebo: glow::Buffer,
    textures: HashMap<u64, TextureEntry>,
    programs: HashMap<u64, ProgramEntry>,
    targets: HashMap<u64, TargetEntry>,
    fences: HashMap<u64, FenceEntry>,
    current: Option<TargetId>,
    next_id: u64,
}

impl GlDevice {
    /// Creates a device on the given native display (`NULL` selects the
    /// default display).
    pub fn new(native_display: *mut c_void) -> Result<Self, RenderError> {
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required() }
            .map_err(|err| RenderError::Device(format!("cannot load libEGL: {err}")))?;

        let display = unsafe { egl.get_display(native_display) }
            .ok_or_else(|| RenderError::Device("no EGL display".into()))?;
        let (major, minor) = egl
            .initialize(display)
            .map_err(|err| RenderError::Device(format!("eglInitialize: {err}")))?;
        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|err| RenderError::Device(format!("eglBindAPI: {err}")))?;

        let config_attribs = [
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT | egl::PBUFFER_BIT,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attribs)
            .map_err(|err| RenderError::Device(format!("eglChooseConfig: {err}")))?
            .ok_or_else(|| RenderError::Device("no usable EGL config".into()))?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attribs)
            .map_err(|err| RenderError::Device(format!("eglCreateContext: {err}")))?;

        let egl_extensions = egl
            .query_string(Some(display), egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let sync_surface = if egl_extensions.contains("EGL_KHR_surfaceless_context") {
            None
        } else {
            let attribs = [EGL_WIDTH, 1, EGL_HEIGHT, 1, egl::NONE];
            Some(
                egl.create_pbuffer_surface(display, config, &attribs)
                    .map_err(|err| RenderError::Device(format!("eglCreatePbufferSurface: {err}")))?,
            )
        };

        egl.make_current(display, sync_surface, sync_surface, Some(context))
            .map_err(|err| RenderError::ContextCurrent(err.to_string()))?;

        // eglGetProcAddress is not required to resolve core GLES symbols
        // on every driver; fall back to the client library.
        let gles_library = unsafe { libloading::Library::new("libGLESv2.so.2") }.ok();
        if gles_library.is_none() {
            debug!("libGLESv2.so.2 not found, relying on eglGetProcAddress alone");
        }
        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                if let Some(addr) = egl.get_proc_address(name) {
                    return addr as *const c_void;
                }
                gles_library
                    .as_ref()
                    .and_then(|lib| unsafe {
                        lib.get::<*const c_void>(name.as_bytes())
                            .map(|sym| *sym)
                            .ok()
                    })
                    .unwrap_or(ptr::null())
            })
        };

        let gl_extensions: Vec<String> = unsafe {
            gl.supported_extensions()
                .iter()
                .map(|ext| ext.clone())
                .collect()
        };

        let mut exts = ExtensionFns::default();
        unsafe {
            exts.create_image = load_fn(&egl, "eglCreateImageKHR");
            exts.destroy_image = load_fn(&egl, "eglDestroyImageKHR");
            exts.image_target_texture_2d = load_fn(&egl, "glEGLImageTargetTexture2DOES");
            exts.create_sync = load_fn(&egl, "eglCreateSyncKHR");
            exts.destroy_sync = load_fn(&egl, "eglDestroySyncKHR");
            exts.client_wait_sync = load_fn(&egl, "eglClientWaitSyncKHR");
            exts.dup_native_fence_fd = load_fn(&egl, "eglDupNativeFenceFDANDROID");
            exts.swap_buffers_with_damage = load_fn(&egl, "eglSwapBuffersWithDamageEXT")
                .or(load_fn(&egl, "eglSwapBuffersWithDamageKHR"));
            exts.query_wayland_buffer = load_fn(&egl, "eglQueryWaylandBufferWL");
        }

        let mut capabilities = Capabilities::discover(
            gl_extensions.iter().map(String::as_str),
            egl_extensions.split_whitespace(),
        );
        // Extension strings promise entry points; trust only resolved ones.
        if exts.create_image.is_none() || exts.image_target_texture_2d.is_none() {
            capabilities -=
                Capabilities::DMABUF_IMPORT | Capabilities::DMABUF_MODIFIERS | Capabilities::LEGACY_BUFFER_QUERY;
        }
        if exts.dup_native_fence_fd.is_none() || exts.create_sync.is_none() {
            capabilities -= Capabilities::NATIVE_FENCE_FD;
        }
        if exts.swap_buffers_with_damage.is_none() {
            capabilities -= Capabilities::PARTIAL_SWAP;
        }
        if exts.query_wayland_buffer.is_none() {
            capabilities -= Capabilities::LEGACY_BUFFER_QUERY;
        }

        let has_texture_rg = gl_extensions.iter().any(|e| e == "GL_EXT_texture_rg");
        let has_texture_float = gl_extensions.iter().any(|e| e == "GL_OES_texture_float")
            && gl_extensions
                .iter()
                .any(|e| e == "GL_OES_texture_float_linear");
        let has_unpack_subimage = gl_extensions.iter().any(|e| e == "GL_EXT_unpack_subimage");

        let (vbo, ebo) = unsafe {
            let vbo = gl
                .create_buffer()
                .map_err(RenderError::ResourceExhaustion)?;
            let ebo = gl
                .create_buffer()
                .map_err(RenderError::ResourceExhaustion)?;
            (vbo, ebo)
        };

        info!(
            egl_version = format!("{major}.{minor}"),
            ?capabilities,
            texture_rg = has_texture_rg,
            texture_float = has_texture_float,
            "GLES device initialized"
        );

        Ok(GlDevice {
            egl,
            display,
            config,
            context,
            sync_surface,
            gl,
            _gles_library: gles_library,
            exts,
            capabilities,
            has_texture_rg,
            has_texture_float,
            has_unpack_subimage,
            vbo,
            ebo,
            textures: HashMap::new(),
            programs: HashMap::new(),
            targets: HashMap::new(),
            fences: HashMap::new(),
            current: None,
            next_id: 1,
        })
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn display_ptr(&self) -> *mut c_void {
        self.display.as_ptr()
    }

    /// GL upload format for a plane texel layout. Two-channel planes need
    /// GL_EXT_texture_rg; without it planar chroma cannot be represented.
    fn texel_upload_format(&self, texel: TexelFormat) -> Result<u32, RenderError> {
        match texel {
            TexelFormat::R8 => Ok(if self.has_texture_rg {
                glow::RED
            } else {
                glow::LUMINANCE
            }),
            TexelFormat::Rg88 => {
                if self.has_texture_rg {
                    Ok(glow::RG)
                } else {
                    Err(RenderError::ImportFailed(
                        "two-channel planes need GL_EXT_texture_rg".into(),
                    ))
                }
            }
            TexelFormat::Rgba8 => Ok(glow::RGBA),
        }
    }

    fn new_gl_texture(&mut self, bind_target: u32) -> Result<glow::Texture, RenderError> {
        let gl = &self.gl;
        unsafe {
            let raw = gl
                .create_texture()
                .map_err(RenderError::ResourceExhaustion)?;
            gl.bind_texture(bind_target, Some(raw));
            gl.tex_parameter_i32(bind_target, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(bind_target, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(
                bind_target,
                glow::TEXTURE_WRAP_S,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.tex_parameter_i32(
                bind_target,
                glow::TEXTURE_WRAP_T,
                glow::CLAMP_TO_EDGE as i32,
            );
            Ok(raw)
        }
    }

    fn register_texture(&mut self, entry: TextureEntry) -> TextureId {
        let id = self.alloc_id();
        self.textures.insert(id, entry);
        TextureId(id)
    }

    fn create_egl_image(
        &self,
        target: u32,
        buffer: *mut c_void,
        attribs: &[i32],
    ) -> Result<EglImage, RenderError> {
        let create = self
            .exts
            .create_image
            .ok_or(RenderError::MissingCapability(Capabilities::DMABUF_IMPORT))?;
        let image = unsafe {
            create(
                self.display_ptr(),
                ptr::null_mut(),
                target,
                buffer,
                attribs.as_ptr(),
            )
        };
        if image.is_null() {
            return Err(RenderError::ImportFailed(format!(
                "eglCreateImageKHR failed for target {target:#x}"
            )));
        }
        Ok(image)
    }

    fn destroy_egl_image(&self, image: EglImage) {
        if let Some(destroy) = self.exts.destroy_image {
            unsafe {
                destroy(self.display_ptr(), image);
            }
        }
    }

    fn bind_image_to_texture(
        &mut self,
        image: EglImage,
        bind_target: u32,
    ) -> Result<glow::Texture, RenderError> {
        let bind = self
            .exts
            .image_target_texture_2d
            .ok_or(RenderError::MissingCapability(Capabilities::DMABUF_IMPORT))?;
        let raw = self.new_gl_texture(bind_target)?;
        unsafe {
            bind(bind_target, image);
            if self.gl.get_error() != glow::NO_ERROR {
                self.gl.delete_texture(raw);
                return Err(RenderError::ImportFailed(
                    "glEGLImageTargetTexture2DOES rejected the image".into(),
                ));
            }
        }
        Ok(raw)
    }

    fn dmabuf_image_attribs(&self, attrs: &DmabufAttributes, fourcc: u32) -> Vec<i32> {
        let mut out = vec![
            EGL_WIDTH,
            attrs.width as i32,
            EGL_HEIGHT,
            attrs.height as i32,
            EGL_LINUX_DRM_FOURCC_EXT,
            fourcc as i32,
        ];
        for (index, plane) in attrs.planes.iter().enumerate().take(4) {
            out.extend_from_slice(&[
                EGL_DMA_BUF_PLANE_FD_EXT[index],
                plane.fd,
                EGL_DMA_BUF_PLANE_OFFSET_EXT[index],
                plane.offset as i32,
                EGL_DMA_BUF_PLANE_PITCH_EXT[index],
                plane.stride as i32,
            ]);
            if let Some(modifier) = attrs.modifier {
                if self.capabilities.contains(Capabilities::DMABUF_MODIFIERS) {
                    out.extend_from_slice(&[
                        EGL_DMA_BUF_PLANE_MODIFIER_LO_EXT[index],
                        modifier as u32 as i32,
                        EGL_DMA_BUF_PLANE_MODIFIER_HI_EXT[index],
                        (modifier >> 32) as u32 as i32,
                    ]);
                }
            }
        }
        out.push(EGL_NONE);
        out
    }

    fn single_plane_image_attribs(
        &self,
        attrs: &DmabufAttributes,
        plane: usize,
        fourcc: u32,
        width: u32,
        height: u32,
    ) -> Vec<i32> {
        let p = &attrs.planes[plane];
        let mut out = vec![
            EGL_WIDTH,
            width as i32,
            EGL_HEIGHT,
            height as i32,
            EGL_LINUX_DRM_FOURCC_EXT,
            fourcc as i32,
            EGL_DMA_BUF_PLANE_FD_EXT[0],
            p.fd,
            EGL_DMA_BUF_PLANE_OFFSET_EXT[0],
            p.offset as i32,
            EGL_DMA_BUF_PLANE_PITCH_EXT[0],
            p.stride as i32,
        ];
        if let Some(modifier) = attrs.modifier {
            if self.capabilities.contains(Capabilities::DMABUF_MODIFIERS) {
                out.extend_from_slice(&[
                    EGL_DMA_BUF_PLANE_MODIFIER_LO_EXT[0],
                    modifier as u32 as i32,
                    EGL_DMA_BUF_PLANE_MODIFIER_HI_EXT[0],
                    (modifier >> 32) as u32 as i32,
                ]);
            }
        }
        out.push(EGL_NONE);
        out
    }

    fn make_context_current(&self, surface: Option<egl::Surface>) -> Result<(), RenderError> {
        let surface = surface.or(self.sync_surface);
        self.egl
            .make_current(self.display, surface, surface, Some(self.context))
            .map_err(|err| RenderError::ContextCurrent(err.to_string()))
    }

    fn current_target(&self) -> Result<&TargetEntry, RenderError> {
        let id = self
            .current
            .ok_or_else(|| RenderError::InvalidState("no current render target".into()))?;
        self.targets
            .get(&id.0)
            .ok_or_else(|| RenderError::InvalidState("current render target was destroyed".into()))
    }

    /// Converts a top-down rect to GL window coordinates for the current
    /// target orientation.
    fn gl_rect(&self, rect: &Rect, target: &TargetEntry) -> (i32, i32, i32, i32) {
        let y = if target.flipped() {
            rect.y
        } else {
            target.height as i32 - rect.y - rect.height
        };
        (rect.x, y, rect.width, rect.height)
    }

    fn apply_scissor(&self, scissor: Option<Rect>, target: &TargetEntry) {
        let gl = &self.gl;
        unsafe {
            match scissor {
                Some(rect) => {
                    let (x, y, w, h) = self.gl_rect(&rect, target);
                    gl.enable(glow::SCISSOR_TEST);
                    gl.scissor(x, y, w, h);
                }
                None => gl.disable(glow::SCISSOR_TEST),
            }
        }
    }

    fn bind_plane_textures(&self, textures: &[TextureId]) -> Result<(), RenderError> {
        for (unit, id) in textures.iter().enumerate().take(3) {
            let entry = self
                .textures
                .get(&id.0)
                .ok_or_else(|| RenderError::InvalidParameter("unknown texture in draw".into()))?;
            unsafe {
                self.gl.active_texture(glow::TEXTURE0 + unit as u32);
                self.gl.bind_texture(entry.bind_target, Some(entry.raw));
            }
        }
        Ok(())
    }

    fn bind_lut_texture(&self, id: TextureId, unit: i32) -> Result<(), RenderError> {
        let entry = self
            .textures
            .get(&id.0)
            .ok_or_else(|| RenderError::InvalidParameter("unknown LUT texture".into()))?;
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit as u32);
            self.gl.bind_texture(entry.bind_target, Some(entry.raw));
        }
        Ok(())
    }

    fn set_curve_uniforms(
        &self,
        locations: &StageLocations,
        curve: &CurveUniform,
        lut_unit: i32,
    ) -> Result<(), RenderError> {
        let gl = &self.gl;
        match curve {
            CurveUniform::None => {}
            CurveUniform::Lut {
                texture,
                scale,
                offset,
            } => {
                self.bind_lut_texture(*texture, lut_unit)?;
                unsafe {
                    gl.uniform_1_f32(locations.lut_scale.as_ref(), *scale);
                    gl.uniform_1_f32(locations.lut_offset.as_ref(), *offset);
                }
            }
            CurveUniform::Parametric(params) => unsafe {
                let p = &params.params;
                gl.uniform_3_f32(locations.g.as_ref(), p[0][0], p[1][0], p[2][0]);
                gl.uniform_3_f32(locations.a.as_ref(), p[0][1], p[1][1], p[2][1]);
                gl.uniform_3_f32(locations.b.as_ref(), p[0][2], p[1][2], p[2][2]);
                gl.uniform_3_f32(locations.c.as_ref(), p[0][3], p[1][3], p[2][3]);
                gl.uniform_3_f32(locations.d.as_ref(), p[0][4], p[1][4], p[2][4]);
                let order = match params.order {
                    CurveOrder::PowerOfLinear => 1.0,
                    CurveOrder::LinearPlusPower => 0.0,
                };
                gl.uniform_1_f32(locations.order.as_ref(), order);
                gl.uniform_1_f32(
                    locations.clamp.as_ref(),
                    if params.clamp_input { 1.0 } else { 0.0 },
                );
            },
        }
        Ok(())
    }

    fn compile_stage(&self, kind: u32, source: &str) -> Result<glow::Shader, RenderError> {
        let gl = &self.gl;
        let stage = if kind == glow::VERTEX_SHADER {
            "vertex shader"
        } else {
            "fragment shader"
        };
        unsafe {
            let shader = gl
                .create_shader(kind)
                .map_err(RenderError::ResourceExhaustion)?;
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                return Err(RenderError::ShaderCompilation {
                    shader: stage.to_string(),
                    log,
                });
            }
            Ok(shader)
        }
    }
}

unsafe fn load_fn<F>(egl: &egl::DynamicInstance<egl::EGL1_4>, name: &str) -> Option<F> {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<extern "system" fn()>()
    );
    egl.get_proc_address(name)
        .map(|addr| std::mem::transmute_copy(&addr))
}

fn drm_fourcc(format: Format) -> u32 {
    match format {
        Format::Argb8888 => DRM_FORMAT_ARGB8888,
        Format::Xrgb8888 => DRM_FORMAT_XRGB8888,
        Format::Abgr8888 => DRM_FORMAT_ABGR8888,
        Format::Xbgr8888 => DRM_FORMAT_XBGR8888,
        Format::Nv12 => DRM_FORMAT_NV12,
        Format::Yuv420 => DRM_FORMAT_YUV420,
        Format::Yuv444 => DRM_FORMAT_YUV444,
        Format::Yuyv => DRM_FORMAT_YUYV,
    }
}

fn texel_fourcc(texel: TexelFormat) -> u32 {
    match texel {
        TexelFormat::R8 => DRM_FORMAT_R8,
        TexelFormat::Rg88 => DRM_FORMAT_GR88,
        TexelFormat::Rgba8 => DRM_FORMAT_ABGR8888,
    }
}

impl GpuDevice for GlDevice {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_texture(
        &mut self,
        texel: TexelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RenderError> {
        let format = self.texel_upload_format(texel)?;
        let raw = self.new_gl_texture(glow::TEXTURE_2D)?;
        unsafe {
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                format as i32,
                width as i32,
                height as i32,
                0,
                format,
                glow::UNSIGNED_BYTE,
                None,
            );
            if self.gl.get_error() == glow::OUT_OF_MEMORY {
                self.gl.delete_texture(raw);
                return Err(RenderError::ResourceExhaustion(format!(
                    "allocating {width}x{height} texture"
                )));
            }
        }
        Ok(self.register_texture(TextureEntry {
            raw,
            bind_target: glow::TEXTURE_2D,
            format,
            data_type: glow::UNSIGNED_BYTE,
            bytes_per_texel: texel.bytes_per_texel(),
            image: None,
        }))
    }

    fn upload_texture(
        &mut self,
        texture: TextureId,
        rect: Rect,
        stride: u32,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| RenderError::InvalidParameter("upload to unknown texture".into()))?;
        let bpt = entry.bytes_per_texel;
        let row_bytes = rect.width as u32 * bpt;
        let gl = &self.gl;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(entry.raw));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            if stride == row_bytes || self.has_unpack_subimage {
                if stride != row_bytes {
                    gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, (stride / bpt) as i32);
                }
                gl.tex_sub_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    rect.x,
                    rect.y,
                    rect.width,
                    rect.height,
                    entry.format,
                    entry.data_type,
                    glow::PixelUnpackData::Slice(data),
                );
                if stride != row_bytes {
                    gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
                }
            } else {
                // No GL_EXT_unpack_subimage: upload row by row.
                for row in 0..rect.height {
                    let start = row as usize * stride as usize;
                    gl.tex_sub_image_2d(
                        glow::TEXTURE_2D,
                        0,
                        rect.x,
                        rect.y + row,
                        rect.width,
                        1,
                        entry.format,
                        entry.data_type,
                        glow::PixelUnpackData::Slice(&data[start..start + row_bytes as usize]),
                    );
                }
            }
        }
        Ok(())
    }

    fn create_curve_lut(&mut self, width: u32, data: &[f32]) -> Result<TextureId, RenderError> {
        debug_assert_eq!(data.len(), width as usize * 4);
        let raw = self.new_gl_texture(glow::TEXTURE_2D)?;
        let gl = &self.gl;
        unsafe {
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            if self.has_texture_float {
                gl.tex_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    glow::LUMINANCE as i32,
                    width as i32,
                    4,
                    0,
                    glow::LUMINANCE,
                    glow::FLOAT,
                    Some(bytemuck::cast_slice(data)),
                );
            } else {
                // Quantize to 8 bits when float textures are unavailable.
                let quantized: Vec<u8> = data
                    .iter()
                    .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                    .collect();
                gl.tex_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    glow::LUMINANCE as i32,
                    width as i32,
                    4,
                    0,
                    glow::LUMINANCE,
                    glow::UNSIGNED_BYTE,
                    Some(&quantized),
                );
            }
        }
        Ok(self.register_texture(TextureEntry {
            raw,
            bind_target: glow::TEXTURE_2D,
            format: glow::LUMINANCE,
            data_type: glow::FLOAT,
            bytes_per_texel: 4,
            image: None,
        }))
    }

    fn create_lut3d(&mut self, size: u32, data: &[f32]) -> Result<TextureId, RenderError> {
        if !self.capabilities.contains(Capabilities::LUT_3D) {
            return Err(RenderError::MissingCapability(Capabilities::LUT_3D));
        }
        debug_assert_eq!(data.len(), (size * size * size * 3) as usize);
        let raw = self.new_gl_texture(glow::TEXTURE_3D)?;
        let gl = &self.gl;
        unsafe {
            gl.tex_parameter_i32(
                glow::TEXTURE_3D,
                glow::TEXTURE_WRAP_R,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            if self.has_texture_float {
                gl.tex_image_3d(
                    glow::TEXTURE_3D,
                    0,
                    glow::RGB as i32,
                    size as i32,
                    size as i32,
                    size as i32,
                    0,
                    glow::RGB,
                    glow::FLOAT,
                    Some(bytemuck::cast_slice(data)),
                );
            } else {
                let quantized: Vec<u8> = data
                    .iter()
                    .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                    .collect();
                gl.tex_image_3d(
                    glow::TEXTURE_3D,
                    0,
                    glow::RGB as i32,
                    size as i32,
                    size as i32,
                    size as i32,
                    0,
                    glow::RGB,
                    glow::UNSIGNED_BYTE,
                    Some(&quantized),
                );
            }
            if gl.get_error() == glow::OUT_OF_MEMORY {
                gl.delete_texture(raw);
                return Err(RenderError::ResourceExhaustion("allocating 3D LUT".into()));
            }
        }
        Ok(self.register_texture(TextureEntry {
            raw,
            bind_target: glow::TEXTURE_3D,
            format: glow::RGB,
            data_type: glow::FLOAT,
            bytes_per_texel: 12,
            image: None,
        }))
    }

    fn import_dmabuf(&mut self, attrs: &DmabufAttributes) -> Result<TextureId, RenderError> {
        if !self.capabilities.contains(Capabilities::DMABUF_IMPORT) {
            return Err(RenderError::MissingCapability(Capabilities::DMABUF_IMPORT));
        }
        let attribs = self.dmabuf_image_attribs(attrs, drm_fourcc(attrs.format));
        let image = self.create_egl_image(EGL_LINUX_DMA_BUF_EXT, ptr::null_mut(), &attribs)?;
        let raw = match self.bind_image_to_texture(image, GL_TEXTURE_EXTERNAL_OES) {
            Ok(raw) => raw,
            Err(err) => {
                self.destroy_egl_image(image);
                return Err(err);
            }
        };
        Ok(self.register_texture(TextureEntry {
            raw,
            bind_target: GL_TEXTURE_EXTERNAL_OES,
            format: glow::RGBA,
            data_type: glow::UNSIGNED_BYTE,
            bytes_per_texel: 4,
            image: Some(image),
        }))
    }

    fn import_dmabuf_plane(
        &mut self,
        attrs: &DmabufAttributes,
        plane: usize,
        texel: TexelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RenderError> {
        if !self.capabilities.contains(Capabilities::DMABUF_IMPORT) {
            return Err(RenderError::MissingCapability(Capabilities::DMABUF_IMPORT));
        }
        if plane >= attrs.planes.len() {
            return Err(RenderError::InvalidParameter(format!(
                "dmabuf has no plane {plane}"
            )));
        }
        let attribs = self.single_plane_image_attribs(attrs, plane, texel_fourcc(texel), width, height);
        let image = self.create_egl_image(EGL_LINUX_DMA_BUF_EXT, ptr::null_mut(), &attribs)?;
        let raw = match self.bind_image_to_texture(image, glow::TEXTURE_2D) {
            Ok(raw) => raw,
            Err(err) => {
                self.destroy_egl_image(image);
                return Err(err);
            }
        };
        Ok(self.register_texture(TextureEntry {
            raw,
            bind_target: glow::TEXTURE_2D,
            format: glow::RGBA,
            data_type: glow::UNSIGNED_BYTE,
            bytes_per_texel: texel.bytes_per_texel(),
            image: Some(image),
        }))
    }

    fn query_legacy_buffer(&mut self, handle: u64) -> Result<LegacyBufferInfo, RenderError> {
        let query = self.exts.query_wayland_buffer.ok_or(
            RenderError::MissingCapability(Capabilities::LEGACY_BUFFER_QUERY),
        )?;
        let buffer = handle as *mut c_void;
        let display = self.display_ptr();
        let mut fetch = |attribute: i32| -> Option<i32> {
            let mut value = 0;
            let ok = unsafe { query(display, buffer, attribute, &mut value) };
            (ok != 0).then_some(value)
        };
        let texture_format = fetch(EGL_TEXTURE_FORMAT)
            .ok_or_else(|| RenderError::ImportFailed("not an EGL-queryable buffer".into()))?;
        let width = fetch(EGL_WIDTH)
            .ok_or_else(|| RenderError::ImportFailed("legacy buffer has no width".into()))?;
        let height = fetch(EGL_HEIGHT)
            .ok_or_else(|| RenderError::ImportFailed("legacy buffer has no height".into()))?;
        let layout = match texture_format {
            EGL_TEXTURE_RGB => LegacyChannelLayout::Rgb,
            EGL_TEXTURE_RGBA => LegacyChannelLayout::Rgba,
            EGL_TEXTURE_Y_UV_WL => LegacyChannelLayout::YUv,
            EGL_TEXTURE_Y_U_V_WL => LegacyChannelLayout::YUV,
            EGL_TEXTURE_Y_XUXV_WL => LegacyChannelLayout::YXuxv,
            other => {
                return Err(RenderError::ImportFailed(format!(
                    "unknown legacy texture format {other:#x}"
                )))
            }
        };
        Ok(LegacyBufferInfo {
            width: width as u32,
            height: height as u32,
            layout,
        })
    }

    fn import_legacy_plane(&mut self, handle: u64, plane: u32) -> Result<TextureId, RenderError> {
        let attribs = [EGL_WAYLAND_PLANE_WL, plane as i32, EGL_NONE];
        let image =
            self.create_egl_image(EGL_WAYLAND_BUFFER_WL, handle as *mut c_void, &attribs)?;
        let raw = match self.bind_image_to_texture(image, glow::TEXTURE_2D) {
            Ok(raw) => raw,
            Err(err) => {
                self.destroy_egl_image(image);
                return Err(err);
            }
        };
        Ok(self.register_texture(TextureEntry {
            raw,
            bind_target: glow::TEXTURE_2D,
            format: glow::RGBA,
            data_type: glow::UNSIGNED_BYTE,
            bytes_per_texel: 4,
            image: Some(image),
        }))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        let Some(entry) = self.textures.remove(&texture.0) else {
            warn!(texture = texture.0, "double destroy of texture");
            return;
        };
        unsafe {
            self.gl.delete_texture(entry.raw);
        }
        if let Some(image) = entry.image {
            self.destroy_egl_image(image);
        }
    }

    fn compile_program(
        &mut self,
        requirements: &ShaderRequirements,
    ) -> Result<ProgramId, RenderError> {
        let vertex = self.compile_stage(glow::VERTEX_SHADER, &glsl::vertex_source(requirements))?;
        let fragment =
            match self.compile_stage(glow::FRAGMENT_SHADER, &glsl::fragment_source(requirements)) {
                Ok(fragment) => fragment,
                Err(err) => {
                    unsafe { self.gl.delete_shader(vertex) };
                    return Err(err);
                }
            };
        let gl = &self.gl;
        let raw = unsafe {
            let program = gl
                .create_program()
                .map_err(RenderError::ResourceExhaustion)?;
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.bind_attrib_location(program, ATTRIB_POSITION, "a_position");
            gl.bind_attrib_location(program, ATTRIB_TEXCOORD, "a_texcoord");
            gl.link_program(program);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);
            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(RenderError::ShaderCompilation {
                    shader: "program link".to_string(),
                    log,
                });
            }
            program
        };

        // Samplers are bound to fixed units once; only value uniforms are
        // set per draw.
        unsafe {
            gl.use_program(Some(raw));
            for (name, unit) in [
                ("u_tex0", UNIT_PLANE0),
                ("u_tex1", UNIT_PLANE1),
                ("u_tex2", UNIT_PLANE2),
                ("u_pre_lut", UNIT_PRE_LUT),
                ("u_mapping_lut", UNIT_MAPPING_LUT),
                ("u_post_lut", UNIT_POST_LUT),
                ("u_wireframe", UNIT_WIREFRAME),
            ] {
                if let Some(location) = gl.get_uniform_location(raw, name) {
                    gl.uniform_1_i32(Some(&location), unit);
                }
            }
        }

        let stage_locations = |stage: &str| StageLocations {
            lut_scale: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_scale")) },
            lut_offset: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_offset")) },
            g: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_g")) },
            a: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_a")) },
            b: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_b")) },
            c: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_c")) },
            d: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_d")) },
            order: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_order")) },
            clamp: unsafe { gl.get_uniform_location(raw, &format!("u_{stage}_clamp")) },
        };
        let locations = Locations {
            projection: unsafe { gl.get_uniform_location(raw, "u_projection") },
            surface_to_buffer: unsafe { gl.get_uniform_location(raw, "u_surface_to_buffer") },
            alpha: unsafe { gl.get_uniform_location(raw, "u_alpha") },
            color: unsafe { gl.get_uniform_location(raw, "u_color") },
            tint: unsafe { gl.get_uniform_location(raw, "u_tint") },
            mapping_matrix: unsafe { gl.get_uniform_location(raw, "u_mapping_matrix") },
            mapping_offset: unsafe { gl.get_uniform_location(raw, "u_mapping_offset") },
            mapping_scale: unsafe { gl.get_uniform_location(raw, "u_mapping_scale") },
            mapping_offset3d: unsafe { gl.get_uniform_location(raw, "u_mapping_offset3d") },
            pre: stage_locations("pre"),
            post: stage_locations("post"),
        };

        let id = self.alloc_id();
        self.programs.insert(id, ProgramEntry { raw, locations });
        Ok(ProgramId(id))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        if let Some(entry) = self.programs.remove(&program.0) {
            unsafe {
                self.gl.delete_program(entry.raw);
            }
        }
    }

    fn create_window_target(
        &mut self,
        window: NativeWindow,
        width: u32,
        height: u32,
    ) -> Result<TargetId, RenderError> {
        let surface = unsafe {
            self.egl
                .create_window_surface(self.display, self.config, window.0, None)
        }
        .map_err(|err| RenderError::Device(format!("eglCreateWindowSurface: {err}")))?;
        let id = self.alloc_id();
        self.targets.insert(
            id,
            TargetEntry {
                kind: TargetKind::Window { surface },
                width,
                height,
            },
        );
        Ok(TargetId(id))
    }

    fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        high_precision: bool,
    ) -> Result<TargetId, RenderError> {
        let half_float =
            high_precision && self.capabilities.contains(Capabilities::HALF_FLOAT_RENDERTARGET);
        let raw = self.new_gl_texture(glow::TEXTURE_2D)?;
        let gl = &self.gl;
        let fbo = unsafe {
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                width as i32,
                height as i32,
                0,
                glow::RGBA,
                if half_float {
                    GL_HALF_FLOAT_OES
                } else {
                    glow::UNSIGNED_BYTE
                },
                None,
            );
            let fbo = gl
                .create_framebuffer()
                .map_err(RenderError::ResourceExhaustion)?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(raw),
                0,
            );
            if gl.check_framebuffer_status(glow::FRAMEBUFFER) != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(fbo);
                gl.delete_texture(raw);
                return Err(RenderError::Device(format!(
                    "incomplete offscreen framebuffer (half_float: {half_float})"
                )));
            }
            fbo
        };
        let texture = self.register_texture(TextureEntry {
            raw,
            bind_target: glow::TEXTURE_2D,
            format: glow::RGBA,
            data_type: glow::UNSIGNED_BYTE,
            bytes_per_texel: 4,
            image: None,
        });
        let id = self.alloc_id();
        self.targets.insert(
            id,
            TargetEntry {
                kind: TargetKind::Offscreen { fbo, texture },
                width,
                height,
            },
        );
        Ok(TargetId(id))
    }

    fn create_dmabuf_target(&mut self, attrs: &DmabufAttributes) -> Result<TargetId, RenderError> {
        if !self.capabilities.contains(Capabilities::DMABUF_IMPORT) {
            return Err(RenderError::MissingCapability(Capabilities::DMABUF_IMPORT));
        }
        let attribs = self.dmabuf_image_attribs(attrs, drm_fourcc(attrs.format));
        let image = self.create_egl_image(EGL_LINUX_DMA_BUF_EXT, ptr::null_mut(), &attribs)?;
        let texture = match self.bind_image_to_texture(image, glow::TEXTURE_2D) {
            Ok(texture) => texture,
            Err(err) => {
                self.destroy_egl_image(image);
                return Err(err);
            }
        };
        let gl = &self.gl;
        let fbo = unsafe {
            let fbo = gl
                .create_framebuffer()
                .map_err(RenderError::ResourceExhaustion)?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            if gl.check_framebuffer_status(glow::FRAMEBUFFER) != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(fbo);
                gl.delete_texture(texture);
                self.destroy_egl_image(image);
                return Err(RenderError::ImportFailed(
                    "dmabuf is not renderable on this driver".into(),
                ));
            }
            fbo
        };
        let id = self.alloc_id();
        self.targets.insert(
            id,
            TargetEntry {
                kind: TargetKind::Dmabuf {
                    fbo,
                    texture,
                    image,
                },
                width: attrs.width,
                height: attrs.height,
            },
        );
        Ok(TargetId(id))
    }

    fn offscreen_texture(&self, target: TargetId) -> Option<TextureId> {
        match self.targets.get(&target.0)?.kind {
            TargetKind::Offscreen { texture, .. } => Some(texture),
            _ => None,
        }
    }

    fn resize_target(
        &mut self,
        target: TargetId,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        let entry = self
            .targets
            .get_mut(&target.0)
            .ok_or_else(|| RenderError::InvalidParameter("resize of unknown target".into()))?;
        match &entry.kind {
            // Window surfaces track their native window; just record the
            // new size for viewport and coordinate flips.
            TargetKind::Window { .. } => {
                entry.width = width;
                entry.height = height;
                Ok(())
            }
            TargetKind::Offscreen { fbo: _, texture } => {
                let texture = *texture;
                entry.width = width;
                entry.height = height;
                let raw = self
                    .textures
                    .get(&texture.0)
                    .map(|t| t.raw)
                    .ok_or_else(|| {
                        RenderError::InvalidState("offscreen target lost its texture".into())
                    })?;
                unsafe {
                    self.gl.bind_texture(glow::TEXTURE_2D, Some(raw));
                    self.gl.tex_image_2d(
                        glow::TEXTURE_2D,
                        0,
                        glow::RGBA as i32,
                        width as i32,
                        height as i32,
                        0,
                        glow::RGBA,
                        glow::UNSIGNED_BYTE,
                        None,
                    );
                }
                Ok(())
            }
            TargetKind::Dmabuf { .. } => Err(RenderError::InvalidParameter(
                "dmabuf targets have a fixed size".into(),
            )),
        }
    }

    fn destroy_target(&mut self, target: TargetId) {
        let Some(entry) = self.targets.remove(&target.0) else {
            warn!(target = target.0, "double destroy of render target");
            return;
        };
        if self.current == Some(target) {
            self.current = None;
        }
        match entry.kind {
            TargetKind::Window { surface } => {
                if let Err(err) = self.egl.destroy_surface(self.display, surface) {
                    warn!(%err, "eglDestroySurface failed");
                }
            }
            TargetKind::Offscreen { fbo, texture } => {
                unsafe { self.gl.delete_framebuffer(fbo) };
                self.destroy_texture(texture);
            }
            TargetKind::Dmabuf {
                fbo,
                texture,
                image,
            } => {
                unsafe {
                    self.gl.delete_framebuffer(fbo);
                    self.gl.delete_texture(texture);
                }
                self.destroy_egl_image(image);
            }
        }
    }

    fn make_current(&mut self, target: Option<TargetId>) -> Result<(), RenderError> {
        match target {
            None => {
                self.make_context_current(None)?;
                unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
            }
            Some(id) => {
                let entry = self.targets.get(&id.0).ok_or_else(|| {
                    RenderError::InvalidParameter("make_current on unknown target".into())
                })?;
                let (surface, fbo, width, height) = match &entry.kind {
                    TargetKind::Window { surface } => {
                        (Some(*surface), None, entry.width, entry.height)
                    }
                    TargetKind::Offscreen { fbo, .. } => {
                        (None, Some(*fbo), entry.width, entry.height)
                    }
                    TargetKind::Dmabuf { fbo, .. } => {
                        (None, Some(*fbo), entry.width, entry.height)
                    }
                };
                self.make_context_current(surface)?;
                unsafe {
                    self.gl.bind_framebuffer(glow::FRAMEBUFFER, fbo);
                    self.gl.viewport(0, 0, width as i32, height as i32);
                }
            }
        }
        self.current = target;
        Ok(())
    }

    fn buffer_age(&mut self, target: TargetId) -> u32 {
        if !self.capabilities.contains(Capabilities::BUFFER_AGE) {
            return 0;
        }
        let Some(entry) = self.targets.get(&target.0) else {
            return 0;
        };
        let TargetKind::Window { surface } = &entry.kind else {
            return 0;
        };
        self.egl
            .query_surface(self.display, *surface, EGL_BUFFER_AGE_EXT)
            .map(|age| age.max(0) as u32)
            .unwrap_or(0)
    }

    fn clear(&mut self, color: [f32; 4], scissor: Option<Rect>) {
        let Ok(target) = self.current_target() else {
            return;
        };
        self.apply_scissor(scissor, target);
        unsafe {
            self.gl.clear_color(color[0], color[1], color[2], color[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
            self.gl.disable(glow::SCISSOR_TEST);
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), RenderError> {
        let target = self
            .current
            .ok_or_else(|| RenderError::InvalidState("draw without a current target".into()))?;
        let target = self
            .targets
            .get(&target.0)
            .ok_or_else(|| RenderError::InvalidState("current render target was destroyed".into()))?;
        let flipped = target.flipped();
        let entry = self
            .programs
            .get(&call.program.0)
            .ok_or_else(|| RenderError::InvalidParameter("draw with unknown program".into()))?;
        let gl = &self.gl;
        let u: &Uniforms<'_> = &call.uniforms;

        unsafe {
            gl.use_program(Some(entry.raw));

            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(call.vertices),
                glow::STREAM_DRAW,
            );
            gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(self.ebo));
            gl.buffer_data_u8_slice(
                glow::ELEMENT_ARRAY_BUFFER,
                bytemuck::cast_slice(call.indices),
                glow::STREAM_DRAW,
            );
            let stride = std::mem::size_of::<Vertex>() as i32;
            gl.enable_vertex_attrib_array(ATTRIB_POSITION);
            gl.vertex_attrib_pointer_f32(ATTRIB_POSITION, 2, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(ATTRIB_TEXCOORD);
            gl.vertex_attrib_pointer_f32(ATTRIB_TEXCOORD, 2, glow::FLOAT, false, stride, 8);

            let projection = if flipped {
                Mat3::scale(1.0, -1.0).multiply(&u.projection)
            } else {
                u.projection
            };
            gl.uniform_matrix_3_f32_slice(
                entry.locations.projection.as_ref(),
                false,
                &projection.m,
            );
            gl.uniform_matrix_3_f32_slice(
                entry.locations.surface_to_buffer.as_ref(),
                false,
                &u.surface_to_buffer.m,
            );
            gl.uniform_1_f32(entry.locations.alpha.as_ref(), u.view_alpha);
            gl.uniform_4_f32(
                entry.locations.color.as_ref(),
                u.solid_color[0],
                u.solid_color[1],
                u.solid_color[2],
                u.solid_color[3],
            );
            gl.uniform_4_f32(
                entry.locations.tint.as_ref(),
                u.tint[0],
                u.tint[1],
                u.tint[2],
                u.tint[3],
            );
        }

        self.bind_plane_textures(u.textures)?;
        self.set_curve_uniforms(&entry.locations.pre, &u.pre_curve, UNIT_PRE_LUT)?;
        self.set_curve_uniforms(&entry.locations.post, &u.post_curve, UNIT_POST_LUT)?;
        match &u.mapping {
            MappingUniform::Identity => {}
            MappingUniform::Matrix { matrix, offset } => unsafe {
                gl.uniform_matrix_3_f32_slice(
                    entry.locations.mapping_matrix.as_ref(),
                    false,
                    matrix,
                );
                gl.uniform_3_f32(
                    entry.locations.mapping_offset.as_ref(),
                    offset[0],
                    offset[1],
                    offset[2],
                );
            },
            MappingUniform::Lut3D {
                texture,
                scale,
                offset,
                size: _,
            } => {
                self.bind_lut_texture(*texture, UNIT_MAPPING_LUT)?;
                unsafe {
                    gl.uniform_1_f32(entry.locations.mapping_scale.as_ref(), *scale);
                    gl.uniform_1_f32(entry.locations.mapping_offset3d.as_ref(), *offset);
                }
            }
        }
        if let Some(wireframe) = u.wireframe_texture {
            self.bind_lut_texture(wireframe, UNIT_WIREFRAME)?;
        }

        self.apply_scissor(call.scissor, target);
        unsafe {
            if call.blend {
                gl.enable(glow::BLEND);
                gl.blend_func(glow::ONE, glow::ONE_MINUS_SRC_ALPHA);
            } else {
                gl.disable(glow::BLEND);
            }
            let mode = match call.mode {
                DrawMode::Triangles => glow::TRIANGLES,
                DrawMode::TriangleStrip => glow::TRIANGLE_STRIP,
            };
            gl.draw_elements(mode, call.indices.len() as i32, glow::UNSIGNED_SHORT, 0);
            gl.disable(glow::SCISSOR_TEST);
        }
        Ok(())
    }

    fn swap(&mut self, target: TargetId, damage: Option<&[Rect]>) -> Result<(), RenderError> {
        let entry = self
            .targets
            .get(&target.0)
            .ok_or_else(|| RenderError::InvalidParameter("swap on unknown target".into()))?;
        let TargetKind::Window { surface } = &entry.kind else {
            return Err(RenderError::InvalidParameter(
                "swap on a non-window target".into(),
            ));
        };
        match (damage, self.exts.swap_buffers_with_damage) {
            (Some(rects), Some(swap_with_damage))
                if self.capabilities.contains(Capabilities::PARTIAL_SWAP) =>
            {
                // EGL damage rects use a bottom-left origin.
                let mut raw: Vec<i32> = Vec::with_capacity(rects.len() * 4);
                for rect in rects {
                    raw.extend_from_slice(&[
                        rect.x,
                        entry.height as i32 - rect.y - rect.height,
                        rect.width,
                        rect.height,
                    ]);
                }
                let ok = unsafe {
                    swap_with_damage(
                        self.display_ptr(),
                        surface.as_ptr(),
                        raw.as_ptr(),
                        rects.len() as i32,
                    )
                };
                if ok == 0 {
                    return Err(RenderError::SwapFailed(
                        "eglSwapBuffersWithDamage failed".into(),
                    ));
                }
                Ok(())
            }
            _ => self
                .egl
                .swap_buffers(self.display, *surface)
                .map_err(|err| RenderError::SwapFailed(err.to_string())),
        }
    }

    fn flush(&mut self) {
        unsafe {
            self.gl.flush();
        }
    }

    fn read_pixels(&mut self, rect: Rect, dst: &mut [u8]) -> Result<(), RenderError> {
        let target = self.current_target()?;
        let flipped = target.flipped();
        let (x, y, w, h) = self.gl_rect(&rect, target);
        let row = rect.width as usize * 4;
        let gl = &self.gl;
        unsafe {
            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            if flipped {
                gl.read_pixels(
                    x,
                    y,
                    w,
                    h,
                    glow::RGBA,
                    glow::UNSIGNED_BYTE,
                    glow::PixelPackData::Slice(dst),
                );
            } else {
                // GL returns rows bottom-up for window surfaces.
                let mut upside_down = vec![0u8; dst.len()];
                gl.read_pixels(
                    x,
                    y,
                    w,
                    h,
                    glow::RGBA,
                    glow::UNSIGNED_BYTE,
                    glow::PixelPackData::Slice(&mut upside_down),
                );
                for (out_row, src_row) in (0..rect.height as usize).rev().enumerate() {
                    dst[out_row * row..(out_row + 1) * row]
                        .copy_from_slice(&upside_down[src_row * row..(src_row + 1) * row]);
                }
            }
        }
        Ok(())
    }

    fn create_fence(&mut self) -> Result<FenceId, RenderError> {
        let create = self
            .exts
            .create_sync
            .ok_or_else(|| RenderError::Device("EGL fence syncs are unavailable".into()))?;
        let native = self.capabilities.contains(Capabilities::NATIVE_FENCE_FD);
        let sync_type = if native {
            EGL_SYNC_NATIVE_FENCE_ANDROID
        } else {
            EGL_SYNC_FENCE_KHR
        };
        let attribs = [EGL_NONE];
        let sync = unsafe { create(self.display_ptr(), sync_type, attribs.as_ptr()) };
        if sync.is_null() {
            return Err(RenderError::Device("eglCreateSyncKHR failed".into()));
        }
        // A native fence fd only materializes once the commands reach the
        // GPU.
        unsafe {
            self.gl.flush();
        }
        let id = self.alloc_id();
        self.fences.insert(id, FenceEntry { sync, native });
        Ok(FenceId(id))
    }

    fn export_fence_fd(&mut self, fence: FenceId) -> Result<RawFd, RenderError> {
        if !self.capabilities.contains(Capabilities::NATIVE_FENCE_FD) {
            return Err(RenderError::MissingCapability(
                Capabilities::NATIVE_FENCE_FD,
            ));
        }
        let entry = self
            .fences
            .get(&fence.0)
            .ok_or_else(|| RenderError::InvalidParameter("export of unknown fence".into()))?;
        if !entry.native {
            return Err(RenderError::InvalidState(
                "fence was not created as a native fence".into(),
            ));
        }
        let dup = self.exts.dup_native_fence_fd.ok_or(
            RenderError::MissingCapability(Capabilities::NATIVE_FENCE_FD),
        )?;
        let fd = unsafe { dup(self.display_ptr(), entry.sync) };
        if fd == EGL_NO_NATIVE_FENCE_FD_ANDROID {
            return Err(RenderError::Device(
                "eglDupNativeFenceFDANDROID returned no fd".into(),
            ));
        }
        Ok(fd)
    }

    fn fence_signaled(&mut self, fence: FenceId) -> bool {
        let Some(entry) = self.fences.get(&fence.0) else {
            return false;
        };
        let Some(wait) = self.exts.client_wait_sync else {
            return true;
        };
        let status = unsafe { wait(self.display_ptr(), entry.sync, 0, 0) };
        status == EGL_CONDITION_SATISFIED_KHR
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        if let Some(entry) = self.fences.remove(&fence.0) {
            if let Some(destroy) = self.exts.destroy_sync {
                unsafe {
                    destroy(self.display_ptr(), entry.sync);
                }
            }
        }
    }
}

impl Drop for GlDevice {
    fn drop(&mut self) {
        let texture_count = self.textures.len();
        let target_count = self.targets.len();
        if texture_count > 0 || target_count > 0 {
            debug!(
                textures = texture_count,
                targets = target_count,
                "GPU objects still alive at device teardown"
            );
        }
        unsafe {
            self.gl.delete_buffer(self.vbo);
            self.gl.delete_buffer(self.ebo);
        }
        let _ = self.egl.make_current(self.display, None, None, None);
        if let Err(err) = self.egl.destroy_context(self.display, self.context) {
            warn!(%err, "eglDestroyContext failed");
        }
        if let Some(surface) = self.sync_surface.take() {
            let _ = self.egl.destroy_surface(self.display, surface);
        }
        if let Err(err) = self.egl.terminate(self.display) {
            warn!(%err, "eglTerminate failed");
        }
    }
}

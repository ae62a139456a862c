//! GLSL ES 1.00 program text generation.
//!
//! One [`ShaderRequirements`] value maps to exactly one vertex/fragment
//! source pair; every branch below is driven by a key field, so equal keys
//! always produce identical text and the cache upstream stays 1:1.

use crate::format::{Channel, Swizzle};
use crate::shader::{CurveKind, MappingKind, ShaderRequirements, ShaderVariant, TexCoordSource};
use std::fmt::Write;

/// Vertex attribute locations bound before linking.
pub const ATTRIB_POSITION: u32 = 0;
pub const ATTRIB_TEXCOORD: u32 = 1;

pub fn vertex_source(requirements: &ShaderRequirements) -> String {
    let mut src = String::from(
        "precision highp float;\n\
         uniform mat3 u_projection;\n\
         uniform mat3 u_surface_to_buffer;\n\
         attribute vec2 a_position;\n\
         attribute vec2 a_texcoord;\n\
         varying vec2 v_texcoord;\n\
         void main() {\n\
         \tvec3 p = u_projection * vec3(a_position, 1.0);\n\
         \tgl_Position = vec4(p.xy, 0.0, 1.0);\n",
    );
    match requirements.texcoord {
        TexCoordSource::Surface => {
            src.push_str("\tv_texcoord = (u_surface_to_buffer * vec3(a_position, 1.0)).xy;\n");
        }
        TexCoordSource::Attrib => {
            src.push_str("\tv_texcoord = a_texcoord;\n");
        }
    }
    src.push_str("}\n");
    src
}

fn channel_expr(channel: Channel) -> &'static str {
    match channel {
        Channel::R => "s.r",
        Channel::G => "s.g",
        Channel::B => "s.b",
        Channel::A => "s.a",
        Channel::One => "1.0",
    }
}

fn swizzle_expr(swizzle: &Swizzle) -> String {
    format!(
        "vec4({}, {}, {}, {})",
        channel_expr(swizzle.r),
        channel_expr(swizzle.g),
        channel_expr(swizzle.b),
        channel_expr(swizzle.a)
    )
}

pub fn fragment_source(requirements: &ShaderRequirements) -> String {
    let mut src = String::new();
    if requirements.variant == ShaderVariant::External {
        src.push_str("#extension GL_OES_EGL_image_external : require\n");
    }
    if requirements.mapping == MappingKind::Lut3D {
        src.push_str("#extension GL_OES_texture_3D : require\n");
    }
    src.push_str("precision highp float;\n");
    src.push_str("varying vec2 v_texcoord;\n");
    src.push_str("uniform float u_alpha;\n");

    match requirements.variant {
        ShaderVariant::Solid => src.push_str("uniform vec4 u_color;\n"),
        ShaderVariant::External => src.push_str("uniform samplerExternalOES u_tex0;\n"),
        ShaderVariant::Rgba => src.push_str("uniform sampler2D u_tex0;\n"),
        ShaderVariant::YUv | ShaderVariant::YXuxv => {
            src.push_str("uniform sampler2D u_tex0;\nuniform sampler2D u_tex1;\n")
        }
        ShaderVariant::YUV => src.push_str(
            "uniform sampler2D u_tex0;\nuniform sampler2D u_tex1;\nuniform sampler2D u_tex2;\n",
        ),
    }
    if requirements.tint {
        src.push_str("uniform vec4 u_tint;\n");
    }
    if requirements.wireframe {
        src.push_str("uniform sampler2D u_wireframe;\n");
    }
    emit_curve_decls(&mut src, "pre", requirements.pre_curve);
    emit_curve_decls(&mut src, "post", requirements.post_curve);
    match requirements.mapping {
        MappingKind::Identity => {}
        MappingKind::Matrix => {
            src.push_str("uniform mat3 u_mapping_matrix;\nuniform vec3 u_mapping_offset;\n")
        }
        MappingKind::Lut3D => src.push_str(
            "uniform sampler3D u_mapping_lut;\nuniform float u_mapping_scale;\nuniform float u_mapping_offset3d;\n",
        ),
    }

    emit_curve_functions(&mut src, "pre", requirements.pre_curve);
    emit_curve_functions(&mut src, "post", requirements.post_curve);

    src.push_str("void main() {\n");
    emit_sample(&mut src, requirements);

    // Color pipeline operates on straight alpha.
    if requirements.input_is_premult
        && requirements.variant != ShaderVariant::Solid
        && needs_unpremult(requirements)
    {
        src.push_str("\tif (color.a > 0.0) color.rgb /= color.a;\n");
    }
    match requirements.pre_curve {
        CurveKind::None => {}
        _ => src.push_str("\tcolor.rgb = curve_pre(color.rgb);\n"),
    }
    match requirements.mapping {
        MappingKind::Identity => {}
        MappingKind::Matrix => {
            src.push_str("\tcolor.rgb = u_mapping_matrix * color.rgb + u_mapping_offset;\n")
        }
        MappingKind::Lut3D => src.push_str(
            "\tcolor.rgb = texture3D(u_mapping_lut, color.rgb * u_mapping_scale + vec3(u_mapping_offset3d)).rgb;\n",
        ),
    }
    match requirements.post_curve {
        CurveKind::None => {}
        _ => src.push_str("\tcolor.rgb = curve_post(color.rgb);\n"),
    }

    if requirements.tint {
        src.push_str("\tcolor.rgb = mix(color.rgb, u_tint.rgb, u_tint.a);\n");
    }
    // Output is premultiplied for the blend equation. Samples that came
    // in premultiplied and went through no pipeline already are.
    let still_premult = requirements.input_is_premult
        && requirements.variant != ShaderVariant::Solid
        && !needs_unpremult(requirements);
    if !still_premult {
        src.push_str("\tcolor.rgb *= color.a;\n");
    }
    src.push_str("\tcolor *= u_alpha;\n");
    if requirements.wireframe {
        src.push_str("\tcolor.rgb += texture2D(u_wireframe, v_texcoord).rgb;\n");
    }
    src.push_str("\tgl_FragColor = color;\n}\n");
    src
}

/// Whether the fragment stage must divide alpha out before the color
/// pipeline runs. Without a pipeline the premultiplied sample passes
/// through untouched.
fn needs_unpremult(requirements: &ShaderRequirements) -> bool {
    requirements.pre_curve != CurveKind::None
        || requirements.mapping != MappingKind::Identity
        || requirements.post_curve != CurveKind::None
}

fn emit_curve_decls(src: &mut String, stage: &str, kind: CurveKind) {
    match kind {
        CurveKind::None => {}
        CurveKind::Lut => {
            let _ = writeln!(
                src,
                "uniform sampler2D u_{stage}_lut;\nuniform float u_{stage}_scale;\nuniform float u_{stage}_offset;"
            );
        }
        CurveKind::Parametric => {
            // Per channel {g, a, b, c, d}, split across two vec3 sets.
            let _ = writeln!(
                src,
                "uniform vec3 u_{stage}_g;\nuniform vec3 u_{stage}_a;\nuniform vec3 u_{stage}_b;\nuniform vec3 u_{stage}_c;\nuniform vec3 u_{stage}_d;\nuniform float u_{stage}_order;\nuniform float u_{stage}_clamp;"
            );
        }
    }
}

fn emit_curve_functions(src: &mut String, stage: &str, kind: CurveKind) {
    match kind {
        CurveKind::None => {}
        CurveKind::Lut => {
            // One curve channel per row of the fixed 4-row LUT texture;
            // sampling at row centers avoids cross-row bleed.
            let _ = writeln!(
                src,
                "vec3 curve_{stage}(vec3 c) {{\n\
                 \tvec3 t = clamp(c, 0.0, 1.0) * u_{stage}_scale + u_{stage}_offset;\n\
                 \treturn vec3(\n\
                 \t\ttexture2D(u_{stage}_lut, vec2(t.r, 0.125)).r,\n\
                 \t\ttexture2D(u_{stage}_lut, vec2(t.g, 0.375)).r,\n\
                 \t\ttexture2D(u_{stage}_lut, vec2(t.b, 0.625)).r);\n\
                 }}"
            );
        }
        CurveKind::Parametric => {
            let _ = writeln!(
                src,
                "vec3 curve_{stage}(vec3 c) {{\n\
                 \tif (u_{stage}_clamp > 0.5) c = clamp(c, 0.0, 1.0);\n\
                 \tvec3 sgn = sign(c);\n\
                 \tvec3 x = abs(c);\n\
                 \tvec3 lin = u_{stage}_c * x;\n\
                 \tvec3 pow_in = u_{stage}_order > 0.5 ? max(u_{stage}_a * x + u_{stage}_b, vec3(0.0)) : max(x, vec3(0.0));\n\
                 \tvec3 powed = pow(pow_in, u_{stage}_g);\n\
                 \tvec3 hi = u_{stage}_order > 0.5 ? powed : u_{stage}_a * powed + u_{stage}_b;\n\
                 \tvec3 lo_mask = step(x, u_{stage}_d - vec3(1e-7));\n\
                 \treturn sgn * mix(hi, lin, lo_mask);\n\
                 }}"
            );
        }
    }
}

fn emit_sample(src: &mut String, requirements: &ShaderRequirements) {
    match requirements.variant {
        ShaderVariant::Solid => {
            src.push_str("\tvec4 color = u_color;\n");
            return;
        }
        ShaderVariant::External => {
            src.push_str("\tvec4 color = texture2D(u_tex0, v_texcoord);\n");
            return;
        }
        ShaderVariant::Rgba => {
            src.push_str("\tvec4 s = texture2D(u_tex0, v_texcoord);\n");
            let _ = writeln!(src, "\tvec4 color = {};", swizzle_expr(&requirements.channel_order));
            return;
        }
        ShaderVariant::YUv => {
            src.push_str(
                "\tfloat y = 1.16438356 * (texture2D(u_tex0, v_texcoord).r - 0.0625);\n\
                 \tvec2 uv = texture2D(u_tex1, v_texcoord).rg - vec2(0.5);\n",
            );
        }
        ShaderVariant::YUV => {
            src.push_str(
                "\tfloat y = 1.16438356 * (texture2D(u_tex0, v_texcoord).r - 0.0625);\n\
                 \tvec2 uv = vec2(texture2D(u_tex1, v_texcoord).r,\n\
                 \t               texture2D(u_tex2, v_texcoord).r) - vec2(0.5);\n",
            );
        }
        ShaderVariant::YXuxv => {
            src.push_str(
                "\tfloat y = 1.16438356 * (texture2D(u_tex0, v_texcoord).r - 0.0625);\n\
                 \tvec2 uv = texture2D(u_tex1, v_texcoord).ga - vec2(0.5);\n",
            );
        }
    }
    // BT.601 limited-range reconstruction, shared by all planar variants.
    src.push_str(
        "\tvec4 color = vec4(\n\
         \t\ty + 1.59602678 * uv.y,\n\
         \t\ty - 0.39176229 * uv.x - 0.81296764 * uv.y,\n\
         \t\ty + 2.01723214 * uv.x,\n\
         \t\t1.0);\n",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_generate_identical_text() {
        let key = ShaderRequirements {
            variant: ShaderVariant::Rgba,
            tint: true,
            ..Default::default()
        };
        assert_eq!(fragment_source(&key), fragment_source(&key.clone()));
        assert_eq!(vertex_source(&key), vertex_source(&key));
    }

    #[test]
    fn surface_texcoords_come_from_the_matrix() {
        let surface = vertex_source(&ShaderRequirements::default());
        assert!(surface.contains("u_surface_to_buffer"));
        let attrib = vertex_source(&ShaderRequirements {
            texcoord: TexCoordSource::Attrib,
            ..Default::default()
        });
        assert!(attrib.contains("v_texcoord = a_texcoord"));
    }

    #[test]
    fn planar_variants_declare_their_plane_samplers() {
        let two = fragment_source(&ShaderRequirements {
            variant: ShaderVariant::YUv,
            ..Default::default()
        });
        assert!(two.contains("u_tex1") && !two.contains("u_tex2"));
        let three = fragment_source(&ShaderRequirements {
            variant: ShaderVariant::YUV,
            ..Default::default()
        });
        assert!(three.contains("u_tex2"));
    }

    #[test]
    fn external_variant_requires_the_extension() {
        let src = fragment_source(&ShaderRequirements {
            variant: ShaderVariant::External,
            ..Default::default()
        });
        assert!(src.starts_with("#extension GL_OES_EGL_image_external"));
        assert!(src.contains("samplerExternalOES"));
    }

    #[test]
    fn bgra_swizzle_reorders_the_sample() {
        let src = fragment_source(&ShaderRequirements {
            variant: ShaderVariant::Rgba,
            channel_order: Swizzle::BGR1,
            ..Default::default()
        });
        assert!(src.contains("vec4(s.b, s.g, s.r, 1.0)"));
    }

    #[test]
    fn color_pipeline_stages_appear_only_when_requested() {
        let plain = fragment_source(&ShaderRequirements::default());
        assert!(!plain.contains("curve_pre") && !plain.contains("u_mapping"));
        let piped = fragment_source(&ShaderRequirements {
            pre_curve: CurveKind::Lut,
            mapping: MappingKind::Lut3D,
            post_curve: CurveKind::Parametric,
            ..Default::default()
        });
        assert!(piped.contains("curve_pre"));
        assert!(piped.contains("texture3D(u_mapping_lut"));
        assert!(piped.contains("curve_post"));
        assert!(piped.contains("#extension GL_OES_texture_3D"));
    }
}

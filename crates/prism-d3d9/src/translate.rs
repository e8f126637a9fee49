//! Decoders from the numeric version-9 state arrays to native pipeline
//! state.

use ash::vk;

use prism_gpu::{
    BlendMode, DepthBias, DepthStencilState, InputLayout, RasterizerState, SamplerKey,
    ShaderMetadata, StencilOps, VertexAttribute, VertexBinding,
};

use crate::state::{rs, samp, State9, StreamSource9, Viewport9, MAX_RENDER_TARGETS_9};
use crate::vertex::VertexDeclaration9;

/// Version-9 primitive types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveType9 {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveType9 {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveType9::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveType9::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveType9::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveType9::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveType9::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveType9::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
        }
    }

    /// Vertex (or index) count for a primitive count.
    pub fn vertex_count(self, primitive_count: u32) -> u32 {
        match self {
            PrimitiveType9::PointList => primitive_count,
            PrimitiveType9::LineList => primitive_count * 2,
            PrimitiveType9::LineStrip => primitive_count + 1,
            PrimitiveType9::TriangleList => primitive_count * 3,
            PrimitiveType9::TriangleStrip | PrimitiveType9::TriangleFan => primitive_count + 2,
        }
    }
}

pub fn decode_comparison9(value: u32) -> vk::CompareOp {
    match value {
        1 => vk::CompareOp::NEVER,
        2 => vk::CompareOp::LESS,
        3 => vk::CompareOp::EQUAL,
        4 => vk::CompareOp::LESS_OR_EQUAL,
        5 => vk::CompareOp::GREATER,
        6 => vk::CompareOp::NOT_EQUAL,
        7 => vk::CompareOp::GREATER_OR_EQUAL,
        _ => vk::CompareOp::ALWAYS,
    }
}

pub fn decode_blend_factor9(value: u32, is_alpha: bool) -> vk::BlendFactor {
    match value {
        1 => vk::BlendFactor::ZERO,
        2 => vk::BlendFactor::ONE,
        3 => vk::BlendFactor::SRC_COLOR,
        4 => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        5 => vk::BlendFactor::SRC_ALPHA,
        6 => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        7 => vk::BlendFactor::DST_ALPHA,
        8 => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        9 => vk::BlendFactor::DST_COLOR,
        10 => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        11 => vk::BlendFactor::SRC_ALPHA_SATURATE,
        12 => vk::BlendFactor::SRC_ALPHA,
        13 => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        14 => {
            if is_alpha {
                vk::BlendFactor::CONSTANT_ALPHA
            } else {
                vk::BlendFactor::CONSTANT_COLOR
            }
        }
        15 => {
            if is_alpha {
                vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA
            } else {
                vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR
            }
        }
        _ => vk::BlendFactor::ONE,
    }
}

pub fn decode_blend_op9(value: u32) -> vk::BlendOp {
    match value {
        2 => vk::BlendOp::SUBTRACT,
        3 => vk::BlendOp::REVERSE_SUBTRACT,
        4 => vk::BlendOp::MIN,
        5 => vk::BlendOp::MAX,
        _ => vk::BlendOp::ADD,
    }
}

pub fn decode_stencil_op9(value: u32) -> vk::StencilOp {
    match value {
        2 => vk::StencilOp::ZERO,
        3 => vk::StencilOp::REPLACE,
        4 => vk::StencilOp::INCREMENT_AND_CLAMP,
        5 => vk::StencilOp::DECREMENT_AND_CLAMP,
        6 => vk::StencilOp::INVERT,
        7 => vk::StencilOp::INCREMENT_AND_WRAP,
        8 => vk::StencilOp::DECREMENT_AND_WRAP,
        _ => vk::StencilOp::KEEP,
    }
}

/// One native blend mode per render-target slot from the render-state
/// array: the shared blend path plus the per-slot color-write masks.
pub fn translate_blend9(state: &State9) -> Vec<BlendMode> {
    let rs_val = |id: u32| state.render_states[id as usize];

    let enable = rs_val(rs::ALPHABLENDENABLE) != 0;
    let src_color = decode_blend_factor9(rs_val(rs::SRCBLEND), false);
    let dst_color = decode_blend_factor9(rs_val(rs::DESTBLEND), false);
    let color_op = decode_blend_op9(rs_val(rs::BLENDOP));

    let (src_alpha, dst_alpha, alpha_op) = if rs_val(rs::SEPARATEALPHABLENDENABLE) != 0 {
        (
            decode_blend_factor9(rs_val(rs::SRCBLENDALPHA), true),
            decode_blend_factor9(rs_val(rs::DESTBLENDALPHA), true),
            decode_blend_op9(rs_val(rs::BLENDOPALPHA)),
        )
    } else {
        (
            decode_blend_factor9(rs_val(rs::SRCBLEND), true),
            decode_blend_factor9(rs_val(rs::DESTBLEND), true),
            color_op,
        )
    };

    let write_masks = [
        rs_val(rs::COLORWRITEENABLE),
        rs_val(rs::COLORWRITEENABLE1),
        rs_val(rs::COLORWRITEENABLE2),
        rs_val(rs::COLORWRITEENABLE3),
    ];

    (0..MAX_RENDER_TARGETS_9)
        .map(|i| BlendMode {
            enable,
            src_color,
            dst_color,
            color_op,
            src_alpha,
            dst_alpha,
            alpha_op,
            write_mask: vk::ColorComponentFlags::from_raw(write_masks[i] & 0xF),
        })
        .collect()
}

/// The blend constant from the packed BGRA blend-factor render state.
pub fn translate_blend_factor9(value: u32) -> [f32; 4] {
    [
        ((value >> 16) & 0xFF) as f32 / 255.0,
        ((value >> 8) & 0xFF) as f32 / 255.0,
        (value & 0xFF) as f32 / 255.0,
        ((value >> 24) & 0xFF) as f32 / 255.0,
    ]
}

pub fn translate_depth_stencil9(state: &State9) -> DepthStencilState {
    let rs_val = |id: u32| state.render_states[id as usize];

    let front = StencilOps {
        fail_op: decode_stencil_op9(rs_val(rs::STENCILFAIL)),
        pass_op: decode_stencil_op9(rs_val(rs::STENCILPASS)),
        depth_fail_op: decode_stencil_op9(rs_val(rs::STENCILZFAIL)),
        compare_op: decode_comparison9(rs_val(rs::STENCILFUNC)),
    };
    let back = if rs_val(rs::TWOSIDEDSTENCILMODE) != 0 {
        StencilOps {
            fail_op: decode_stencil_op9(rs_val(rs::CCW_STENCILFAIL)),
            pass_op: decode_stencil_op9(rs_val(rs::CCW_STENCILPASS)),
            depth_fail_op: decode_stencil_op9(rs_val(rs::CCW_STENCILZFAIL)),
            compare_op: decode_comparison9(rs_val(rs::CCW_STENCILFUNC)),
        }
    } else {
        front
    };

    DepthStencilState {
        depth_test: rs_val(rs::ZENABLE) != 0,
        depth_write: rs_val(rs::ZWRITEENABLE) != 0,
        depth_compare: if rs_val(rs::ZENABLE) != 0 {
            decode_comparison9(rs_val(rs::ZFUNC))
        } else {
            vk::CompareOp::ALWAYS
        },
        stencil_test: rs_val(rs::STENCILENABLE) != 0,
        front,
        back,
    }
}

pub fn translate_rasterizer9(state: &State9) -> (RasterizerState, DepthBias) {
    let rs_val = |id: u32| state.render_states[id as usize];

    // Version-9 front faces are clockwise; CULL_CW therefore culls the
    // front face and CULL_CCW the back face.
    let cull_mode = match rs_val(rs::CULLMODE) {
        2 => vk::CullModeFlags::FRONT,
        3 => vk::CullModeFlags::BACK,
        _ => vk::CullModeFlags::NONE,
    };

    let depth_bias = f32::from_bits(rs_val(rs::DEPTHBIAS));
    let slope_bias = f32::from_bits(rs_val(rs::SLOPESCALEDEPTHBIAS));

    let raster = RasterizerState {
        polygon_mode: match rs_val(rs::FILLMODE) {
            2 => vk::PolygonMode::LINE,
            1 => vk::PolygonMode::POINT,
            _ => vk::PolygonMode::FILL,
        },
        cull_mode,
        front_face: vk::FrontFace::CLOCKWISE,
        depth_bias_enable: depth_bias != 0.0 || slope_bias != 0.0,
        depth_clip_enable: true,
    };

    // The fixed-point depth-bias units of the legacy API are scaled by the
    // depth-format range on the original; modern drivers take the factor
    // directly.
    let bias = DepthBias {
        constant_factor: depth_bias * 65536.0,
        clamp: 0.0,
        slope_factor: slope_bias,
    };

    (raster, bias)
}

/// Alpha-test state, or `None` when disabled.
pub fn translate_alpha_test9(state: &State9) -> Option<(vk::CompareOp, f32)> {
    if state.render_states[rs::ALPHATESTENABLE as usize] == 0 {
        return None;
    }
    let func = decode_comparison9(state.render_states[rs::ALPHAFUNC as usize]);
    let reference = (state.render_states[rs::ALPHAREF as usize] & 0xFF) as f32 / 255.0;
    Some((func, reference))
}

pub fn translate_sampler9(states: &[u32]) -> SamplerKey {
    let filter = |value: u32| match value {
        2 | 3 => vk::Filter::LINEAR,
        _ => vk::Filter::NEAREST,
    };
    let address = |value: u32| match value {
        2 => vk::SamplerAddressMode::MIRRORED_REPEAT,
        3 => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        4 => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        5 => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
        _ => vk::SamplerAddressMode::REPEAT,
    };

    let mip_filter = states[samp::MIPFILTER as usize];
    let anisotropic = states[samp::MAGFILTER as usize] == 3 || states[samp::MINFILTER as usize] == 3;

    SamplerKey {
        mag_filter: filter(states[samp::MAGFILTER as usize]),
        min_filter: filter(states[samp::MINFILTER as usize]),
        mipmap_mode: if mip_filter >= 2 {
            vk::SamplerMipmapMode::LINEAR
        } else {
            vk::SamplerMipmapMode::NEAREST
        },
        address_u: address(states[samp::ADDRESSU as usize]),
        address_v: address(states[samp::ADDRESSV as usize]),
        address_w: address(states[samp::ADDRESSW as usize]),
        mip_lod_bias_bits: states[samp::MIPMAPLODBIAS as usize],
        max_anisotropy: if anisotropic {
            states[samp::MAXANISOTROPY as usize].max(1)
        } else {
            0
        },
        compare_op: vk::CompareOp::LESS_OR_EQUAL,
        border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        // Mip filtering disabled clamps sampling to the top level.
        min_lod_bits: (states[samp::MAXMIPLEVEL as usize] as f32).to_bits(),
        max_lod_bits: if mip_filter == 0 {
            0.25f32.to_bits()
        } else {
            1000f32.to_bits()
        },
    }
}

/// Converts the legacy viewport, flipping y by negative viewport height.
pub fn translate_viewport9(vp: &Viewport9) -> vk::Viewport {
    vk::Viewport {
        x: vp.x as f32,
        y: (vp.y + vp.height) as f32,
        width: vp.width as f32,
        height: -(vp.height as f32),
        min_depth: vp.min_z,
        max_depth: vp.max_z,
    }
}

const STREAM_FREQ_INSTANCEDATA: u32 = 0x8000_0000;
const STREAM_FREQ_COUNT_MASK: u32 = 0x3FFF_FFFF;

/// Resolves the vertex declaration against the vertex shader's input
/// signature, honoring per-stream instance frequencies.
pub fn resolve_declaration(
    declaration: &VertexDeclaration9,
    signature: &ShaderMetadata,
    streams: &[StreamSource9],
) -> InputLayout {
    let mut layout = InputLayout::default();

    for element in &declaration.elements {
        let Some(entry) = signature.uses_semantic(
            element.usage.semantic_name(),
            u32::from(element.usage_index),
        ) else {
            continue;
        };

        let stream = element.stream as usize;
        if !layout
            .bindings
            .iter()
            .any(|b| b.binding == u32::from(element.stream))
        {
            let frequency = streams
                .get(stream)
                .map(|s| s.frequency)
                .unwrap_or(0);
            let instanced = frequency & STREAM_FREQ_INSTANCEDATA != 0;
            layout.bindings.push(VertexBinding {
                binding: u32::from(element.stream),
                stride: streams.get(stream).map(|s| s.stride).unwrap_or(0),
                input_rate: if instanced {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
                divisor: if instanced {
                    (frequency & STREAM_FREQ_COUNT_MASK).max(1)
                } else {
                    0
                },
            });
        }

        layout.attributes.push(VertexAttribute {
            location: entry.location,
            binding: u32::from(element.stream),
            format: element.decl_type.to_vk(),
            offset: u32::from(element.offset),
        });
    }

    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::{DeclElement, DeclType, DeclUsage};
    use prism_gpu::SignatureElement;

    #[test]
    fn cull_modes_account_for_clockwise_front_faces() {
        let mut state = State9::default();
        // Default CULL_CCW culls the back face.
        let (raster, _) = translate_rasterizer9(&state);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::BACK);

        state.render_states[rs::CULLMODE as usize] = 2;
        let (raster, _) = translate_rasterizer9(&state);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::FRONT);
    }

    #[test]
    fn separate_alpha_blend_decodes_both_paths() {
        let mut state = State9::default();
        state.render_states[rs::ALPHABLENDENABLE as usize] = 1;
        state.render_states[rs::SRCBLEND as usize] = 5;
        state.render_states[rs::SEPARATEALPHABLENDENABLE as usize] = 1;
        state.render_states[rs::SRCBLENDALPHA as usize] = 2;

        let modes = translate_blend9(&state);
        assert_eq!(modes[0].src_color, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(modes[0].src_alpha, vk::BlendFactor::ONE);
    }

    #[test]
    fn blend_factor_unpacks_bgra() {
        let color = translate_blend_factor9(0xFF80_0000 | 0xFF);
        assert!((color[0] - 128.0 / 255.0).abs() < 1e-6); // red
        assert!((color[2] - 1.0).abs() < 1e-6); // blue
        assert!((color[3] - 1.0).abs() < 1e-6); // alpha
    }

    #[test]
    fn triangle_counts_convert_to_vertex_counts() {
        assert_eq!(PrimitiveType9::TriangleList.vertex_count(2), 6);
        assert_eq!(PrimitiveType9::TriangleStrip.vertex_count(2), 4);
        assert_eq!(PrimitiveType9::LineStrip.vertex_count(3), 4);
    }

    #[test]
    fn declaration_resolution_respects_instancing() {
        let decl = VertexDeclaration9 {
            elements: vec![
                DeclElement {
                    stream: 0,
                    offset: 0,
                    decl_type: DeclType::Float3,
                    usage: DeclUsage::Position,
                    usage_index: 0,
                },
                DeclElement {
                    stream: 1,
                    offset: 0,
                    decl_type: DeclType::Float4,
                    usage: DeclUsage::TexCoord,
                    usage_index: 1,
                },
            ],
        };
        let signature = ShaderMetadata {
            input_signature: vec![
                SignatureElement {
                    semantic_name: "POSITION".into(),
                    semantic_index: 0,
                    location: 0,
                },
                SignatureElement {
                    semantic_name: "TEXCOORD".into(),
                    semantic_index: 1,
                    location: 5,
                },
            ],
            ..ShaderMetadata::default()
        };
        let mut streams: Vec<StreamSource9> = (0..2).map(|_| StreamSource9::default()).collect();
        streams[0].stride = 12;
        streams[1].stride = 16;
        streams[1].frequency = STREAM_FREQ_INSTANCEDATA | 1;

        let layout = resolve_declaration(&decl, &signature, &streams);

        assert_eq!(layout.attributes.len(), 2);
        let instanced = layout.bindings.iter().find(|b| b.binding == 1).unwrap();
        assert_eq!(instanced.input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(instanced.divisor, 1);
        assert_eq!(layout.attributes[1].location, 5);
    }
}

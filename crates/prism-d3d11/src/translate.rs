//! Decoders from legacy state descriptors to native pipeline state, used by
//! the draw-preparation pass. Each function is a pure projection of the
//! state vector; emission order is owned by the context.

use ash::vk;

use prism_gpu::{
    BlendMode, DepthBias, DepthStencilState, InputLayout, MultisampleState, RasterizerState,
    SamplerKey, ShaderMetadata, StencilOps, VertexAttribute, VertexBinding,
};

use crate::format::lookup_format;
use crate::resource::{InputElementDesc, InputSlotClass, APPEND_ALIGNED_ELEMENT};
use crate::state::{
    AddressMode, Blend, BlendOpKind, BlendState11, ComparisonFunc, CullModeKind, DepthStencilState11,
    FillMode, Filter, IndexFormat, RasterizerState11, SamplerState11, StencilOpKind, Topology,
    Viewport,
};

pub fn decode_blend_factor(blend: Blend) -> vk::BlendFactor {
    match blend {
        Blend::Zero => vk::BlendFactor::ZERO,
        Blend::One => vk::BlendFactor::ONE,
        Blend::SrcColor => vk::BlendFactor::SRC_COLOR,
        Blend::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        Blend::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        Blend::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        Blend::DestAlpha => vk::BlendFactor::DST_ALPHA,
        Blend::InvDestAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        Blend::DestColor => vk::BlendFactor::DST_COLOR,
        Blend::InvDestColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        Blend::SrcAlphaSat => vk::BlendFactor::SRC_ALPHA_SATURATE,
        Blend::BlendFactor => vk::BlendFactor::CONSTANT_COLOR,
        Blend::InvBlendFactor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
    }
}

pub fn decode_blend_op(op: BlendOpKind) -> vk::BlendOp {
    match op {
        BlendOpKind::Add => vk::BlendOp::ADD,
        BlendOpKind::Subtract => vk::BlendOp::SUBTRACT,
        BlendOpKind::RevSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOpKind::Min => vk::BlendOp::MIN,
        BlendOpKind::Max => vk::BlendOp::MAX,
    }
}

pub fn decode_comparison(func: ComparisonFunc) -> vk::CompareOp {
    match func {
        ComparisonFunc::Never => vk::CompareOp::NEVER,
        ComparisonFunc::Less => vk::CompareOp::LESS,
        ComparisonFunc::Equal => vk::CompareOp::EQUAL,
        ComparisonFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        ComparisonFunc::Greater => vk::CompareOp::GREATER,
        ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        ComparisonFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        ComparisonFunc::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn decode_stencil_op(op: StencilOpKind) -> vk::StencilOp {
    match op {
        StencilOpKind::Keep => vk::StencilOp::KEEP,
        StencilOpKind::Zero => vk::StencilOp::ZERO,
        StencilOpKind::Replace => vk::StencilOp::REPLACE,
        StencilOpKind::IncrSat => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOpKind::DecrSat => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOpKind::Invert => vk::StencilOp::INVERT,
        StencilOpKind::Incr => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOpKind::Decr => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub fn decode_topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::Undefined | Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

pub fn decode_index_format(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

/// One native blend mode per render-target slot, honoring the independent
/// blend flag and per-slot write masks.
pub fn translate_blend_state(state: &BlendState11) -> Vec<BlendMode> {
    state
        .render_targets
        .iter()
        .enumerate()
        .map(|(i, desc)| {
            let desc = if state.independent_blend {
                desc
            } else {
                &state.render_targets[0]
            };
            // The write mask is always per-slot, even without independent
            // blend.
            let write_mask = if state.independent_blend {
                desc.write_mask
            } else {
                state.render_targets[i].write_mask
            };

            BlendMode {
                enable: desc.blend_enable,
                src_color: decode_blend_factor(desc.src_blend),
                dst_color: decode_blend_factor(desc.dest_blend),
                color_op: decode_blend_op(desc.blend_op),
                src_alpha: decode_blend_factor(desc.src_blend_alpha),
                dst_alpha: decode_blend_factor(desc.dest_blend_alpha),
                alpha_op: decode_blend_op(desc.blend_op_alpha),
                write_mask: vk::ColorComponentFlags::from_raw(u32::from(write_mask) & 0xF),
            }
        })
        .collect()
}

pub fn translate_depth_stencil_state(state: &DepthStencilState11) -> DepthStencilState {
    let face = |desc: &crate::state::DepthStencilOpDesc| StencilOps {
        fail_op: decode_stencil_op(desc.fail_op),
        pass_op: decode_stencil_op(desc.pass_op),
        depth_fail_op: decode_stencil_op(desc.depth_fail_op),
        compare_op: decode_comparison(desc.func),
    };

    DepthStencilState {
        depth_test: state.depth_enable,
        depth_write: state.depth_write,
        depth_compare: if state.depth_enable {
            decode_comparison(state.depth_func)
        } else {
            vk::CompareOp::ALWAYS
        },
        stencil_test: state.stencil_enable,
        front: face(&state.front_face),
        back: face(&state.back_face),
    }
}

pub fn translate_rasterizer_state(state: &RasterizerState11) -> (RasterizerState, DepthBias) {
    let raster = RasterizerState {
        polygon_mode: match state.fill_mode {
            FillMode::Wireframe => vk::PolygonMode::LINE,
            FillMode::Solid => vk::PolygonMode::FILL,
        },
        cull_mode: match state.cull_mode {
            CullModeKind::None => vk::CullModeFlags::NONE,
            CullModeKind::Front => vk::CullModeFlags::FRONT,
            CullModeKind::Back => vk::CullModeFlags::BACK,
        },
        front_face: if state.front_counter_clockwise {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        },
        depth_bias_enable: state.depth_bias != 0 || state.slope_scaled_depth_bias != 0.0,
        depth_clip_enable: state.depth_clip_enable,
    };

    let bias = DepthBias {
        constant_factor: state.depth_bias as f32,
        clamp: state.depth_bias_clamp,
        slope_factor: state.slope_scaled_depth_bias,
    };

    (raster, bias)
}

pub fn translate_multisample_state(
    sample_count: vk::SampleCountFlags,
    sample_mask: u32,
    alpha_to_coverage: bool,
) -> MultisampleState {
    MultisampleState {
        sample_count,
        sample_mask,
        alpha_to_coverage,
    }
}

pub fn translate_sampler(desc: &SamplerState11) -> SamplerKey {
    let (mag, min, mip, aniso) = match desc.filter {
        Filter::MinMagMipPoint => (
            vk::Filter::NEAREST,
            vk::Filter::NEAREST,
            vk::SamplerMipmapMode::NEAREST,
            false,
        ),
        Filter::MinMagPointMipLinear => (
            vk::Filter::NEAREST,
            vk::Filter::NEAREST,
            vk::SamplerMipmapMode::LINEAR,
            false,
        ),
        Filter::MinMagLinearMipPoint => (
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::NEAREST,
            false,
        ),
        Filter::MinMagMipLinear => (
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
            false,
        ),
        Filter::Anisotropic => (
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
            true,
        ),
    };

    let address = |mode: AddressMode| match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    };

    SamplerKey {
        mag_filter: mag,
        min_filter: min,
        mipmap_mode: mip,
        address_u: address(desc.address_u),
        address_v: address(desc.address_v),
        address_w: address(desc.address_w),
        mip_lod_bias_bits: desc.mip_lod_bias.to_bits(),
        max_anisotropy: if aniso { desc.max_anisotropy } else { 0 },
        compare_op: decode_comparison(desc.comparison),
        border_color: border_color(desc.border_color),
        min_lod_bits: desc.min_lod.to_bits(),
        max_lod_bits: desc.max_lod.to_bits(),
    }
}

fn border_color(color: [f32; 4]) -> vk::BorderColor {
    if color == [0.0, 0.0, 0.0, 1.0] {
        vk::BorderColor::FLOAT_OPAQUE_BLACK
    } else if color == [1.0, 1.0, 1.0, 1.0] {
        vk::BorderColor::FLOAT_OPAQUE_WHITE
    } else {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    }
}

/// Converts a legacy viewport into native clip space.
///
/// The y axis is flipped by handing the driver a negative-height viewport,
/// so shaders keep the legacy convention untouched.
pub fn translate_viewport(vp: &Viewport) -> vk::Viewport {
    vk::Viewport {
        x: vp.top_left_x,
        y: vp.top_left_y + vp.height,
        width: vp.width,
        height: -vp.height,
        min_depth: vp.min_depth,
        max_depth: vp.max_depth,
    }
}

/// Resolves the vertex declaration against the bound vertex shader's input
/// signature.
///
/// Attributes the shader does not consume are dropped, bindings are
/// compacted to the used slots, append-aligned offsets are resolved to the
/// running offset of their slot (4-byte aligned), and instance divisors are
/// honored.
pub fn resolve_input_layout(
    elements: &[InputElementDesc],
    signature: &ShaderMetadata,
) -> InputLayout {
    let mut layout = InputLayout::default();
    // Running append offset per input slot, fed by every element on the
    // slot whether or not the shader consumes it.
    let mut running_offset = [0u32; 32];

    for element in elements {
        let info = lookup_format(element.format).info;
        let slot = element.input_slot as usize & 31;

        let offset = if element.aligned_byte_offset == APPEND_ALIGNED_ELEMENT {
            (running_offset[slot] + 3) & !3
        } else {
            element.aligned_byte_offset
        };
        running_offset[slot] = offset + info.element_size;

        let Some(entry) = signature.uses_semantic(&element.semantic_name, element.semantic_index)
        else {
            continue;
        };

        if !layout
            .bindings
            .iter()
            .any(|b| b.binding == element.input_slot)
        {
            layout.bindings.push(VertexBinding {
                binding: element.input_slot,
                stride: 0,
                input_rate: match element.slot_class {
                    InputSlotClass::PerVertex => vk::VertexInputRate::VERTEX,
                    InputSlotClass::PerInstance => vk::VertexInputRate::INSTANCE,
                },
                divisor: match element.slot_class {
                    InputSlotClass::PerVertex => 0,
                    InputSlotClass::PerInstance => element.instance_data_step_rate,
                },
            });
        }

        layout.attributes.push(VertexAttribute {
            location: entry.location,
            binding: element.input_slot,
            format: lookup_format(element.format).format,
            offset,
        });
    }

    layout
}

/// Fills binding strides from the currently bound vertex buffers and
/// compacts the binding list to slots that are actually consumed.
pub fn finalize_input_layout(layout: &mut InputLayout, strides: &[u32]) {
    layout
        .bindings
        .retain(|b| layout_uses_binding(&layout.attributes, b.binding));
    for binding in layout.bindings.iter_mut() {
        binding.stride = strides.get(binding.binding as usize).copied().unwrap_or(0);
    }
}

fn layout_uses_binding(attributes: &[VertexAttribute], binding: u32) -> bool {
    attributes.iter().any(|a| a.binding == binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DxgiFormat;
    use prism_gpu::SignatureElement;

    fn element(name: &str, index: u32, slot: u32, offset: u32) -> InputElementDesc {
        InputElementDesc {
            semantic_name: name.to_string(),
            semantic_index: index,
            format: DxgiFormat::R32G32B32Float,
            input_slot: slot,
            aligned_byte_offset: offset,
            slot_class: InputSlotClass::PerVertex,
            instance_data_step_rate: 0,
        }
    }

    fn signature(entries: &[(&str, u32, u32)]) -> ShaderMetadata {
        ShaderMetadata {
            input_signature: entries
                .iter()
                .map(|(name, index, location)| SignatureElement {
                    semantic_name: name.to_string(),
                    semantic_index: *index,
                    location: *location,
                })
                .collect(),
            ..ShaderMetadata::default()
        }
    }

    #[test]
    fn emitted_locations_are_signature_intersection() {
        let elements = [
            element("POSITION", 0, 0, 0),
            element("NORMAL", 0, 0, APPEND_ALIGNED_ELEMENT),
            element("TEXCOORD", 0, 0, APPEND_ALIGNED_ELEMENT),
        ];
        // Shader consumes POSITION and TEXCOORD but not NORMAL.
        let meta = signature(&[("POSITION", 0, 0), ("TEXCOORD", 0, 1)]);

        let layout = resolve_input_layout(&elements, &meta);

        let mut locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        locations.sort_unstable();
        assert_eq!(locations, vec![0, 1]);
    }

    #[test]
    fn append_aligned_offsets_account_for_skipped_elements() {
        let elements = [
            element("POSITION", 0, 0, 0),
            element("NORMAL", 0, 0, APPEND_ALIGNED_ELEMENT),
            element("TEXCOORD", 0, 0, APPEND_ALIGNED_ELEMENT),
        ];
        let meta = signature(&[("POSITION", 0, 0), ("TEXCOORD", 0, 1)]);

        let layout = resolve_input_layout(&elements, &meta);

        // NORMAL still advances the running offset: 12 (POSITION) + 12
        // (NORMAL) = 24.
        let texcoord = layout
            .attributes
            .iter()
            .find(|a| a.location == 1)
            .expect("texcoord resolved");
        assert_eq!(texcoord.offset, 24);
    }

    #[test]
    fn semantic_match_is_case_insensitive() {
        let elements = [element("Position", 0, 0, 0)];
        let meta = signature(&[("POSITION", 0, 3)]);

        let layout = resolve_input_layout(&elements, &meta);
        assert_eq!(layout.attributes.len(), 1);
        assert_eq!(layout.attributes[0].location, 3);
    }

    #[test]
    fn unused_bindings_are_compacted_away() {
        let elements = [element("POSITION", 0, 0, 0), element("COLOR", 0, 5, 0)];
        let meta = signature(&[("POSITION", 0, 0)]);

        let mut layout = resolve_input_layout(&elements, &meta);
        finalize_input_layout(&mut layout, &[16, 0, 0, 0, 0, 32]);

        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].binding, 0);
        assert_eq!(layout.bindings[0].stride, 16);
    }

    #[test]
    fn disabled_depth_forces_always_compare() {
        let state = DepthStencilState11 {
            depth_enable: false,
            depth_func: ComparisonFunc::Less,
            ..DepthStencilState11::default()
        };
        let native = translate_depth_stencil_state(&state);
        assert_eq!(native.depth_compare, vk::CompareOp::ALWAYS);
    }

    #[test]
    fn non_independent_blend_broadcasts_slot_zero() {
        let mut state = BlendState11::default();
        state.render_targets[0].blend_enable = true;
        state.render_targets[0].src_blend = Blend::SrcAlpha;
        state.render_targets[3].write_mask = 0x3;

        let modes = translate_blend_state(&state);
        assert!(modes[3].enable);
        assert_eq!(modes[3].src_color, vk::BlendFactor::SRC_ALPHA);
        // Write masks stay per-slot.
        assert_eq!(
            modes[3].write_mask,
            vk::ColorComponentFlags::from_raw(0x3)
        );
    }

    #[test]
    fn viewport_translation_flips_y() {
        let vp = Viewport {
            top_left_x: 0.0,
            top_left_y: 0.0,
            width: 640.0,
            height: 480.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let native = translate_viewport(&vp);
        assert_eq!(native.y, 480.0);
        assert_eq!(native.height, -480.0);
    }
}

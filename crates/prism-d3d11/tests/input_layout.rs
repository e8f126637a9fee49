use ash::vk;
use pretty_assertions::assert_eq;

use prism_d3d11::translate::{finalize_input_layout, resolve_input_layout};
use prism_d3d11::{DxgiFormat, InputElementDesc, InputSlotClass, APPEND_ALIGNED_ELEMENT};
use prism_gpu::{ShaderMetadata, SignatureElement};

fn element(
    name: &str,
    index: u32,
    format: DxgiFormat,
    slot: u32,
    offset: u32,
    class: InputSlotClass,
    step: u32,
) -> InputElementDesc {
    InputElementDesc {
        semantic_name: name.to_string(),
        semantic_index: index,
        format,
        input_slot: slot,
        aligned_byte_offset: offset,
        slot_class: class,
        instance_data_step_rate: step,
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
fn full_declaration_resolves_against_a_typical_signature() {
    let elements = [
        element(
            "POSITION",
            0,
            DxgiFormat::R32G32B32Float,
            0,
            0,
            InputSlotClass::PerVertex,
            0,
        ),
        element(
            "NORMAL",
            0,
            DxgiFormat::R32G32B32Float,
            0,
            APPEND_ALIGNED_ELEMENT,
            InputSlotClass::PerVertex,
            0,
        ),
        element(
            "TEXCOORD",
            0,
            DxgiFormat::R16G16Float,
            0,
            APPEND_ALIGNED_ELEMENT,
            InputSlotClass::PerVertex,
            0,
        ),
        element(
            "TEXCOORD",
            1,
            DxgiFormat::R32G32B32A32Float,
            1,
            0,
            InputSlotClass::PerInstance,
            1,
        ),
    ];
    let meta = signature(&[
        ("POSITION", 0, 0),
        ("NORMAL", 0, 1),
        ("TEXCOORD", 0, 2),
        ("TEXCOORD", 1, 3),
    ]);

    let mut layout = resolve_input_layout(&elements, &meta);
    finalize_input_layout(&mut layout, &[32, 16]);

    assert_eq!(layout.attributes.len(), 4);
    assert_eq!(layout.bindings.len(), 2);

    let instance_binding = layout.bindings.iter().find(|b| b.binding == 1).unwrap();
    assert_eq!(instance_binding.input_rate, vk::VertexInputRate::INSTANCE);
    assert_eq!(instance_binding.divisor, 1);
    assert_eq!(instance_binding.stride, 16);

    // Append-aligned offsets run 0, 12, 24 on slot 0.
    let offsets: Vec<u32> = layout
        .attributes
        .iter()
        .filter(|a| a.binding == 0)
        .map(|a| a.offset)
        .collect();
    assert_eq!(offsets, vec![0, 12, 24]);
}

#[test]
fn attributes_without_signature_matches_are_dropped() {
    let elements = [
        element(
            "POSITION",
            0,
            DxgiFormat::R32G32B32Float,
            0,
            0,
            InputSlotClass::PerVertex,
            0,
        ),
        element(
            "COLOR",
            0,
            DxgiFormat::R8G8B8A8Unorm,
            2,
            0,
            InputSlotClass::PerVertex,
            0,
        ),
    ];
    let meta = signature(&[("POSITION", 0, 0)]);

    let mut layout = resolve_input_layout(&elements, &meta);
    finalize_input_layout(&mut layout, &[12, 0, 4]);

    // The emitted locations are exactly the shader-consumed subset, and
    // the unused slot-2 binding is compacted away.
    assert_eq!(layout.attributes.len(), 1);
    assert_eq!(layout.attributes[0].location, 0);
    assert_eq!(layout.bindings.len(), 1);
    assert_eq!(layout.bindings[0].binding, 0);
}

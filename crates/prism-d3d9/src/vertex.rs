//! Vertex declarations and the flexible-vertex-format bit decoding.

use std::sync::Arc;

use ash::vk;

/// Element data types of a vertex declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclType {
    Float1,
    Float2,
    Float3,
    Float4,
    /// BGRA color, normalized.
    Color,
    Ubyte4,
    Short2,
    Short4,
    Ubyte4N,
    Short2N,
    Short4N,
    Float16x2,
    Float16x4,
    Unused,
}

impl DeclType {
    pub fn byte_size(self) -> u32 {
        match self {
            DeclType::Float1 => 4,
            DeclType::Float2 => 8,
            DeclType::Float3 => 12,
            DeclType::Float4 => 16,
            DeclType::Color | DeclType::Ubyte4 | DeclType::Ubyte4N => 4,
            DeclType::Short2 | DeclType::Short2N | DeclType::Float16x2 => 4,
            DeclType::Short4 | DeclType::Short4N | DeclType::Float16x4 => 8,
            DeclType::Unused => 0,
        }
    }

    pub fn to_vk(self) -> vk::Format {
        match self {
            DeclType::Float1 => vk::Format::R32_SFLOAT,
            DeclType::Float2 => vk::Format::R32G32_SFLOAT,
            DeclType::Float3 => vk::Format::R32G32B32_SFLOAT,
            DeclType::Float4 => vk::Format::R32G32B32A32_SFLOAT,
            DeclType::Color => vk::Format::B8G8R8A8_UNORM,
            DeclType::Ubyte4 => vk::Format::R8G8B8A8_UINT,
            DeclType::Short2 => vk::Format::R16G16_SINT,
            DeclType::Short4 => vk::Format::R16G16B16A16_SINT,
            DeclType::Ubyte4N => vk::Format::R8G8B8A8_UNORM,
            DeclType::Short2N => vk::Format::R16G16_SNORM,
            DeclType::Short4N => vk::Format::R16G16B16A16_SNORM,
            DeclType::Float16x2 => vk::Format::R16G16_SFLOAT,
            DeclType::Float16x4 => vk::Format::R16G16B16A16_SFLOAT,
            DeclType::Unused => vk::Format::UNDEFINED,
        }
    }
}

/// Semantic usages of a vertex declaration element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclUsage {
    Position,
    BlendWeight,
    BlendIndices,
    Normal,
    PointSize,
    TexCoord,
    Tangent,
    Binormal,
    TessFactor,
    PositionT,
    Color,
    Fog,
    Depth,
    Sample,
}

impl DeclUsage {
    /// The semantic name the shader compiler emits for this usage.
    pub fn semantic_name(self) -> &'static str {
        match self {
            DeclUsage::Position => "POSITION",
            DeclUsage::BlendWeight => "BLENDWEIGHT",
            DeclUsage::BlendIndices => "BLENDINDICES",
            DeclUsage::Normal => "NORMAL",
            DeclUsage::PointSize => "PSIZE",
            DeclUsage::TexCoord => "TEXCOORD",
            DeclUsage::Tangent => "TANGENT",
            DeclUsage::Binormal => "BINORMAL",
            DeclUsage::TessFactor => "TESSFACTOR",
            DeclUsage::PositionT => "POSITIONT",
            DeclUsage::Color => "COLOR",
            DeclUsage::Fog => "FOG",
            DeclUsage::Depth => "DEPTH",
            DeclUsage::Sample => "SAMPLE",
        }
    }
}

/// One element of a vertex declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeclElement {
    pub stream: u16,
    pub offset: u16,
    pub decl_type: DeclType,
    pub usage: DeclUsage,
    pub usage_index: u8,
}

/// A vertex declaration.
pub struct VertexDeclaration9 {
    pub elements: Vec<DeclElement>,
}

impl VertexDeclaration9 {
    pub fn new(elements: Vec<DeclElement>) -> Arc<Self> {
        Arc::new(Self { elements })
    }
}

// Flexible-vertex-format bits.
pub const FVF_XYZ: u32 = 0x002;
pub const FVF_XYZRHW: u32 = 0x004;
pub const FVF_NORMAL: u32 = 0x010;
pub const FVF_PSIZE: u32 = 0x020;
pub const FVF_DIFFUSE: u32 = 0x040;
pub const FVF_SPECULAR: u32 = 0x080;
pub const FVF_TEXCOUNT_MASK: u32 = 0xF00;
pub const FVF_TEXCOUNT_SHIFT: u32 = 8;

/// Expands a flexible-vertex-format word into an equivalent declaration on
/// stream 0.
pub fn declaration_from_fvf(fvf: u32) -> Arc<VertexDeclaration9> {
    let mut elements = Vec::new();
    let mut offset = 0u16;

    let mut push = |decl_type: DeclType, usage: DeclUsage, usage_index: u8, offset: &mut u16| {
        elements.push(DeclElement {
            stream: 0,
            offset: *offset,
            decl_type,
            usage,
            usage_index,
        });
        *offset += decl_type.byte_size() as u16;
    };

    if fvf & FVF_XYZRHW != 0 {
        push(DeclType::Float4, DeclUsage::PositionT, 0, &mut offset);
    } else if fvf & FVF_XYZ != 0 {
        push(DeclType::Float3, DeclUsage::Position, 0, &mut offset);
    }
    if fvf & FVF_NORMAL != 0 {
        push(DeclType::Float3, DeclUsage::Normal, 0, &mut offset);
    }
    if fvf & FVF_PSIZE != 0 {
        push(DeclType::Float1, DeclUsage::PointSize, 0, &mut offset);
    }
    if fvf & FVF_DIFFUSE != 0 {
        push(DeclType::Color, DeclUsage::Color, 0, &mut offset);
    }
    if fvf & FVF_SPECULAR != 0 {
        push(DeclType::Color, DeclUsage::Color, 1, &mut offset);
    }

    let tex_count = (fvf & FVF_TEXCOUNT_MASK) >> FVF_TEXCOUNT_SHIFT;
    for i in 0..tex_count.min(8) {
        push(DeclType::Float2, DeclUsage::TexCoord, i as u8, &mut offset);
    }

    VertexDeclaration9::new(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fvf_expansion_orders_position_normal_color_texcoords() {
        let fvf = FVF_XYZ | FVF_NORMAL | FVF_DIFFUSE | (2 << FVF_TEXCOUNT_SHIFT);
        let decl = declaration_from_fvf(fvf);

        let usages: Vec<(DeclUsage, u8, u16)> = decl
            .elements
            .iter()
            .map(|e| (e.usage, e.usage_index, e.offset))
            .collect();
        assert_eq!(
            usages,
            vec![
                (DeclUsage::Position, 0, 0),
                (DeclUsage::Normal, 0, 12),
                (DeclUsage::Color, 0, 24),
                (DeclUsage::TexCoord, 0, 28),
                (DeclUsage::TexCoord, 1, 36),
            ]
        );
    }

    #[test]
    fn transformed_position_takes_four_floats() {
        let decl = declaration_from_fvf(FVF_XYZRHW);
        assert_eq!(decl.elements[0].decl_type, DeclType::Float4);
        assert_eq!(decl.elements[0].usage, DeclUsage::PositionT);
    }
}

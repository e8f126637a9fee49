use ash::vk;

use prism_gpu::{format_info, FormatInfo};

/// The legacy format enum, at the granularity the core consumes. The full
/// capability table lives in the external format-table collaborator; this
/// module covers the mapping the runtime itself needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DxgiFormat {
    Unknown = 0,
    R32G32B32A32Float = 2,
    R32G32B32Float = 6,
    R16G16B16A16Float = 10,
    R32G32Float = 16,
    R10G10B10A2Unorm = 24,
    R11G11B10Float = 26,
    R8G8B8A8Unorm = 28,
    R8G8B8A8UnormSrgb = 29,
    R16G16Float = 34,
    D32Float = 40,
    R32Float = 41,
    R32Uint = 42,
    D24UnormS8Uint = 45,
    R8G8Unorm = 49,
    R16Float = 54,
    D16Unorm = 55,
    R16Unorm = 56,
    R8Unorm = 61,
    BC1Unorm = 71,
    BC2Unorm = 74,
    BC3Unorm = 77,
    BC7Unorm = 98,
    B8G8R8A8Unorm = 87,
    B8G8R8A8UnormSrgb = 91,
    B5G6R5Unorm = 85,
    B5G5R5A1Unorm = 86,
}

/// What the format table reports for a legacy format.
#[derive(Clone, Copy, Debug)]
pub struct FormatMapping {
    pub format: vk::Format,
    pub swizzle: vk::ComponentMapping,
    /// Formats sharing a typeless family may alias through views.
    pub family: u32,
    pub info: FormatInfo,
    pub supported_as_view: bool,
}

const IDENTITY: vk::ComponentMapping = vk::ComponentMapping {
    r: vk::ComponentSwizzle::IDENTITY,
    g: vk::ComponentSwizzle::IDENTITY,
    b: vk::ComponentSwizzle::IDENTITY,
    a: vk::ComponentSwizzle::IDENTITY,
};

/// Maps a legacy format to its native equivalent and properties.
pub fn lookup_format(format: DxgiFormat) -> FormatMapping {
    let (native, family) = match format {
        DxgiFormat::Unknown => (vk::Format::UNDEFINED, 0),
        DxgiFormat::R32G32B32A32Float => (vk::Format::R32G32B32A32_SFLOAT, 1),
        DxgiFormat::R32G32B32Float => (vk::Format::R32G32B32_SFLOAT, 2),
        DxgiFormat::R16G16B16A16Float => (vk::Format::R16G16B16A16_SFLOAT, 3),
        DxgiFormat::R32G32Float => (vk::Format::R32G32_SFLOAT, 4),
        DxgiFormat::R10G10B10A2Unorm => (vk::Format::A2B10G10R10_UNORM_PACK32, 5),
        DxgiFormat::R11G11B10Float => (vk::Format::B10G11R11_UFLOAT_PACK32, 6),
        DxgiFormat::R8G8B8A8Unorm => (vk::Format::R8G8B8A8_UNORM, 7),
        DxgiFormat::R8G8B8A8UnormSrgb => (vk::Format::R8G8B8A8_SRGB, 7),
        DxgiFormat::R16G16Float => (vk::Format::R16G16_SFLOAT, 8),
        DxgiFormat::D32Float => (vk::Format::D32_SFLOAT, 9),
        DxgiFormat::R32Float => (vk::Format::R32_SFLOAT, 9),
        DxgiFormat::R32Uint => (vk::Format::R32_UINT, 9),
        DxgiFormat::D24UnormS8Uint => (vk::Format::D24_UNORM_S8_UINT, 10),
        DxgiFormat::R8G8Unorm => (vk::Format::R8G8_UNORM, 11),
        DxgiFormat::R16Float => (vk::Format::R16_SFLOAT, 12),
        DxgiFormat::D16Unorm => (vk::Format::D16_UNORM, 12),
        DxgiFormat::R16Unorm => (vk::Format::R16_UNORM, 12),
        DxgiFormat::R8Unorm => (vk::Format::R8_UNORM, 13),
        DxgiFormat::BC1Unorm => (vk::Format::BC1_RGBA_UNORM_BLOCK, 14),
        DxgiFormat::BC2Unorm => (vk::Format::BC2_UNORM_BLOCK, 15),
        DxgiFormat::BC3Unorm => (vk::Format::BC3_UNORM_BLOCK, 16),
        DxgiFormat::BC7Unorm => (vk::Format::BC7_UNORM_BLOCK, 17),
        DxgiFormat::B8G8R8A8Unorm => (vk::Format::B8G8R8A8_UNORM, 18),
        DxgiFormat::B8G8R8A8UnormSrgb => (vk::Format::B8G8R8A8_SRGB, 18),
        DxgiFormat::B5G6R5Unorm => (vk::Format::R5G6B5_UNORM_PACK16, 19),
        DxgiFormat::B5G5R5A1Unorm => (vk::Format::A1R5G5B5_UNORM_PACK16, 20),
    };

    FormatMapping {
        format: native,
        swizzle: IDENTITY,
        family,
        info: format_info(native),
        supported_as_view: native != vk::Format::UNDEFINED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_variants_share_a_typeless_family() {
        let a = lookup_format(DxgiFormat::R8G8B8A8Unorm);
        let b = lookup_format(DxgiFormat::R8G8B8A8UnormSrgb);
        assert_eq!(a.family, b.family);
        assert_ne!(a.format, b.format);
    }

    #[test]
    fn unknown_maps_to_undefined() {
        let mapping = lookup_format(DxgiFormat::Unknown);
        assert_eq!(mapping.format, vk::Format::UNDEFINED);
        assert!(!mapping.supported_as_view);
    }
}

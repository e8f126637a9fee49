use ash::vk;

use prism_gpu::{format_info, FormatInfo};

/// The version-9 format enum, at the granularity the core consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format9 {
    Unknown,
    /// Tightly packed 24-bit RGB; no native equivalent, handled by the
    /// map-time fixup.
    R8G8B8,
    A8R8G8B8,
    X8R8G8B8,
    R5G6B5,
    A1R5G5B5,
    A4R4G4B4,
    A8,
    L8,
    A16B16G16R16F,
    A32B32G32R32F,
    Dxt1,
    Dxt3,
    Dxt5,
    D16,
    D24S8,
    D32F,
    Index16,
    Index32,
}

/// What the format table reports for a version-9 format.
#[derive(Clone, Copy, Debug)]
pub struct FormatMapping9 {
    pub format: vk::Format,
    pub swizzle: vk::ComponentMapping,
    pub info: FormatInfo,
    /// Host data must be widened before buffer-to-image copies.
    pub requires_fixup: bool,
    /// Bytes per texel on the host side (differs from the native element
    /// size for fixed-up formats).
    pub host_element_size: u32,
}

const IDENTITY: vk::ComponentMapping = vk::ComponentMapping {
    r: vk::ComponentSwizzle::IDENTITY,
    g: vk::ComponentSwizzle::IDENTITY,
    b: vk::ComponentSwizzle::IDENTITY,
    a: vk::ComponentSwizzle::IDENTITY,
};

const FORCE_OPAQUE: vk::ComponentMapping = vk::ComponentMapping {
    r: vk::ComponentSwizzle::IDENTITY,
    g: vk::ComponentSwizzle::IDENTITY,
    b: vk::ComponentSwizzle::IDENTITY,
    a: vk::ComponentSwizzle::ONE,
};

const LUMINANCE: vk::ComponentMapping = vk::ComponentMapping {
    r: vk::ComponentSwizzle::R,
    g: vk::ComponentSwizzle::R,
    b: vk::ComponentSwizzle::R,
    a: vk::ComponentSwizzle::ONE,
};

/// Maps a version-9 format onto the native format set.
pub fn lookup_format9(format: Format9) -> FormatMapping9 {
    let (native, swizzle, requires_fixup, host_element_size) = match format {
        Format9::Unknown => (vk::Format::UNDEFINED, IDENTITY, false, 0),
        // Widened to BGRX at upload time.
        Format9::R8G8B8 => (vk::Format::B8G8R8A8_UNORM, FORCE_OPAQUE, true, 3),
        Format9::A8R8G8B8 => (vk::Format::B8G8R8A8_UNORM, IDENTITY, false, 4),
        Format9::X8R8G8B8 => (vk::Format::B8G8R8A8_UNORM, FORCE_OPAQUE, false, 4),
        Format9::R5G6B5 => (vk::Format::R5G6B5_UNORM_PACK16, IDENTITY, false, 2),
        Format9::A1R5G5B5 => (vk::Format::A1R5G5B5_UNORM_PACK16, IDENTITY, false, 2),
        Format9::A4R4G4B4 => (vk::Format::B4G4R4A4_UNORM_PACK16, IDENTITY, false, 2),
        Format9::A8 => (vk::Format::R8_UNORM, alpha_only(), false, 1),
        Format9::L8 => (vk::Format::R8_UNORM, LUMINANCE, false, 1),
        Format9::A16B16G16R16F => (vk::Format::R16G16B16A16_SFLOAT, IDENTITY, false, 8),
        Format9::A32B32G32R32F => (vk::Format::R32G32B32A32_SFLOAT, IDENTITY, false, 16),
        Format9::Dxt1 => (vk::Format::BC1_RGBA_UNORM_BLOCK, IDENTITY, false, 8),
        Format9::Dxt3 => (vk::Format::BC2_UNORM_BLOCK, IDENTITY, false, 16),
        Format9::Dxt5 => (vk::Format::BC3_UNORM_BLOCK, IDENTITY, false, 16),
        Format9::D16 => (vk::Format::D16_UNORM, IDENTITY, false, 2),
        Format9::D24S8 => (vk::Format::D24_UNORM_S8_UINT, IDENTITY, false, 4),
        Format9::D32F => (vk::Format::D32_SFLOAT, IDENTITY, false, 4),
        Format9::Index16 => (vk::Format::R16_UINT, IDENTITY, false, 2),
        Format9::Index32 => (vk::Format::R32_UINT, IDENTITY, false, 4),
    };

    FormatMapping9 {
        format: native,
        swizzle,
        info: format_info(native),
        requires_fixup,
        host_element_size,
    }
}

fn alpha_only() -> vk::ComponentMapping {
    vk::ComponentMapping {
        r: vk::ComponentSwizzle::ZERO,
        g: vk::ComponentSwizzle::ZERO,
        b: vk::ComponentSwizzle::ZERO,
        a: vk::ComponentSwizzle::R,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_rgb_requires_fixup() {
        let mapping = lookup_format9(Format9::R8G8B8);
        assert!(mapping.requires_fixup);
        assert_eq!(mapping.host_element_size, 3);
        assert_eq!(mapping.info.element_size, 4);
    }

    #[test]
    fn depth_stencil_keeps_both_aspects() {
        let mapping = lookup_format9(Format9::D24S8);
        assert_eq!(
            mapping.info.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}

use ash::vk;

/// Per-format properties the core needs for copies, staging-buffer sizing
/// and subresource addressing.
///
/// The full legacy-format capability tables live in the API runtimes; this
/// table only covers the native formats the core manipulates directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bytes per element (texel, or block for compressed formats).
    pub element_size: u32,
    /// Block extent. `1x1x1` for uncompressed formats.
    pub block_size: vk::Extent3D,
    /// Aspects present in the format.
    pub aspect_mask: vk::ImageAspectFlags,
}

const BLOCK_1X1: vk::Extent3D = vk::Extent3D {
    width: 1,
    height: 1,
    depth: 1,
};

const BLOCK_4X4: vk::Extent3D = vk::Extent3D {
    width: 4,
    height: 4,
    depth: 1,
};

/// Looks up the properties of a native format.
pub fn format_info(format: vk::Format) -> FormatInfo {
    let color = vk::ImageAspectFlags::COLOR;
    let depth = vk::ImageAspectFlags::DEPTH;
    let depth_stencil = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;

    let (element_size, block_size, aspect_mask) = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => {
            (1, BLOCK_1X1, if format == vk::Format::S8_UINT {
                vk::ImageAspectFlags::STENCIL
            } else {
                color
            })
        }
        vk::Format::R8G8_UNORM
        | vk::Format::R16_UNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SFLOAT
        | vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::A1R5G5B5_UNORM_PACK16
        | vk::Format::B4G4R4A4_UNORM_PACK16
        | vk::Format::D16_UNORM => (
            2,
            BLOCK_1X1,
            if format == vk::Format::D16_UNORM { depth } else { color },
        ),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SFLOAT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32 => (4, BLOCK_1X1, color),
        vk::Format::D32_SFLOAT => (4, BLOCK_1X1, depth),
        vk::Format::D24_UNORM_S8_UINT | vk::Format::X8_D24_UNORM_PACK32 => {
            (4, BLOCK_1X1, if format == vk::Format::D24_UNORM_S8_UINT {
                depth_stencil
            } else {
                depth
            })
        }
        vk::Format::D32_SFLOAT_S8_UINT => (8, BLOCK_1X1, depth_stencil),
        vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT => (8, BLOCK_1X1, color),
        vk::Format::R32G32B32_SFLOAT => (12, BLOCK_1X1, color),
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => (16, BLOCK_1X1, color),
        vk::Format::BC1_RGBA_UNORM_BLOCK | vk::Format::BC1_RGBA_SRGB_BLOCK => (8, BLOCK_4X4, color),
        vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC3_SRGB_BLOCK
        | vk::Format::BC5_UNORM_BLOCK
        | vk::Format::BC7_UNORM_BLOCK
        | vk::Format::BC7_SRGB_BLOCK => (16, BLOCK_4X4, color),
        // Reasonable default for formats the core never inspects directly.
        _ => (4, BLOCK_1X1, color),
    };

    FormatInfo {
        element_size,
        block_size,
        aspect_mask,
    }
}

/// Aspect mask of a native format.
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    format_info(format).aspect_mask
}

/// Bytes per element (or block) of a native format.
pub fn format_element_size(format: vk::Format) -> u32 {
    format_info(format).element_size
}

/// The packed depth-stencil format to use when copying a combined
/// depth-stencil image through a staging buffer, if the format needs the
/// packed copy path.
pub fn packed_depth_stencil_format(format: vk::Format) -> Option<vk::Format> {
    match format {
        vk::Format::D24_UNORM_S8_UINT => Some(vk::Format::D24_UNORM_S8_UINT),
        vk::Format::D32_SFLOAT_S8_UINT => Some(vk::Format::D32_SFLOAT_S8_UINT),
        _ => None,
    }
}

/// Expands tightly packed 24-bit RGB rows into 32-bit RGBX.
///
/// Used by the map-time format fixup for legacy formats with no native
/// equivalent: the host writes 3-byte texels into the staging layout, and
/// the engine widens them before the buffer-to-image copy.
pub fn expand_packed_rgb24(src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len() % 3, 0);
    debug_assert!(dst.len() >= src.len() / 3 * 4);

    for (i, texel) in src.chunks_exact(3).enumerate() {
        let out = &mut dst[i * 4..i * 4 + 4];
        out[0] = texel[0];
        out[1] = texel[1];
        out[2] = texel[2];
        out[3] = 0xFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb24_expansion_widens_and_saturates_alpha() {
        let src = [1u8, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 8];
        expand_packed_rgb24(&src, &mut dst);
        assert_eq!(dst, [1, 2, 3, 0xFF, 4, 5, 6, 0xFF]);
    }

    #[test]
    fn depth_formats_report_depth_aspect() {
        assert_eq!(
            format_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn compressed_formats_use_block_extents() {
        let info = format_info(vk::Format::BC1_RGBA_UNORM_BLOCK);
        assert_eq!(info.element_size, 8);
        assert_eq!(info.block_size.width, 4);
    }
}

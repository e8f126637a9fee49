//! `prism-gpu` is the Vulkan-facing core of the prism translation layer.
//!
//! This crate provides:
//! - Chunked device-memory sub-allocation (see [`MemoryAllocator`]).
//! - Buffer and image resources with host mapping and the rename pool used
//!   by the discard protocol (see [`Buffer`], [`Image`], [`ImageView`]).
//! - The command-stream hand-off between API contexts and the single worker
//!   thread that records native command buffers (see [`cs`]).
//! - Pipeline, sampler and descriptor management for the worker's recording
//!   context (see [`pipeline`]).
//! - Query objects with stall detection (see [`Query`]).
//!
//! The API runtimes (`prism-d3d11`, `prism-d3d9`) sit on top of this crate
//! and never touch raw Vulkan handles themselves.

mod buffer;
mod context;
mod descriptor;
mod device;
mod error;
mod format;
mod image;
mod memory;
mod options;
mod pipeline;
mod query;
mod resource;
mod shader;
mod submission;

pub mod cs;

pub use buffer::{Buffer, BufferCreateInfo, BufferSlice};
pub use context::{BarrierControl, NativeContext};
pub use device::{Device, DeviceCreateInfo, SamplerKey, SamplerPair};
pub use error::{GpuError, Status};
pub use format::{
    expand_packed_rgb24, format_aspect, format_element_size, format_info,
    packed_depth_stencil_format, FormatInfo,
};
pub use image::{
    Image, ImageCreateInfo, ImageView, ImageViewCreateInfo, Subresource, SubresourceLayout,
};
pub use memory::{Memory, MemoryAllocator, MemoryStats};
pub use options::GpuOptions;
pub use pipeline::{
    BlendMode, DepthBias, DepthStencilState, InputLayout, MultisampleState, RasterizerState,
    StencilOps, VertexAttribute, VertexBinding, MAX_RENDER_TARGETS,
};
pub use query::{PipelineStatistics, Query, QueryData, QueryKind, QueryState};
pub use resource::UseTracker;
pub use shader::{
    Shader, ShaderCompileOptions, ShaderConstantCopy, ShaderMetadata, ShaderStage,
    SignatureElement, MAX_SAMPLER_SLOTS, MAX_TEXTURE_SLOTS, MAX_UNIFORM_SLOTS,
};
pub use submission::SubmissionTracker;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Extent of mip level `level` given a base extent.
pub fn mip_level_extent(extent: ash::vk::Extent3D, level: u32) -> ash::vk::Extent3D {
    ash::vk::Extent3D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
        depth: (extent.depth >> level).max(1),
    }
}

/// Number of format blocks covering `extent` for a given block size.
pub fn compute_block_count(extent: ash::vk::Extent3D, block: ash::vk::Extent3D) -> ash::vk::Extent3D {
    ash::vk::Extent3D {
        width: extent.width.div_ceil(block.width),
        height: extent.height.div_ceil(block.height),
        depth: extent.depth.div_ceil(block.depth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(255, 256), 256);
    }

    #[test]
    fn mip_extent_clamps_to_one() {
        let base = vk::Extent3D {
            width: 128,
            height: 32,
            depth: 1,
        };
        let m = mip_level_extent(base, 6);
        assert_eq!((m.width, m.height, m.depth), (2, 1, 1));
    }

    #[test]
    fn block_count_rounds_up() {
        let extent = vk::Extent3D {
            width: 129,
            height: 127,
            depth: 1,
        };
        let block = vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        };
        let c = compute_block_count(extent, block);
        assert_eq!((c.width, c.height, c.depth), (33, 32, 1));
    }
}

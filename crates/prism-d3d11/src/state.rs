//! The flat version-11 state vector and its dirty-flag set.
//!
//! The state vector is the single source of truth for the API; the native
//! pipeline state is a projection from it, refreshed on demand by the
//! draw-preparation pass in [`crate::translate`].

use std::sync::Arc;

use bitflags::bitflags;

use prism_gpu::Shader;

use crate::query::Query11;
use crate::resource::{
    Buffer11, DepthStencilView11, InputLayout11, RenderTargetView11, ShaderResourceView11,
};

pub const MAX_RTV_COUNT: usize = 8;
pub const MAX_VERTEX_BUFFER_COUNT: usize = 16;
pub const MAX_CONSTANT_BUFFER_COUNT: usize = 8;
pub const MAX_SRV_COUNT: usize = 16;
pub const MAX_SAMPLER_COUNT: usize = 16;
pub const MAX_VIEWPORT_COUNT: usize = 16;

bitflags! {
    /// Categories of the state vector modified since the last draw
    /// preparation. Mutators set bits; `prepare_draw` clears them in fixed
    /// order.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        const FRAMEBUFFER      = 1 << 0;
        const VIEWPORT_SCISSOR = 1 << 1;
        const BLEND            = 1 << 2;
        const DEPTH_STENCIL    = 1 << 3;
        const RASTERIZER       = 1 << 4;
        const MULTISAMPLE      = 1 << 5;
        const INPUT_LAYOUT     = 1 << 6;
        const VERTEX_BUFFERS   = 1 << 7;
        const INDEX_BUFFER     = 1 << 8;
        const SHADER_VS        = 1 << 9;
        const SHADER_PS        = 1 << 10;
        const SHADER_CS        = 1 << 11;
        const CONSTANTS_VS     = 1 << 12;
        const CONSTANTS_PS     = 1 << 13;
        const RESOURCES_VS     = 1 << 14;
        const RESOURCES_PS     = 1 << 15;
        const SAMPLERS_VS      = 1 << 16;
        const SAMPLERS_PS      = 1 << 17;
    }
}

/// Legacy primitive topologies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Topology {
    #[default]
    Undefined,
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

/// Legacy blend factors (shared enum for color and alpha paths).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Blend {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
    SrcAlphaSat,
    BlendFactor,
    InvBlendFactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendOpKind {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

/// Blend configuration of one render target in a blend-state object.
#[derive(Clone, Copy, Debug)]
pub struct RenderTargetBlendDesc {
    pub blend_enable: bool,
    pub src_blend: Blend,
    pub dest_blend: Blend,
    pub blend_op: BlendOpKind,
    pub src_blend_alpha: Blend,
    pub dest_blend_alpha: Blend,
    pub blend_op_alpha: BlendOpKind,
    pub write_mask: u8,
}

impl Default for RenderTargetBlendDesc {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_blend: Blend::One,
            dest_blend: Blend::Zero,
            blend_op: BlendOpKind::Add,
            src_blend_alpha: Blend::One,
            dest_blend_alpha: Blend::Zero,
            blend_op_alpha: BlendOpKind::Add,
            write_mask: 0xF,
        }
    }
}

/// An immutable blend-state object.
#[derive(Clone, Debug, Default)]
pub struct BlendState11 {
    pub alpha_to_coverage: bool,
    pub independent_blend: bool,
    pub render_targets: [RenderTargetBlendDesc; MAX_RTV_COUNT],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StencilOpKind {
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

#[derive(Clone, Copy, Debug)]
pub struct DepthStencilOpDesc {
    pub fail_op: StencilOpKind,
    pub depth_fail_op: StencilOpKind,
    pub pass_op: StencilOpKind,
    pub func: ComparisonFunc,
}

impl Default for DepthStencilOpDesc {
    fn default() -> Self {
        Self {
            fail_op: StencilOpKind::Keep,
            depth_fail_op: StencilOpKind::Keep,
            pass_op: StencilOpKind::Keep,
            func: ComparisonFunc::Always,
        }
    }
}

/// An immutable depth-stencil-state object.
#[derive(Clone, Debug)]
pub struct DepthStencilState11 {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front_face: DepthStencilOpDesc,
    pub back_face: DepthStencilOpDesc,
}

impl Default for DepthStencilState11 {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write: true,
            depth_func: ComparisonFunc::Less,
            stencil_enable: false,
            stencil_read_mask: 0xFF,
            stencil_write_mask: 0xFF,
            front_face: DepthStencilOpDesc::default(),
            back_face: DepthStencilOpDesc::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillMode {
    Wireframe,
    Solid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullModeKind {
    None,
    Front,
    Back,
}

/// An immutable rasterizer-state object.
#[derive(Clone, Debug)]
pub struct RasterizerState11 {
    pub fill_mode: FillMode,
    pub cull_mode: CullModeKind,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip_enable: bool,
    pub scissor_enable: bool,
}

impl Default for RasterizerState11 {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullModeKind::Back,
            front_counter_clockwise: false,
            depth_bias: 0,
            depth_bias_clamp: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_clip_enable: true,
            scissor_enable: false,
        }
    }
}

/// Legacy texture filter kinds, reduced to what the sampler cache keys on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    MinMagMipPoint,
    MinMagPointMipLinear,
    MinMagLinearMipPoint,
    MinMagMipLinear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

/// An immutable sampler-state object (the legacy tuple the sampler cache
/// hashes).
#[derive(Clone, Debug)]
pub struct SamplerState11 {
    pub filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison: ComparisonFunc,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerState11 {
    fn default() -> Self {
        Self {
            filter: Filter::MinMagMipLinear,
            address_u: AddressMode::Clamp,
            address_v: AddressMode::Clamp,
            address_w: AddressMode::Clamp,
            mip_lod_bias: 0.0,
            max_anisotropy: 1,
            comparison: ComparisonFunc::Never,
            border_color: [1.0; 4],
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub top_left_x: f32,
    pub top_left_y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Clone, Default)]
pub struct VertexBufferBinding {
    pub buffer: Option<Arc<Buffer11>>,
    pub offset: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexFormat {
    #[default]
    Uint16,
    Uint32,
}

#[derive(Clone, Default)]
pub struct IndexBufferBinding {
    pub buffer: Option<Arc<Buffer11>>,
    pub offset: u32,
    pub format: IndexFormat,
}

/// Per-stage resource bindings.
#[derive(Clone, Default)]
pub struct StageState {
    pub shader: Option<Arc<Shader>>,
    pub constant_buffers: [Option<Arc<Buffer11>>; MAX_CONSTANT_BUFFER_COUNT],
    pub shader_resources: [Option<Arc<ShaderResourceView11>>; MAX_SRV_COUNT],
    pub samplers: [Option<Arc<SamplerState11>>; MAX_SAMPLER_COUNT],
}

/// The entire version-11 pipeline state, owned by the context.
#[derive(Clone, Default)]
pub struct StateVector {
    pub render_targets: [Option<Arc<RenderTargetView11>>; MAX_RTV_COUNT],
    pub depth_stencil_view: Option<Arc<DepthStencilView11>>,

    pub viewports: Vec<Viewport>,
    pub scissors: Vec<ScissorRect>,

    pub blend_state: Option<Arc<BlendState11>>,
    pub blend_factor: [f32; 4],
    pub sample_mask: u32,

    pub depth_stencil_state: Option<Arc<DepthStencilState11>>,
    pub stencil_ref: u32,

    pub rasterizer_state: Option<Arc<RasterizerState11>>,

    pub input_layout: Option<Arc<InputLayout11>>,
    pub topology: Topology,
    pub vertex_buffers: [VertexBufferBinding; MAX_VERTEX_BUFFER_COUNT],
    pub index_buffer: IndexBufferBinding,

    pub vs: StageState,
    pub ps: StageState,
    pub cs: StageState,

    pub predicate: Option<Arc<Query11>>,
}

impl StateVector {
    pub fn clear(&mut self) {
        *self = StateVector {
            sample_mask: u32::MAX,
            ..StateVector::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_flags_compose() {
        let mut dirty = DirtyFlags::default();
        dirty |= DirtyFlags::BLEND | DirtyFlags::FRAMEBUFFER;
        assert!(dirty.contains(DirtyFlags::BLEND));

        dirty.remove(DirtyFlags::BLEND);
        assert!(!dirty.contains(DirtyFlags::BLEND));
        assert!(dirty.contains(DirtyFlags::FRAMEBUFFER));
    }

    #[test]
    fn cleared_state_resets_sample_mask() {
        let mut state = StateVector::default();
        state.sample_mask = 0xF0F0;
        state.stencil_ref = 7;
        state.clear();
        assert_eq!(state.sample_mask, u32::MAX);
        assert_eq!(state.stencil_ref, 0);
    }
}

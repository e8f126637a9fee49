//! `prism-d3d11` implements the version-11 runtime of the prism translation
//! layer on top of [`prism_gpu`]:
//!
//! - The flat state vector and its dirty-flag set ([`state`]).
//! - The immediate context with the implicit-flush policy and the mapping
//!   engine ([`ImmediateContext`]).
//! - Deferred contexts recording replayable command lists
//!   ([`DeferredContext`], [`CommandList`]).
//! - The state-to-pipeline translators that resolve dirty categories into
//!   worker commands at draw time ([`translate`]).
//!
//! The COM-shaped API shim lives outside this crate; the surface here
//! matches the legacy API at the method-group level and reports
//! [`prism_gpu::Status`] codes.

mod context;
mod context_def;
mod context_imm;
mod device;
mod format;
mod options;
mod query;
mod resource;

pub mod state;
pub mod translate;

pub use context::CommonContext;
pub use context_def::{CommandList, DeferredContext};
pub use context_imm::ImmediateContext;
pub use device::{Device11, FeatureLevel};
pub use format::{lookup_format, DxgiFormat, FormatMapping};
pub use options::Options11;
pub use query::{Query11, QueryDesc, QueryKind11};
pub use resource::{
    BindFlags, Buffer11, BufferDesc, CpuAccessFlags, DepthStencilView11, InputElementDesc,
    InputLayout11, InputSlotClass, MapFlags, MapMode, MapType, MappedSubresource,
    RenderTargetView11, ShaderResourceView11, Texture11, TextureDesc, Usage,
    APPEND_ALIGNED_ELEMENT,
};

//! `prism-d3d9` implements the version-9 runtime of the prism translation
//! layer on top of [`prism_gpu`]:
//!
//! - The render-state / sampler-state / texture-stage-state arrays and
//!   their dirty projection ([`state`], [`translate`]).
//! - The device surface with the implicit-flush policy, the lock engine and
//!   the draw-preparation pass ([`Device9`]).
//! - State blocks with Begin/EndStateBlock recording ([`StateBlock9`]).
//! - Fixed-function shader keys and the generated-module cache
//!   ([`fixed_function`]).
//!
//! The COM-shaped API shim and the fixed-function code generator live
//! outside this crate.

mod device;
mod format;
mod options;
mod query;
mod resource;
mod state_block;

pub mod fixed_function;
pub mod state;
pub mod translate;
pub mod vertex;

pub use device::{check_multisample_quality_levels, ClearFlags9, Device9, LockedRect};
pub use fixed_function::{FfPixelKey, FfShaderCache, FfShaderProvider, FfVertexKey};
pub use format::{lookup_format9, Format9, FormatMapping9};
pub use options::Options9;
pub use query::{Query9, QueryKind9};
pub use resource::{
    Buffer9, BufferDesc9, BufferKind, LockFlags, Pool, Surface9, Texture9, TextureDesc9, Usage9,
};
pub use state_block::{StateBlock9, StateBlockType9};
pub use translate::PrimitiveType9;
pub use vertex::{declaration_from_fvf, DeclElement, DeclType, DeclUsage, VertexDeclaration9};

//! The version-9 state vector: render-state, sampler-state and
//! texture-stage-state arrays indexed by numeric id, plus transforms,
//! lights, constants and bindings.
//!
//! The arrays are the single source of truth; draw preparation projects
//! them into native state through [`crate::translate`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;

use prism_gpu::Shader;

use crate::resource::{Buffer9, Surface9, Texture9};
use crate::vertex::VertexDeclaration9;

pub const RENDER_STATE_COUNT: usize = 256;
pub const SAMPLER_COUNT: usize = 20;
pub const SAMPLER_STATE_COUNT: usize = 14;
pub const TEXTURE_STAGE_COUNT: usize = 8;
pub const TEXTURE_STAGE_STATE_COUNT: usize = 33;
pub const TRANSFORM_COUNT: usize = 260;
pub const STREAM_COUNT: usize = 16;
pub const CLIP_PLANE_COUNT: usize = 6;
pub const VS_FLOAT_CONSTANT_COUNT: usize = 256;
pub const PS_FLOAT_CONSTANT_COUNT: usize = 224;
pub const INT_CONSTANT_COUNT: usize = 16;
pub const MAX_RENDER_TARGETS_9: usize = 4;

// Render-state ids the runtime decodes. Everything else is stored and
// round-tripped but has no native projection.
pub mod rs {
    pub const ZENABLE: u32 = 7;
    pub const FILLMODE: u32 = 8;
    pub const ZWRITEENABLE: u32 = 14;
    pub const ALPHATESTENABLE: u32 = 15;
    pub const SRCBLEND: u32 = 19;
    pub const DESTBLEND: u32 = 20;
    pub const CULLMODE: u32 = 22;
    pub const ZFUNC: u32 = 23;
    pub const ALPHAREF: u32 = 24;
    pub const ALPHAFUNC: u32 = 25;
    pub const ALPHABLENDENABLE: u32 = 27;
    pub const FOGENABLE: u32 = 28;
    pub const SPECULARENABLE: u32 = 29;
    pub const FOGCOLOR: u32 = 34;
    pub const FOGTABLEMODE: u32 = 35;
    pub const FOGSTART: u32 = 36;
    pub const FOGEND: u32 = 37;
    pub const FOGDENSITY: u32 = 38;
    pub const RANGEFOGENABLE: u32 = 48;
    pub const STENCILENABLE: u32 = 52;
    pub const STENCILFAIL: u32 = 53;
    pub const STENCILZFAIL: u32 = 54;
    pub const STENCILPASS: u32 = 55;
    pub const STENCILFUNC: u32 = 56;
    pub const STENCILREF: u32 = 57;
    pub const STENCILMASK: u32 = 58;
    pub const STENCILWRITEMASK: u32 = 59;
    pub const TEXTUREFACTOR: u32 = 60;
    pub const CLIPPING: u32 = 136;
    pub const LIGHTING: u32 = 137;
    pub const AMBIENT: u32 = 139;
    pub const FOGVERTEXMODE: u32 = 140;
    pub const COLORVERTEX: u32 = 141;
    pub const NORMALIZENORMALS: u32 = 143;
    pub const DIFFUSEMATERIALSOURCE: u32 = 145;
    pub const SPECULARMATERIALSOURCE: u32 = 146;
    pub const AMBIENTMATERIALSOURCE: u32 = 147;
    pub const EMISSIVEMATERIALSOURCE: u32 = 148;
    pub const CLIPPLANEENABLE: u32 = 152;
    pub const MULTISAMPLEANTIALIAS: u32 = 161;
    pub const MULTISAMPLEMASK: u32 = 162;
    pub const COLORWRITEENABLE: u32 = 168;
    pub const BLENDOP: u32 = 171;
    pub const SCISSORTESTENABLE: u32 = 174;
    pub const SLOPESCALEDEPTHBIAS: u32 = 175;
    pub const TWOSIDEDSTENCILMODE: u32 = 185;
    pub const CCW_STENCILFAIL: u32 = 186;
    pub const CCW_STENCILZFAIL: u32 = 187;
    pub const CCW_STENCILPASS: u32 = 188;
    pub const CCW_STENCILFUNC: u32 = 189;
    pub const COLORWRITEENABLE1: u32 = 190;
    pub const COLORWRITEENABLE2: u32 = 191;
    pub const COLORWRITEENABLE3: u32 = 192;
    pub const BLENDFACTOR: u32 = 193;
    pub const SRGBWRITEENABLE: u32 = 194;
    pub const DEPTHBIAS: u32 = 195;
    pub const SEPARATEALPHABLENDENABLE: u32 = 206;
    pub const SRCBLENDALPHA: u32 = 207;
    pub const DESTBLENDALPHA: u32 = 208;
    pub const BLENDOPALPHA: u32 = 209;
}

// Sampler-state ids.
pub mod samp {
    pub const ADDRESSU: u32 = 1;
    pub const ADDRESSV: u32 = 2;
    pub const ADDRESSW: u32 = 3;
    pub const BORDERCOLOR: u32 = 4;
    pub const MAGFILTER: u32 = 5;
    pub const MINFILTER: u32 = 6;
    pub const MIPFILTER: u32 = 7;
    pub const MIPMAPLODBIAS: u32 = 8;
    pub const MAXMIPLEVEL: u32 = 9;
    pub const MAXANISOTROPY: u32 = 10;
    pub const SRGBTEXTURE: u32 = 11;
}

// Texture-stage-state ids.
pub mod tss {
    pub const COLOROP: u32 = 1;
    pub const COLORARG1: u32 = 2;
    pub const COLORARG2: u32 = 3;
    pub const ALPHAOP: u32 = 4;
    pub const ALPHAARG1: u32 = 5;
    pub const ALPHAARG2: u32 = 6;
    pub const TEXCOORDINDEX: u32 = 11;
    pub const TEXTURETRANSFORMFLAGS: u32 = 24;
    pub const CONSTANT: u32 = 32;
}

// Transform indices.
pub const TRANSFORM_VIEW: u32 = 2;
pub const TRANSFORM_PROJECTION: u32 = 3;
pub const TRANSFORM_TEXTURE0: u32 = 16;
pub const TRANSFORM_WORLD: u32 = 256;

/// Maps a transform-state id to its slot in the transform array, or `None`
/// for out-of-range ids.
pub fn transform_index(state: u32) -> Option<usize> {
    match state {
        TRANSFORM_VIEW | TRANSFORM_PROJECTION => Some(state as usize),
        s if (TRANSFORM_TEXTURE0..TRANSFORM_TEXTURE0 + 8).contains(&s) => Some(s as usize),
        s if (TRANSFORM_WORLD..TRANSFORM_WORLD + 4).contains(&s) => Some(s as usize),
        _ => None,
    }
}

bitflags! {
    /// Dirty categories of the version-9 state vector.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DirtyFlags9: u32 {
        const FRAMEBUFFER      = 1 << 0;
        const VIEWPORT_SCISSOR = 1 << 1;
        const BLEND            = 1 << 2;
        const DEPTH_STENCIL    = 1 << 3;
        const RASTERIZER       = 1 << 4;
        const MULTISAMPLE      = 1 << 5;
        const ALPHA_TEST       = 1 << 6;
        const CLIP_PLANES      = 1 << 7;
        const INPUT_LAYOUT     = 1 << 8;
        const FF_VERTEX_SHADER = 1 << 9;
        const FF_PIXEL_SHADER  = 1 << 10;
        const VS_CONSTANTS     = 1 << 11;
        const PS_CONSTANTS     = 1 << 12;
        const SAMPLERS         = 1 << 13;
        const TEXTURES         = 1 << 14;
        const STREAMS          = 1 << 15;
        const INDICES          = 1 << 16;
        const SHADER_VS        = 1 << 17;
        const SHADER_PS        = 1 << 18;
    }
}

/// Which dirty categories a render-state id feeds.
pub fn render_state_dirty(id: u32) -> DirtyFlags9 {
    use DirtyFlags9 as D;
    match id {
        rs::SRCBLEND
        | rs::DESTBLEND
        | rs::ALPHABLENDENABLE
        | rs::BLENDOP
        | rs::COLORWRITEENABLE
        | rs::COLORWRITEENABLE1
        | rs::COLORWRITEENABLE2
        | rs::COLORWRITEENABLE3
        | rs::SEPARATEALPHABLENDENABLE
        | rs::SRCBLENDALPHA
        | rs::DESTBLENDALPHA
        | rs::BLENDOPALPHA
        | rs::BLENDFACTOR => D::BLEND,

        rs::ZENABLE
        | rs::ZWRITEENABLE
        | rs::ZFUNC
        | rs::STENCILENABLE
        | rs::STENCILFAIL
        | rs::STENCILZFAIL
        | rs::STENCILPASS
        | rs::STENCILFUNC
        | rs::STENCILREF
        | rs::STENCILMASK
        | rs::STENCILWRITEMASK
        | rs::TWOSIDEDSTENCILMODE
        | rs::CCW_STENCILFAIL
        | rs::CCW_STENCILZFAIL
        | rs::CCW_STENCILPASS
        | rs::CCW_STENCILFUNC => D::DEPTH_STENCIL,

        rs::FILLMODE | rs::CULLMODE | rs::DEPTHBIAS | rs::SLOPESCALEDEPTHBIAS => D::RASTERIZER,

        rs::SCISSORTESTENABLE => D::VIEWPORT_SCISSOR,

        rs::MULTISAMPLEANTIALIAS | rs::MULTISAMPLEMASK => D::MULTISAMPLE,

        rs::ALPHATESTENABLE | rs::ALPHAREF | rs::ALPHAFUNC => D::ALPHA_TEST,

        rs::CLIPPING | rs::CLIPPLANEENABLE => D::CLIP_PLANES,

        rs::LIGHTING
        | rs::AMBIENT
        | rs::COLORVERTEX
        | rs::NORMALIZENORMALS
        | rs::SPECULARENABLE
        | rs::DIFFUSEMATERIALSOURCE
        | rs::SPECULARMATERIALSOURCE
        | rs::AMBIENTMATERIALSOURCE
        | rs::EMISSIVEMATERIALSOURCE
        | rs::FOGENABLE
        | rs::FOGTABLEMODE
        | rs::FOGVERTEXMODE => D::FF_VERTEX_SHADER | D::VS_CONSTANTS,

        rs::TEXTUREFACTOR => D::FF_PIXEL_SHADER | D::PS_CONSTANTS,

        rs::FOGCOLOR | rs::FOGSTART | rs::FOGEND | rs::FOGDENSITY | rs::RANGEFOGENABLE => {
            D::PS_CONSTANTS | D::VS_CONSTANTS
        }

        rs::SRGBWRITEENABLE => D::FRAMEBUFFER,

        _ => D::empty(),
    }
}

/// A fixed-function light.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Light9 {
    pub light_type: u32,
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub ambient: [f32; 4],
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub range: f32,
    pub falloff: f32,
    pub attenuation: [f32; 3],
    pub theta: f32,
    pub phi: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material9 {
    pub diffuse: [f32; 4],
    pub ambient: [f32; 4],
    pub specular: [f32; 4],
    pub emissive: [f32; 4],
    pub power: f32,
}

impl Default for Material9 {
    fn default() -> Self {
        Self {
            diffuse: [1.0, 1.0, 1.0, 1.0],
            ambient: [0.0; 4],
            specular: [0.0; 4],
            emissive: [0.0; 4],
            power: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport9 {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect9 {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Clone, Default)]
pub struct StreamSource9 {
    pub buffer: Option<Arc<Buffer9>>,
    pub offset: u32,
    pub stride: u32,
    /// Instance-frequency word: count or INDEXEDDATA/INSTANCEDATA flags.
    pub frequency: u32,
}

/// Per-stage shader constants. Bool constants are a bitmask.
#[derive(Clone)]
pub struct Constants9 {
    pub float: Box<[[f32; 4]]>,
    pub int: [[i32; 4]; INT_CONSTANT_COUNT],
    pub bools: u32,
}

impl Constants9 {
    fn new(float_count: usize) -> Self {
        Self {
            float: vec![[0.0; 4]; float_count].into_boxed_slice(),
            int: [[0; 4]; INT_CONSTANT_COUNT],
            bools: 0,
        }
    }
}

/// The whole version-9 pipeline state.
#[derive(Clone)]
pub struct State9 {
    pub render_states: [u32; RENDER_STATE_COUNT],
    pub sampler_states: [[u32; SAMPLER_STATE_COUNT]; SAMPLER_COUNT],
    pub texture_stage_states: [[u32; TEXTURE_STAGE_STATE_COUNT]; TEXTURE_STAGE_COUNT],
    pub transforms: Box<[[f32; 16]]>,
    pub textures: [Option<Arc<Texture9>>; SAMPLER_COUNT],

    pub render_targets: [Option<Arc<Surface9>>; MAX_RENDER_TARGETS_9],
    pub depth_stencil: Option<Arc<Surface9>>,

    pub viewport: Viewport9,
    pub scissor: Rect9,
    pub clip_planes: [[f32; 4]; CLIP_PLANE_COUNT],

    pub material: Material9,
    pub lights: BTreeMap<u32, Light9>,
    pub enabled_lights: Vec<u32>,

    pub vertex_decl: Option<Arc<VertexDeclaration9>>,
    pub streams: [StreamSource9; STREAM_COUNT],
    pub indices: Option<Arc<Buffer9>>,

    pub vertex_shader: Option<Arc<Shader>>,
    pub pixel_shader: Option<Arc<Shader>>,
    pub vs_constants: Constants9,
    pub ps_constants: Constants9,
}

impl Default for State9 {
    fn default() -> Self {
        let mut state = Self {
            render_states: [0; RENDER_STATE_COUNT],
            sampler_states: [[0; SAMPLER_STATE_COUNT]; SAMPLER_COUNT],
            texture_stage_states: [[0; TEXTURE_STAGE_STATE_COUNT]; TEXTURE_STAGE_COUNT],
            transforms: vec![IDENTITY_MATRIX; TRANSFORM_COUNT].into_boxed_slice(),
            textures: std::array::from_fn(|_| None),
            render_targets: std::array::from_fn(|_| None),
            depth_stencil: None,
            viewport: Viewport9::default(),
            scissor: Rect9::default(),
            clip_planes: [[0.0; 4]; CLIP_PLANE_COUNT],
            material: Material9::default(),
            lights: BTreeMap::new(),
            enabled_lights: Vec::new(),
            vertex_decl: None,
            streams: std::array::from_fn(|_| StreamSource9::default()),
            indices: None,
            vertex_shader: None,
            pixel_shader: None,
            vs_constants: Constants9::new(VS_FLOAT_CONSTANT_COUNT),
            ps_constants: Constants9::new(PS_FLOAT_CONSTANT_COUNT),
        };
        state.install_defaults();
        state
    }
}

pub const IDENTITY_MATRIX: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

// Decoded enum defaults; values mirror the legacy documented defaults.
const CMP_LESSEQUAL: u32 = 4;
const CMP_ALWAYS: u32 = 8;
const BLEND_ONE: u32 = 2;
const BLEND_ZERO: u32 = 1;
const BLENDOP_ADD: u32 = 1;
const CULL_CCW: u32 = 3;
const FILL_SOLID: u32 = 3;
const STENCILOP_KEEP: u32 = 1;
const TEXF_POINT: u32 = 1;
const TADDRESS_WRAP: u32 = 1;
const TOP_MODULATE: u32 = 4;
const TOP_SELECTARG1: u32 = 2;
const TOP_DISABLE: u32 = 1;
const TA_TEXTURE: u32 = 2;
const TA_CURRENT: u32 = 1;

impl State9 {
    /// Installs the documented default for every render state, sampler
    /// state and texture-stage state.
    fn install_defaults(&mut self) {
        let rs = &mut self.render_states;
        rs[rs::ZENABLE as usize] = 1;
        rs[rs::FILLMODE as usize] = FILL_SOLID;
        rs[rs::ZWRITEENABLE as usize] = 1;
        rs[rs::SRCBLEND as usize] = BLEND_ONE;
        rs[rs::DESTBLEND as usize] = BLEND_ZERO;
        rs[rs::CULLMODE as usize] = CULL_CCW;
        rs[rs::ZFUNC as usize] = CMP_LESSEQUAL;
        rs[rs::ALPHAFUNC as usize] = CMP_ALWAYS;
        rs[rs::STENCILFAIL as usize] = STENCILOP_KEEP;
        rs[rs::STENCILZFAIL as usize] = STENCILOP_KEEP;
        rs[rs::STENCILPASS as usize] = STENCILOP_KEEP;
        rs[rs::STENCILFUNC as usize] = CMP_ALWAYS;
        rs[rs::STENCILMASK as usize] = u32::MAX;
        rs[rs::STENCILWRITEMASK as usize] = u32::MAX;
        rs[rs::CCW_STENCILFAIL as usize] = STENCILOP_KEEP;
        rs[rs::CCW_STENCILZFAIL as usize] = STENCILOP_KEEP;
        rs[rs::CCW_STENCILPASS as usize] = STENCILOP_KEEP;
        rs[rs::CCW_STENCILFUNC as usize] = CMP_ALWAYS;
        rs[rs::CLIPPING as usize] = 1;
        rs[rs::LIGHTING as usize] = 1;
        rs[rs::COLORVERTEX as usize] = 1;
        rs[rs::DIFFUSEMATERIALSOURCE as usize] = 1;
        rs[rs::SPECULARMATERIALSOURCE as usize] = 2;
        rs[rs::FOGEND as usize] = 1.0f32.to_bits();
        rs[rs::FOGDENSITY as usize] = 1.0f32.to_bits();
        rs[rs::MULTISAMPLEANTIALIAS as usize] = 1;
        rs[rs::MULTISAMPLEMASK as usize] = u32::MAX;
        rs[rs::COLORWRITEENABLE as usize] = 0xF;
        rs[rs::COLORWRITEENABLE1 as usize] = 0xF;
        rs[rs::COLORWRITEENABLE2 as usize] = 0xF;
        rs[rs::COLORWRITEENABLE3 as usize] = 0xF;
        rs[rs::BLENDOP as usize] = BLENDOP_ADD;
        rs[rs::SRCBLENDALPHA as usize] = BLEND_ONE;
        rs[rs::DESTBLENDALPHA as usize] = BLEND_ZERO;
        rs[rs::BLENDOPALPHA as usize] = BLENDOP_ADD;
        rs[rs::BLENDFACTOR as usize] = 0xFFFF_FFFF;

        for sampler in self.sampler_states.iter_mut() {
            sampler[samp::ADDRESSU as usize] = TADDRESS_WRAP;
            sampler[samp::ADDRESSV as usize] = TADDRESS_WRAP;
            sampler[samp::ADDRESSW as usize] = TADDRESS_WRAP;
            sampler[samp::MAGFILTER as usize] = TEXF_POINT;
            sampler[samp::MINFILTER as usize] = TEXF_POINT;
            sampler[samp::MIPFILTER as usize] = 0;
            sampler[samp::MAXANISOTROPY as usize] = 1;
        }

        for (stage, tss_state) in self.texture_stage_states.iter_mut().enumerate() {
            tss_state[tss::COLOROP as usize] = if stage == 0 { TOP_MODULATE } else { TOP_DISABLE };
            tss_state[tss::COLORARG1 as usize] = TA_TEXTURE;
            tss_state[tss::COLORARG2 as usize] = TA_CURRENT;
            tss_state[tss::ALPHAOP as usize] =
                if stage == 0 { TOP_SELECTARG1 } else { TOP_DISABLE };
            tss_state[tss::ALPHAARG1 as usize] = TA_TEXTURE;
            tss_state[tss::ALPHAARG2 as usize] = TA_CURRENT;
            tss_state[tss::TEXCOORDINDEX as usize] = stage as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let state = State9::default();
        assert_eq!(state.render_states[rs::ZENABLE as usize], 1);
        assert_eq!(state.render_states[rs::CULLMODE as usize], CULL_CCW);
        assert_eq!(state.render_states[rs::MULTISAMPLEMASK as usize], u32::MAX);
        assert_eq!(
            f32::from_bits(state.render_states[rs::FOGEND as usize]),
            1.0
        );
        assert_eq!(state.transforms[TRANSFORM_VIEW as usize], IDENTITY_MATRIX);
    }

    #[test]
    fn transform_index_covers_world_and_texture_ranges() {
        assert_eq!(transform_index(TRANSFORM_VIEW), Some(2));
        assert_eq!(transform_index(TRANSFORM_TEXTURE0 + 7), Some(23));
        assert_eq!(transform_index(TRANSFORM_WORLD), Some(256));
        assert_eq!(transform_index(1000), None);
        assert_eq!(transform_index(0), None);
    }

    #[test]
    fn blend_states_feed_the_blend_category() {
        assert_eq!(render_state_dirty(rs::SRCBLEND), DirtyFlags9::BLEND);
        assert!(render_state_dirty(rs::LIGHTING).contains(DirtyFlags9::FF_VERTEX_SHADER));
        assert_eq!(render_state_dirty(200), DirtyFlags9::empty());
    }
}

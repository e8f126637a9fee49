//! State blocks: captured snapshots of a chosen state subset, plus the
//! Begin/EndStateBlock recording mode that reroutes mutators into a block.

use std::sync::Arc;

use bitflags::bitflags;

use prism_gpu::Shader;

use crate::resource::{Buffer9, Texture9};
use crate::state::{
    transform_index, DirtyFlags9, State9, RENDER_STATE_COUNT, SAMPLER_COUNT,
    SAMPLER_STATE_COUNT, TEXTURE_STAGE_COUNT, TEXTURE_STAGE_STATE_COUNT,
};
use crate::vertex::VertexDeclaration9;

/// Predefined capture sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateBlockType9 {
    All,
    PixelState,
    VertexState,
    /// Empty; populated by the Begin/EndStateBlock recorder.
    Custom,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct CaptureFlags: u32 {
        const VIEWPORT     = 1 << 0;
        const SCISSOR      = 1 << 1;
        const TRANSFORMS   = 1 << 2;
        const MATERIAL     = 1 << 3;
        const LIGHTS       = 1 << 4;
        const SHADER_VS    = 1 << 5;
        const SHADER_PS    = 1 << 6;
        const VS_CONSTANTS = 1 << 7;
        const PS_CONSTANTS = 1 << 8;
        const STREAMS      = 1 << 9;
        const INDICES      = 1 << 10;
        const VERTEX_DECL  = 1 << 11;
        const CLIP_PLANES  = 1 << 12;
    }
}

/// What a block captures, at the granularity the legacy API exposes.
struct Captures {
    flags: CaptureFlags,
    render_states: Box<[bool; RENDER_STATE_COUNT]>,
    samplers: [bool; SAMPLER_COUNT],
    texture_stages: [bool; TEXTURE_STAGE_COUNT],
    textures: [bool; SAMPLER_COUNT],
}

impl Captures {
    fn none() -> Self {
        Self {
            flags: CaptureFlags::empty(),
            render_states: Box::new([false; RENDER_STATE_COUNT]),
            samplers: [false; SAMPLER_COUNT],
            texture_stages: [false; TEXTURE_STAGE_COUNT],
            textures: [false; SAMPLER_COUNT],
        }
    }

    fn all() -> Self {
        Self {
            flags: CaptureFlags::all(),
            render_states: Box::new([true; RENDER_STATE_COUNT]),
            samplers: [true; SAMPLER_COUNT],
            texture_stages: [true; TEXTURE_STAGE_COUNT],
            textures: [true; SAMPLER_COUNT],
        }
    }

    fn pixel() -> Self {
        let mut captures = Self::none();
        captures.flags = CaptureFlags::SHADER_PS | CaptureFlags::PS_CONSTANTS;
        for &id in PIXEL_RENDER_STATES {
            captures.render_states[id as usize] = true;
        }
        captures.samplers = [true; SAMPLER_COUNT];
        captures.texture_stages = [true; TEXTURE_STAGE_COUNT];
        captures
    }

    fn vertex() -> Self {
        let mut captures = Self::none();
        captures.flags = CaptureFlags::SHADER_VS
            | CaptureFlags::VS_CONSTANTS
            | CaptureFlags::VERTEX_DECL
            | CaptureFlags::STREAMS
            | CaptureFlags::LIGHTS
            | CaptureFlags::MATERIAL;
        for &id in VERTEX_RENDER_STATES {
            captures.render_states[id as usize] = true;
        }
        captures
    }
}

use crate::state::rs;

/// Render states belonging to the pixel-state capture set.
const PIXEL_RENDER_STATES: &[u32] = &[
    rs::ZENABLE,
    rs::FILLMODE,
    rs::ZWRITEENABLE,
    rs::ALPHATESTENABLE,
    rs::SRCBLEND,
    rs::DESTBLEND,
    rs::ZFUNC,
    rs::ALPHAREF,
    rs::ALPHAFUNC,
    rs::ALPHABLENDENABLE,
    rs::FOGENABLE,
    rs::SPECULARENABLE,
    rs::FOGCOLOR,
    rs::FOGTABLEMODE,
    rs::FOGSTART,
    rs::FOGEND,
    rs::FOGDENSITY,
    rs::STENCILENABLE,
    rs::STENCILFAIL,
    rs::STENCILZFAIL,
    rs::STENCILPASS,
    rs::STENCILFUNC,
    rs::STENCILREF,
    rs::STENCILMASK,
    rs::STENCILWRITEMASK,
    rs::TEXTUREFACTOR,
    rs::COLORWRITEENABLE,
    rs::COLORWRITEENABLE1,
    rs::COLORWRITEENABLE2,
    rs::COLORWRITEENABLE3,
    rs::BLENDOP,
    rs::SCISSORTESTENABLE,
    rs::TWOSIDEDSTENCILMODE,
    rs::CCW_STENCILFAIL,
    rs::CCW_STENCILZFAIL,
    rs::CCW_STENCILPASS,
    rs::CCW_STENCILFUNC,
    rs::BLENDFACTOR,
    rs::SRGBWRITEENABLE,
    rs::DEPTHBIAS,
    rs::SLOPESCALEDEPTHBIAS,
    rs::SEPARATEALPHABLENDENABLE,
    rs::SRCBLENDALPHA,
    rs::DESTBLENDALPHA,
    rs::BLENDOPALPHA,
];

/// Render states belonging to the vertex-state capture set.
const VERTEX_RENDER_STATES: &[u32] = &[
    rs::CULLMODE,
    rs::FOGENABLE,
    rs::FOGTABLEMODE,
    rs::FOGSTART,
    rs::FOGEND,
    rs::FOGDENSITY,
    rs::RANGEFOGENABLE,
    rs::FOGVERTEXMODE,
    rs::CLIPPING,
    rs::LIGHTING,
    rs::AMBIENT,
    rs::COLORVERTEX,
    rs::NORMALIZENORMALS,
    rs::DIFFUSEMATERIALSOURCE,
    rs::SPECULARMATERIALSOURCE,
    rs::AMBIENTMATERIALSOURCE,
    rs::EMISSIVEMATERIALSOURCE,
    rs::CLIPPLANEENABLE,
    rs::MULTISAMPLEANTIALIAS,
    rs::MULTISAMPLEMASK,
];

/// A captured state subset.
///
/// `capture` refreshes the block from the device state; `apply` copies the
/// captured subset back and returns the full dirty set, since the block
/// may touch any category.
pub struct StateBlock9 {
    captures: Captures,
    state: State9,
}

impl StateBlock9 {
    pub fn new(block_type: StateBlockType9) -> Self {
        let captures = match block_type {
            StateBlockType9::All => Captures::all(),
            StateBlockType9::PixelState => Captures::pixel(),
            StateBlockType9::VertexState => Captures::vertex(),
            StateBlockType9::Custom => Captures::none(),
        };
        Self {
            captures,
            state: State9::default(),
        }
    }

    /// Copies the captured subset of `src` into the block.
    pub fn capture(&mut self, src: &State9) {
        for (id, captured) in self.captures.render_states.iter().enumerate() {
            if *captured {
                self.state.render_states[id] = src.render_states[id];
            }
        }
        for (sampler, captured) in self.captures.samplers.iter().enumerate() {
            if *captured {
                self.state.sampler_states[sampler] = src.sampler_states[sampler];
            }
        }
        for (stage, captured) in self.captures.texture_stages.iter().enumerate() {
            if *captured {
                self.state.texture_stage_states[stage] = src.texture_stage_states[stage];
            }
        }
        for (slot, captured) in self.captures.textures.iter().enumerate() {
            if *captured {
                self.state.textures[slot] = src.textures[slot].clone();
            }
        }

        let flags = self.captures.flags;
        if flags.contains(CaptureFlags::VIEWPORT) {
            self.state.viewport = src.viewport;
        }
        if flags.contains(CaptureFlags::SCISSOR) {
            self.state.scissor = src.scissor;
        }
        if flags.contains(CaptureFlags::TRANSFORMS) {
            self.state.transforms.copy_from_slice(&src.transforms);
        }
        if flags.contains(CaptureFlags::MATERIAL) {
            self.state.material = src.material;
        }
        if flags.contains(CaptureFlags::LIGHTS) {
            self.state.lights = src.lights.clone();
            self.state.enabled_lights = src.enabled_lights.clone();
        }
        if flags.contains(CaptureFlags::SHADER_VS) {
            self.state.vertex_shader = src.vertex_shader.clone();
        }
        if flags.contains(CaptureFlags::SHADER_PS) {
            self.state.pixel_shader = src.pixel_shader.clone();
        }
        if flags.contains(CaptureFlags::VS_CONSTANTS) {
            self.state.vs_constants = src.vs_constants.clone();
        }
        if flags.contains(CaptureFlags::PS_CONSTANTS) {
            self.state.ps_constants = src.ps_constants.clone();
        }
        if flags.contains(CaptureFlags::STREAMS) {
            self.state.streams = src.streams.clone();
        }
        if flags.contains(CaptureFlags::INDICES) {
            self.state.indices = src.indices.clone();
        }
        if flags.contains(CaptureFlags::VERTEX_DECL) {
            self.state.vertex_decl = src.vertex_decl.clone();
        }
        if flags.contains(CaptureFlags::CLIP_PLANES) {
            self.state.clip_planes = src.clip_planes;
        }
    }

    /// Copies the captured subset into `dst` and returns the dirty set to
    /// raise.
    pub fn apply(&self, dst: &mut State9) -> DirtyFlags9 {
        for (id, captured) in self.captures.render_states.iter().enumerate() {
            if *captured {
                dst.render_states[id] = self.state.render_states[id];
            }
        }
        for (sampler, captured) in self.captures.samplers.iter().enumerate() {
            if *captured {
                dst.sampler_states[sampler] = self.state.sampler_states[sampler];
            }
        }
        for (stage, captured) in self.captures.texture_stages.iter().enumerate() {
            if *captured {
                dst.texture_stage_states[stage] = self.state.texture_stage_states[stage];
            }
        }
        for (slot, captured) in self.captures.textures.iter().enumerate() {
            if *captured {
                dst.textures[slot] = self.state.textures[slot].clone();
            }
        }

        let flags = self.captures.flags;
        if flags.contains(CaptureFlags::VIEWPORT) {
            dst.viewport = self.state.viewport;
        }
        if flags.contains(CaptureFlags::SCISSOR) {
            dst.scissor = self.state.scissor;
        }
        if flags.contains(CaptureFlags::TRANSFORMS) {
            dst.transforms.copy_from_slice(&self.state.transforms);
        }
        if flags.contains(CaptureFlags::MATERIAL) {
            dst.material = self.state.material;
        }
        if flags.contains(CaptureFlags::LIGHTS) {
            dst.lights = self.state.lights.clone();
            dst.enabled_lights = self.state.enabled_lights.clone();
        }
        if flags.contains(CaptureFlags::SHADER_VS) {
            dst.vertex_shader = self.state.vertex_shader.clone();
        }
        if flags.contains(CaptureFlags::SHADER_PS) {
            dst.pixel_shader = self.state.pixel_shader.clone();
        }
        if flags.contains(CaptureFlags::VS_CONSTANTS) {
            dst.vs_constants = self.state.vs_constants.clone();
        }
        if flags.contains(CaptureFlags::PS_CONSTANTS) {
            dst.ps_constants = self.state.ps_constants.clone();
        }
        if flags.contains(CaptureFlags::STREAMS) {
            dst.streams = self.state.streams.clone();
        }
        if flags.contains(CaptureFlags::INDICES) {
            dst.indices = self.state.indices.clone();
        }
        if flags.contains(CaptureFlags::VERTEX_DECL) {
            dst.vertex_decl = self.state.vertex_decl.clone();
        }
        if flags.contains(CaptureFlags::CLIP_PLANES) {
            dst.clip_planes = self.state.clip_planes;
        }

        DirtyFlags9::all()
    }

    // Recorder entry points, used while the device is between
    // Begin/EndStateBlock: each stores the mutation into the block instead
    // of the device state.

    pub fn record_render_state(&mut self, id: u32, value: u32) {
        if let Some(slot) = self.state.render_states.get_mut(id as usize) {
            *slot = value;
            self.captures.render_states[id as usize] = true;
        }
    }

    pub fn record_sampler_state(&mut self, sampler: u32, id: u32, value: u32) {
        if sampler as usize >= SAMPLER_COUNT || id as usize >= SAMPLER_STATE_COUNT {
            return;
        }
        self.state.sampler_states[sampler as usize][id as usize] = value;
        self.captures.samplers[sampler as usize] = true;
    }

    pub fn record_texture_stage_state(&mut self, stage: u32, id: u32, value: u32) {
        if stage as usize >= TEXTURE_STAGE_COUNT || id as usize >= TEXTURE_STAGE_STATE_COUNT {
            return;
        }
        self.state.texture_stage_states[stage as usize][id as usize] = value;
        self.captures.texture_stages[stage as usize] = true;
    }

    pub fn record_texture(&mut self, slot: u32, texture: Option<Arc<Texture9>>) {
        if let Some(dst) = self.state.textures.get_mut(slot as usize) {
            *dst = texture;
            self.captures.textures[slot as usize] = true;
        }
    }

    pub fn record_transform(&mut self, transform_state: u32, matrix: [f32; 16]) {
        if let Some(index) = transform_index(transform_state) {
            self.state.transforms[index] = matrix;
            self.captures.flags |= CaptureFlags::TRANSFORMS;
        }
    }

    pub fn record_vertex_shader(&mut self, shader: Option<Arc<Shader>>) {
        self.state.vertex_shader = shader;
        self.captures.flags |= CaptureFlags::SHADER_VS;
    }

    pub fn record_pixel_shader(&mut self, shader: Option<Arc<Shader>>) {
        self.state.pixel_shader = shader;
        self.captures.flags |= CaptureFlags::SHADER_PS;
    }

    pub fn record_vertex_decl(&mut self, declaration: Option<Arc<VertexDeclaration9>>) {
        self.state.vertex_decl = declaration;
        self.captures.flags |= CaptureFlags::VERTEX_DECL;
    }

    pub fn record_indices(&mut self, indices: Option<Arc<Buffer9>>) {
        self.state.indices = indices;
        self.captures.flags |= CaptureFlags::INDICES;
    }

    pub fn record_vs_constants_f(&mut self, start: u32, data: &[[f32; 4]]) {
        for (i, value) in data.iter().enumerate() {
            if let Some(slot) = self.state.vs_constants.float.get_mut(start as usize + i) {
                *slot = *value;
            }
        }
        self.captures.flags |= CaptureFlags::VS_CONSTANTS;
    }

    pub fn record_ps_constants_f(&mut self, start: u32, data: &[[f32; 4]]) {
        for (i, value) in data.iter().enumerate() {
            if let Some(slot) = self.state.ps_constants.float.get_mut(start as usize + i) {
                *slot = *value;
            }
        }
        self.captures.flags |= CaptureFlags::PS_CONSTANTS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_then_apply_is_identity_on_the_captured_subset() {
        let mut device_state = State9::default();
        device_state.render_states[rs::ALPHABLENDENABLE as usize] = 1;

        let mut block = StateBlock9::new(StateBlockType9::All);
        block.capture(&device_state);

        // Mutate the device state after the capture.
        device_state.render_states[rs::ALPHABLENDENABLE as usize] = 0;
        device_state.render_states[rs::SRCBLEND as usize] = 5;

        let dirty = block.apply(&mut device_state);
        assert_eq!(
            device_state.render_states[rs::ALPHABLENDENABLE as usize],
            1
        );
        assert_eq!(dirty, DirtyFlags9::all());
    }

    #[test]
    fn pixel_blocks_leave_vertex_state_alone() {
        let mut device_state = State9::default();
        let mut block = StateBlock9::new(StateBlockType9::PixelState);
        block.capture(&device_state);

        device_state.render_states[rs::LIGHTING as usize] = 0;
        device_state.render_states[rs::ALPHAREF as usize] = 0x7F;

        block.apply(&mut device_state);
        // LIGHTING is vertex state, so the apply must not touch it.
        assert_eq!(device_state.render_states[rs::LIGHTING as usize], 0);
        // ALPHAREF is pixel state, so the captured default wins.
        assert_eq!(device_state.render_states[rs::ALPHAREF as usize], 0);
    }

    #[test]
    fn recorder_marks_only_recorded_states() {
        let mut block = StateBlock9::new(StateBlockType9::Custom);
        block.record_render_state(rs::SRCBLEND, 5);

        let mut device_state = State9::default();
        device_state.render_states[rs::DESTBLEND as usize] = 9;

        block.apply(&mut device_state);
        assert_eq!(device_state.render_states[rs::SRCBLEND as usize], 5);
        // Unrecorded states keep their device values.
        assert_eq!(device_state.render_states[rs::DESTBLEND as usize], 9);
    }
}

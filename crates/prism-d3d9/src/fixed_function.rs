//! Fixed-function shader keys and the generated-module cache.
//!
//! The keys capture exactly the state tuple that influences generated
//! code; the cache is a monotonic map from key to compiled module. Code
//! generation itself happens in the external shader generator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use prism_gpu::{Device, GpuError, Shader};

use crate::state::{rs, tss, State9, TEXTURE_STAGE_COUNT};

/// Where a material color channel comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaterialSource {
    Material,
    VertexColor0,
    VertexColor1,
}

fn material_source(value: u32) -> MaterialSource {
    match value {
        1 => MaterialSource::VertexColor0,
        2 => MaterialSource::VertexColor1,
        _ => MaterialSource::Material,
    }
}

/// Fog configuration shared by both generated stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FogKey {
    pub enabled: bool,
    pub table_mode: u32,
    pub vertex_mode: u32,
    pub range_fog: bool,
}

/// The state tuple a generated vertex module depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FfVertexKey {
    pub lighting: bool,
    pub light_count: u8,
    pub color_vertex: bool,
    pub normalize_normals: bool,
    pub specular_enable: bool,
    pub diffuse_source: MaterialSource,
    pub specular_source: MaterialSource,
    pub ambient_source: MaterialSource,
    pub emissive_source: MaterialSource,
    pub fog: FogKey,
    /// Pre-transformed position input (POSITIONT).
    pub position_t: bool,
    /// Texture-coordinate transform flags per stage.
    pub texcoord_transform: [u8; TEXTURE_STAGE_COUNT],
}

/// One texture stage of the generated pixel module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FfStageKey {
    pub color_op: u8,
    pub color_arg1: u8,
    pub color_arg2: u8,
    pub alpha_op: u8,
    pub alpha_arg1: u8,
    pub alpha_arg2: u8,
    pub bound_texture: bool,
}

/// The state tuple a generated pixel module depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FfPixelKey {
    pub stages: [FfStageKey; TEXTURE_STAGE_COUNT],
    pub specular_enable: bool,
    pub fog: FogKey,
}

/// Builds the vertex key from the live state vector.
pub fn vertex_key(state: &State9, position_t: bool) -> FfVertexKey {
    let rs_val = |id: u32| state.render_states[id as usize];

    let mut texcoord_transform = [0u8; TEXTURE_STAGE_COUNT];
    for (stage, flags) in texcoord_transform.iter_mut().enumerate() {
        *flags = state.texture_stage_states[stage][tss::TEXTURETRANSFORMFLAGS as usize] as u8;
    }

    FfVertexKey {
        lighting: rs_val(rs::LIGHTING) != 0,
        light_count: state.enabled_lights.len().min(8) as u8,
        color_vertex: rs_val(rs::COLORVERTEX) != 0,
        normalize_normals: rs_val(rs::NORMALIZENORMALS) != 0,
        specular_enable: rs_val(rs::SPECULARENABLE) != 0,
        diffuse_source: material_source(rs_val(rs::DIFFUSEMATERIALSOURCE)),
        specular_source: material_source(rs_val(rs::SPECULARMATERIALSOURCE)),
        ambient_source: material_source(rs_val(rs::AMBIENTMATERIALSOURCE)),
        emissive_source: material_source(rs_val(rs::EMISSIVEMATERIALSOURCE)),
        fog: fog_key(state),
        position_t,
        texcoord_transform,
    }
}

/// Builds the pixel key from the live state vector.
pub fn pixel_key(state: &State9) -> FfPixelKey {
    let mut stages = [FfStageKey {
        color_op: 0,
        color_arg1: 0,
        color_arg2: 0,
        alpha_op: 0,
        alpha_arg1: 0,
        alpha_arg2: 0,
        bound_texture: false,
    }; TEXTURE_STAGE_COUNT];

    for (i, stage) in stages.iter_mut().enumerate() {
        let tss_state = &state.texture_stage_states[i];
        *stage = FfStageKey {
            color_op: tss_state[tss::COLOROP as usize] as u8,
            color_arg1: tss_state[tss::COLORARG1 as usize] as u8,
            color_arg2: tss_state[tss::COLORARG2 as usize] as u8,
            alpha_op: tss_state[tss::ALPHAOP as usize] as u8,
            alpha_arg1: tss_state[tss::ALPHAARG1 as usize] as u8,
            alpha_arg2: tss_state[tss::ALPHAARG2 as usize] as u8,
            bound_texture: state.textures[i].is_some(),
        };
    }

    FfPixelKey {
        stages,
        specular_enable: state.render_states[rs::SPECULARENABLE as usize] != 0,
        fog: fog_key(state),
    }
}

fn fog_key(state: &State9) -> FogKey {
    let rs_val = |id: u32| state.render_states[id as usize];
    FogKey {
        enabled: rs_val(rs::FOGENABLE) != 0,
        table_mode: rs_val(rs::FOGTABLEMODE),
        vertex_mode: rs_val(rs::FOGVERTEXMODE),
        range_fog: rs_val(rs::RANGEFOGENABLE) != 0,
    }
}

/// The external generator that turns a key into a compiled module.
pub trait FfShaderProvider: Send + Sync {
    fn compile_vertex(&self, device: &Device, key: &FfVertexKey) -> Result<Arc<Shader>, GpuError>;
    fn compile_pixel(&self, device: &Device, key: &FfPixelKey) -> Result<Arc<Shader>, GpuError>;
}

/// Monotonic cache from fixed-function key to compiled module.
pub struct FfShaderCache {
    provider: Arc<dyn FfShaderProvider>,
    vertex: Mutex<HashMap<FfVertexKey, Arc<Shader>>>,
    pixel: Mutex<HashMap<FfPixelKey, Arc<Shader>>>,
}

impl FfShaderCache {
    pub fn new(provider: Arc<dyn FfShaderProvider>) -> Self {
        Self {
            provider,
            vertex: Mutex::new(HashMap::new()),
            pixel: Mutex::new(HashMap::new()),
        }
    }

    pub fn vertex_module(
        &self,
        device: &Device,
        key: &FfVertexKey,
    ) -> Result<Arc<Shader>, GpuError> {
        if let Some(shader) = self.vertex.lock().unwrap().get(key) {
            return Ok(Arc::clone(shader));
        }
        let shader = self.provider.compile_vertex(device, key)?;
        self.vertex
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert(shader.clone());
        Ok(shader)
    }

    pub fn pixel_module(&self, device: &Device, key: &FfPixelKey) -> Result<Arc<Shader>, GpuError> {
        if let Some(shader) = self.pixel.lock().unwrap().get(key) {
            return Ok(Arc::clone(shader));
        }
        let shader = self.provider.compile_pixel(device, key)?;
        self.pixel
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert(shader.clone());
        Ok(shader)
    }

    pub fn vertex_module_count(&self) -> usize {
        self.vertex.lock().unwrap().len()
    }

    pub fn pixel_module_count(&self) -> usize {
        self.pixel.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_key_reflects_lighting_state() {
        let mut state = State9::default();
        let lit = vertex_key(&state, false);
        assert!(lit.lighting);

        state.render_states[rs::LIGHTING as usize] = 0;
        let unlit = vertex_key(&state, false);
        assert!(!unlit.lighting);
        assert_ne!(lit, unlit);
    }

    #[test]
    fn pixel_key_tracks_stage_ops_and_bound_textures() {
        let mut state = State9::default();
        let a = pixel_key(&state);

        state.texture_stage_states[1][tss::COLOROP as usize] = 4;
        let b = pixel_key(&state);
        assert_ne!(a, b);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::error::GpuError;

/// Uniform-buffer slots per stage in the fixed binding model.
pub const MAX_UNIFORM_SLOTS: u32 = 8;
/// Sampled-image slots per stage.
pub const MAX_TEXTURE_SLOTS: u32 = 16;
/// Sampler slots per stage.
pub const MAX_SAMPLER_SLOTS: u32 = 16;

/// Options handed through to the external bytecode compiler. The core does
/// not interpret these; they come from the same configuration bag as the
/// runtime options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderCompileOptions {
    /// Disable the parser optimization for integer division.
    pub strict_division: bool,
    /// Emit bounds checks around constant-buffer fetches.
    pub constant_buffer_range_check: bool,
    /// Zero-initialize workgroup shared memory.
    pub zero_init_workgroup_memory: bool,
    /// Force raw storage buffers for structured resource views.
    pub use_raw_ssbo: bool,
    /// Tessellation-factor clamp applied when compiling hull shaders.
    /// Zero leaves factors unclamped.
    pub max_tess_factor: u32,
}

/// Shader stages the core records commands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// One element of a shader's input signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    /// Input location the compiled module reads the attribute from.
    pub location: u32,
}

/// A range of constants the compiler asks the runtime to copy into the
/// constant block verbatim (immediate constants defined in bytecode).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShaderConstantCopy {
    pub register: u32,
    pub data: [f32; 4],
}

/// Metadata record the external bytecode compiler returns alongside the
/// SPIR-V module.
#[derive(Clone, Debug, Default)]
pub struct ShaderMetadata {
    pub input_signature: Vec<SignatureElement>,
    /// Highest float constant register the shader reads, plus one.
    pub max_float_const: u32,
    /// Highest integer constant register the shader reads, plus one.
    pub max_int_const: u32,
    /// Highest boolean constant register the shader reads, plus one.
    pub max_bool_const: u32,
    /// Whether the shader indexes the constant block with a runtime value.
    /// When set, constant uploads must cover the full range.
    pub relative_addressing: bool,
    pub constant_copies: Vec<ShaderConstantCopy>,
}

impl ShaderMetadata {
    /// Whether the input signature consumes `(semantic, index)`.
    pub fn uses_semantic(&self, name: &str, index: u32) -> Option<&SignatureElement> {
        self.input_signature
            .iter()
            .find(|e| e.semantic_index == index && e.semantic_name.eq_ignore_ascii_case(name))
    }
}

static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);

/// A compiled shader module plus the compiler's metadata.
///
/// Modules are created on producer threads; the raw handle is only handed
/// to pipeline creation, which the pipeline cache serializes.
pub struct Shader {
    id: u64,
    stage: ShaderStage,
    module: vk::ShaderModule,
    metadata: ShaderMetadata,
    device: ash::Device,
}

impl Shader {
    pub fn new(
        device: ash::Device,
        stage: ShaderStage,
        spirv: &[u32],
        metadata: ShaderMetadata,
    ) -> Result<Self, GpuError> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { device.create_shader_module(&info, None) }?;

        Ok(Self {
            id: NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed),
            stage,
            module,
            metadata,
            device,
        })
    }

    /// Stable id used as the pipeline-cache key component for this module.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn metadata(&self) -> &ShaderMetadata {
        &self.metadata
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .finish()
    }
}

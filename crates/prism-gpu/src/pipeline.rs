use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use crate::error::GpuError;
use crate::shader::{
    Shader, ShaderStage, MAX_SAMPLER_SLOTS, MAX_TEXTURE_SLOTS, MAX_UNIFORM_SLOTS,
};

/// Maximum simultaneously bound render targets.
pub const MAX_RENDER_TARGETS: usize = 8;

/// Blend configuration of one render-target slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendMode {
    pub enable: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

impl Default for BlendMode {
    fn default() -> Self {
        Self {
            enable: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

/// Stencil behavior for one face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilOps {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
}

impl Default for StencilOps {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_test: bool,
    pub front: StencilOps,
    pub back: StencilOps,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS,
            stencil_test: false,
            front: StencilOps::default(),
            back: StencilOps::default(),
        }
    }
}

/// Rasterizer configuration. Depth-bias values are dynamic state and not
/// part of the pipeline key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterizerState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_bias_enable: bool,
    pub depth_clip_enable: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_bias_enable: false,
            depth_clip_enable: true,
        }
    }
}

/// Depth-bias values; applied as dynamic state so they never fragment the
/// pipeline cache.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MultisampleState {
    pub sample_count: vk::SampleCountFlags,
    pub sample_mask: u32,
    pub alpha_to_coverage: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            sample_count: vk::SampleCountFlags::TYPE_1,
            sample_mask: u32::MAX,
            alpha_to_coverage: false,
        }
    }
}

/// One vertex-buffer binding of the input layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
    /// Instance divisor; meaningful only for per-instance bindings.
    pub divisor: u32,
}

/// One vertex attribute of the input layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// A compacted vertex input layout: only bindings referenced by at least
/// one attribute appear.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

/// Everything that selects a graphics pipeline variant.
///
/// Viewport, scissor, blend constants, stencil reference/masks and depth
/// bias are dynamic and deliberately absent.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub vertex_shader: u64,
    pub pixel_shader: u64,
    pub input_layout: InputLayout,
    pub topology: vk::PrimitiveTopology,
    pub blend: [BlendMode; MAX_RENDER_TARGETS],
    pub depth_stencil: DepthStencilState,
    pub rasterizer: RasterizerState,
    pub multisample: MultisampleState,
    pub color_formats: [vk::Format; MAX_RENDER_TARGETS],
    pub depth_format: vk::Format,
}

/// Owns the fixed binding model and the monotonic pipeline caches.
///
/// The binding model is two descriptor sets (vertex, fragment), each with
/// uniform buffers, sampled images and samplers at fixed binding offsets;
/// compiled modules follow this convention. Null descriptors cover unused
/// slots, so the device must be created with `robustness2.nullDescriptor`.
pub struct PipelineManager {
    device: ash::Device,
    set_layouts: [vk::DescriptorSetLayout; 2],
    pipeline_layout: vk::PipelineLayout,
    graphics: Mutex<HashMap<GraphicsPipelineKey, vk::Pipeline>>,
    compute: Mutex<HashMap<u64, vk::Pipeline>>,
}

/// Binding offset of sampled images within a per-stage descriptor set.
pub const BINDING_TEXTURES: u32 = MAX_UNIFORM_SLOTS;
/// Binding offset of samplers within a per-stage descriptor set.
pub const BINDING_SAMPLERS: u32 = MAX_UNIFORM_SLOTS + MAX_TEXTURE_SLOTS;

/// Push-constant block shared with generated shaders (alpha-test state).
pub const PUSH_CONSTANT_SIZE: u32 = 16;

impl PipelineManager {
    pub fn new(device: ash::Device) -> Result<Self, GpuError> {
        let vs_layout = create_stage_set_layout(&device, vk::ShaderStageFlags::VERTEX)?;
        let fs_layout = create_stage_set_layout(&device, vk::ShaderStageFlags::FRAGMENT)?;

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE);

        let set_layouts = [vs_layout, fs_layout];
        let ranges = [push_range];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;

        Ok(Self {
            device,
            set_layouts,
            pipeline_layout,
            graphics: Mutex::new(HashMap::new()),
            compute: Mutex::new(HashMap::new()),
        })
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn set_layout(&self, stage: ShaderStage) -> vk::DescriptorSetLayout {
        match stage {
            ShaderStage::Vertex => self.set_layouts[0],
            _ => self.set_layouts[1],
        }
    }

    /// Looks up or creates the graphics pipeline for `key`. The cache is
    /// monotonic; pipelines live until the manager is destroyed.
    pub fn get_graphics(
        &self,
        key: &GraphicsPipelineKey,
        vertex_shader: &Arc<Shader>,
        pixel_shader: &Arc<Shader>,
    ) -> Result<vk::Pipeline, GpuError> {
        if let Some(&pipeline) = self.graphics.lock().unwrap().get(key) {
            return Ok(pipeline);
        }

        let pipeline = self.create_graphics(key, vertex_shader, pixel_shader)?;

        let mut cache = self.graphics.lock().unwrap();
        // A concurrent miss may have created the same variant; keep the
        // first one.
        match cache.get(key) {
            Some(&existing) => {
                unsafe { self.device.destroy_pipeline(pipeline, None) };
                Ok(existing)
            }
            None => {
                debug!(count = cache.len() + 1, "compiled graphics pipeline variant");
                cache.insert(key.clone(), pipeline);
                Ok(pipeline)
            }
        }
    }

    /// Looks up or creates the compute pipeline for a compute shader.
    pub fn get_compute(&self, shader: &Arc<Shader>) -> Result<vk::Pipeline, GpuError> {
        if let Some(&pipeline) = self.compute.lock().unwrap().get(&shader.id()) {
            return Ok(pipeline);
        }

        let entry = c"main";
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module())
            .name(entry);

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.pipeline_layout);

        let pipeline = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, err)| GpuError::Vulkan(err))?[0];

        self.compute.lock().unwrap().insert(shader.id(), pipeline);
        Ok(pipeline)
    }

    fn create_graphics(
        &self,
        key: &GraphicsPipelineKey,
        vertex_shader: &Arc<Shader>,
        pixel_shader: &Arc<Shader>,
    ) -> Result<vk::Pipeline, GpuError> {
        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_shader.module())
                .name(entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(pixel_shader.module())
                .name(entry),
        ];

        let bindings: Vec<vk::VertexInputBindingDescription> = key
            .input_layout
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: b.input_rate,
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = key
            .input_layout
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(key.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(key.rasterizer.polygon_mode)
            .cull_mode(key.rasterizer.cull_mode)
            .front_face(key.rasterizer.front_face)
            .depth_bias_enable(key.rasterizer.depth_bias_enable)
            .depth_clamp_enable(!key.rasterizer.depth_clip_enable)
            .line_width(1.0);

        let sample_mask = [key.multisample.sample_mask];
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(key.multisample.sample_count)
            .sample_mask(&sample_mask)
            .alpha_to_coverage_enable(key.multisample.alpha_to_coverage);

        let ds = &key.depth_stencil;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(ds.depth_test)
            .depth_write_enable(ds.depth_test && ds.depth_write)
            .depth_compare_op(ds.depth_compare)
            .stencil_test_enable(ds.stencil_test)
            .front(stencil_op_state(ds.front))
            .back(stencil_op_state(ds.back));

        let color_count = key
            .color_formats
            .iter()
            .filter(|&&f| f != vk::Format::UNDEFINED)
            .count();

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = key.blend
            [..color_count]
            .iter()
            .map(|b| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(b.enable)
                    .src_color_blend_factor(b.src_color)
                    .dst_color_blend_factor(b.dst_color)
                    .color_blend_op(b.color_op)
                    .src_alpha_blend_factor(b.src_alpha)
                    .dst_alpha_blend_factor(b.dst_alpha)
                    .alpha_blend_op(b.alpha_op)
                    .color_write_mask(b.write_mask)
            })
            .collect();

        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::STENCIL_REFERENCE,
            vk::DynamicState::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_WRITE_MASK,
            vk::DynamicState::DEPTH_BIAS,
        ];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = &key.color_formats[..color_count];
        let stencil_format = if crate::format::format_aspect(key.depth_format)
            .contains(vk::ImageAspectFlags::STENCIL)
        {
            key.depth_format
        } else {
            vk::Format::UNDEFINED
        };
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(color_formats)
            .depth_attachment_format(key.depth_format)
            .stencil_attachment_format(stencil_format);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(self.pipeline_layout)
            .push_next(&mut rendering);

        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, err)| GpuError::Vulkan(err))?[0];

        Ok(pipeline)
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        unsafe {
            for (_, pipeline) in self.graphics.get_mut().unwrap().drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, pipeline) in self.compute.get_mut().unwrap().drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            for layout in self.set_layouts {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

fn stencil_op_state(ops: StencilOps) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: ops.fail_op,
        pass_op: ops.pass_op,
        depth_fail_op: ops.depth_fail_op,
        compare_op: ops.compare_op,
        // Compare mask, write mask and reference are dynamic.
        compare_mask: 0,
        write_mask: 0,
        reference: 0,
    }
}

fn create_stage_set_layout(
    device: &ash::Device,
    stage: vk::ShaderStageFlags,
) -> Result<vk::DescriptorSetLayout, GpuError> {
    let mut bindings = Vec::new();

    for slot in 0..MAX_UNIFORM_SLOTS {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(slot)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(stage),
        );
    }
    for slot in 0..MAX_TEXTURE_SLOTS {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_TEXTURES + slot)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(stage),
        );
    }
    for slot in 0..MAX_SAMPLER_SLOTS {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_SAMPLERS + slot)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(stage),
        );
    }

    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&info, None) }?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_key_distinguishes_blend_state() {
        let base = GraphicsPipelineKey {
            vertex_shader: 1,
            pixel_shader: 2,
            input_layout: InputLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            blend: [BlendMode::default(); MAX_RENDER_TARGETS],
            depth_stencil: DepthStencilState::default(),
            rasterizer: RasterizerState::default(),
            multisample: MultisampleState::default(),
            color_formats: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS],
            depth_format: vk::Format::UNDEFINED,
        };

        let mut blended = base.clone();
        blended.blend[0].enable = true;

        assert_ne!(base, blended);
    }

    #[test]
    fn default_blend_mode_writes_all_channels() {
        assert_eq!(
            BlendMode::default().write_mask,
            vk::ColorComponentFlags::RGBA
        );
        assert!(!BlendMode::default().enable);
    }
}

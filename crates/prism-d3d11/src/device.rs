use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

use ash::vk;
use tracing::{error, warn};

use prism_gpu::{
    Device, GpuError, ImageViewCreateInfo, Shader, ShaderMetadata, ShaderStage, Status,
};

use crate::context_def::DeferredContext;
use crate::context_imm::ImmediateContext;
use crate::format::{lookup_format, DxgiFormat};
use crate::options::Options11;
use crate::query::{Query11, QueryDesc};
use crate::resource::{
    BindFlags, Buffer11, BufferDesc, DepthStencilView11, InputElementDesc, InputLayout11,
    RenderTargetView11, ShaderResourceView11, Texture11, TextureDesc,
};

/// Advertised feature levels, ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureLevel {
    Level9_1,
    Level9_3,
    Level10_0,
    Level10_1,
    Level11_0,
    Level11_1,
}

impl FeatureLevel {
    fn from_index(index: u32) -> Self {
        match index {
            0 => FeatureLevel::Level9_1,
            1 => FeatureLevel::Level9_3,
            2 => FeatureLevel::Level10_0,
            3 => FeatureLevel::Level10_1,
            4 => FeatureLevel::Level11_0,
            _ => FeatureLevel::Level11_1,
        }
    }

    fn index(self) -> u32 {
        match self {
            FeatureLevel::Level9_1 => 0,
            FeatureLevel::Level9_3 => 1,
            FeatureLevel::Level10_0 => 2,
            FeatureLevel::Level10_1 => 3,
            FeatureLevel::Level11_0 => 4,
            FeatureLevel::Level11_1 => 5,
        }
    }
}

/// The version-11 device surface: resource, view, shader and query
/// creation, plus the feature-level bookkeeping.
pub struct Device11 {
    core: Device,
    options: Options11,
    feature_level: AtomicU32,
    max_feature_level: FeatureLevel,
}

impl Device11 {
    pub fn new(core: Device, options: Options11) -> Arc<Self> {
        let max_feature_level = match options.max_feature_level {
            Some((11, 1)) | None => FeatureLevel::Level11_1,
            Some((11, _)) => FeatureLevel::Level11_0,
            Some((10, 1)) => FeatureLevel::Level10_1,
            Some((10, _)) => FeatureLevel::Level10_0,
            Some((9, 3)) => FeatureLevel::Level9_3,
            Some((9, _)) => FeatureLevel::Level9_1,
            Some(_) => FeatureLevel::Level11_1,
        };

        Arc::new(Self {
            core,
            options,
            feature_level: AtomicU32::new(
                FeatureLevel::Level11_0.min(max_feature_level).index(),
            ),
            max_feature_level,
        })
    }

    pub fn core(&self) -> &Device {
        &self.core
    }

    pub fn options(&self) -> &Options11 {
        &self.options
    }

    pub fn feature_level(&self) -> FeatureLevel {
        FeatureLevel::from_index(self.feature_level.load(Ordering::Acquire))
    }

    /// Sticky device-removed state, surfaced on the reason query path.
    pub fn device_removed_reason(&self) -> Status {
        if self.core.is_lost() {
            Status::DEVICE_REMOVED
        } else {
            Status::OK
        }
    }

    pub fn create_immediate_context(&self) -> ImmediateContext {
        ImmediateContext::new(self.core.clone(), self.options.clone())
    }

    pub fn create_deferred_context(&self) -> DeferredContext {
        DeferredContext::new(self.core.clone())
    }

    /// Applies the feature level of a context-state object. Raising is
    /// honored up to the configured cap; a downgrade preserves the current
    /// level.
    pub fn apply_context_state_level(&self, requested: FeatureLevel) -> FeatureLevel {
        let current = self.feature_level();
        if requested > current {
            let applied = requested.min(self.max_feature_level);
            self.feature_level.store(applied.index(), Ordering::Release);
            applied
        } else {
            current
        }
    }

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<Arc<Buffer11>, Status> {
        if desc.byte_width == 0 {
            return Err(Status::INVALID_CALL);
        }
        Buffer11::new(&self.core, desc).map_err(|err| creation_status(&err))
    }

    pub fn create_texture(&self, desc: TextureDesc) -> Result<Arc<Texture11>, Status> {
        if desc.width == 0 || desc.mip_levels > 16 {
            return Err(Status::INVALID_CALL);
        }
        Texture11::new(&self.core, desc).map_err(|err| creation_status(&err))
    }

    pub fn create_render_target_view(
        &self,
        texture: &Arc<Texture11>,
        format: Option<DxgiFormat>,
        mip_slice: u32,
        first_layer: u32,
        layer_count: u32,
    ) -> Result<Arc<RenderTargetView11>, Status> {
        let format = format.unwrap_or(texture.desc().format);
        let view = self
            .create_view(texture, format, vk::ImageAspectFlags::COLOR, mip_slice, 1, first_layer, layer_count)?;
        Ok(Arc::new(RenderTargetView11 { view, format }))
    }

    pub fn create_depth_stencil_view(
        &self,
        texture: &Arc<Texture11>,
        format: Option<DxgiFormat>,
        mip_slice: u32,
        first_layer: u32,
        layer_count: u32,
    ) -> Result<Arc<DepthStencilView11>, Status> {
        let format = format.unwrap_or(texture.desc().format);
        let aspect = lookup_format(format).info.aspect_mask;
        let view =
            self.create_view(texture, format, aspect, mip_slice, 1, first_layer, layer_count)?;
        Ok(Arc::new(DepthStencilView11 { view, format }))
    }

    /// Depth-stencil views of buffers are invalid, but known applications
    /// rely on the call succeeding; return no object instead of failing.
    pub fn create_depth_stencil_view_for_buffer(
        &self,
        _buffer: &Arc<Buffer11>,
    ) -> (Status, Option<Arc<DepthStencilView11>>) {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            warn!("depth-stencil view requested for a buffer resource; returning no object");
        });
        (Status::OK, None)
    }

    pub fn create_shader_resource_view(
        &self,
        texture: &Arc<Texture11>,
        format: Option<DxgiFormat>,
        first_mip: u32,
        mip_count: u32,
        first_layer: u32,
        layer_count: u32,
    ) -> Result<Arc<ShaderResourceView11>, Status> {
        if !texture.desc().bind_flags.contains(BindFlags::SHADER_RESOURCE) {
            return Err(Status::INVALID_CALL);
        }
        let format = format.unwrap_or(texture.desc().format);
        let mapping = lookup_format(format);
        // Sampling a combined depth-stencil image reads the depth aspect.
        let aspect = if mapping
            .info
            .aspect_mask
            .contains(vk::ImageAspectFlags::DEPTH)
        {
            vk::ImageAspectFlags::DEPTH
        } else {
            mapping.info.aspect_mask
        };
        let view = self.create_view(
            texture,
            format,
            aspect,
            first_mip,
            mip_count,
            first_layer,
            layer_count,
        )?;
        Ok(Arc::new(ShaderResourceView11 { view, format }))
    }

    pub fn create_input_layout(
        &self,
        elements: Vec<InputElementDesc>,
    ) -> Result<Arc<InputLayout11>, Status> {
        if elements.len() > 32 {
            return Err(Status::INVALID_CALL);
        }
        Ok(InputLayout11::new(elements))
    }

    /// Wraps a compiled SPIR-V module and the compiler's metadata record.
    /// The bytecode-to-SPIR-V translation itself happens in the external
    /// compiler, on this thread.
    pub fn create_shader(
        &self,
        stage: ShaderStage,
        spirv: &[u32],
        metadata: ShaderMetadata,
    ) -> Result<Arc<Shader>, Status> {
        if spirv.is_empty() {
            return Err(Status::INVALID_CALL);
        }
        self.core
            .create_shader(stage, spirv, metadata)
            .map_err(|err| Status::from(&err))
    }

    pub fn create_query(&self, desc: QueryDesc) -> Result<Arc<Query11>, Status> {
        Query11::new(&self.core, desc).map_err(|err| Status::from(&err))
    }

    /// Reports the number of quality levels for a format/sample-count pair.
    pub fn check_multisample_quality_levels(
        &self,
        format: DxgiFormat,
        sample_count: u32,
    ) -> Result<u32, Status> {
        if sample_count == 0 {
            return Err(Status::INVALID_CALL);
        }
        if format == DxgiFormat::Unknown {
            return if sample_count == 1 {
                Ok(1)
            } else {
                Err(Status::INVALID_CALL)
            };
        }
        if sample_count > 32 || !sample_count.is_power_of_two() {
            return Ok(0);
        }
        Ok(1)
    }

    /// Cross-process shared resources are not modeled by the core.
    pub fn open_shared_resource(&self) -> Status {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            error!("shared resources are not supported");
        });
        Status::NOT_IMPLEMENTED
    }

    #[allow(clippy::too_many_arguments)]
    fn create_view(
        &self,
        texture: &Arc<Texture11>,
        format: DxgiFormat,
        aspect: vk::ImageAspectFlags,
        first_mip: u32,
        mip_count: u32,
        first_layer: u32,
        layer_count: u32,
    ) -> Result<Arc<prism_gpu::ImageView>, Status> {
        let mapping = lookup_format(format);
        if !texture.image().is_view_compatible(mapping.format) {
            return Err(Status::INVALID_CALL);
        }

        let view_type = match (texture.desc().dimension, layer_count) {
            (1, 1) => vk::ImageViewType::TYPE_1D,
            (1, _) => vk::ImageViewType::TYPE_1D_ARRAY,
            (3, _) => vk::ImageViewType::TYPE_3D,
            (_, 1) => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_2D_ARRAY,
        };

        self.core
            .create_image_view(
                Arc::clone(texture.image()),
                ImageViewCreateInfo {
                    view_type,
                    format: mapping.format,
                    aspect,
                    min_level: first_mip,
                    num_levels: mip_count.max(1),
                    min_layer: first_layer,
                    num_layers: layer_count.max(1),
                    swizzle: mapping.swizzle,
                },
            )
            .map_err(|err| Status::from(&err))
    }
}

/// Resource-creation failures report OUT_OF_VIDEO_MEMORY for exhaustion and
/// INVALID_CALL otherwise.
fn creation_status(err: &GpuError) -> Status {
    match err {
        GpuError::OutOfDeviceMemory { .. } => Status::OUT_OF_VIDEO_MEMORY,
        other => Status::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_levels_are_ordered() {
        assert!(FeatureLevel::Level11_0 > FeatureLevel::Level10_1);
        assert!(FeatureLevel::Level9_1 < FeatureLevel::Level9_3);
    }

    #[test]
    fn feature_level_round_trips_through_index() {
        for level in [
            FeatureLevel::Level9_1,
            FeatureLevel::Level10_0,
            FeatureLevel::Level11_1,
        ] {
            assert_eq!(FeatureLevel::from_index(level.index()), level);
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use crate::buffer::{Buffer, BufferCreateInfo};
use crate::context::NativeContext;
use crate::cs::CsThread;
use crate::error::GpuError;
use crate::image::{Image, ImageCreateInfo, ImageView, ImageViewCreateInfo};
use crate::memory::{MemoryAllocator, MemoryStats};
use crate::options::GpuOptions;
use crate::pipeline::PipelineManager;
use crate::query::{Query, QueryAllocator, QueryData, QueryKind};
use crate::shader::{Shader, ShaderMetadata, ShaderStage};
use crate::submission::SubmissionTracker;

/// Everything the embedder hands the core at device creation. Instance and
/// physical-device selection stay outside the core.
pub struct DeviceCreateInfo {
    pub device: ash::Device,
    pub queue_family_index: u32,
    pub queue: vk::Queue,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Whether `VK_EXT_memory_priority` was enabled.
    pub memory_priority: bool,
    pub options: GpuOptions,
}

/// The sampler state tuple the translator hashes bindings into.
///
/// Floats are carried as raw bits so the key is hashable; they only ever
/// come from application state, so bit equality is the right notion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
    pub mip_lod_bias_bits: u32,
    /// 0 disables anisotropy.
    pub max_anisotropy: u32,
    pub compare_op: vk::CompareOp,
    pub border_color: vk::BorderColor,
    pub min_lod_bits: u32,
    pub max_lod_bits: u32,
}

impl Default for SamplerKey {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_u: vk::SamplerAddressMode::REPEAT,
            address_v: vk::SamplerAddressMode::REPEAT,
            address_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias_bits: 0f32.to_bits(),
            max_anisotropy: 0,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            min_lod_bits: 0f32.to_bits(),
            max_lod_bits: 1000f32.to_bits(),
        }
    }
}

/// A color sampler plus the matching depth-compare sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerPair {
    pub color: vk::Sampler,
    pub depth_compare: vk::Sampler,
}

struct DeviceInner {
    // Dropped first: joins the worker, which releases its own references
    // to the subsystems below.
    cs: CsThread,

    device: ash::Device,
    options: GpuOptions,
    allocator: Arc<MemoryAllocator>,
    submissions: Arc<SubmissionTracker>,
    queries: Arc<QueryAllocator>,
    pipelines: Arc<PipelineManager>,
    samplers: Mutex<HashMap<SamplerKey, SamplerPair>>,
}

/// The core device: owns the allocator, the submission queue, the worker
/// thread and the shared caches. Cheaply cloneable.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(info: DeviceCreateInfo) -> Result<Self, GpuError> {
        let allocator = Arc::new(MemoryAllocator::new(
            info.device.clone(),
            info.memory_properties,
            info.memory_priority,
        ));
        let submissions = Arc::new(SubmissionTracker::new(info.device.clone(), info.queue));
        let pipelines = Arc::new(PipelineManager::new(info.device.clone())?);
        let queries = Arc::new(QueryAllocator::new(info.device.clone()));

        let context = NativeContext::new(
            info.device.clone(),
            info.queue_family_index,
            Arc::clone(&submissions),
            Arc::clone(&pipelines),
        )?;
        let cs = CsThread::new(context);

        debug!(
            queue_family = info.queue_family_index,
            "created translation-layer device"
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                cs,
                device: info.device,
                options: info.options,
                allocator,
                submissions,
                queries,
                pipelines,
                samplers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> &GpuOptions {
        &self.inner.options
    }

    /// The command-stream worker hand-off.
    pub fn cs(&self) -> &CsThread {
        &self.inner.cs
    }

    /// Submission bookkeeping: pending count, completion queries, waits.
    pub fn submissions(&self) -> &SubmissionTracker {
        &self.inner.submissions
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.allocator.stats()
    }

    /// Sticky device-removed state.
    pub fn is_lost(&self) -> bool {
        self.inner.submissions.is_lost()
    }

    /// Blocks until the worker has drained all published chunks and every
    /// submission has completed.
    pub fn wait_for_idle(&self) {
        self.inner.cs.synchronize();
        self.inner.submissions.wait_for_idle();
    }

    pub fn create_buffer(
        &self,
        info: BufferCreateInfo,
        mem_flags: vk::MemoryPropertyFlags,
    ) -> Result<Arc<Buffer>, GpuError> {
        Buffer::new(
            self.inner.device.clone(),
            Arc::clone(&self.inner.allocator),
            info,
            mem_flags,
        )
    }

    pub fn create_image(
        &self,
        info: ImageCreateInfo,
        mem_flags: vk::MemoryPropertyFlags,
    ) -> Result<Arc<Image>, GpuError> {
        Image::new(
            self.inner.device.clone(),
            Arc::clone(&self.inner.allocator),
            info,
            mem_flags,
        )
    }

    pub fn create_image_view(
        &self,
        image: Arc<Image>,
        info: ImageViewCreateInfo,
    ) -> Result<Arc<ImageView>, GpuError> {
        ImageView::new(self.inner.device.clone(), image, info)
    }

    pub fn create_shader(
        &self,
        stage: ShaderStage,
        spirv: &[u32],
        metadata: ShaderMetadata,
    ) -> Result<Arc<Shader>, GpuError> {
        Ok(Arc::new(Shader::new(
            self.inner.device.clone(),
            stage,
            spirv,
            metadata,
        )?))
    }

    pub fn create_query(&self, kind: QueryKind) -> Result<Arc<Query>, GpuError> {
        Query::new(Arc::clone(&self.inner.queries), kind)
    }

    /// Reads back a query's data, or `None` if it is not yet available.
    pub fn query_data(&self, query: &Query) -> Result<Option<QueryData>, GpuError> {
        query.get_data(&self.inner.device, &self.inner.submissions)
    }

    /// Looks up or creates the sampler pair for a state tuple. The cache is
    /// monotonic; samplers live for the device's lifetime, so commands can
    /// carry raw handles.
    pub fn sampler(&self, key: SamplerKey) -> Result<SamplerPair, GpuError> {
        if let Some(&pair) = self.inner.samplers.lock().unwrap().get(&key) {
            return Ok(pair);
        }

        let color = self.create_sampler(&key, false)?;
        let depth_compare = self.create_sampler(&key, true)?;
        let pair = SamplerPair {
            color,
            depth_compare,
        };

        let mut cache = self.inner.samplers.lock().unwrap();
        let entry = cache.entry(key).or_insert(pair);
        if *entry != pair {
            // Lost a creation race; drop ours.
            unsafe {
                self.inner.device.destroy_sampler(color, None);
                self.inner.device.destroy_sampler(depth_compare, None);
            }
        }
        Ok(*entry)
    }

    fn create_sampler(&self, key: &SamplerKey, compare: bool) -> Result<vk::Sampler, GpuError> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(key.mag_filter)
            .min_filter(key.min_filter)
            .mipmap_mode(key.mipmap_mode)
            .address_mode_u(key.address_u)
            .address_mode_v(key.address_v)
            .address_mode_w(key.address_w)
            .mip_lod_bias(f32::from_bits(key.mip_lod_bias_bits))
            .anisotropy_enable(key.max_anisotropy > 1)
            .max_anisotropy(key.max_anisotropy.max(1) as f32)
            .compare_enable(compare)
            .compare_op(if compare {
                key.compare_op
            } else {
                vk::CompareOp::NEVER
            })
            .min_lod(f32::from_bits(key.min_lod_bits))
            .max_lod(f32::from_bits(key.max_lod_bits))
            .border_color(key.border_color);

        Ok(unsafe { self.inner.device.create_sampler(&info, None) }?)
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        // Join the worker before tearing down objects it may still record
        // with.
        self.cs.stop();

        for (_, pair) in self.samplers.get_mut().unwrap().drain() {
            unsafe {
                self.device.destroy_sampler(pair.color, None);
                self.device.destroy_sampler(pair.depth_compare, None);
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("lost", &self.is_lost())
            .finish()
    }
}

use std::sync::{Arc, Mutex};

use ash::vk;
use bitflags::bitflags;

use prism_gpu::{
    Buffer, BufferCreateInfo, Device, GpuError, Image, ImageCreateInfo, ImageView,
    ImageViewCreateInfo,
};

use crate::format::{lookup_format9, Format9, FormatMapping9};

/// Version-9 memory pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pool {
    Default,
    Managed,
    SystemMem,
    Scratch,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Usage9: u32 {
        const RENDERTARGET = 0x0000_0001;
        const DEPTHSTENCIL = 0x0000_0002;
        const DYNAMIC      = 0x0000_0200;
        const WRITEONLY    = 0x0000_0008;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        const READONLY     = 0x0000_0010;
        const DISCARD      = 0x0000_2000;
        const NOOVERWRITE  = 0x0000_1000;
        const NOSYSLOCK    = 0x0000_0800;
        const DONOTWAIT    = 0x0000_4000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc9 {
    pub kind: BufferKind,
    pub length: u32,
    pub usage: Usage9,
    pub pool: Pool,
    /// Index format; ignored for vertex buffers.
    pub format: Format9,
}

/// A version-9 vertex or index buffer.
pub struct Buffer9 {
    desc: BufferDesc9,
    buffer: Arc<Buffer>,
    /// Flags of the outstanding lock, consumed by unlock.
    lock_flags: Mutex<LockFlags>,
}

impl Buffer9 {
    pub fn new(device: &Device, desc: BufferDesc9) -> Result<Arc<Self>, GpuError> {
        let usage = match desc.kind {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        } | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;

        // Every pool the runtime models keeps buffers host-visible; the
        // performance-critical default-pool path relies on device-local
        // host-visible types where the driver offers them.
        let mut mem_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        if desc.pool == Pool::Default && !desc.usage.contains(Usage9::DYNAMIC) {
            mem_flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
        }
        if desc.pool == Pool::SystemMem || desc.pool == Pool::Scratch {
            mem_flags |= vk::MemoryPropertyFlags::HOST_CACHED;
        }

        let slice_count = if desc.usage.contains(Usage9::DYNAMIC) {
            2
        } else {
            1
        };

        let buffer = device.create_buffer(
            BufferCreateInfo {
                size: u64::from(desc.length),
                usage,
                alignment: 256,
                slice_count,
            },
            mem_flags,
        )?;

        Ok(Arc::new(Self {
            desc,
            buffer,
            lock_flags: Mutex::new(LockFlags::empty()),
        }))
    }

    pub fn desc(&self) -> &BufferDesc9 {
        &self.desc
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn set_lock_flags(&self, flags: LockFlags) -> LockFlags {
        std::mem::replace(&mut self.lock_flags.lock().unwrap(), flags)
    }
}

impl std::fmt::Debug for Buffer9 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer9")
            .field("kind", &self.desc.kind)
            .field("length", &self.desc.length)
            .field("pool", &self.desc.pool)
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc9 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u32,
    pub usage: Usage9,
    pub format: Format9,
    pub pool: Pool,
    pub sample_count: u32,
}

/// Per-subresource lock bookkeeping.
pub(crate) struct LockState {
    /// Staging buffer for the buffered lock path.
    pub staging: Option<Arc<Buffer>>,
    /// Host shadow kept for managed-pool resources between locks.
    pub shadow: Option<Vec<u8>>,
    /// Flags of the outstanding lock.
    pub lock_flags: Option<LockFlags>,
    pub outstanding_locks: u32,
}

/// A version-9 texture.
pub struct Texture9 {
    desc: TextureDesc9,
    mapping: FormatMapping9,
    image: Arc<Image>,
    /// The sampling view over all mip levels, with the format's swizzle.
    view: Arc<ImageView>,
    subresources: Mutex<Vec<LockState>>,
}

impl Texture9 {
    pub fn new(device: &Device, desc: TextureDesc9) -> Result<Arc<Self>, GpuError> {
        let mapping = lookup_format9(desc.format);

        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::SAMPLED;
        let mut layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        if desc.usage.contains(Usage9::RENDERTARGET) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
        }
        if desc.usage.contains(Usage9::DEPTHSTENCIL) {
            usage &= !vk::ImageUsageFlags::SAMPLED;
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED;
            layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        }

        let image = device.create_image(
            ImageCreateInfo {
                image_type: if desc.depth > 1 {
                    vk::ImageType::TYPE_3D
                } else {
                    vk::ImageType::TYPE_2D
                },
                format: mapping.format,
                flags: vk::ImageCreateFlags::empty(),
                sample_count: sample_count_flag(desc.sample_count),
                extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: desc.depth.max(1),
                },
                num_layers: 1,
                mip_levels: desc.levels.max(1),
                usage,
                tiling: vk::ImageTiling::OPTIMAL,
                layout,
                view_formats: Vec::new(),
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        // Sampling a depth-stencil image reads the depth aspect.
        let sample_aspect = if mapping
            .info
            .aspect_mask
            .contains(vk::ImageAspectFlags::DEPTH)
        {
            vk::ImageAspectFlags::DEPTH
        } else {
            mapping.info.aspect_mask
        };
        let view = device.create_image_view(
            Arc::clone(&image),
            ImageViewCreateInfo {
                view_type: if desc.depth > 1 {
                    vk::ImageViewType::TYPE_3D
                } else {
                    vk::ImageViewType::TYPE_2D
                },
                format: mapping.format,
                aspect: sample_aspect,
                min_level: 0,
                num_levels: desc.levels.max(1),
                min_layer: 0,
                num_layers: 1,
                swizzle: mapping.swizzle,
            },
        )?;

        let count = desc.levels.max(1) as usize;
        let subresources = (0..count)
            .map(|_| LockState {
                staging: None,
                shadow: None,
                lock_flags: None,
                outstanding_locks: 0,
            })
            .collect();

        Ok(Arc::new(Self {
            desc,
            mapping,
            image,
            view,
            subresources: Mutex::new(subresources),
        }))
    }

    pub fn desc(&self) -> &TextureDesc9 {
        &self.desc
    }

    pub fn mapping(&self) -> &FormatMapping9 {
        &self.mapping
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// The view draws sample through.
    pub fn sample_view(&self) -> &Arc<ImageView> {
        &self.view
    }

    pub fn is_managed(&self) -> bool {
        self.desc.pool == Pool::Managed
    }

    pub(crate) fn with_lock_state<R>(
        &self,
        level: u32,
        f: impl FnOnce(&mut LockState) -> R,
    ) -> Option<R> {
        let mut subresources = self.subresources.lock().unwrap();
        subresources.get_mut(level as usize).map(f)
    }

    /// The per-level staging buffer, created on first lock.
    pub(crate) fn staging_buffer(
        &self,
        device: &Device,
        level: u32,
    ) -> Result<Arc<Buffer>, GpuError> {
        let mut subresources = self.subresources.lock().unwrap();
        let state = subresources
            .get_mut(level as usize)
            .ok_or(GpuError::InvalidParameter("lock of nonexistent level"))?;
        if let Some(buffer) = &state.staging {
            return Ok(Arc::clone(buffer));
        }

        let extent = self.image.mip_level_extent(level);
        let blocks = prism_gpu::compute_block_count(extent, self.mapping.info.block_size);
        let size = u64::from(self.mapping.info.element_size)
            * u64::from(blocks.width)
            * u64::from(blocks.height)
            * u64::from(blocks.depth);

        let buffer = device.create_buffer(
            BufferCreateInfo {
                size: size.max(4),
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                alignment: 256,
                slice_count: 1,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        )?;

        state.staging = Some(Arc::clone(&buffer));
        Ok(buffer)
    }
}

impl std::fmt::Debug for Texture9 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture9")
            .field("format", &self.desc.format)
            .field("extent", &(self.desc.width, self.desc.height))
            .field("pool", &self.desc.pool)
            .finish()
    }
}

/// A renderable or depth surface: one subresource of a texture, wrapped
/// with its attachment view.
pub struct Surface9 {
    pub texture: Arc<Texture9>,
    pub level: u32,
    pub view: Arc<ImageView>,
}

impl Surface9 {
    pub fn new(device: &Device, texture: Arc<Texture9>, level: u32) -> Result<Arc<Self>, GpuError> {
        let mapping = *texture.mapping();
        let view = device.create_image_view(
            Arc::clone(texture.image()),
            ImageViewCreateInfo {
                view_type: vk::ImageViewType::TYPE_2D,
                format: mapping.format,
                aspect: mapping.info.aspect_mask,
                min_level: level,
                num_levels: 1,
                min_layer: 0,
                num_layers: 1,
                // Attachment views must use the identity swizzle; format
                // swizzles only apply to sampled views.
                swizzle: vk::ComponentMapping::default(),
            },
        )?;

        Ok(Arc::new(Self {
            texture,
            level,
            view,
        }))
    }

    pub fn width(&self) -> u32 {
        self.texture.image().mip_level_extent(self.level).width
    }

    pub fn height(&self) -> u32 {
        self.texture.image().mip_level_extent(self.level).height
    }

    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.texture.image().info().sample_count
    }
}

fn sample_count_flag(count: u32) -> vk::SampleCountFlags {
    match count {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_16,
    }
}

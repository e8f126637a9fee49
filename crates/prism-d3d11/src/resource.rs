use std::sync::{Arc, Mutex};

use ash::vk;
use bitflags::bitflags;
use tracing::warn;

use prism_gpu::{
    Buffer, BufferCreateInfo, Device, GpuError, Image, ImageCreateInfo, ImageView,
    Subresource,
};

use crate::format::{lookup_format, DxgiFormat};

/// Legacy resource usage classes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Usage {
    #[default]
    Default,
    Immutable,
    Dynamic,
    Staging,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER    = 1 << 0;
        const INDEX_BUFFER     = 1 << 1;
        const CONSTANT_BUFFER  = 1 << 2;
        const SHADER_RESOURCE  = 1 << 3;
        const RENDER_TARGET    = 1 << 5;
        const DEPTH_STENCIL    = 1 << 6;
        const UNORDERED_ACCESS = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CpuAccessFlags: u32 {
        const WRITE = 1 << 16;
        const READ  = 1 << 17;
    }
}

/// Legacy map modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapType {
    Read,
    Write,
    ReadWrite,
    WriteDiscard,
    WriteNoOverwrite,
}

impl MapType {
    pub fn reads(self) -> bool {
        matches!(self, MapType::Read | MapType::ReadWrite)
    }

    pub fn writes(self) -> bool {
        !matches!(self, MapType::Read)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const DO_NOT_WAIT = 1 << 20;
    }
}

/// What `map` hands back to the caller.
#[derive(Clone, Copy, Debug)]
pub struct MappedSubresource {
    pub data: *mut u8,
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

/// How a resource can be mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    /// Device-local; not mappable.
    None,
    /// Host-visible memory mapped in place.
    Direct,
    /// Mapped through a per-subresource staging buffer.
    Buffered,
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub byte_width: u64,
    pub usage: Usage,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccessFlags,
    pub structure_byte_stride: u32,
}

/// A version-11 buffer resource.
pub struct Buffer11 {
    desc: BufferDesc,
    buffer: Arc<Buffer>,
    map_mode: MapMode,
}

impl Buffer11 {
    pub fn new(device: &Device, desc: BufferDesc) -> Result<Arc<Self>, GpuError> {
        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if desc.bind_flags.contains(BindFlags::VERTEX_BUFFER) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if desc.bind_flags.contains(BindFlags::INDEX_BUFFER) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if desc.bind_flags.contains(BindFlags::CONSTANT_BUFFER) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if desc.bind_flags.contains(BindFlags::UNORDERED_ACCESS)
            || desc.structure_byte_stride != 0
        {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }

        let (mem_flags, map_mode) = match desc.usage {
            Usage::Dynamic => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                MapMode::Direct,
            ),
            Usage::Staging => (
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                MapMode::Direct,
            ),
            _ if desc.cpu_access.is_empty() => {
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, MapMode::None)
            }
            _ => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                MapMode::Direct,
            ),
        };

        // Dynamic buffers rotate through the rename pool on discard.
        let slice_count = if desc.usage == Usage::Dynamic { 2 } else { 1 };

        let buffer = device.create_buffer(
            BufferCreateInfo {
                size: desc.byte_width,
                usage,
                alignment: 256,
                slice_count,
            },
            mem_flags,
        )?;

        Ok(Arc::new(Self {
            desc,
            buffer,
            map_mode,
        }))
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn map_mode(&self) -> MapMode {
        self.map_mode
    }
}

impl std::fmt::Debug for Buffer11 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer11")
            .field("byte_width", &self.desc.byte_width)
            .field("usage", &self.desc.usage)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub dimension: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_size: u32,
    pub format: DxgiFormat,
    pub sample_count: u32,
    pub usage: Usage,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccessFlags,
}

/// Per-subresource mapping bookkeeping for buffered textures.
pub(crate) struct SubresourceState {
    /// Staging buffer large enough for one tightly packed copy.
    pub staging: Option<Arc<Buffer>>,
    /// Map mode of the last `map`, consumed by `unmap` to decide whether a
    /// GPU copy must be issued.
    pub map_type: Option<MapType>,
}

/// A version-11 texture resource (any dimension).
pub struct Texture11 {
    desc: TextureDesc,
    image: Arc<Image>,
    map_mode: MapMode,
    /// Whether map-time data needs the packed-format fixup before upload.
    needs_fixup: bool,
    /// Staging textures normally refresh their mapped buffer at map time;
    /// render-target-capable ones update it when GPU writes retire instead.
    update_mapped_early: bool,
    subresources: Mutex<Vec<SubresourceState>>,
}

impl Texture11 {
    pub fn new(device: &Device, desc: TextureDesc) -> Result<Arc<Self>, GpuError> {
        let mapping = lookup_format(desc.format);

        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.bind_flags.contains(BindFlags::SHADER_RESOURCE) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.bind_flags.contains(BindFlags::RENDER_TARGET) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.bind_flags.contains(BindFlags::DEPTH_STENCIL) {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if desc.bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let (tiling, mem_flags, map_mode) = match desc.usage {
            Usage::Staging => (
                vk::ImageTiling::LINEAR,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                MapMode::Direct,
            ),
            Usage::Dynamic => (
                vk::ImageTiling::OPTIMAL,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                MapMode::Buffered,
            ),
            _ if desc.cpu_access.is_empty() => (
                vk::ImageTiling::OPTIMAL,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                MapMode::None,
            ),
            _ => (
                vk::ImageTiling::OPTIMAL,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                MapMode::Buffered,
            ),
        };

        // Attachments can never be linear; fall back to the buffered path.
        let (tiling, map_mode) = if tiling == vk::ImageTiling::LINEAR
            && desc
                .bind_flags
                .intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL)
        {
            (vk::ImageTiling::OPTIMAL, MapMode::Buffered)
        } else {
            (tiling, map_mode)
        };

        let layout = standing_layout(&desc);

        let image_type = match desc.dimension {
            1 => vk::ImageType::TYPE_1D,
            3 => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        };

        let image = device.create_image(
            ImageCreateInfo {
                image_type,
                format: mapping.format,
                flags: if desc.array_size >= 6 && desc.dimension == 2 {
                    vk::ImageCreateFlags::CUBE_COMPATIBLE
                } else {
                    vk::ImageCreateFlags::empty()
                },
                sample_count: sample_count_flag(desc.sample_count),
                extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: desc.depth.max(1),
                },
                num_layers: desc.array_size.max(1),
                mip_levels: desc.mip_levels.max(1),
                usage,
                tiling,
                layout,
                view_formats: family_view_formats(desc.format),
            },
            if tiling == vk::ImageTiling::LINEAR {
                mem_flags
            } else {
                vk::MemoryPropertyFlags::DEVICE_LOCAL
            },
        )?;

        let count = (desc.mip_levels.max(1) * desc.array_size.max(1)) as usize;
        let subresources = (0..count)
            .map(|_| SubresourceState {
                staging: None,
                map_type: None,
            })
            .collect();

        Ok(Arc::new(Self {
            desc,
            image,
            map_mode,
            needs_fixup: false,
            update_mapped_early: false,
            subresources: Mutex::new(subresources),
        }))
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn map_mode(&self) -> MapMode {
        self.map_mode
    }

    pub fn needs_fixup(&self) -> bool {
        self.needs_fixup
    }

    pub fn update_mapped_early(&self) -> bool {
        self.update_mapped_early
    }

    pub fn subresource_count(&self) -> u32 {
        self.image.subresource_count()
    }

    /// Resolves a flat subresource index into `(mip, layer, aspect)`.
    pub fn subresource_from_index(&self, index: u32) -> Subresource {
        let mips = self.desc.mip_levels.max(1);
        Subresource {
            aspect_mask: lookup_format(self.desc.format).info.aspect_mask,
            mip_level: index % mips,
            array_layer: index / mips,
        }
    }

    /// Remembers the map mode of a subresource for the matching unmap.
    pub(crate) fn set_map_type(&self, index: u32, map_type: Option<MapType>) -> Option<MapType> {
        let mut subresources = self.subresources.lock().unwrap();
        let state = &mut subresources[index as usize];
        std::mem::replace(&mut state.map_type, map_type)
    }

    /// The staging buffer of a subresource, created on first map.
    pub(crate) fn mapped_buffer(
        &self,
        device: &Device,
        index: u32,
    ) -> Result<Arc<Buffer>, GpuError> {
        let mut subresources = self.subresources.lock().unwrap();
        let state = &mut subresources[index as usize];
        if let Some(buffer) = &state.staging {
            return Ok(Arc::clone(buffer));
        }

        let subresource = self.subresource_from_index(index);
        let extent = self.image.mip_level_extent(subresource.mip_level);
        let info = lookup_format(self.desc.format).info;
        let blocks = prism_gpu::compute_block_count(extent, info.block_size);
        let size = u64::from(info.element_size)
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

impl std::fmt::Debug for Texture11 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture11")
            .field("format", &self.desc.format)
            .field("extent", &(self.desc.width, self.desc.height, self.desc.depth))
            .field("usage", &self.desc.usage)
            .finish()
    }
}

fn standing_layout(desc: &TextureDesc) -> vk::ImageLayout {
    if desc.bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
        vk::ImageLayout::GENERAL
    } else if desc.bind_flags.contains(BindFlags::RENDER_TARGET) {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if desc.bind_flags.contains(BindFlags::DEPTH_STENCIL) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if desc.bind_flags.contains(BindFlags::SHADER_RESOURCE) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::GENERAL
    }
}

fn sample_count_flag(count: u32) -> vk::SampleCountFlags {
    match count {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        other => {
            warn!(samples = other, "unsupported sample count, using 1");
            vk::SampleCountFlags::TYPE_1
        }
    }
}

fn family_view_formats(format: DxgiFormat) -> Vec<vk::Format> {
    // sRGB aliasing is the only cross-format view the runtime creates.
    match format {
        DxgiFormat::R8G8B8A8Unorm | DxgiFormat::R8G8B8A8UnormSrgb => {
            vec![vk::Format::R8G8B8A8_UNORM, vk::Format::R8G8B8A8_SRGB]
        }
        DxgiFormat::B8G8R8A8Unorm | DxgiFormat::B8G8R8A8UnormSrgb => {
            vec![vk::Format::B8G8R8A8_UNORM, vk::Format::B8G8R8A8_SRGB]
        }
        _ => Vec::new(),
    }
}

/// A render-target view.
pub struct RenderTargetView11 {
    pub view: Arc<ImageView>,
    pub format: DxgiFormat,
}

/// A depth-stencil view.
pub struct DepthStencilView11 {
    pub view: Arc<ImageView>,
    pub format: DxgiFormat,
}

/// A shader-resource view.
pub struct ShaderResourceView11 {
    pub view: Arc<ImageView>,
    pub format: DxgiFormat,
}

/// Slot classification of an input element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSlotClass {
    PerVertex,
    PerInstance,
}

/// Sentinel offset: place the element right after the previous one on its
/// slot, aligned to 4 bytes.
pub const APPEND_ALIGNED_ELEMENT: u32 = u32::MAX;

/// One element of an input layout declaration.
#[derive(Clone, Debug)]
pub struct InputElementDesc {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: DxgiFormat,
    pub input_slot: u32,
    /// Byte offset on the slot, or [`APPEND_ALIGNED_ELEMENT`].
    pub aligned_byte_offset: u32,
    pub slot_class: InputSlotClass,
    pub instance_data_step_rate: u32,
}

/// An input layout: the vertex declaration, resolved against the bound
/// vertex shader's input signature at draw time.
pub struct InputLayout11 {
    pub elements: Vec<InputElementDesc>,
}

impl InputLayout11 {
    pub fn new(elements: Vec<InputElementDesc>) -> Arc<Self> {
        Arc::new(Self { elements })
    }
}

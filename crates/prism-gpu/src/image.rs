use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::error::GpuError;
use crate::format::format_aspect;
use crate::memory::{Memory, MemoryAllocator};
use crate::mip_level_extent;
use crate::resource::UseTracker;

/// Image creation parameters.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub flags: vk::ImageCreateFlags,
    pub sample_count: vk::SampleCountFlags,
    pub extent: vk::Extent3D,
    pub num_layers: u32,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    /// The layout the image is kept in between uses.
    pub layout: vk::ImageLayout,
    /// Formats views of this image may be created with, in addition to the
    /// image's own format.
    pub view_formats: Vec<vk::Format>,
}

/// An addressable (mip, layer, aspect) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subresource {
    pub aspect_mask: vk::ImageAspectFlags,
    pub mip_level: u32,
    pub array_layer: u32,
}

/// Host memory layout of a linear-tiled subresource.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubresourceLayout {
    pub offset: u64,
    pub size: u64,
    pub row_pitch: u64,
    pub depth_pitch: u64,
}

/// A GPU image.
///
/// The `layout` field is a conservative approximation of the GPU-observable
/// layout; only the worker mutates it, when it records transitions.
pub struct Image {
    device: ash::Device,
    allocator: Option<Arc<MemoryAllocator>>,
    info: ImageCreateInfo,
    mem_flags: vk::MemoryPropertyFlags,
    memory: Mutex<Option<Memory>>,
    map_ptr: *mut u8,
    image: vk::Image,
    /// Whether this wraps an externally provided handle the core must not
    /// destroy.
    external: bool,
    layout: AtomicI32,
    hazardous: AtomicBool,
    tracker: UseTracker,
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    pub fn new(
        device: ash::Device,
        allocator: Arc<MemoryAllocator>,
        info: ImageCreateInfo,
        mem_flags: vk::MemoryPropertyFlags,
    ) -> Result<Arc<Self>, GpuError> {
        let mut format_list = vk::ImageFormatListCreateInfo::default();
        let mut create_info = vk::ImageCreateInfo::default()
            .image_type(info.image_type)
            .format(info.format)
            .flags(info.flags)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.num_layers)
            .samples(sample_count_bits(info.sample_count))
            .tiling(info.tiling)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(if info.tiling == vk::ImageTiling::LINEAR {
                vk::ImageLayout::PREINITIALIZED
            } else {
                vk::ImageLayout::UNDEFINED
            });

        if !info.view_formats.is_empty() {
            format_list = format_list.view_formats(&info.view_formats);
            create_info = create_info.push_next(&mut format_list);
        }

        let image = unsafe { device.create_image(&create_info, None) }?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let dedicated = requirements.size >= 16 * 1024 * 1024;
        let memory = match allocator.alloc(&requirements, dedicated, mem_flags, 1.0) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        unsafe { device.bind_image_memory(image, memory.memory(), memory.offset()) }?;

        let map_ptr = memory.map_ptr(0);
        let initial_layout = create_info.initial_layout;

        Ok(Arc::new(Self {
            device,
            allocator: Some(allocator),
            info,
            mem_flags,
            memory: Mutex::new(Some(memory)),
            map_ptr,
            image,
            external: false,
            layout: AtomicI32::new(initial_layout.as_raw()),
            hazardous: AtomicBool::new(false),
            tracker: UseTracker::new(),
        }))
    }

    /// Wraps an externally owned image (a swap-chain image, typically).
    /// The handle is not destroyed when the wrapper is dropped.
    pub fn from_external(device: ash::Device, info: ImageCreateInfo, image: vk::Image) -> Arc<Self> {
        Arc::new(Self {
            device,
            allocator: None,
            info,
            mem_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            memory: Mutex::new(None),
            map_ptr: ptr::null_mut(),
            image,
            external: true,
            layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
            hazardous: AtomicBool::new(false),
            tracker: UseTracker::new(),
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn info(&self) -> &ImageCreateInfo {
        &self.info
    }

    pub fn mem_flags(&self) -> vk::MemoryPropertyFlags {
        self.mem_flags
    }

    pub fn tracker(&self) -> &UseTracker {
        &self.tracker
    }

    /// Host pointer `offset` bytes into the image's memory. Only valid for
    /// linear-tiled images on host-visible memory, where it stays valid for
    /// the image's whole lifetime.
    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        if self.map_ptr.is_null() {
            ptr::null_mut()
        } else {
            unsafe { self.map_ptr.add(offset as usize) }
        }
    }

    pub fn is_host_visible(&self) -> bool {
        !self.map_ptr.is_null()
    }

    /// Extent of the given mip level.
    pub fn mip_level_extent(&self, level: u32) -> vk::Extent3D {
        mip_level_extent(self.info.extent, level)
    }

    /// Number of addressable subresources (mips x layers).
    pub fn subresource_count(&self) -> u32 {
        self.info.mip_levels * self.info.num_layers
    }

    /// Queries the driver's memory layout for a linear subresource.
    pub fn query_subresource_layout(&self, subresource: Subresource) -> SubresourceLayout {
        let query = vk::ImageSubresource {
            aspect_mask: subresource.aspect_mask,
            mip_level: subresource.mip_level,
            array_layer: subresource.array_layer,
        };
        let layout = unsafe { self.device.get_image_subresource_layout(self.image, query) };
        SubresourceLayout {
            offset: layout.offset,
            size: layout.size,
            row_pitch: layout.row_pitch,
            depth_pitch: layout.depth_pitch,
        }
    }

    /// Whether a view with the given format can be created for this image.
    pub fn is_view_compatible(&self, format: vk::Format) -> bool {
        self.info.format == format || self.info.view_formats.contains(&format)
    }

    /// The layout the image is assumed to be in between uses.
    pub fn layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.layout.load(Ordering::Acquire))
    }

    /// Records the layout the worker has transitioned the image to.
    /// Worker use only.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        self.layout.store(layout.as_raw(), Ordering::Release);
    }

    /// Picks a compatible layout: images kept in GENERAL stay in GENERAL.
    pub fn pick_layout(&self, layout: vk::ImageLayout) -> vk::ImageLayout {
        if self.info.layout == vk::ImageLayout::GENERAL {
            vk::ImageLayout::GENERAL
        } else {
            layout
        }
    }

    /// Whether the hazard scan has already moved this image to the shared
    /// layout.
    pub fn is_hazardous(&self) -> bool {
        self.hazardous.load(Ordering::Acquire)
    }

    /// Marks the image as handled by the hazard scan. Returns the previous
    /// value so the first caller can do the one-time work.
    pub fn set_hazardous(&self) -> bool {
        self.hazardous.swap(true, Ordering::AcqRel)
    }

    /// Whether `subresource` + `extent` covers the subresource completely,
    /// so its previous contents can be discarded.
    pub fn is_full_subresource(&self, subresource: Subresource, extent: vk::Extent3D) -> bool {
        let level = self.mip_level_extent(subresource.mip_level);
        subresource.aspect_mask == format_aspect(self.info.format)
            && extent.width == level.width
            && extent.height == level.height
            && extent.depth == level.depth
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if !self.external {
            unsafe { self.device.destroy_image(self.image, None) };
        }
        if let (Some(allocator), Some(memory)) =
            (self.allocator.as_ref(), self.memory.get_mut().unwrap().take())
        {
            allocator.free(memory);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.info.format)
            .field("extent", &self.info.extent)
            .field("mips", &self.info.mip_levels)
            .field("layers", &self.info.num_layers)
            .finish()
    }
}

fn sample_count_bits(flags: vk::SampleCountFlags) -> vk::SampleCountFlags {
    if flags.is_empty() {
        vk::SampleCountFlags::TYPE_1
    } else {
        flags
    }
}

/// Image view creation parameters.
#[derive(Clone, Debug)]
pub struct ImageViewCreateInfo {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub min_level: u32,
    pub num_levels: u32,
    pub min_layer: u32,
    pub num_layers: u32,
    pub swizzle: vk::ComponentMapping,
}

const VIEW_TYPE_COUNT: usize = 7;

/// A typed window into an image.
///
/// One native view per view-type category is created lazily; the view for
/// the creation type is always available. The view keeps its parent image
/// alive.
pub struct ImageView {
    device: ash::Device,
    image: Arc<Image>,
    info: ImageViewCreateInfo,
    views: Mutex<[vk::ImageView; VIEW_TYPE_COUNT]>,
    tracker: UseTracker,
}

impl ImageView {
    pub fn new(
        device: ash::Device,
        image: Arc<Image>,
        info: ImageViewCreateInfo,
    ) -> Result<Arc<Self>, GpuError> {
        let view = Self {
            device,
            image,
            info,
            views: Mutex::new([vk::ImageView::null(); VIEW_TYPE_COUNT]),
            tracker: UseTracker::new(),
        };
        // The creation type must be valid; create it eagerly so later
        // lookups on the hot path never fail.
        view.create_view(view.info.view_type)?;
        Ok(Arc::new(view))
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn info(&self) -> &ImageViewCreateInfo {
        &self.info
    }

    pub fn tracker(&self) -> &UseTracker {
        &self.tracker
    }

    /// The native view for the creation view type.
    pub fn handle(&self) -> vk::ImageView {
        self.views.lock().unwrap()[self.info.view_type.as_raw() as usize]
    }

    /// The native view for a specific view type, creating it on first use.
    /// Returns null if the type is incompatible with the view's layer
    /// configuration.
    pub fn handle_for_type(&self, view_type: vk::ImageViewType) -> vk::ImageView {
        {
            let views = self.views.lock().unwrap();
            let handle = views[view_type.as_raw() as usize];
            if handle != vk::ImageView::null() {
                return handle;
            }
        }

        if !self.supports_view_type(view_type) {
            return vk::ImageView::null();
        }

        match self.create_view(view_type) {
            Ok(handle) => handle,
            Err(_) => vk::ImageView::null(),
        }
    }

    /// The view's subresource range within its image.
    pub fn subresources(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.info.aspect,
            base_mip_level: self.info.min_level,
            level_count: self.info.num_levels,
            base_array_layer: self.info.min_layer,
            layer_count: self.info.num_layers,
        }
    }

    /// Extent of mip `level`, counted from the view's first level.
    pub fn mip_level_extent(&self, level: u32) -> vk::Extent3D {
        self.image.mip_level_extent(level + self.info.min_level)
    }

    fn supports_view_type(&self, view_type: vk::ImageViewType) -> bool {
        match view_type {
            vk::ImageViewType::TYPE_1D | vk::ImageViewType::TYPE_2D | vk::ImageViewType::TYPE_3D => {
                true
            }
            vk::ImageViewType::TYPE_1D_ARRAY | vk::ImageViewType::TYPE_2D_ARRAY => true,
            vk::ImageViewType::CUBE => self.info.num_layers >= 6,
            vk::ImageViewType::CUBE_ARRAY => self.info.num_layers >= 6,
            _ => false,
        }
    }

    fn create_view(&self, view_type: vk::ImageViewType) -> Result<vk::ImageView, GpuError> {
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image.handle())
            .view_type(view_type)
            .format(self.info.format)
            .components(self.info.swizzle)
            .subresource_range(self.subresources());

        let handle = unsafe { self.device.create_image_view(&info, None) }?;

        let mut views = self.views.lock().unwrap();
        let slot = &mut views[view_type.as_raw() as usize];
        if *slot != vk::ImageView::null() {
            // Lost the race with another thread; keep the existing view.
            unsafe { self.device.destroy_image_view(handle, None) };
            return Ok(*slot);
        }
        *slot = handle;
        Ok(handle)
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        let views = self.views.get_mut().unwrap();
        for view in views.iter() {
            if *view != vk::ImageView::null() {
                unsafe { self.device.destroy_image_view(*view, None) };
            }
        }
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("view_type", &self.info.view_type)
            .field("format", &self.info.format)
            .finish()
    }
}

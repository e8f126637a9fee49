use std::ptr;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::align_up;
use crate::error::GpuError;
use crate::memory::{Memory, MemoryAllocator};
use crate::resource::UseTracker;

/// Buffer creation parameters.
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// Logical size of the buffer in bytes.
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Minimum alignment of each backing slice.
    pub alignment: u64,
    /// Number of slices in the rename pool. `1` for buffers that are never
    /// discarded.
    pub slice_count: u32,
}

/// One backing slice of a buffer: a physical range plus its host pointer.
///
/// Slice handles are plain values; they stay valid until the slice is
/// recycled through the rename pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub length: u64,
    pub map_ptr: *mut u8,
}

unsafe impl Send for BufferSlice {}
unsafe impl Sync for BufferSlice {}

impl BufferSlice {
    /// Host pointer `offset` bytes into the slice, or null if unmapped.
    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        if self.map_ptr.is_null() {
            ptr::null_mut()
        } else {
            unsafe { self.map_ptr.add(offset as usize) }
        }
    }
}

struct Backing {
    buffer: vk::Buffer,
    memory: Option<Memory>,
}

struct SlicePool {
    backings: Vec<Backing>,
    free: Vec<BufferSlice>,
    /// Producer-visible slice: what a WRITE / NO_OVERWRITE map returns.
    mapped: BufferSlice,
    /// Worker-visible slice: what GPU binds resolve to. Replaced when the
    /// worker observes the rename.
    physical: BufferSlice,
}

/// A GPU buffer with an optional rename pool.
///
/// On discard, [`Buffer::alloc_slice`] installs a fresh producer-visible
/// slice immediately; the worker later applies the rename to the GPU-visible
/// slice via [`Buffer::replace_backing`] when it executes the corresponding
/// invalidate command, returning the previous slice for deferred reuse.
pub struct Buffer {
    device: ash::Device,
    allocator: Arc<MemoryAllocator>,
    info: BufferCreateInfo,
    mem_flags: vk::MemoryPropertyFlags,
    slice_stride: u64,
    pool: Mutex<SlicePool>,
    tracker: UseTracker,
}

impl Buffer {
    pub fn new(
        device: ash::Device,
        allocator: Arc<MemoryAllocator>,
        info: BufferCreateInfo,
        mem_flags: vk::MemoryPropertyFlags,
    ) -> Result<Arc<Self>, GpuError> {
        if info.size == 0 || info.slice_count == 0 {
            return Err(GpuError::InvalidParameter("buffer size and slice count must be non-zero"));
        }

        let slice_stride = align_up(info.size, info.alignment.max(256));
        let backing = create_backing(&device, &allocator, &info, mem_flags, slice_stride)?;

        let mut free = backing_slices(&backing, &info, slice_stride);
        let first = free.remove(0);

        let pool = SlicePool {
            backings: vec![backing],
            free,
            mapped: first,
            physical: first,
        };

        Ok(Arc::new(Self {
            device,
            allocator,
            info,
            mem_flags,
            slice_stride,
            pool: Mutex::new(pool),
            tracker: UseTracker::new(),
        }))
    }

    /// The native handle backing the producer-visible slice.
    pub fn handle(&self) -> vk::Buffer {
        self.current_slice().buffer
    }

    pub fn info(&self) -> &BufferCreateInfo {
        &self.info
    }

    pub fn mem_flags(&self) -> vk::MemoryPropertyFlags {
        self.mem_flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.mem_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn tracker(&self) -> &UseTracker {
        &self.tracker
    }

    /// The producer-visible slice: stable across maps until the next
    /// discard.
    pub fn current_slice(&self) -> BufferSlice {
        self.pool.lock().unwrap().mapped
    }

    /// The slice GPU binds currently resolve to. Worker use only.
    pub fn physical_slice(&self) -> BufferSlice {
        self.pool.lock().unwrap().physical
    }

    /// Host pointer into the producer-visible slice.
    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        self.current_slice().map_ptr(offset)
    }

    /// Obtains the next slice from the rename pool, growing the pool by a
    /// whole backing allocation when it is exhausted, and installs it as
    /// the producer-visible slice.
    pub fn alloc_slice(&self) -> Result<BufferSlice, GpuError> {
        let mut pool = self.pool.lock().unwrap();

        let slice = match pool.free.pop() {
            Some(slice) => slice,
            None => {
                let backing = create_backing(
                    &self.device,
                    &self.allocator,
                    &self.info,
                    self.mem_flags,
                    self.slice_stride,
                )?;
                let mut slices = backing_slices(&backing, &self.info, self.slice_stride);
                pool.backings.push(backing);
                let slice = slices.remove(0);
                pool.free.extend(slices);
                slice
            }
        };

        pool.mapped = slice;
        Ok(slice)
    }

    /// The discard entry point on the API surface: identical to
    /// [`Buffer::alloc_slice`].
    pub fn discard_slice(&self) -> Result<BufferSlice, GpuError> {
        self.alloc_slice()
    }

    /// Applies a rename on the worker: makes `slice` the GPU-visible slice
    /// and returns the previous one so the caller can recycle it once the
    /// current submission completes.
    pub fn replace_backing(&self, slice: BufferSlice) -> BufferSlice {
        let mut pool = self.pool.lock().unwrap();
        std::mem::replace(&mut pool.physical, slice)
    }

    /// Returns a retired slice to the rename pool.
    pub fn free_slice(&self, slice: BufferSlice) {
        self.pool.lock().unwrap().free.push(slice);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap();
        for backing in pool.backings.iter_mut() {
            unsafe { self.device.destroy_buffer(backing.buffer, None) };
            if let Some(memory) = backing.memory.take() {
                self.allocator.free(memory);
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.info.size)
            .field("usage", &self.info.usage)
            .field("slice_count", &self.info.slice_count)
            .finish()
    }
}

fn create_backing(
    device: &ash::Device,
    allocator: &MemoryAllocator,
    info: &BufferCreateInfo,
    mem_flags: vk::MemoryPropertyFlags,
    slice_stride: u64,
) -> Result<Backing, GpuError> {
    let total_size = slice_stride * u64::from(info.slice_count);

    let buffer_info = vk::BufferCreateInfo::default()
        .size(total_size)
        .usage(info.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let memory = match allocator.alloc(&requirements, false, mem_flags, 0.0) {
        Ok(memory) => memory,
        Err(err) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(err);
        }
    };

    unsafe { device.bind_buffer_memory(buffer, memory.memory(), memory.offset()) }?;

    Ok(Backing {
        buffer,
        memory: Some(memory),
    })
}

fn backing_slices(backing: &Backing, info: &BufferCreateInfo, slice_stride: u64) -> Vec<BufferSlice> {
    let memory = backing.memory.as_ref().expect("backing always owns memory until drop");
    (0..info.slice_count)
        .map(|i| {
            let offset = u64::from(i) * slice_stride;
            BufferSlice {
                buffer: backing.buffer,
                offset,
                length: info.size,
                map_ptr: memory.map_ptr(offset),
            }
        })
        .collect()
}

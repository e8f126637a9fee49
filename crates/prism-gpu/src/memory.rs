use std::ptr;
use std::sync::Mutex;

use ash::vk;
use tracing::{debug, error};

use crate::align_up;
use crate::error::GpuError;

/// Default chunk sizing: `min(heap_size / 16, 64 MiB)`.
///
/// Small chunks keep fragmentation low on small heaps.
fn pick_chunk_size(heap_size: u64) -> u64 {
    const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
    const MIN_CHUNK_COUNT: u64 = 16;

    (heap_size / MIN_CHUNK_COUNT).min(MAX_CHUNK_SIZE)
}

/// A sub-allocated (or dedicated) slice of device memory.
///
/// Plain data; the owning resource returns it to the allocator when the
/// resource is destroyed. `map_ptr` is null unless the memory type is
/// host-visible, in which case the whole chunk is persistently mapped and
/// the pointer addresses this allocation's first byte.
#[derive(Debug)]
pub struct Memory {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) map_ptr: *mut u8,
    type_index: u32,
    chunk_id: Option<u64>,
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Host pointer at `offset` bytes into the allocation, or null if the
    /// memory is not host-visible.
    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        if self.map_ptr.is_null() {
            ptr::null_mut()
        } else {
            // Allocations never exceed their slice, so offsetting stays in
            // bounds of the mapped chunk.
            unsafe { self.map_ptr.add(offset as usize) }
        }
    }
}

/// Free-list bookkeeping for one chunk. Slices are disjoint; adjacent
/// slices are coalesced on free; selection is worst-fit.
#[derive(Debug)]
struct FreeList {
    slices: Vec<FreeSlice>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeSlice {
    offset: u64,
    length: u64,
}

impl FreeList {
    fn new(size: u64) -> Self {
        Self {
            slices: vec![FreeSlice {
                offset: 0,
                length: size,
            }],
        }
    }

    fn free_bytes(&self) -> u64 {
        self.slices.iter().map(|s| s.length).sum()
    }

    /// Worst-fit allocation: take the largest slice (or an exact fit), carve
    /// the aligned range out of it and return the remainder pieces to the
    /// list.
    fn alloc(&mut self, size: u64, align: u64) -> Option<(u64, u64)> {
        if self.slices.is_empty() {
            return None;
        }

        let mut best = 0;
        for (i, slice) in self.slices.iter().enumerate() {
            if slice.length == size {
                best = i;
                break;
            }
            if slice.length > self.slices[best].length {
                best = i;
            }
        }

        let slice = self.slices[best];
        let slice_end = slice.offset + slice.length;

        let alloc_start = align_up(slice.offset, align);
        let alloc_end = align_up(alloc_start + size, align);

        if alloc_end > slice_end {
            return None;
        }

        self.slices.swap_remove(best);

        if alloc_start != slice.offset {
            self.slices.push(FreeSlice {
                offset: slice.offset,
                length: alloc_start - slice.offset,
            });
        }
        if alloc_end != slice_end {
            self.slices.push(FreeSlice {
                offset: alloc_end,
                length: slice_end - alloc_end,
            });
        }

        Some((alloc_start, alloc_end - alloc_start))
    }

    /// Return a range, merging it with any adjacent free slices so larger
    /// allocations can reuse the space.
    fn free(&mut self, mut offset: u64, mut length: u64) {
        let mut i = 0;
        while i < self.slices.len() {
            let s = self.slices[i];
            if s.offset == offset + length {
                length += s.length;
                self.slices.swap_remove(i);
            } else if s.offset + s.length == offset {
                offset -= s.length;
                length += s.length;
                self.slices.swap_remove(i);
            } else {
                i += 1;
            }
        }
        self.slices.push(FreeSlice { offset, length });
    }
}

struct Chunk {
    id: u64,
    memory: vk::DeviceMemory,
    map_ptr: *mut u8,
    size: u64,
    free_list: FreeList,
}

unsafe impl Send for Chunk {}

struct MemoryTypeState {
    property_flags: vk::MemoryPropertyFlags,
    heap_index: u32,
    chunk_size: u64,
    chunks: Vec<Chunk>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes of device memory allocated from the driver.
    pub allocated: u64,
    /// Bytes handed out to resources.
    pub used: u64,
}

struct AllocatorState {
    types: Vec<MemoryTypeState>,
    next_chunk_id: u64,
    stats: MemoryStats,
}

/// Sub-allocating device-memory allocator.
///
/// Memory types are probed in index order; small requests are served from
/// fixed-size chunks per type, large requests and dedicated-allocation
/// hints bypass chunk management. A single mutex guards both `alloc` and
/// `free`; the allocator is not on the draw path.
pub struct MemoryAllocator {
    device: ash::Device,
    /// Whether `VK_EXT_memory_priority` is enabled on the device.
    memory_priority: bool,
    state: Mutex<AllocatorState>,
}

impl MemoryAllocator {
    pub fn new(
        device: ash::Device,
        memory_props: vk::PhysicalDeviceMemoryProperties,
        memory_priority: bool,
    ) -> Self {
        let mut types = Vec::with_capacity(memory_props.memory_type_count as usize);
        for i in 0..memory_props.memory_type_count as usize {
            let mem_type = memory_props.memory_types[i];
            let heap_size = memory_props.memory_heaps[mem_type.heap_index as usize].size;
            types.push(MemoryTypeState {
                property_flags: mem_type.property_flags,
                heap_index: mem_type.heap_index,
                chunk_size: pick_chunk_size(heap_size),
                chunks: Vec::new(),
            });
        }

        Self {
            device,
            memory_priority,
            state: Mutex::new(AllocatorState {
                types,
                next_chunk_id: 1,
                stats: MemoryStats::default(),
            }),
        }
    }

    /// Allocates memory satisfying `requirements` with the requested
    /// property flags.
    ///
    /// If no memory type satisfies the flags, the request is retried with
    /// DEVICE_LOCAL and HOST_CACHED cleared before failing.
    pub fn alloc(
        &self,
        requirements: &vk::MemoryRequirements,
        dedicated: bool,
        flags: vk::MemoryPropertyFlags,
        priority: f32,
    ) -> Result<Memory, GpuError> {
        let mut state = self.state.lock().unwrap();

        if let Some(memory) = self.try_alloc(&mut state, requirements, dedicated, flags, priority) {
            return Ok(memory);
        }

        // Probe slower memory types before giving up.
        let opt_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_CACHED;
        if flags.intersects(opt_flags) {
            let relaxed = flags & !opt_flags;
            if let Some(memory) =
                self.try_alloc(&mut state, requirements, dedicated, relaxed, priority)
            {
                return Ok(memory);
            }
        }

        error!(
            size = requirements.size,
            alignment = requirements.alignment,
            type_mask = format_args!("{:#x}", requirements.memory_type_bits),
            "device memory allocation failed"
        );

        Err(GpuError::OutOfDeviceMemory {
            size: requirements.size,
            type_mask: requirements.memory_type_bits,
        })
    }

    /// Returns an allocation to its chunk, or frees the dedicated device
    /// memory backing it.
    pub fn free(&self, memory: Memory) {
        let mut state = self.state.lock().unwrap();
        state.stats.used -= memory.length;

        match memory.chunk_id {
            Some(chunk_id) => {
                let ty = &mut state.types[memory.type_index as usize];
                if let Some(chunk) = ty.chunks.iter_mut().find(|c| c.id == chunk_id) {
                    chunk.free_list.free(memory.offset, memory.length);
                }
            }
            None => {
                state.stats.allocated -= memory.length;
                unsafe { self.device.free_memory(memory.memory, None) };
            }
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().unwrap().stats
    }

    fn try_alloc(
        &self,
        state: &mut AllocatorState,
        requirements: &vk::MemoryRequirements,
        dedicated: bool,
        flags: vk::MemoryPropertyFlags,
        priority: f32,
    ) -> Option<Memory> {
        for i in 0..state.types.len() {
            let supported = requirements.memory_type_bits & (1u32 << i) != 0;
            let adequate = state.types[i].property_flags.contains(flags);
            if !supported || !adequate {
                continue;
            }

            if let Some(memory) = self.try_alloc_from_type(state, i as u32, requirements, dedicated, flags, priority)
            {
                return Some(memory);
            }
        }
        None
    }

    fn try_alloc_from_type(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        requirements: &vk::MemoryRequirements,
        dedicated: bool,
        flags: vk::MemoryPropertyFlags,
        priority: f32,
    ) -> Option<Memory> {
        let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let chunk_size = state.types[type_index as usize].chunk_size;

        // Large and dedicated requests bypass chunk management entirely.
        if dedicated || requirements.size >= chunk_size / 4 {
            let (memory, map_ptr) =
                self.alloc_device_memory(type_index, requirements.size, host_visible, priority)?;
            state.stats.allocated += requirements.size;
            state.stats.used += requirements.size;
            return Some(Memory {
                memory,
                offset: 0,
                length: requirements.size,
                map_ptr,
                type_index,
                chunk_id: None,
            });
        }

        let AllocatorState { types, stats, .. } = &mut *state;
        for chunk in types[type_index as usize].chunks.iter_mut() {
            if let Some((offset, length)) =
                chunk.free_list.alloc(requirements.size, requirements.alignment)
            {
                stats.used += length;
                return Some(Memory {
                    memory: chunk.memory,
                    offset,
                    length,
                    map_ptr: chunk_map_ptr(chunk.map_ptr, offset),
                    type_index,
                    chunk_id: Some(chunk.id),
                });
            }
        }

        // No chunk had room; grow the type by one chunk and retry on it.
        let (memory, map_ptr) =
            self.alloc_device_memory(type_index, chunk_size, host_visible, priority)?;

        let id = state.next_chunk_id;
        state.next_chunk_id += 1;
        state.stats.allocated += chunk_size;

        let mut chunk = Chunk {
            id,
            memory,
            map_ptr,
            size: chunk_size,
            free_list: FreeList::new(chunk_size),
        };

        let (offset, length) = chunk
            .free_list
            .alloc(requirements.size, requirements.alignment)?;
        state.stats.used += length;

        let result = Memory {
            memory: chunk.memory,
            offset,
            length,
            map_ptr: chunk_map_ptr(chunk.map_ptr, offset),
            type_index,
            chunk_id: Some(chunk.id),
        };

        debug!(
            type_index,
            chunk_size,
            heap = state.types[type_index as usize].heap_index,
            "created device memory chunk"
        );

        state.types[type_index as usize].chunks.push(chunk);
        Some(result)
    }

    fn alloc_device_memory(
        &self,
        type_index: u32,
        size: u64,
        host_visible: bool,
        priority: f32,
    ) -> Option<(vk::DeviceMemory, *mut u8)> {
        let mut priority_info = vk::MemoryPriorityAllocateInfoEXT::default().priority(priority);

        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        if self.memory_priority {
            info = info.push_next(&mut priority_info);
        }

        let memory = unsafe { self.device.allocate_memory(&info, None) }.ok()?;

        let map_ptr = if host_visible {
            match unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => ptr.cast::<u8>(),
                Err(err) => {
                    error!(?err, "mapping device memory failed");
                    unsafe { self.device.free_memory(memory, None) };
                    return None;
                }
            }
        } else {
            ptr::null_mut()
        };

        Some((memory, map_ptr))
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for ty in &state.types {
            for chunk in &ty.chunks {
                let free = chunk.free_list.free_bytes();
                if free != chunk.size {
                    debug!(
                        chunk = chunk.id,
                        leaked = chunk.size - free,
                        "memory chunk destroyed with live allocations"
                    );
                }
                unsafe { self.device.free_memory(chunk.memory, None) };
            }
        }
    }
}

fn chunk_map_ptr(base: *mut u8, offset: u64) -> *mut u8 {
    if base.is_null() {
        ptr::null_mut()
    } else {
        unsafe { base.add(offset as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_bounded() {
        assert_eq!(pick_chunk_size(256 * 1024 * 1024), 16 * 1024 * 1024);
        assert_eq!(pick_chunk_size(8 * 1024 * 1024 * 1024), 64 * 1024 * 1024);
    }

    #[test]
    fn free_list_round_trip_restores_byte_total() {
        let mut list = FreeList::new(4096);
        let before = list.free_bytes();

        let (offset, length) = list.alloc(100, 64).unwrap();
        assert_eq!(offset % 64, 0);
        assert!(list.free_bytes() < before);

        list.free(offset, length);
        assert_eq!(list.free_bytes(), before);
    }

    #[test]
    fn free_list_coalesces_adjacent_slices() {
        let mut list = FreeList::new(1024);
        let (o1, l1) = list.alloc(256, 1).unwrap();
        let (o2, l2) = list.alloc(256, 1).unwrap();
        let (o3, l3) = list.alloc(256, 1).unwrap();

        list.free(o1, l1);
        list.free(o3, l3);
        list.free(o2, l2);

        // After freeing everything the list must be a single slice again,
        // otherwise a full-size allocation would fail.
        assert!(list.alloc(1024, 1).is_some());
    }

    #[test]
    fn worst_fit_prefers_largest_slice() {
        let mut list = FreeList::new(1024);
        // Carve the chunk into a small and a large free slice.
        let (o1, l1) = list.alloc(128, 1).unwrap();
        let _keep = list.alloc(128, 1).unwrap();
        list.free(o1, l1);

        // 128 free at the front, 768 free at the back; worst-fit must pick
        // the larger slice.
        let (offset, _) = list.alloc(64, 1).unwrap();
        assert!(offset >= 256);
    }

    #[test]
    fn exact_fit_short_circuits() {
        let mut list = FreeList::new(1024);
        let (o1, l1) = list.alloc(128, 1).unwrap();
        let _hold = list.alloc(512, 1).unwrap();
        list.free(o1, l1);

        // The 128-byte slice is an exact fit and wins over the larger one.
        let (offset, length) = list.alloc(128, 1).unwrap();
        assert_eq!(offset, o1);
        assert_eq!(length, 128);
    }
}

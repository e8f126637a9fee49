use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::{error, warn};

use prism_gpu::cs::{ChunkTag, CsCmd};
use prism_gpu::{
    packed_depth_stencil_format, BufferCreateInfo, Device, QueryData, Status, UseTracker,
};

use crate::context::{CommonContext, Sink};
use crate::context_def::CommandList;
use crate::format::lookup_format;
use crate::options::Options11;
use crate::query::Query11;
use crate::resource::{
    Buffer11, DepthStencilView11, MapFlags, MapMode, MapType, MappedSubresource,
    RenderTargetView11, Texture11,
};

/// Flush the command list if the GPU is about to go idle, but no more often
/// than the pacing interval allows.
const MIN_FLUSH_INTERVAL_US: u64 = 750;
const INC_FLUSH_INTERVAL_US: u64 = 250;
const MAX_PENDING_SUBMITS: u32 = 6;

/// The immediate context: translates API calls into chunk emissions for the
/// worker and owns the implicit-flush pacing policy.
pub struct ImmediateContext {
    ctx: CommonContext,
    options: Options11,
    last_flush: Instant,
}

impl Deref for ImmediateContext {
    type Target = CommonContext;

    fn deref(&self) -> &CommonContext {
        &self.ctx
    }
}

impl DerefMut for ImmediateContext {
    fn deref_mut(&mut self) -> &mut CommonContext {
        &mut self.ctx
    }
}

impl ImmediateContext {
    pub fn new(device: Device, options: Options11) -> Self {
        let mut ctx = CommonContext::new(device, ChunkTag::SingleUse, Sink::Worker);
        if options.relaxed_barriers {
            ctx.emit(CsCmd::SetBarrierControl(
                prism_gpu::BarrierControl::IGNORE_WRITE_AFTER_WRITE,
            ));
        }

        Self {
            ctx,
            options,
            last_flush: Instant::now(),
        }
    }

    // ------------------------------------------------------------------
    // Flush policy
    // ------------------------------------------------------------------

    /// Closes and submits the current native command buffer. Does not block
    /// on GPU work.
    pub fn flush(&mut self) {
        if self.ctx.is_busy() {
            self.ctx.emit(CsCmd::Flush);
            self.ctx.flush_chunk();
            self.last_flush = Instant::now();
            self.ctx.set_busy(false);
        }
    }

    /// Flushes only if the GPU is about to go idle, to keep the number of
    /// submissions low.
    pub fn flush_implicit(&mut self, strong_hint: bool) {
        let pending = self.ctx.device().submissions().pending_submissions();

        if strong_hint || pending <= MAX_PENDING_SUBMITS {
            let delay =
                MIN_FLUSH_INTERVAL_US + INC_FLUSH_INTERVAL_US * u64::from(pending);

            if self.last_flush.elapsed() >= Duration::from_micros(delay) {
                self.flush();
            }
        }
    }

    /// Blocks until the worker has drained every chunk published so far.
    pub fn synchronize_cs(&mut self) {
        self.ctx.flush_chunk();
        self.ctx.device().cs().synchronize();
    }

    /// Blocks until the device reports all submissions complete.
    pub fn synchronize_device(&mut self) {
        self.ctx.device().wait_for_idle();
    }

    // ------------------------------------------------------------------
    // Render-target rebinding raises a strong flush hint
    // ------------------------------------------------------------------

    pub fn om_set_render_targets(
        &mut self,
        render_targets: &[Option<Arc<RenderTargetView11>>],
        depth_stencil: Option<Arc<DepthStencilView11>>,
    ) {
        self.flush_implicit(true);
        self.ctx.om_set_render_targets(render_targets, depth_stencil);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn end(&mut self, query: &Arc<Query11>) {
        let stalling = query.core().is_stalling();
        self.ctx.end_query(query);

        if query.is_event() {
            // Event availability needs a submission to ride on.
            if stalling {
                self.flush();
            } else {
                self.flush_implicit(true);
            }
        } else if stalling {
            self.flush_implicit(true);
        }
    }

    /// Polls a query. `Ok(None)` means the result is not available yet; the
    /// caller reports FALSE.
    pub fn get_data(&mut self, query: &Arc<Query11>) -> Result<Option<QueryData>, Status> {
        // All query commands must reach the worker before the native pool
        // is inspected.
        self.synchronize_cs();

        let result = self
            .ctx
            .device()
            .query_data(query.core())
            .map_err(|err| Status::from(&err))?;

        if result.is_none() {
            // The caller is likely to spin on this query; keep the GPU fed.
            query.core().notify_stall();
            self.flush_implicit(false);
        }

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Mapping engine
    // ------------------------------------------------------------------

    pub fn map_buffer(
        &mut self,
        buffer: &Arc<Buffer11>,
        map_type: MapType,
        map_flags: MapFlags,
    ) -> Result<MappedSubresource, Status> {
        if buffer.map_mode() == MapMode::None {
            error!("cannot map a device-local buffer");
            return Err(Status::INVALID_CALL);
        }

        let byte_width = buffer.desc().byte_width as u32;

        if map_type == MapType::WriteDiscard {
            // Install a fresh backing slice and tell the worker so
            // subsequent GPU reads observe the rename.
            let slice = buffer
                .buffer()
                .alloc_slice()
                .map_err(|err| Status::from(&err))?;
            self.ctx.emit(CsCmd::InvalidateBuffer {
                buffer: Arc::clone(buffer.buffer()),
                slice,
            });
            return Ok(MappedSubresource {
                data: slice.map_ptr(0),
                row_pitch: byte_width,
                depth_pitch: byte_width,
            });
        }

        if map_type != MapType::WriteNoOverwrite
            && !self.wait_for_resource(buffer.buffer().tracker(), map_flags)
        {
            return Err(Status::WAS_STILL_DRAWING);
        }

        // The current slice's pointer is stable across maps, so
        // NO_OVERWRITE needs no synchronization at all.
        let slice = buffer.buffer().current_slice();
        Ok(MappedSubresource {
            data: slice.map_ptr(0),
            row_pitch: byte_width,
            depth_pitch: byte_width,
        })
    }

    pub fn map_image(
        &mut self,
        texture: &Arc<Texture11>,
        subresource_index: u32,
        map_type: MapType,
        mut map_flags: MapFlags,
    ) -> Result<MappedSubresource, Status> {
        if texture.map_mode() == MapMode::None {
            error!("cannot map a device-local image");
            return Err(Status::INVALID_CALL);
        }
        if subresource_index >= texture.subresource_count() {
            return Err(Status::INVALID_CALL);
        }

        texture.set_map_type(subresource_index, Some(map_type));

        let image = texture.image();
        let subresource = texture.subresource_from_index(subresource_index);
        let info = lookup_format(texture.desc().format).info;

        if texture.map_mode() == MapMode::Direct {
            if !self.wait_for_resource(image.tracker(), map_flags) {
                return Err(Status::WAS_STILL_DRAWING);
            }

            // The application is expected to respect the driver-reported
            // pitches.
            let layout = image.query_subresource_layout(subresource);
            let is_2d = texture.desc().dimension >= 2;
            let is_3d = texture.desc().dimension >= 3;
            let row_pitch = if is_2d { layout.row_pitch } else { layout.size };
            let depth_pitch = if is_3d { layout.depth_pitch } else { layout.size };
            return Ok(MappedSubresource {
                data: image.map_ptr(layout.offset),
                row_pitch: row_pitch as u32,
                depth_pitch: depth_pitch as u32,
            });
        }

        // Buffered path: map through the per-subresource staging buffer.
        let staging = texture
            .mapped_buffer(self.ctx.device(), subresource_index)
            .map_err(|err| Status::from(&err))?;

        let extent = image.mip_level_extent(subresource.mip_level);
        let blocks = prism_gpu::compute_block_count(extent, info.block_size);

        let slice = if map_type == MapType::WriteDiscard {
            // The whole subresource is discarded; no contents to preserve.
            let slice = staging.alloc_slice().map_err(|err| Status::from(&err))?;
            self.ctx.emit(CsCmd::InvalidateBuffer {
                buffer: Arc::clone(&staging),
                slice,
            });
            slice
        } else {
            // The image contents must be preserved: refresh the staging
            // buffer from the GPU copy first when the resource class calls
            // for it.
            if texture.desc().usage == crate::resource::Usage::Staging
                && !texture.update_mapped_early()
            {
                self.ctx.emit(CsCmd::CopyImageToBuffer {
                    src: Arc::clone(image),
                    layers: vk::ImageSubresourceLayers {
                        aspect_mask: subresource.aspect_mask,
                        mip_level: subresource.mip_level,
                        base_array_layer: subresource.array_layer,
                        layer_count: 1,
                    },
                    offset: vk::Offset3D::default(),
                    extent,
                    dst: Arc::clone(&staging),
                    dst_offset: 0,
                });
                map_flags.remove(MapFlags::DO_NOT_WAIT);
            }

            if !self.wait_for_resource(staging.tracker(), map_flags) {
                return Err(Status::WAS_STILL_DRAWING);
            }
            staging.current_slice()
        };

        // Data is tightly packed within the staging buffer.
        let row_pitch = info.element_size * blocks.width;
        Ok(MappedSubresource {
            data: slice.map_ptr(0),
            row_pitch,
            depth_pitch: row_pitch * blocks.height,
        })
    }

    pub fn unmap_image(&mut self, texture: &Arc<Texture11>, subresource_index: u32) {
        let map_type = texture.set_map_type(subresource_index, None);

        let Some(map_type) = map_type else {
            return;
        };
        if !map_type.writes() || texture.map_mode() != MapMode::Buffered {
            return;
        }

        // Written staging data must be copied back into the image.
        let Ok(staging) = texture.mapped_buffer(self.ctx.device(), subresource_index) else {
            return;
        };

        let image = texture.image();
        let subresource = texture.subresource_from_index(subresource_index);
        let extent = image.mip_level_extent(subresource.mip_level);

        let source = if texture.needs_fixup() {
            match self.fixup_staging(&staging, extent) {
                Ok(fixed) => fixed,
                Err(err) => {
                    error!(?err, "staging fixup allocation failed, skipping upload");
                    return;
                }
            }
        } else {
            Arc::clone(&staging)
        };

        let format = lookup_format(texture.desc().format).format;
        self.ctx.emit(CsCmd::CopyBufferToImage {
            src: source,
            src_offset: 0,
            dst: Arc::clone(image),
            layers: vk::ImageSubresourceLayers {
                aspect_mask: subresource.aspect_mask,
                mip_level: subresource.mip_level,
                base_array_layer: subresource.array_layer,
                layer_count: 1,
            },
            offset: vk::Offset3D::default(),
            extent,
            packed_format: packed_depth_stencil_format(format),
        });
    }

    /// Expands staging data for formats with no native equivalent into a
    /// corrected buffer the image copy can consume.
    fn fixup_staging(
        &mut self,
        staging: &Arc<prism_gpu::Buffer>,
        extent: vk::Extent3D,
    ) -> Result<Arc<prism_gpu::Buffer>, prism_gpu::GpuError> {
        let texels = u64::from(extent.width) * u64::from(extent.height) * u64::from(extent.depth);
        let fixed = self.ctx.device().create_buffer(
            BufferCreateInfo {
                size: texels * 4,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                alignment: 256,
                slice_count: 1,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let src_slice = staging.current_slice();
        let dst_slice = fixed.current_slice();
        let src_len = (texels * 3) as usize;
        // Both buffers are host-visible and exclusively owned by this map
        // operation until the upload below is emitted.
        unsafe {
            let src = std::slice::from_raw_parts(src_slice.map_ptr(0), src_len);
            let dst = std::slice::from_raw_parts_mut(dst_slice.map_ptr(0), (texels * 4) as usize);
            prism_gpu::expand_packed_rgb24(src, dst);
        }

        Ok(fixed)
    }

    /// Waits for a resource to leave GPU use, honoring DO_NOT_WAIT when the
    /// options allow it.
    fn wait_for_resource(&mut self, tracker: &UseTracker, mut map_flags: MapFlags) -> bool {
        // Some applications never recover from a failed DO_NOT_WAIT map, so
        // the flag is opt-in.
        if !self.options.allow_map_flag_no_wait {
            map_flags.remove(MapFlags::DO_NOT_WAIT);
        }

        // Drain pending commands so the in-use check sees every reference
        // recorded so far.
        self.synchronize_cs();

        if tracker.is_in_use(self.ctx.device().submissions().last_completed()) {
            if map_flags.contains(MapFlags::DO_NOT_WAIT) {
                // The caller may still spin on map; keep pending work
                // moving toward the GPU.
                self.flush_implicit(false);
                return false;
            }

            // The resource is owned by in-flight work; submit it and wait.
            self.flush();
            self.synchronize_cs();

            while tracker.is_in_use(self.ctx.device().submissions().last_completed()) {
                self.ctx.device().submissions().poll();
                std::thread::yield_now();
            }
        }

        true
    }

    // ------------------------------------------------------------------
    // UpdateSubresource
    // ------------------------------------------------------------------

    /// Writes caller data into a buffer range. The leading implicit flush
    /// keeps the host copy from contending with in-flight GPU work against
    /// the same resource.
    pub fn update_buffer(&mut self, buffer: &Arc<Buffer11>, offset: u64, data: &[u8]) {
        self.flush_implicit(false);

        self.ctx.emit(CsCmd::UpdateBuffer {
            buffer: Arc::clone(buffer.buffer()),
            offset,
            data: data.to_vec(),
        });
    }

    /// Writes caller data into an image subresource through a transient
    /// staging buffer.
    pub fn update_texture(
        &mut self,
        texture: &Arc<Texture11>,
        subresource_index: u32,
        data: &[u8],
        row_pitch: u32,
        depth_pitch: u32,
    ) {
        self.flush_implicit(false);

        if subresource_index >= texture.subresource_count() {
            warn!(subresource_index, "update of nonexistent subresource ignored");
            return;
        }

        let image = texture.image();
        let subresource = texture.subresource_from_index(subresource_index);
        let extent = image.mip_level_extent(subresource.mip_level);
        let info = lookup_format(texture.desc().format).info;
        let blocks = prism_gpu::compute_block_count(extent, info.block_size);

        let packed_row = info.element_size * blocks.width;
        let packed_size =
            u64::from(packed_row) * u64::from(blocks.height) * u64::from(blocks.depth);

        let staging = match self.ctx.device().create_buffer(
            BufferCreateInfo {
                size: packed_size.max(4),
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                alignment: 256,
                slice_count: 1,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(?err, "staging allocation for subresource update failed");
                return;
            }
        };

        // Repack caller rows (with arbitrary pitches) into the tight
        // staging layout.
        let slice = staging.current_slice();
        for z in 0..blocks.depth as usize {
            for y in 0..blocks.height as usize {
                let src_offset = z * depth_pitch as usize + y * row_pitch as usize;
                let dst_offset =
                    (z * blocks.height as usize + y) * packed_row as usize;
                let len = (packed_row as usize).min(data.len().saturating_sub(src_offset));
                if len == 0 {
                    continue;
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr().add(src_offset),
                        slice.map_ptr(dst_offset as u64),
                        len,
                    );
                }
            }
        }

        let format = lookup_format(texture.desc().format).format;
        self.ctx.emit(CsCmd::CopyBufferToImage {
            src: staging,
            src_offset: 0,
            dst: Arc::clone(image),
            layers: vk::ImageSubresourceLayers {
                aspect_mask: subresource.aspect_mask,
                mip_level: subresource.mip_level,
                base_array_layer: subresource.array_layer,
                layer_count: 1,
            },
            offset: vk::Offset3D::default(),
            extent,
            packed_format: packed_depth_stencil_format(format),
        });
    }

    // ------------------------------------------------------------------
    // Command lists
    // ------------------------------------------------------------------

    /// Drains a recorded command list into the worker, in list order, then
    /// restores or clears the immediate state.
    pub fn execute_command_list(&mut self, list: &CommandList, restore_state: bool) {
        // Flush outstanding commands so execution order is preserved.
        self.ctx.flush_chunk();

        // Large recorded workloads justify a submission.
        self.flush_implicit(false);

        for chunk in list.chunks() {
            self.ctx.device().cs().dispatch(Arc::clone(chunk));
        }

        if restore_state {
            self.ctx.restore_state();
        } else {
            self.ctx.clear_state();
        }

        // Subsequent flush operations must see the worker as busy.
        self.ctx.set_busy(true);
    }
}

impl Drop for ImmediateContext {
    fn drop(&mut self) {
        self.flush();
        self.synchronize_cs();
        self.synchronize_device();
    }
}

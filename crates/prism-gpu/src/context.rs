use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use tracing::warn;

use crate::buffer::{Buffer, BufferSlice};
use crate::cs::CsCmd;
use crate::descriptor::DescriptorHeap;
use crate::error::GpuError;
use crate::format::format_aspect;
use crate::image::{Image, ImageView};
use crate::pipeline::{
    BlendMode, DepthBias, DepthStencilState, GraphicsPipelineKey, InputLayout, MultisampleState,
    PipelineManager, RasterizerState, BINDING_SAMPLERS, BINDING_TEXTURES, MAX_RENDER_TARGETS,
    PUSH_CONSTANT_SIZE,
};
use crate::query::Query;
use crate::shader::{Shader, ShaderStage, MAX_TEXTURE_SLOTS, MAX_UNIFORM_SLOTS};
use crate::submission::{SubmissionTracker, TrackedObject};

bitflags! {
    /// Worker barrier policy adjustments.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BarrierControl: u32 {
        /// Skip barriers between consecutive transfer writes.
        const IGNORE_WRITE_AFTER_WRITE = 1 << 0;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct RecDirty: u32 {
        const PIPELINE        = 1 << 0;
        const VIEWPORT        = 1 << 1;
        const BLEND_CONSTANTS = 1 << 2;
        const STENCIL_REF     = 1 << 3;
        const DEPTH_BIAS      = 1 << 4;
        const VERTEX_BUFFERS  = 1 << 5;
        const INDEX_BUFFER    = 1 << 6;
        const DESCRIPTORS_VS  = 1 << 7;
        const DESCRIPTORS_FS  = 1 << 8;
        const PUSH_CONSTANTS  = 1 << 9;
    }
}

const MAX_VERTEX_BINDINGS: usize = 32;

#[derive(Default)]
struct StageBindings {
    uniforms: [Option<(Arc<Buffer>, u64, u64)>; MAX_UNIFORM_SLOTS as usize],
    textures: [Option<Arc<ImageView>>; MAX_TEXTURE_SLOTS as usize],
    samplers: [(vk::Sampler, vk::Sampler); MAX_TEXTURE_SLOTS as usize],
}

/// Shadow of the graphics state the worker has been told about. The
/// pipeline and descriptor sets are re-derived from it lazily at draw time.
struct GfxState {
    fb_color: Vec<Option<Arc<ImageView>>>,
    fb_depth: Option<Arc<ImageView>>,
    render_area: vk::Extent2D,
    viewports: Vec<vk::Viewport>,
    scissors: Vec<vk::Rect2D>,
    blend: [BlendMode; MAX_RENDER_TARGETS],
    blend_constants: [f32; 4],
    depth_stencil: DepthStencilState,
    stencil_reference: u32,
    rasterizer: RasterizerState,
    depth_bias: DepthBias,
    multisample: MultisampleState,
    alpha_test: [u32; 4],
    input_layout: InputLayout,
    topology: vk::PrimitiveTopology,
    vertex_shader: Option<Arc<Shader>>,
    pixel_shader: Option<Arc<Shader>>,
    compute_shader: Option<Arc<Shader>>,
    vertex_buffers: [Option<(Arc<Buffer>, u64, u32)>; MAX_VERTEX_BINDINGS],
    index_buffer: Option<(Arc<Buffer>, u64, vk::IndexType)>,
    vs: StageBindings,
    fs: StageBindings,
}

impl Default for GfxState {
    fn default() -> Self {
        Self {
            fb_color: Vec::new(),
            fb_depth: None,
            render_area: vk::Extent2D::default(),
            viewports: Vec::new(),
            scissors: Vec::new(),
            blend: [BlendMode::default(); MAX_RENDER_TARGETS],
            blend_constants: [0.0; 4],
            depth_stencil: DepthStencilState::default(),
            stencil_reference: 0,
            rasterizer: RasterizerState::default(),
            depth_bias: DepthBias::default(),
            multisample: MultisampleState::default(),
            alpha_test: [vk::CompareOp::ALWAYS.as_raw() as u32, 0, 0, 0],
            input_layout: InputLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            vertex_shader: None,
            pixel_shader: None,
            compute_shader: None,
            vertex_buffers: std::array::from_fn(|_| None),
            index_buffer: None,
            vs: StageBindings::default(),
            fs: StageBindings::default(),
        }
    }
}

/// The native recording context.
///
/// Owned and driven exclusively by the worker thread: applies command-stream
/// commands to the current native command buffer, manages render-pass
/// instances, barriers and descriptor updates, and submits on flush.
pub struct NativeContext {
    device: ash::Device,
    submissions: Arc<SubmissionTracker>,
    pipelines: Arc<PipelineManager>,
    heap: DescriptorHeap,

    cmd_pool: vk::CommandPool,
    cmd_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    recording: bool,
    rendering: bool,

    state: GfxState,
    dirty: RecDirty,
    barrier_control: BarrierControl,
    /// Whether the previous access on the transfer timeline was a write.
    transfer_write_pending: bool,

    tracked: Vec<TrackedObject>,
    retired_slices: Vec<(Arc<Buffer>, BufferSlice)>,
    signaled_events: Vec<Arc<Query>>,
    /// Spare command buffers + fences recycled from completed submissions.
    spare: Vec<(vk::CommandBuffer, vk::Fence)>,
}

impl NativeContext {
    pub fn new(
        device: ash::Device,
        queue_family_index: u32,
        submissions: Arc<SubmissionTracker>,
        pipelines: Arc<PipelineManager>,
    ) -> Result<Self, GpuError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let cmd_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let heap = DescriptorHeap::new(device.clone());

        Ok(Self {
            device,
            submissions,
            pipelines,
            heap,
            cmd_pool,
            cmd_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            recording: false,
            rendering: false,
            state: GfxState::default(),
            dirty: RecDirty::all(),
            barrier_control: BarrierControl::default(),
            transfer_write_pending: false,
            tracked: Vec::new(),
            retired_slices: Vec::new(),
            signaled_events: Vec::new(),
            spare: Vec::new(),
        })
    }

    pub fn mark_lost(&self) {
        self.submissions.mark_lost();
    }

    /// Applies one command. Called only from the worker thread, in chunk
    /// order.
    pub fn apply(&mut self, cmd: &CsCmd) -> Result<(), GpuError> {
        if self.submissions.is_lost() {
            return Ok(());
        }

        match cmd {
            CsCmd::SetBarrierControl(control) => {
                self.barrier_control = *control;
            }

            CsCmd::InitImage(image) => {
                self.ensure_recording()?;
                self.init_image(image)?;
                self.tracked.push(TrackedObject::Image(Arc::clone(image)));
            }

            CsCmd::InvalidateBuffer { buffer, slice } => {
                let old = buffer.replace_backing(*slice);
                self.retired_slices.push((Arc::clone(buffer), old));
                // Bindings resolve the physical slice at draw time; force a
                // re-resolve.
                self.dirty |= RecDirty::VERTEX_BUFFERS
                    | RecDirty::INDEX_BUFFER
                    | RecDirty::DESCRIPTORS_VS
                    | RecDirty::DESCRIPTORS_FS;
            }

            CsCmd::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                self.ensure_recording()?;
                self.suspend_rendering();
                self.transfer_barrier(true)?;
                let slice = buffer.physical_slice();
                let mut written = 0usize;
                while written < data.len() {
                    let len = (data.len() - written).min(65536);
                    unsafe {
                        self.device.cmd_update_buffer(
                            self.cmd_buffer,
                            slice.buffer,
                            slice.offset + offset + written as u64,
                            &data[written..written + len],
                        );
                    }
                    written += len;
                }
                self.tracked.push(TrackedObject::Buffer(Arc::clone(buffer)));
            }

            CsCmd::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.ensure_recording()?;
                self.suspend_rendering();
                self.transfer_barrier(true)?;
                let src_slice = src.physical_slice();
                let dst_slice = dst.physical_slice();
                let region = vk::BufferCopy {
                    src_offset: src_slice.offset + src_offset,
                    dst_offset: dst_slice.offset + dst_offset,
                    size: *size,
                };
                unsafe {
                    self.device.cmd_copy_buffer(
                        self.cmd_buffer,
                        src_slice.buffer,
                        dst_slice.buffer,
                        &[region],
                    );
                }
                self.tracked.push(TrackedObject::Buffer(Arc::clone(src)));
                self.tracked.push(TrackedObject::Buffer(Arc::clone(dst)));
            }

            CsCmd::CopyBufferToImage {
                src,
                src_offset,
                dst,
                layers,
                offset,
                extent,
                packed_format,
            } => {
                self.ensure_recording()?;
                self.suspend_rendering();
                self.transfer_barrier(true)?;
                self.copy_buffer_to_image(src, *src_offset, dst, *layers, *offset, *extent, *packed_format)?;
                self.tracked.push(TrackedObject::Buffer(Arc::clone(src)));
                self.tracked.push(TrackedObject::Image(Arc::clone(dst)));
            }

            CsCmd::CopyImageToBuffer {
                src,
                layers,
                offset,
                extent,
                dst,
                dst_offset,
            } => {
                self.ensure_recording()?;
                self.suspend_rendering();
                self.transfer_barrier(true)?;
                self.copy_image_to_buffer(src, *layers, *offset, *extent, dst, *dst_offset)?;
                self.tracked.push(TrackedObject::Image(Arc::clone(src)));
                self.tracked.push(TrackedObject::Buffer(Arc::clone(dst)));
            }

            CsCmd::ClearRenderTarget { view, color, rect } => {
                self.ensure_recording()?;
                self.clear_view(view, ClearValue::Color(*color), *rect)?;
                self.tracked.push(TrackedObject::View(Arc::clone(view)));
            }

            CsCmd::ClearDepthStencil {
                view,
                aspects,
                depth,
                stencil,
                rect,
            } => {
                self.ensure_recording()?;
                self.clear_view(
                    view,
                    ClearValue::DepthStencil {
                        aspects: *aspects,
                        depth: *depth,
                        stencil: *stencil,
                    },
                    *rect,
                )?;
                self.tracked.push(TrackedObject::View(Arc::clone(view)));
            }

            CsCmd::BindFramebuffer { color, depth } => {
                self.suspend_rendering();
                self.state.fb_color = color.clone();
                self.state.fb_depth = depth.clone();
                self.state.render_area = framebuffer_extent(color, depth);
                self.dirty |= RecDirty::PIPELINE;
                for view in color.iter().flatten() {
                    self.tracked.push(TrackedObject::View(Arc::clone(view)));
                }
                if let Some(view) = depth {
                    self.tracked.push(TrackedObject::View(Arc::clone(view)));
                }
            }

            CsCmd::SetViewports {
                viewports,
                scissors,
            } => {
                self.state.viewports = viewports.clone();
                self.state.scissors = scissors.clone();
                self.dirty |= RecDirty::VIEWPORT;
            }

            CsCmd::SetBlendState { targets } => {
                for (i, slot) in self.state.blend.iter_mut().enumerate() {
                    *slot = targets.get(i).copied().unwrap_or_default();
                }
                self.dirty |= RecDirty::PIPELINE;
            }

            CsCmd::SetBlendConstants(constants) => {
                self.state.blend_constants = *constants;
                self.dirty |= RecDirty::BLEND_CONSTANTS;
            }

            CsCmd::SetDepthStencilState(ds) => {
                self.state.depth_stencil = *ds;
                self.dirty |= RecDirty::PIPELINE;
            }

            CsCmd::SetStencilReference(reference) => {
                self.state.stencil_reference = *reference;
                self.dirty |= RecDirty::STENCIL_REF;
            }

            CsCmd::SetRasterizerState { state, bias } => {
                self.state.rasterizer = *state;
                self.state.depth_bias = *bias;
                self.dirty |= RecDirty::PIPELINE | RecDirty::DEPTH_BIAS;
            }

            CsCmd::SetMultisampleState(ms) => {
                self.state.multisample = *ms;
                self.dirty |= RecDirty::PIPELINE;
            }

            CsCmd::SetAlphaTest { func, reference } => {
                self.state.alpha_test = [func.as_raw() as u32, reference.to_bits(), 0, 0];
                self.dirty |= RecDirty::PUSH_CONSTANTS;
            }

            CsCmd::SetInputLayout(layout) => {
                self.state.input_layout = layout.clone();
                self.dirty |= RecDirty::PIPELINE;
            }

            CsCmd::SetPrimitiveTopology(topology) => {
                self.state.topology = *topology;
                self.dirty |= RecDirty::PIPELINE;
            }

            CsCmd::BindShader { stage, shader } => {
                match stage {
                    ShaderStage::Vertex => self.state.vertex_shader = shader.clone(),
                    ShaderStage::Pixel => self.state.pixel_shader = shader.clone(),
                    ShaderStage::Compute => self.state.compute_shader = shader.clone(),
                }
                self.dirty |= RecDirty::PIPELINE;
            }

            CsCmd::BindVertexBuffer {
                slot,
                buffer,
                offset,
                stride,
            } => {
                let slot = *slot as usize;
                if slot < MAX_VERTEX_BINDINGS {
                    self.state.vertex_buffers[slot] =
                        buffer.as_ref().map(|b| (Arc::clone(b), *offset, *stride));
                    self.dirty |= RecDirty::VERTEX_BUFFERS;
                    if let Some(buffer) = buffer {
                        self.tracked.push(TrackedObject::Buffer(Arc::clone(buffer)));
                    }
                }
            }

            CsCmd::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                self.state.index_buffer =
                    buffer.as_ref().map(|b| (Arc::clone(b), *offset, *index_type));
                self.dirty |= RecDirty::INDEX_BUFFER;
                if let Some(buffer) = buffer {
                    self.tracked.push(TrackedObject::Buffer(Arc::clone(buffer)));
                }
            }

            CsCmd::BindUniformBuffer {
                stage,
                slot,
                buffer,
                offset,
                length,
            } => {
                let slot = *slot as usize;
                if slot < MAX_UNIFORM_SLOTS as usize {
                    let bindings = self.stage_bindings_mut(*stage);
                    bindings.uniforms[slot] =
                        buffer.as_ref().map(|b| (Arc::clone(b), *offset, *length));
                    self.dirty |= descriptor_dirty_bit(*stage);
                    if let Some(buffer) = buffer {
                        self.tracked.push(TrackedObject::Buffer(Arc::clone(buffer)));
                    }
                }
            }

            CsCmd::BindImageView { stage, slot, view } => {
                let slot = *slot as usize;
                if slot < MAX_TEXTURE_SLOTS as usize {
                    let bindings = self.stage_bindings_mut(*stage);
                    bindings.textures[slot] = view.clone();
                    self.dirty |= descriptor_dirty_bit(*stage);
                    if let Some(view) = view {
                        self.tracked.push(TrackedObject::View(Arc::clone(view)));
                    }
                }
            }

            CsCmd::BindSampler {
                stage,
                slot,
                sampler,
                depth_compare_sampler,
            } => {
                let slot = *slot as usize;
                if slot < MAX_TEXTURE_SLOTS as usize {
                    let bindings = self.stage_bindings_mut(*stage);
                    bindings.samplers[slot] = (*sampler, *depth_compare_sampler);
                    self.dirty |= descriptor_dirty_bit(*stage);
                }
            }

            CsCmd::TransitionLayout { image, layout } => {
                self.ensure_recording()?;
                self.suspend_rendering();
                self.transition_image(image, image.layout(), *layout)?;
                image.set_layout(*layout);
                self.tracked.push(TrackedObject::Image(Arc::clone(image)));
            }

            CsCmd::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                if self.try_prepare_draw()? {
                    unsafe {
                        self.device.cmd_draw(
                            self.cmd_buffer,
                            *vertex_count,
                            *instance_count,
                            *first_vertex,
                            *first_instance,
                        );
                    }
                }
            }

            CsCmd::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                if self.try_prepare_draw()? {
                    unsafe {
                        self.device.cmd_draw_indexed(
                            self.cmd_buffer,
                            *index_count,
                            *instance_count,
                            *first_index,
                            *vertex_offset,
                            *first_instance,
                        );
                    }
                }
            }

            CsCmd::Dispatch { x, y, z } => {
                match self.prepare_dispatch() {
                    Ok(()) => unsafe { self.device.cmd_dispatch(self.cmd_buffer, *x, *y, *z) },
                    // An incomplete dispatch is the application's mistake,
                    // not a device fault.
                    Err(GpuError::InvalidParameter(reason)) => {
                        warn!(reason, "skipping dispatch");
                    }
                    Err(err) => return Err(err),
                }
            }

            CsCmd::BeginQuery(query) => {
                self.ensure_recording()?;
                if let Some((pool, index)) = query.slot() {
                    self.suspend_rendering();
                    unsafe {
                        self.device.cmd_reset_query_pool(self.cmd_buffer, pool, index, 1);
                        self.device.cmd_begin_query(
                            self.cmd_buffer,
                            pool,
                            index,
                            vk::QueryControlFlags::empty(),
                        );
                    }
                }
                self.tracked.push(TrackedObject::Query(Arc::clone(query)));
            }

            CsCmd::EndQuery(query) => {
                self.ensure_recording()?;
                if let Some((pool, index)) = query.slot() {
                    self.suspend_rendering();
                    unsafe { self.device.cmd_end_query(self.cmd_buffer, pool, index) };
                }
                self.tracked.push(TrackedObject::Query(Arc::clone(query)));
            }

            CsCmd::WriteTimestamp(query) => {
                self.ensure_recording()?;
                if let Some((pool, index)) = query.slot() {
                    self.suspend_rendering();
                    unsafe {
                        self.device.cmd_reset_query_pool(self.cmd_buffer, pool, index, 1);
                        self.device.cmd_write_timestamp(
                            self.cmd_buffer,
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                            pool,
                            index,
                        );
                    }
                }
                self.tracked.push(TrackedObject::Query(Arc::clone(query)));
            }

            CsCmd::SignalEvent(query) => {
                self.signaled_events.push(Arc::clone(query));
            }

            CsCmd::Flush => {
                self.flush_command_list()?;
            }
        }

        Ok(())
    }

    /// Closes the current native command buffer, submits it and opens a new
    /// one for subsequent commands.
    pub fn flush_command_list(&mut self) -> Result<(), GpuError> {
        if !self.recording {
            // Nothing recorded; events that would ride this submission are
            // already complete relative to all prior work.
            if !self.signaled_events.is_empty() {
                let last = self.submissions.last_completed();
                for query in self.signaled_events.drain(..) {
                    query.set_event_submission(last);
                }
            }
            return Ok(());
        }

        self.suspend_rendering();
        unsafe { self.device.end_command_buffer(self.cmd_buffer) }?;
        self.recording = false;

        let pools = self.heap.take_submitted();
        self.submissions.submit(
            self.cmd_buffer,
            self.fence,
            std::mem::take(&mut self.tracked),
            std::mem::take(&mut self.retired_slices),
            pools,
            std::mem::take(&mut self.signaled_events),
        )?;

        self.cmd_buffer = vk::CommandBuffer::null();
        self.fence = vk::Fence::null();
        self.transfer_write_pending = false;
        // Shadow state survives the submit; everything is rebound lazily on
        // the next draw.
        self.dirty = RecDirty::all();
        Ok(())
    }

    /// Tears the context down on worker exit.
    pub fn finalize(&mut self) {
        let _ = self.flush_command_list();
        self.submissions.wait_for_idle();
        self.recycle_completed();

        unsafe {
            if self.fence != vk::Fence::null() {
                self.device.destroy_fence(self.fence, None);
            }
            for (_, fence) in self.spare.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_command_pool(self.cmd_pool, None);
        }
    }

    fn stage_bindings_mut(&mut self, stage: ShaderStage) -> &mut StageBindings {
        match stage {
            ShaderStage::Vertex => &mut self.state.vs,
            _ => &mut self.state.fs,
        }
    }

    fn recycle_completed(&mut self) {
        for recycled in self.submissions.take_recycled() {
            let _ = unsafe { self.device.reset_fences(&[recycled.fence]) };
            self.spare.push((recycled.cmd_buffer, recycled.fence));
            self.heap.recycle(recycled.pools);
        }
    }

    fn ensure_recording(&mut self) -> Result<(), GpuError> {
        if self.recording {
            return Ok(());
        }

        self.recycle_completed();

        let (cmd_buffer, fence) = match self.spare.pop() {
            Some(pair) => pair,
            None => {
                let alloc = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.cmd_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let cmd_buffer = unsafe { self.device.allocate_command_buffers(&alloc) }?[0];
                let fence = unsafe {
                    self.device
                        .create_fence(&vk::FenceCreateInfo::default(), None)
                }?;
                (cmd_buffer, fence)
            }
        };

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd_buffer, &begin) }?;

        self.cmd_buffer = cmd_buffer;
        self.fence = fence;
        self.recording = true;
        Ok(())
    }

    fn suspend_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device.cmd_end_rendering(self.cmd_buffer) };
            self.rendering = false;
        }
    }

    fn begin_rendering(&mut self) -> Result<(), GpuError> {
        if self.rendering {
            return Ok(());
        }
        self.ensure_recording()?;

        let mut color_attachments = Vec::with_capacity(self.state.fb_color.len());
        for view in self.state.fb_color.iter().flatten() {
            let image = view.image();
            let layout = image.pick_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view.handle())
                    .image_layout(layout)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE),
            );
        }

        let mut depth_attachment = vk::RenderingAttachmentInfo::default();
        let mut stencil_attachment = vk::RenderingAttachmentInfo::default();
        let mut has_depth = false;
        let mut has_stencil = false;
        if let Some(view) = &self.state.fb_depth {
            let image = view.image();
            let layout = image.pick_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
            depth_attachment = depth_attachment
                .image_view(view.handle())
                .image_layout(layout)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE);
            stencil_attachment = stencil_attachment
                .image_view(view.handle())
                .image_layout(layout)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE);
            has_depth = true;
            has_stencil = view.info().aspect.contains(vk::ImageAspectFlags::STENCIL);
        }

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.state.render_area,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if has_depth {
            info = info.depth_attachment(&depth_attachment);
        }
        if has_stencil {
            info = info.stencil_attachment(&stencil_attachment);
        }

        unsafe { self.device.cmd_begin_rendering(self.cmd_buffer, &info) };
        self.rendering = true;
        Ok(())
    }

    /// Prepares a draw, reporting whether it can proceed. Draws with
    /// incomplete bindings are dropped rather than faulting the device.
    fn try_prepare_draw(&mut self) -> Result<bool, GpuError> {
        match self.prepare_draw() {
            Ok(()) => Ok(true),
            Err(GpuError::InvalidParameter(reason)) => {
                warn!(reason, "skipping draw");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn prepare_draw(&mut self) -> Result<(), GpuError> {
        self.ensure_recording()?;

        if self.state.fb_color.iter().all(Option::is_none) && self.state.fb_depth.is_none() {
            return Err(GpuError::InvalidParameter("draw without render targets"));
        }

        // Attachment layout fixups must happen outside the render pass
        // instance.
        if !self.rendering {
            self.prepare_attachments()?;
        }
        self.begin_rendering()?;

        if self.dirty.contains(RecDirty::PIPELINE) {
            self.bind_graphics_pipeline()?;
            self.dirty.remove(RecDirty::PIPELINE);
            // A fresh pipeline invalidates previously set push constants on
            // some drivers; re-push defensively is not needed with a shared
            // layout, but dynamic state must be re-applied after a submit.
        }

        if self.dirty.contains(RecDirty::VIEWPORT) && !self.state.viewports.is_empty() {
            unsafe {
                self.device
                    .cmd_set_viewport(self.cmd_buffer, 0, &self.state.viewports);
                self.device
                    .cmd_set_scissor(self.cmd_buffer, 0, &self.state.scissors);
            }
            self.dirty.remove(RecDirty::VIEWPORT);
        }

        if self.dirty.contains(RecDirty::BLEND_CONSTANTS) {
            unsafe {
                self.device
                    .cmd_set_blend_constants(self.cmd_buffer, &self.state.blend_constants);
            }
            self.dirty.remove(RecDirty::BLEND_CONSTANTS);
        }

        if self.dirty.contains(RecDirty::STENCIL_REF) {
            unsafe {
                self.device.cmd_set_stencil_reference(
                    self.cmd_buffer,
                    vk::StencilFaceFlags::FRONT_AND_BACK,
                    self.state.stencil_reference,
                );
            }
            self.dirty.remove(RecDirty::STENCIL_REF);
        }

        if self.dirty.contains(RecDirty::DEPTH_BIAS) {
            let bias = self.state.depth_bias;
            unsafe {
                self.device.cmd_set_depth_bias(
                    self.cmd_buffer,
                    bias.constant_factor,
                    bias.clamp,
                    bias.slope_factor,
                );
            }
            self.dirty.remove(RecDirty::DEPTH_BIAS);
        }

        if self.dirty.contains(RecDirty::VERTEX_BUFFERS) {
            self.bind_vertex_buffers();
            self.dirty.remove(RecDirty::VERTEX_BUFFERS);
        }

        if self.dirty.contains(RecDirty::INDEX_BUFFER) {
            if let Some((buffer, offset, index_type)) = &self.state.index_buffer {
                let slice = buffer.physical_slice();
                unsafe {
                    self.device.cmd_bind_index_buffer(
                        self.cmd_buffer,
                        slice.buffer,
                        slice.offset + offset,
                        *index_type,
                    );
                }
            }
            self.dirty.remove(RecDirty::INDEX_BUFFER);
        }

        if self.dirty.contains(RecDirty::DESCRIPTORS_VS) {
            self.bind_descriptors(ShaderStage::Vertex)?;
            self.dirty.remove(RecDirty::DESCRIPTORS_VS);
        }
        if self.dirty.contains(RecDirty::DESCRIPTORS_FS) {
            self.bind_descriptors(ShaderStage::Pixel)?;
            self.dirty.remove(RecDirty::DESCRIPTORS_FS);
        }

        if self.dirty.contains(RecDirty::PUSH_CONSTANTS) {
            let data = bytemuck::cast_slice::<u32, u8>(&self.state.alpha_test);
            debug_assert_eq!(data.len(), PUSH_CONSTANT_SIZE as usize);
            unsafe {
                self.device.cmd_push_constants(
                    self.cmd_buffer,
                    self.pipelines.pipeline_layout(),
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    data,
                );
            }
            self.dirty.remove(RecDirty::PUSH_CONSTANTS);
        }

        Ok(())
    }

    fn prepare_dispatch(&mut self) -> Result<(), GpuError> {
        self.ensure_recording()?;
        self.suspend_rendering();

        let shader = self
            .state
            .compute_shader
            .as_ref()
            .ok_or(GpuError::InvalidParameter("dispatch without a compute shader"))?;
        let pipeline = self.pipelines.get_compute(shader)?;
        unsafe {
            self.device.cmd_bind_pipeline(
                self.cmd_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            );
        }
        Ok(())
    }

    fn bind_graphics_pipeline(&mut self) -> Result<(), GpuError> {
        let (Some(vs), Some(fs)) = (
            self.state.vertex_shader.clone(),
            self.state.pixel_shader.clone(),
        ) else {
            return Err(GpuError::InvalidParameter("draw without bound shaders"));
        };

        let mut color_formats = [vk::Format::UNDEFINED; MAX_RENDER_TARGETS];
        for (i, view) in self.state.fb_color.iter().enumerate() {
            if let Some(view) = view {
                color_formats[i] = view.info().format;
            }
        }
        let depth_format = self
            .state
            .fb_depth
            .as_ref()
            .map(|v| v.info().format)
            .unwrap_or(vk::Format::UNDEFINED);

        let key = GraphicsPipelineKey {
            vertex_shader: vs.id(),
            pixel_shader: fs.id(),
            input_layout: self.state.input_layout.clone(),
            topology: self.state.topology,
            blend: self.state.blend,
            depth_stencil: if depth_format == vk::Format::UNDEFINED {
                DepthStencilState::default()
            } else {
                self.state.depth_stencil
            },
            rasterizer: self.state.rasterizer,
            multisample: self.state.multisample,
            color_formats,
            depth_format,
        };

        let pipeline = self.pipelines.get_graphics(&key, &vs, &fs)?;
        unsafe {
            self.device.cmd_bind_pipeline(
                self.cmd_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
        // Dynamic state is invalidated by a pipeline switch on the first
        // bind of a command buffer.
        self.dirty |= RecDirty::VIEWPORT
            | RecDirty::BLEND_CONSTANTS
            | RecDirty::STENCIL_REF
            | RecDirty::DEPTH_BIAS
            | RecDirty::PUSH_CONSTANTS;
        Ok(())
    }

    fn bind_vertex_buffers(&mut self) {
        for (slot, binding) in self.state.vertex_buffers.iter().enumerate() {
            let Some((buffer, offset, _stride)) = binding else {
                continue;
            };
            let slice = buffer.physical_slice();
            let buffers = [slice.buffer];
            let offsets = [slice.offset + offset];
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(self.cmd_buffer, slot as u32, &buffers, &offsets);
            }
        }
    }

    fn bind_descriptors(&mut self, stage: ShaderStage) -> Result<(), GpuError> {
        let layout = self.pipelines.set_layout(stage);
        let set = self.heap.alloc(layout)?;

        let bindings = match stage {
            ShaderStage::Vertex => &self.state.vs,
            _ => &self.state.fs,
        };

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut sampler_infos = Vec::new();

        for slot in 0..MAX_UNIFORM_SLOTS as usize {
            let info = match &bindings.uniforms[slot] {
                Some((buffer, offset, length)) => {
                    let slice = buffer.physical_slice();
                    vk::DescriptorBufferInfo {
                        buffer: slice.buffer,
                        offset: slice.offset + offset,
                        range: *length,
                    }
                }
                // Null descriptor; requires robustness2.nullDescriptor.
                None => vk::DescriptorBufferInfo {
                    buffer: vk::Buffer::null(),
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                },
            };
            buffer_infos.push(info);
        }

        for slot in 0..MAX_TEXTURE_SLOTS as usize {
            let info = match &bindings.textures[slot] {
                Some(view) => vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view.handle(),
                    image_layout: view
                        .image()
                        .pick_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                },
                None => vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                },
            };
            image_infos.push(info);

            // Depth-aspect textures sample through the comparison sampler.
            let (color_sampler, compare_sampler) = bindings.samplers[slot];
            let wants_compare = bindings.textures[slot]
                .as_ref()
                .map(|v| v.info().aspect.contains(vk::ImageAspectFlags::DEPTH))
                .unwrap_or(false);
            sampler_infos.push(vk::DescriptorImageInfo {
                sampler: if wants_compare && compare_sampler != vk::Sampler::null() {
                    compare_sampler
                } else {
                    color_sampler
                },
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            });
        }

        let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len() * 2);
        for (slot, info) in buffer_infos.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(slot as u32)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(info)),
            );
        }
        for (slot, info) in image_infos.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_TEXTURES + slot as u32)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(std::slice::from_ref(info)),
            );
        }
        for (slot, info) in sampler_infos.iter().enumerate() {
            if info.sampler == vk::Sampler::null() {
                continue;
            }
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_SAMPLERS + slot as u32)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let set_index = match stage {
            ShaderStage::Vertex => 0,
            _ => 1,
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.pipeline_layout(),
                set_index,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    /// Moves render-target and sampled images into their expected standing
    /// layouts before a render pass instance begins.
    fn prepare_attachments(&mut self) -> Result<(), GpuError> {
        let color: Vec<Arc<ImageView>> = self.state.fb_color.iter().flatten().cloned().collect();
        for view in color {
            self.init_image(view.image())?;
        }
        if let Some(view) = self.state.fb_depth.clone() {
            self.init_image(view.image())?;
        }
        Ok(())
    }

    fn init_image(&mut self, image: &Arc<Image>) -> Result<(), GpuError> {
        let current = image.layout();
        if current == vk::ImageLayout::UNDEFINED || current == vk::ImageLayout::PREINITIALIZED {
            self.suspend_rendering();
            self.transition_image(image, current, image.info().layout)?;
            image.set_layout(image.info().layout);
        }
        Ok(())
    }

    fn transition_image(
        &mut self,
        image: &Arc<Image>,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) -> Result<(), GpuError> {
        self.ensure_recording()?;

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .old_layout(from)
            .new_layout(to)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: format_aspect(image.info().format),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(())
    }

    /// Serializes transfer work against earlier GPU access. When the next
    /// access is a write and the previous one was too, the barrier is
    /// skipped under `IGNORE_WRITE_AFTER_WRITE`.
    fn transfer_barrier(&mut self, write: bool) -> Result<(), GpuError> {
        let skip = write
            && self.transfer_write_pending
            && self
                .barrier_control
                .contains(BarrierControl::IGNORE_WRITE_AFTER_WRITE);
        self.transfer_write_pending = write;
        if skip {
            return Ok(());
        }

        self.ensure_recording()?;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    fn copy_buffer_to_image(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Image>,
        layers: vk::ImageSubresourceLayers,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        packed_format: Option<vk::Format>,
    ) -> Result<(), GpuError> {
        self.init_image(dst)?;
        let standing = dst.layout();
        self.transition_image(dst, standing, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let slice = src.physical_slice();

        if packed_format.is_some() {
            // Packed depth-stencil data carries both aspects consecutively;
            // emit one region per aspect against the packed layout.
            let depth_layers = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                ..layers
            };
            let stencil_layers = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::STENCIL,
                ..layers
            };
            let depth_size =
                u64::from(extent.width) * u64::from(extent.height) * u64::from(extent.depth) * 4;
            let regions = [
                vk::BufferImageCopy {
                    buffer_offset: slice.offset + src_offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: depth_layers,
                    image_offset: offset,
                    image_extent: extent,
                },
                vk::BufferImageCopy {
                    buffer_offset: slice.offset + src_offset + depth_size,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: stencil_layers,
                    image_offset: offset,
                    image_extent: extent,
                },
            ];
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    self.cmd_buffer,
                    slice.buffer,
                    dst.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
            }
        } else {
            let region = vk::BufferImageCopy {
                buffer_offset: slice.offset + src_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: layers,
                image_offset: offset,
                image_extent: extent,
            };
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    self.cmd_buffer,
                    slice.buffer,
                    dst.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }

        self.transition_image(dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, standing)?;
        Ok(())
    }

    fn copy_image_to_buffer(
        &mut self,
        src: &Arc<Image>,
        layers: vk::ImageSubresourceLayers,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        dst: &Arc<Buffer>,
        dst_offset: u64,
    ) -> Result<(), GpuError> {
        self.init_image(src)?;
        let standing = src.layout();
        self.transition_image(src, standing, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

        let slice = dst.physical_slice();
        let region = vk::BufferImageCopy {
            buffer_offset: slice.offset + dst_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: layers,
            image_offset: offset,
            image_extent: extent,
        };
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.cmd_buffer,
                src.handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                slice.buffer,
                &[region],
            );
        }

        self.transition_image(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, standing)?;
        Ok(())
    }

    fn clear_view(
        &mut self,
        view: &Arc<ImageView>,
        value: ClearValue,
        rect: Option<vk::Rect2D>,
    ) -> Result<(), GpuError> {
        let attachment_index = self.bound_attachment_index(view);

        if let (Some(index), Some(rect)) = (attachment_index, rect) {
            // Rect-limited clear of a bound attachment: clear in-pass.
            self.prepare_attachments()?;
            self.begin_rendering()?;

            let attachment = match value {
                ClearValue::Color(color) => vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: index,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue { float32: color },
                    },
                },
                ClearValue::DepthStencil {
                    aspects,
                    depth,
                    stencil,
                } => vk::ClearAttachment {
                    aspect_mask: aspects,
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                    },
                },
            };
            let clear_rect = vk::ClearRect {
                rect,
                base_array_layer: 0,
                layer_count: 1,
            };
            unsafe {
                self.device
                    .cmd_clear_attachments(self.cmd_buffer, &[attachment], &[clear_rect]);
            }
            return Ok(());
        }

        if rect.is_some() && attachment_index.is_none() {
            warn!("rect-limited clear of an unbound view clears the whole subresource");
        }

        // Whole-subresource clear through the transfer path.
        self.suspend_rendering();
        self.init_image(view.image())?;
        let image = view.image();
        let standing = image.layout();
        self.transition_image(image, standing, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let range = view.subresources();
        match value {
            ClearValue::Color(color) => unsafe {
                self.device.cmd_clear_color_image(
                    self.cmd_buffer,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearColorValue { float32: color },
                    &[range],
                );
            },
            ClearValue::DepthStencil {
                aspects,
                depth,
                stencil,
            } => unsafe {
                let range = vk::ImageSubresourceRange {
                    aspect_mask: aspects,
                    ..range
                };
                self.device.cmd_clear_depth_stencil_image(
                    self.cmd_buffer,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearDepthStencilValue { depth, stencil },
                    &[range],
                );
            },
        }

        self.transition_image(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, standing)?;
        Ok(())
    }

    fn bound_attachment_index(&self, view: &Arc<ImageView>) -> Option<u32> {
        for (i, bound) in self.state.fb_color.iter().enumerate() {
            if let Some(bound) = bound {
                if Arc::ptr_eq(bound, view) {
                    return Some(i as u32);
                }
            }
        }
        if let Some(depth) = &self.state.fb_depth {
            if Arc::ptr_eq(depth, view) {
                // Depth clears via the attachment path ignore the index.
                return Some(0);
            }
        }
        None
    }
}

enum ClearValue {
    Color([f32; 4]),
    DepthStencil {
        aspects: vk::ImageAspectFlags,
        depth: f32,
        stencil: u32,
    },
}

fn descriptor_dirty_bit(stage: ShaderStage) -> RecDirty {
    match stage {
        ShaderStage::Vertex => RecDirty::DESCRIPTORS_VS,
        _ => RecDirty::DESCRIPTORS_FS,
    }
}

fn framebuffer_extent(
    color: &[Option<Arc<ImageView>>],
    depth: &Option<Arc<ImageView>>,
) -> vk::Extent2D {
    let mut extent = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };
    let mut any = false;

    for view in color.iter().flatten().chain(depth.iter()) {
        let e = view.mip_level_extent(0);
        extent.width = extent.width.min(e.width);
        extent.height = extent.height.min(e.height);
        any = true;
    }

    if any {
        extent
    } else {
        vk::Extent2D::default()
    }
}

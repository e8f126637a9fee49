use std::sync::Arc;

use ash::vk;
use tracing::warn;

use prism_gpu::cs::{ChunkTag, CsChunk, CsCmd};
use prism_gpu::{Device, ShaderStage};

use crate::query::Query11;
use crate::resource::{Buffer11, DepthStencilView11, RenderTargetView11, ShaderResourceView11};
use crate::state::{
    BlendState11, DepthStencilState11, DirtyFlags, IndexBufferBinding, RasterizerState11,
    SamplerState11, ScissorRect, StateVector, Topology, VertexBufferBinding, Viewport,
    MAX_CONSTANT_BUFFER_COUNT, MAX_SAMPLER_COUNT, MAX_SRV_COUNT, MAX_VERTEX_BUFFER_COUNT,
};
use crate::translate;

/// Where sealed chunks go: straight to the worker (immediate context) or
/// into an accumulating command list (deferred context).
pub(crate) enum Sink {
    Worker,
    List(Vec<Arc<CsChunk>>),
}

/// Context behavior shared between the immediate and deferred contexts:
/// the state vector, dirty tracking, chunk emission and draw preparation.
pub struct CommonContext {
    device: Device,
    tag: ChunkTag,
    chunk: CsChunk,
    pub(crate) sink: Sink,
    pub state: StateVector,
    dirty: DirtyFlags,
    /// Whether the worker has received work since the last submit.
    cs_busy: bool,
}

impl CommonContext {
    pub(crate) fn new(device: Device, tag: ChunkTag, sink: Sink) -> Self {
        let mut ctx = Self {
            device,
            tag,
            chunk: CsChunk::new(tag),
            sink,
            state: StateVector::default(),
            dirty: DirtyFlags::all(),
            cs_busy: false,
        };
        ctx.state.clear();
        ctx
    }

    /// Whether any work would be lost by skipping a submit: either the
    /// worker holds undrained chunks or the current chunk has commands.
    pub(crate) fn is_busy(&self) -> bool {
        self.cs_busy || !self.chunk.is_empty()
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.cs_busy = busy;
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Appends a command to the current chunk, sealing and publishing the
    /// chunk first if it is full.
    pub(crate) fn emit(&mut self, cmd: CsCmd) {
        if let Err(cmd) = self.chunk.try_push(cmd) {
            self.flush_chunk();
            // A fresh chunk always has room.
            let _ = self.chunk.try_push(cmd);
        }
    }

    /// Seals the current chunk and hands it to the sink.
    pub(crate) fn flush_chunk(&mut self) {
        if self.chunk.is_empty() {
            return;
        }
        let chunk = Arc::new(std::mem::replace(&mut self.chunk, CsChunk::new(self.tag)));
        match &mut self.sink {
            Sink::Worker => {
                self.device.cs().dispatch(chunk);
                self.cs_busy = true;
            }
            Sink::List(chunks) => chunks.push(chunk),
        }
    }

    // ------------------------------------------------------------------
    // Output merger
    // ------------------------------------------------------------------

    pub fn om_set_render_targets(
        &mut self,
        render_targets: &[Option<Arc<RenderTargetView11>>],
        depth_stencil: Option<Arc<DepthStencilView11>>,
    ) {
        for (i, slot) in self.state.render_targets.iter_mut().enumerate() {
            *slot = render_targets.get(i).cloned().flatten();
        }
        self.state.depth_stencil_view = depth_stencil;
        self.dirty |= DirtyFlags::FRAMEBUFFER | DirtyFlags::MULTISAMPLE;
    }

    pub fn om_set_blend_state(
        &mut self,
        state: Option<Arc<BlendState11>>,
        blend_factor: Option<[f32; 4]>,
        sample_mask: u32,
    ) {
        self.state.blend_state = state;
        if let Some(factor) = blend_factor {
            self.state.blend_factor = factor;
            // Push state: bound rather than recorded.
            self.emit(CsCmd::SetBlendConstants(factor));
        }
        self.state.sample_mask = sample_mask;
        self.dirty |= DirtyFlags::BLEND | DirtyFlags::MULTISAMPLE;
    }

    pub fn om_set_depth_stencil_state(
        &mut self,
        state: Option<Arc<DepthStencilState11>>,
        stencil_ref: u32,
    ) {
        self.state.depth_stencil_state = state;
        if self.state.stencil_ref != stencil_ref {
            self.state.stencil_ref = stencil_ref;
            self.emit(CsCmd::SetStencilReference(stencil_ref));
        }
        self.dirty |= DirtyFlags::DEPTH_STENCIL;
    }

    // ------------------------------------------------------------------
    // Rasterizer
    // ------------------------------------------------------------------

    pub fn rs_set_state(&mut self, state: Option<Arc<RasterizerState11>>) {
        self.state.rasterizer_state = state;
        // Scissor enable feeds the viewport/scissor resolution too.
        self.dirty |= DirtyFlags::RASTERIZER | DirtyFlags::VIEWPORT_SCISSOR;
    }

    pub fn rs_set_viewports(&mut self, viewports: &[Viewport]) {
        self.state.viewports = viewports.to_vec();
        self.dirty |= DirtyFlags::VIEWPORT_SCISSOR;
    }

    pub fn rs_set_scissor_rects(&mut self, scissors: &[ScissorRect]) {
        self.state.scissors = scissors.to_vec();
        self.dirty |= DirtyFlags::VIEWPORT_SCISSOR;
    }

    // ------------------------------------------------------------------
    // Input assembler
    // ------------------------------------------------------------------

    pub fn ia_set_input_layout(&mut self, layout: Option<Arc<crate::resource::InputLayout11>>) {
        self.state.input_layout = layout;
        self.dirty |= DirtyFlags::INPUT_LAYOUT;
    }

    pub fn ia_set_primitive_topology(&mut self, topology: Topology) {
        self.state.topology = topology;
        self.dirty |= DirtyFlags::INPUT_LAYOUT;
    }

    pub fn ia_set_vertex_buffers(&mut self, start_slot: u32, buffers: &[VertexBufferBinding]) {
        for (i, binding) in buffers.iter().enumerate() {
            let slot = start_slot as usize + i;
            if slot >= MAX_VERTEX_BUFFER_COUNT {
                break;
            }
            self.state.vertex_buffers[slot] = binding.clone();
        }
        self.dirty |= DirtyFlags::VERTEX_BUFFERS | DirtyFlags::INPUT_LAYOUT;
    }

    pub fn ia_set_index_buffer(&mut self, binding: IndexBufferBinding) {
        self.state.index_buffer = binding;
        self.dirty |= DirtyFlags::INDEX_BUFFER;
    }

    // ------------------------------------------------------------------
    // Shader stages
    // ------------------------------------------------------------------

    pub fn vs_set_shader(&mut self, shader: Option<Arc<prism_gpu::Shader>>) {
        self.state.vs.shader = shader;
        self.dirty |= DirtyFlags::SHADER_VS | DirtyFlags::INPUT_LAYOUT;
    }

    pub fn ps_set_shader(&mut self, shader: Option<Arc<prism_gpu::Shader>>) {
        self.state.ps.shader = shader;
        self.dirty |= DirtyFlags::SHADER_PS;
    }

    pub fn cs_set_shader(&mut self, shader: Option<Arc<prism_gpu::Shader>>) {
        self.state.cs.shader = shader;
        self.dirty |= DirtyFlags::SHADER_CS;
    }

    pub fn vs_set_constant_buffers(&mut self, start_slot: u32, buffers: &[Option<Arc<Buffer11>>]) {
        Self::set_slots(
            &mut self.state.vs.constant_buffers,
            start_slot,
            buffers,
            MAX_CONSTANT_BUFFER_COUNT,
        );
        self.dirty |= DirtyFlags::CONSTANTS_VS;
    }

    pub fn ps_set_constant_buffers(&mut self, start_slot: u32, buffers: &[Option<Arc<Buffer11>>]) {
        Self::set_slots(
            &mut self.state.ps.constant_buffers,
            start_slot,
            buffers,
            MAX_CONSTANT_BUFFER_COUNT,
        );
        self.dirty |= DirtyFlags::CONSTANTS_PS;
    }

    pub fn vs_set_shader_resources(
        &mut self,
        start_slot: u32,
        views: &[Option<Arc<ShaderResourceView11>>],
    ) {
        Self::set_slots(
            &mut self.state.vs.shader_resources,
            start_slot,
            views,
            MAX_SRV_COUNT,
        );
        self.dirty |= DirtyFlags::RESOURCES_VS;
    }

    pub fn ps_set_shader_resources(
        &mut self,
        start_slot: u32,
        views: &[Option<Arc<ShaderResourceView11>>],
    ) {
        Self::set_slots(
            &mut self.state.ps.shader_resources,
            start_slot,
            views,
            MAX_SRV_COUNT,
        );
        self.dirty |= DirtyFlags::RESOURCES_PS;
    }

    pub fn vs_set_samplers(&mut self, start_slot: u32, samplers: &[Option<Arc<SamplerState11>>]) {
        Self::set_slots(
            &mut self.state.vs.samplers,
            start_slot,
            samplers,
            MAX_SAMPLER_COUNT,
        );
        self.dirty |= DirtyFlags::SAMPLERS_VS;
    }

    pub fn ps_set_samplers(&mut self, start_slot: u32, samplers: &[Option<Arc<SamplerState11>>]) {
        Self::set_slots(
            &mut self.state.ps.samplers,
            start_slot,
            samplers,
            MAX_SAMPLER_COUNT,
        );
        self.dirty |= DirtyFlags::SAMPLERS_PS;
    }

    fn set_slots<T: Clone>(dst: &mut [Option<T>], start_slot: u32, src: &[Option<T>], max: usize) {
        for (i, item) in src.iter().enumerate() {
            let slot = start_slot as usize + i;
            if slot >= max {
                break;
            }
            dst[slot] = item.clone();
        }
    }

    // ------------------------------------------------------------------
    // Clears
    // ------------------------------------------------------------------

    pub fn clear_render_target_view(&mut self, rtv: &Arc<RenderTargetView11>, color: [f32; 4]) {
        self.emit(CsCmd::ClearRenderTarget {
            view: Arc::clone(&rtv.view),
            color,
            rect: None,
        });
    }

    pub fn clear_depth_stencil_view(
        &mut self,
        dsv: &Arc<DepthStencilView11>,
        clear_depth: bool,
        clear_stencil: bool,
        depth: f32,
        stencil: u32,
    ) {
        let mut aspects = vk::ImageAspectFlags::empty();
        if clear_depth {
            aspects |= vk::ImageAspectFlags::DEPTH;
        }
        if clear_stencil {
            aspects |= vk::ImageAspectFlags::STENCIL;
        }
        aspects &= dsv.view.info().aspect;
        if aspects.is_empty() {
            return;
        }
        self.emit(CsCmd::ClearDepthStencil {
            view: Arc::clone(&dsv.view),
            aspects,
            depth,
            stencil,
            rect: None,
        });
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn begin_query(&mut self, query: &Arc<Query11>) {
        if query.is_event() {
            // Begin is a no-op for event-like queries.
            return;
        }
        query.core().set_state(prism_gpu::QueryState::Begun);
        self.emit(CsCmd::BeginQuery(Arc::clone(query.core())));
    }

    pub fn end_query(&mut self, query: &Arc<Query11>) {
        query.core().notify_end();
        if query.is_event() {
            query.core().set_state(prism_gpu::QueryState::Ended);
            self.emit(CsCmd::SignalEvent(Arc::clone(query.core())));
        } else {
            match query.kind() {
                crate::query::QueryKind11::Timestamp => {
                    self.emit(CsCmd::WriteTimestamp(Arc::clone(query.core())));
                }
                _ => self.emit(CsCmd::EndQuery(Arc::clone(query.core()))),
            }
            query.core().set_state(prism_gpu::QueryState::Ended);
        }
    }

    // ------------------------------------------------------------------
    // Draws and dispatches
    // ------------------------------------------------------------------

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.prepare_draw();
        self.emit(CsCmd::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.prepare_draw();
        self.emit(CsCmd::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if self.dirty.contains(DirtyFlags::SHADER_CS) {
            self.emit(CsCmd::BindShader {
                stage: ShaderStage::Compute,
                shader: self.state.cs.shader.clone(),
            });
            self.dirty.remove(DirtyFlags::SHADER_CS);
        }
        self.emit(CsCmd::Dispatch { x, y, z });
    }

    // ------------------------------------------------------------------
    // State reset / restore
    // ------------------------------------------------------------------

    /// Resets the state vector to defaults and rebinds everything lazily.
    pub fn clear_state(&mut self) {
        self.state.clear();
        self.dirty = DirtyFlags::all();
        self.emit(CsCmd::SetBlendConstants([0.0; 4]));
        self.emit(CsCmd::SetStencilReference(0));
    }

    /// Re-emits push states and marks every category dirty so the next
    /// draw projects the (restored) state vector afresh.
    pub fn restore_state(&mut self) {
        self.dirty = DirtyFlags::all();
        self.emit(CsCmd::SetBlendConstants(self.state.blend_factor));
        self.emit(CsCmd::SetStencilReference(self.state.stencil_ref));
    }

    // ------------------------------------------------------------------
    // Draw preparation
    // ------------------------------------------------------------------

    /// Resolves every set dirty bit into worker commands, in fixed order.
    ///
    /// The emitted command set is a function of the final state vector;
    /// intermediate mutations between draws never surface.
    pub(crate) fn prepare_draw(&mut self) {
        if self.device.options().has_hazards {
            self.check_hazards();
        }

        if self.dirty.contains(DirtyFlags::FRAMEBUFFER) {
            self.bind_framebuffer();
            self.dirty.remove(DirtyFlags::FRAMEBUFFER);
        }

        if self.dirty.contains(DirtyFlags::VIEWPORT_SCISSOR) {
            self.bind_viewports();
            self.dirty.remove(DirtyFlags::VIEWPORT_SCISSOR);
        }

        if self.dirty.contains(DirtyFlags::BLEND) {
            let targets = match &self.state.blend_state {
                Some(state) => translate::translate_blend_state(state),
                None => translate::translate_blend_state(&BlendState11::default()),
            };
            self.emit(CsCmd::SetBlendState { targets });
            self.dirty.remove(DirtyFlags::BLEND);
        }

        if self.dirty.contains(DirtyFlags::DEPTH_STENCIL) {
            let ds = match &self.state.depth_stencil_state {
                Some(state) => translate::translate_depth_stencil_state(state),
                None => translate::translate_depth_stencil_state(&DepthStencilState11::default()),
            };
            self.emit(CsCmd::SetDepthStencilState(ds));
            self.dirty.remove(DirtyFlags::DEPTH_STENCIL);
        }

        if self.dirty.contains(DirtyFlags::RASTERIZER) {
            let (state, bias) = match &self.state.rasterizer_state {
                Some(rs) => translate::translate_rasterizer_state(rs),
                None => translate::translate_rasterizer_state(&RasterizerState11::default()),
            };
            self.emit(CsCmd::SetRasterizerState { state, bias });
            self.dirty.remove(DirtyFlags::RASTERIZER);
        }

        if self.dirty.contains(DirtyFlags::MULTISAMPLE) {
            let sample_count = self
                .state
                .render_targets
                .iter()
                .flatten()
                .next()
                .map(|rtv| rtv.view.image().info().sample_count)
                .unwrap_or(vk::SampleCountFlags::TYPE_1);
            let alpha_to_coverage = self
                .state
                .blend_state
                .as_ref()
                .map(|b| b.alpha_to_coverage)
                .unwrap_or(false);
            self.emit(CsCmd::SetMultisampleState(
                translate::translate_multisample_state(
                    sample_count,
                    self.state.sample_mask,
                    alpha_to_coverage,
                ),
            ));
            self.dirty.remove(DirtyFlags::MULTISAMPLE);
        }

        if self.dirty.contains(DirtyFlags::INPUT_LAYOUT) {
            self.bind_input_layout();
            self.dirty.remove(DirtyFlags::INPUT_LAYOUT);
        }

        if self.dirty.contains(DirtyFlags::SHADER_VS) {
            self.emit(CsCmd::BindShader {
                stage: ShaderStage::Vertex,
                shader: self.state.vs.shader.clone(),
            });
            self.dirty.remove(DirtyFlags::SHADER_VS);
        }

        if self.dirty.contains(DirtyFlags::SHADER_PS) {
            self.emit(CsCmd::BindShader {
                stage: ShaderStage::Pixel,
                shader: self.state.ps.shader.clone(),
            });
            self.dirty.remove(DirtyFlags::SHADER_PS);
        }

        if self.dirty.contains(DirtyFlags::VERTEX_BUFFERS) {
            self.bind_vertex_buffers();
            self.dirty.remove(DirtyFlags::VERTEX_BUFFERS);
        }

        if self.dirty.contains(DirtyFlags::INDEX_BUFFER) {
            let binding = &self.state.index_buffer;
            self.emit(CsCmd::BindIndexBuffer {
                buffer: binding.buffer.as_ref().map(|b| Arc::clone(b.buffer())),
                offset: u64::from(binding.offset),
                index_type: translate::decode_index_format(binding.format),
            });
            self.dirty.remove(DirtyFlags::INDEX_BUFFER);
        }

        if self.dirty.contains(DirtyFlags::RESOURCES_VS) {
            self.bind_shader_resources(ShaderStage::Vertex);
            self.dirty.remove(DirtyFlags::RESOURCES_VS);
        }
        if self.dirty.contains(DirtyFlags::RESOURCES_PS) {
            self.bind_shader_resources(ShaderStage::Pixel);
            self.dirty.remove(DirtyFlags::RESOURCES_PS);
        }

        if self.dirty.contains(DirtyFlags::SAMPLERS_VS) {
            self.bind_samplers(ShaderStage::Vertex);
            self.dirty.remove(DirtyFlags::SAMPLERS_VS);
        }
        if self.dirty.contains(DirtyFlags::SAMPLERS_PS) {
            self.bind_samplers(ShaderStage::Pixel);
            self.dirty.remove(DirtyFlags::SAMPLERS_PS);
        }

        // Constant bindings go last, matching the upload-then-draw order
        // the worker expects.
        if self.dirty.contains(DirtyFlags::CONSTANTS_VS) {
            self.bind_constant_buffers(ShaderStage::Vertex);
            self.dirty.remove(DirtyFlags::CONSTANTS_VS);
        }
        if self.dirty.contains(DirtyFlags::CONSTANTS_PS) {
            self.bind_constant_buffers(ShaderStage::Pixel);
            self.dirty.remove(DirtyFlags::CONSTANTS_PS);
        }
    }

    fn bind_framebuffer(&mut self) {
        let color: Vec<Option<Arc<prism_gpu::ImageView>>> = self
            .state
            .render_targets
            .iter()
            .map(|rtv| rtv.as_ref().map(|r| Arc::clone(&r.view)))
            .collect();
        let depth = self
            .state
            .depth_stencil_view
            .as_ref()
            .map(|d| Arc::clone(&d.view));
        self.emit(CsCmd::BindFramebuffer { color, depth });
    }

    fn bind_viewports(&mut self) {
        if self.state.viewports.is_empty() {
            return;
        }
        let viewports: Vec<vk::Viewport> = self
            .state
            .viewports
            .iter()
            .map(translate::translate_viewport)
            .collect();

        let scissor_enabled = self
            .state
            .rasterizer_state
            .as_ref()
            .map(|rs| rs.scissor_enable)
            .unwrap_or(false);

        let scissors: Vec<vk::Rect2D> = self
            .state
            .viewports
            .iter()
            .enumerate()
            .map(|(i, vp)| {
                if scissor_enabled {
                    if let Some(sr) = self.state.scissors.get(i) {
                        return vk::Rect2D {
                            offset: vk::Offset2D {
                                x: sr.left,
                                y: sr.top,
                            },
                            extent: vk::Extent2D {
                                width: (sr.right - sr.left).max(0) as u32,
                                height: (sr.bottom - sr.top).max(0) as u32,
                            },
                        };
                    }
                }
                vk::Rect2D {
                    offset: vk::Offset2D {
                        x: vp.top_left_x as i32,
                        y: vp.top_left_y as i32,
                    },
                    extent: vk::Extent2D {
                        width: vp.width.max(0.0) as u32,
                        height: vp.height.max(0.0) as u32,
                    },
                }
            })
            .collect();

        self.emit(CsCmd::SetViewports {
            viewports,
            scissors,
        });
    }

    fn bind_input_layout(&mut self) {
        let Some(layout) = self.state.input_layout.clone() else {
            return;
        };
        let Some(shader) = self.state.vs.shader.clone() else {
            // No vertex shader: layout resolution happens once one is
            // bound; SHADER_VS re-dirties the input layout.
            return;
        };

        let mut resolved = translate::resolve_input_layout(&layout.elements, shader.metadata());
        let strides: Vec<u32> = self
            .state
            .vertex_buffers
            .iter()
            .map(|vb| vb.stride)
            .collect();
        translate::finalize_input_layout(&mut resolved, &strides);

        self.emit(CsCmd::SetInputLayout(resolved));
        self.emit(CsCmd::SetPrimitiveTopology(translate::decode_topology(
            self.state.topology,
        )));
    }

    fn bind_vertex_buffers(&mut self) {
        let bindings: Vec<CsCmd> = self
            .state
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(slot, binding)| CsCmd::BindVertexBuffer {
                slot: slot as u32,
                buffer: binding.buffer.as_ref().map(|b| Arc::clone(b.buffer())),
                offset: u64::from(binding.offset),
                stride: binding.stride,
            })
            .collect();
        for cmd in bindings {
            self.emit(cmd);
        }
    }

    fn bind_shader_resources(&mut self, stage: ShaderStage) {
        let views: Vec<(u32, Option<Arc<prism_gpu::ImageView>>)> = {
            let stage_state = match stage {
                ShaderStage::Vertex => &self.state.vs,
                _ => &self.state.ps,
            };
            stage_state
                .shader_resources
                .iter()
                .enumerate()
                .map(|(slot, srv)| {
                    (
                        slot as u32,
                        srv.as_ref().map(|s| Arc::clone(&s.view)),
                    )
                })
                .collect()
        };
        for (slot, view) in views {
            self.emit(CsCmd::BindImageView { stage, slot, view });
        }
    }

    fn bind_samplers(&mut self, stage: ShaderStage) {
        let keys: Vec<(u32, Option<prism_gpu::SamplerKey>)> = {
            let stage_state = match stage {
                ShaderStage::Vertex => &self.state.vs,
                _ => &self.state.ps,
            };
            stage_state
                .samplers
                .iter()
                .enumerate()
                .map(|(slot, desc)| {
                    (
                        slot as u32,
                        desc.as_ref().map(|d| translate::translate_sampler(d)),
                    )
                })
                .collect()
        };

        for (slot, key) in keys {
            let key = key.unwrap_or_else(|| {
                translate::translate_sampler(&SamplerState11::default())
            });
            match self.device.sampler(key) {
                Ok(pair) => self.emit(CsCmd::BindSampler {
                    stage,
                    slot,
                    sampler: pair.color,
                    depth_compare_sampler: pair.depth_compare,
                }),
                Err(err) => warn!(?err, slot, "sampler creation failed"),
            }
        }
    }

    fn bind_constant_buffers(&mut self, stage: ShaderStage) {
        let buffers: Vec<(u32, Option<(Arc<prism_gpu::Buffer>, u64)>)> = {
            let stage_state = match stage {
                ShaderStage::Vertex => &self.state.vs,
                _ => &self.state.ps,
            };
            stage_state
                .constant_buffers
                .iter()
                .enumerate()
                .map(|(slot, cb)| {
                    (
                        slot as u32,
                        cb.as_ref()
                            .map(|b| (Arc::clone(b.buffer()), b.desc().byte_width)),
                    )
                })
                .collect()
        };
        for (slot, binding) in buffers {
            let (buffer, length) = match binding {
                Some((buffer, length)) => (Some(buffer), length),
                None => (None, 0),
            };
            self.emit(CsCmd::BindUniformBuffer {
                stage,
                slot,
                buffer,
                offset: 0,
                length: if length == 0 { vk::WHOLE_SIZE } else { length },
            });
        }
    }

    /// Scans for images bound both as a render target and as a pixel-shader
    /// resource, transitioning them to the shared layout once.
    fn check_hazards(&mut self) {
        let mut hazards = Vec::new();
        for srv in self.state.ps.shader_resources.iter().flatten() {
            let srv_image = srv.view.image();
            let bound = self
                .state
                .render_targets
                .iter()
                .flatten()
                .any(|rtv| Arc::ptr_eq(rtv.view.image(), srv_image))
                || self
                    .state
                    .depth_stencil_view
                    .as_ref()
                    .map(|dsv| Arc::ptr_eq(dsv.view.image(), srv_image))
                    .unwrap_or(false);
            if bound && !srv_image.set_hazardous() {
                hazards.push(Arc::clone(srv_image));
            }
        }

        for image in hazards {
            self.emit(CsCmd::TransitionLayout {
                image,
                layout: vk::ImageLayout::GENERAL,
            });
            // The framebuffer must be re-bound against the new layout.
            self.dirty |= DirtyFlags::FRAMEBUFFER;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_slots_clamps_to_range() {
        let mut dst: [Option<u32>; 4] = [None; 4];
        CommonContext::set_slots(&mut dst, 2, &[Some(7), Some(8), Some(9)], 4);
        assert_eq!(dst, [None, None, Some(7), Some(8)]);
    }

    #[test]
    fn dirty_flags_cover_all_categories() {
        // Draw preparation resolves exactly the bits that exist; a new
        // category must be added to both the flags and prepare_draw.
        assert_eq!(DirtyFlags::all().bits().count_ones(), 18);
    }
}

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ash::vk;
use bitflags::bitflags;
use tracing::{error, warn};

use prism_gpu::cs::{ChunkTag, CsChunk, CsCmd};
use prism_gpu::{
    packed_depth_stencil_format, BufferCreateInfo, Device, GpuError, QueryData, Shader,
    ShaderStage, Status, UseTracker,
};

use crate::fixed_function::{pixel_key, vertex_key, FfShaderCache, FfShaderProvider};
use crate::options::Options9;
use crate::query::{Query9, QueryKind9};
use crate::resource::{Buffer9, LockFlags, Surface9, Texture9, Usage9};
use crate::state::{
    render_state_dirty, rs, transform_index, DirtyFlags9, Light9, Material9, Rect9, State9,
    Viewport9, INT_CONSTANT_COUNT, MAX_RENDER_TARGETS_9, RENDER_STATE_COUNT,
    SAMPLER_COUNT, SAMPLER_STATE_COUNT, TEXTURE_STAGE_COUNT, TEXTURE_STAGE_STATE_COUNT,
};
use crate::state_block::{StateBlock9, StateBlockType9};
use crate::translate::{self, PrimitiveType9};
use crate::vertex::{declaration_from_fvf, DeclUsage, VertexDeclaration9};

const MIN_FLUSH_INTERVAL_US: u64 = 750;
const INC_FLUSH_INTERVAL_US: u64 = 250;
const MAX_PENDING_SUBMITS: u32 = 6;

/// Pixel-stage texture slots; the remaining slots address the vertex
/// stage's displaced samplers.
const PS_SAMPLER_COUNT: usize = 16;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ClearFlags9: u32 {
        const TARGET  = 1 << 0;
        const ZBUFFER = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// What a texture lock hands back to the caller.
#[derive(Clone, Copy, Debug)]
pub struct LockedRect {
    pub data: *mut u8,
    pub pitch: u32,
}

struct Inner {
    chunk: CsChunk,
    cs_busy: bool,
    last_flush: Instant,
    last_topology: Option<vk::PrimitiveTopology>,

    state: State9,
    dirty: DirtyFlags9,
    /// Set while the primary render target's sample description is above
    /// the nonmaskable level; when clear, the sample mask is forced to
    /// all-ones regardless of the render state.
    valid_sample_mask: bool,
    recorder: Option<StateBlock9>,

    vs_const_buffer: Arc<prism_gpu::Buffer>,
    ps_const_buffer: Arc<prism_gpu::Buffer>,
}

/// The version-9 device: owns the state vector, the chunk emission path,
/// the implicit-flush policy and the lock engine.
///
/// The creation-time multithread flag is recorded for capability queries;
/// internal state always sits behind a mutex, since a conditional no-op
/// lock is not expressible safely.
pub struct Device9 {
    core: Device,
    options: Options9,
    multithreaded: bool,
    ff_cache: FfShaderCache,
    inner: Mutex<Inner>,
}

impl Device9 {
    pub fn new(
        core: Device,
        options: Options9,
        multithreaded: bool,
        ff_provider: Arc<dyn FfShaderProvider>,
    ) -> Result<Arc<Self>, GpuError> {
        let vs_const_buffer = create_constant_buffer(&core, crate::state::VS_FLOAT_CONSTANT_COUNT)?;
        let ps_const_buffer = create_constant_buffer(&core, crate::state::PS_FLOAT_CONSTANT_COUNT)?;

        Ok(Arc::new(Self {
            core,
            options,
            multithreaded,
            ff_cache: FfShaderCache::new(ff_provider),
            inner: Mutex::new(Inner {
                chunk: CsChunk::new(ChunkTag::SingleUse),
                cs_busy: false,
                last_flush: Instant::now(),
                last_topology: None,
                state: State9::default(),
                dirty: DirtyFlags9::all(),
                valid_sample_mask: false,
                recorder: None,
                vs_const_buffer,
                ps_const_buffer,
            }),
        }))
    }

    pub fn core(&self) -> &Device {
        &self.core
    }

    pub fn options(&self) -> &Options9 {
        &self.options
    }

    pub fn is_multithreaded(&self) -> bool {
        self.multithreaded
    }

    pub fn ff_cache(&self) -> &FfShaderCache {
        &self.ff_cache
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    // ------------------------------------------------------------------
    // Render states
    // ------------------------------------------------------------------

    pub fn set_render_state(&self, id: u32, value: u32) -> Status {
        let mut inner = self.lock();

        if let Some(recorder) = &mut inner.recorder {
            recorder.record_render_state(id, value);
            return Status::OK;
        }

        // Out-of-range ids are accepted and ignored.
        if id as usize >= RENDER_STATE_COUNT {
            return Status::OK;
        }

        if inner.state.render_states[id as usize] == value {
            return Status::OK;
        }
        inner.state.render_states[id as usize] = value;
        inner.dirty |= render_state_dirty(id);
        Status::OK
    }

    pub fn get_render_state(&self, id: u32) -> (Status, u32) {
        let inner = self.lock();
        match inner.state.render_states.get(id as usize) {
            Some(&value) => (Status::OK, value),
            None => (Status::OK, 0),
        }
    }

    pub fn set_sampler_state(&self, sampler: u32, id: u32, value: u32) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_sampler_state(sampler, id, value);
            return Status::OK;
        }
        if sampler as usize >= SAMPLER_COUNT || id as usize >= SAMPLER_STATE_COUNT {
            return Status::INVALID_CALL;
        }
        inner.state.sampler_states[sampler as usize][id as usize] = value;
        inner.dirty |= DirtyFlags9::SAMPLERS;
        Status::OK
    }

    pub fn get_sampler_state(&self, sampler: u32, id: u32) -> (Status, u32) {
        let inner = self.lock();
        if sampler as usize >= SAMPLER_COUNT || id as usize >= SAMPLER_STATE_COUNT {
            return (Status::INVALID_CALL, 0);
        }
        (
            Status::OK,
            inner.state.sampler_states[sampler as usize][id as usize],
        )
    }

    pub fn set_texture_stage_state(&self, stage: u32, id: u32, value: u32) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_texture_stage_state(stage, id, value);
            return Status::OK;
        }
        if stage as usize >= TEXTURE_STAGE_COUNT || id as usize >= TEXTURE_STAGE_STATE_COUNT {
            return Status::INVALID_CALL;
        }
        inner.state.texture_stage_states[stage as usize][id as usize] = value;
        inner.dirty |= DirtyFlags9::FF_PIXEL_SHADER | DirtyFlags9::FF_VERTEX_SHADER;
        Status::OK
    }

    pub fn set_texture(&self, slot: u32, texture: Option<Arc<Texture9>>) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_texture(slot, texture);
            return Status::OK;
        }
        if slot as usize >= SAMPLER_COUNT {
            return Status::INVALID_CALL;
        }
        inner.state.textures[slot as usize] = texture;
        inner.dirty |= DirtyFlags9::TEXTURES | DirtyFlags9::FF_PIXEL_SHADER;
        Status::OK
    }

    pub fn set_transform(&self, transform_state: u32, matrix: &[f32; 16]) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_transform(transform_state, *matrix);
            return Status::OK;
        }
        let Some(index) = transform_index(transform_state) else {
            return Status::INVALID_CALL;
        };
        inner.state.transforms[index] = *matrix;
        inner.dirty |= DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn get_transform(&self, transform_state: u32) -> (Status, [f32; 16]) {
        let inner = self.lock();
        match transform_index(transform_state) {
            Some(index) => (Status::OK, inner.state.transforms[index]),
            None => (Status::INVALID_CALL, crate::state::IDENTITY_MATRIX),
        }
    }

    pub fn set_material(&self, material: Material9) -> Status {
        let mut inner = self.lock();
        inner.state.material = material;
        inner.dirty |= DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn set_light(&self, index: u32, light: Light9) -> Status {
        let mut inner = self.lock();
        inner.state.lights.insert(index, light);
        inner.dirty |= DirtyFlags9::FF_VERTEX_SHADER | DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn light_enable(&self, index: u32, enable: bool) -> Status {
        let mut inner = self.lock();
        let enabled = &mut inner.state.enabled_lights;
        let present = enabled.contains(&index);
        if enable && !present {
            enabled.push(index);
        } else if !enable && present {
            enabled.retain(|&i| i != index);
        }
        inner.dirty |= DirtyFlags9::FF_VERTEX_SHADER | DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn set_clip_plane(&self, index: u32, plane: &[f32; 4]) -> Status {
        let mut inner = self.lock();
        let Some(slot) = inner.state.clip_planes.get_mut(index as usize) else {
            return Status::INVALID_CALL;
        };
        *slot = *plane;
        inner.dirty |= DirtyFlags9::CLIP_PLANES;
        Status::OK
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    pub fn set_render_target(&self, index: u32, surface: Option<Arc<Surface9>>) -> Status {
        if index as usize >= MAX_RENDER_TARGETS_9 {
            return Status::INVALID_CALL;
        }
        if index == 0 && surface.is_none() {
            return Status::INVALID_CALL;
        }

        // Rebinding the primary target is the strongest signal a frame
        // boundary is near.
        self.flush_implicit(index == 0);

        let mut inner = self.lock();

        if index == 0 {
            if let Some(surface) = &surface {
                // Sample masks only apply to maskable multisample targets.
                let valid_sample_mask = surface.sample_count() != vk::SampleCountFlags::TYPE_1;
                if valid_sample_mask != inner.valid_sample_mask {
                    inner.valid_sample_mask = valid_sample_mask;
                    inner.dirty |= DirtyFlags9::MULTISAMPLE;
                }

                // Binding a new primary target resets the viewport and
                // scissor to cover it.
                let (width, height) = (surface.width(), surface.height());
                inner.state.viewport = Viewport9 {
                    x: 0,
                    y: 0,
                    width,
                    height,
                    min_z: 0.0,
                    max_z: 1.0,
                };
                inner.state.scissor = Rect9 {
                    left: 0,
                    top: 0,
                    right: width as i32,
                    bottom: height as i32,
                };
                inner.dirty |= DirtyFlags9::VIEWPORT_SCISSOR;
            }
        }

        inner.state.render_targets[index as usize] = surface;
        inner.dirty |= DirtyFlags9::FRAMEBUFFER | DirtyFlags9::MULTISAMPLE;
        Status::OK
    }

    pub fn set_depth_stencil_surface(&self, surface: Option<Arc<Surface9>>) -> Status {
        let mut inner = self.lock();
        inner.state.depth_stencil = surface;
        inner.dirty |= DirtyFlags9::FRAMEBUFFER;
        Status::OK
    }

    pub fn set_viewport(&self, viewport: Viewport9) -> Status {
        let mut inner = self.lock();
        inner.state.viewport = viewport;
        inner.dirty |= DirtyFlags9::VIEWPORT_SCISSOR;
        Status::OK
    }

    pub fn set_scissor_rect(&self, rect: Rect9) -> Status {
        let mut inner = self.lock();
        inner.state.scissor = rect;
        inner.dirty |= DirtyFlags9::VIEWPORT_SCISSOR;
        Status::OK
    }

    pub fn set_stream_source(
        &self,
        stream: u32,
        buffer: Option<Arc<Buffer9>>,
        offset: u32,
        stride: u32,
    ) -> Status {
        let mut inner = self.lock();
        let Some(slot) = inner.state.streams.get_mut(stream as usize) else {
            return Status::INVALID_CALL;
        };
        slot.buffer = buffer;
        slot.offset = offset;
        slot.stride = stride;
        inner.dirty |= DirtyFlags9::STREAMS | DirtyFlags9::INPUT_LAYOUT;
        Status::OK
    }

    pub fn set_stream_source_freq(&self, stream: u32, frequency: u32) -> Status {
        let mut inner = self.lock();
        let Some(slot) = inner.state.streams.get_mut(stream as usize) else {
            return Status::INVALID_CALL;
        };
        slot.frequency = frequency;
        inner.dirty |= DirtyFlags9::INPUT_LAYOUT;
        Status::OK
    }

    pub fn set_indices(&self, buffer: Option<Arc<Buffer9>>) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_indices(buffer);
            return Status::OK;
        }
        inner.state.indices = buffer;
        inner.dirty |= DirtyFlags9::INDICES;
        Status::OK
    }

    pub fn set_vertex_declaration(&self, declaration: Option<Arc<VertexDeclaration9>>) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_vertex_decl(declaration);
            return Status::OK;
        }
        inner.state.vertex_decl = declaration;
        inner.dirty |= DirtyFlags9::INPUT_LAYOUT | DirtyFlags9::FF_VERTEX_SHADER;
        Status::OK
    }

    pub fn set_fvf(&self, fvf: u32) -> Status {
        if fvf == 0 {
            return Status::OK;
        }
        self.set_vertex_declaration(Some(declaration_from_fvf(fvf)))
    }

    pub fn set_vertex_shader(&self, shader: Option<Arc<Shader>>) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_vertex_shader(shader);
            return Status::OK;
        }
        inner.state.vertex_shader = shader;
        inner.dirty |= DirtyFlags9::SHADER_VS | DirtyFlags9::INPUT_LAYOUT | DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn set_pixel_shader(&self, shader: Option<Arc<Shader>>) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_pixel_shader(shader);
            return Status::OK;
        }
        inner.state.pixel_shader = shader;
        inner.dirty |= DirtyFlags9::SHADER_PS | DirtyFlags9::PS_CONSTANTS;
        Status::OK
    }

    pub fn set_vs_constants_f(&self, start: u32, data: &[[f32; 4]]) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_vs_constants_f(start, data);
            return Status::OK;
        }
        if start as usize + data.len() > inner.state.vs_constants.float.len() {
            return Status::INVALID_CALL;
        }
        inner.state.vs_constants.float[start as usize..start as usize + data.len()]
            .copy_from_slice(data);
        inner.dirty |= DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn get_vs_constants_f(&self, start: u32, out: &mut [[f32; 4]]) -> Status {
        let inner = self.lock();
        if start as usize + out.len() > inner.state.vs_constants.float.len() {
            return Status::INVALID_CALL;
        }
        out.copy_from_slice(
            &inner.state.vs_constants.float[start as usize..start as usize + out.len()],
        );
        Status::OK
    }

    pub fn set_ps_constants_f(&self, start: u32, data: &[[f32; 4]]) -> Status {
        let mut inner = self.lock();
        if let Some(recorder) = &mut inner.recorder {
            recorder.record_ps_constants_f(start, data);
            return Status::OK;
        }
        if start as usize + data.len() > inner.state.ps_constants.float.len() {
            return Status::INVALID_CALL;
        }
        inner.state.ps_constants.float[start as usize..start as usize + data.len()]
            .copy_from_slice(data);
        inner.dirty |= DirtyFlags9::PS_CONSTANTS;
        Status::OK
    }

    pub fn set_vs_constants_i(&self, start: u32, data: &[[i32; 4]]) -> Status {
        let mut inner = self.lock();
        if start as usize + data.len() > INT_CONSTANT_COUNT {
            return Status::INVALID_CALL;
        }
        inner.state.vs_constants.int[start as usize..start as usize + data.len()]
            .copy_from_slice(data);
        inner.dirty |= DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    pub fn set_vs_constants_b(&self, start: u32, data: &[bool]) -> Status {
        let mut inner = self.lock();
        if start as usize + data.len() > 32 {
            return Status::INVALID_CALL;
        }
        for (i, &value) in data.iter().enumerate() {
            let bit = 1u32 << (start as usize + i);
            if value {
                inner.state.vs_constants.bools |= bit;
            } else {
                inner.state.vs_constants.bools &= !bit;
            }
        }
        inner.dirty |= DirtyFlags9::VS_CONSTANTS;
        Status::OK
    }

    // ------------------------------------------------------------------
    // Scene and presentation
    // ------------------------------------------------------------------

    /// Begin/EndScene do no work; EndScene is the end-of-scene sentinel
    /// that raises the strong flush hint.
    pub fn begin_scene(&self) -> Status {
        Status::OK
    }

    pub fn end_scene(&self) -> Status {
        self.flush_implicit(true);
        Status::OK
    }

    /// Submits outstanding work for presentation; the swap-chain handoff
    /// itself lives in the external presenter.
    pub fn present(&self) -> Status {
        self.flush();
        if self.core.is_lost() {
            Status::DEVICE_REMOVED
        } else {
            Status::OK
        }
    }

    // ------------------------------------------------------------------
    // Clears
    // ------------------------------------------------------------------

    pub fn clear(
        &self,
        rects: &[Rect9],
        flags: ClearFlags9,
        color: u32,
        depth: f32,
        stencil: u32,
    ) -> Status {
        let mut inner = self.lock();

        let Some(rt0) = inner.state.render_targets[0].clone() else {
            return Status::INVALID_CALL;
        };

        let vp = inner.state.viewport;
        let scissor_enabled =
            inner.state.render_states[rs::SCISSORTESTENABLE as usize] != 0;

        let mut offset = (vp.x as i32, vp.y as i32);
        let mut extent = (vp.width, vp.height);
        if scissor_enabled {
            let sc = inner.state.scissor;
            let x0 = offset.0.max(sc.left);
            let y0 = offset.1.max(sc.top);
            let x1 = (offset.0 + extent.0 as i32).min(sc.right);
            let y1 = (offset.1 + extent.1 as i32).min(sc.bottom);
            offset = (x0, y0);
            extent = ((x1 - x0).max(0) as u32, (y1 - y0).max(0) as u32);
        }

        // One known application clears with an oversized render-target
        // height; accept a four-row defect as a full clear when configured.
        let height_defect = rt0.height() as i32 - extent.1 as i32;
        let height_matches =
            (self.options.lenient_clear && height_defect == 4) || height_defect == 0;

        let full_clear = rects.is_empty()
            && offset == (0, 0)
            && extent.0 == rt0.width()
            && height_matches;

        let clear_color = [
            ((color >> 16) & 0xFF) as f32 / 255.0,
            ((color >> 8) & 0xFF) as f32 / 255.0,
            (color & 0xFF) as f32 / 255.0,
            ((color >> 24) & 0xFF) as f32 / 255.0,
        ];

        let mut clear_rects: Vec<Option<vk::Rect2D>> = Vec::new();
        if full_clear {
            clear_rects.push(None);
        } else if rects.is_empty() {
            clear_rects.push(Some(vk::Rect2D {
                offset: vk::Offset2D {
                    x: offset.0,
                    y: offset.1,
                },
                extent: vk::Extent2D {
                    width: extent.0,
                    height: extent.1,
                },
            }));
        } else {
            for rect in rects {
                let x0 = rect.left.max(offset.0);
                let y0 = rect.top.max(offset.1);
                let x1 = rect.right.min(offset.0 + extent.0 as i32);
                let y1 = rect.bottom.min(offset.1 + extent.1 as i32);
                if x1 <= x0 || y1 <= y0 {
                    continue;
                }
                clear_rects.push(Some(vk::Rect2D {
                    offset: vk::Offset2D { x: x0, y: y0 },
                    extent: vk::Extent2D {
                        width: (x1 - x0) as u32,
                        height: (y1 - y0) as u32,
                    },
                }));
            }
        }

        // The attachment-path clear needs the current framebuffer bound.
        if inner.dirty.contains(DirtyFlags9::FRAMEBUFFER) {
            let cmd = bind_framebuffer_cmd(&inner.state);
            inner.emit(&self.core, cmd);
            inner.dirty.remove(DirtyFlags9::FRAMEBUFFER);
        }

        for rect in clear_rects {
            if flags.contains(ClearFlags9::TARGET) {
                let targets: Vec<Arc<Surface9>> = inner
                    .state
                    .render_targets
                    .iter()
                    .flatten()
                    .cloned()
                    .collect();
                for target in targets {
                    inner.emit(
                        &self.core,
                        CsCmd::ClearRenderTarget {
                            view: Arc::clone(&target.view),
                            color: clear_color,
                            rect,
                        },
                    );
                }
            }

            if flags.intersects(ClearFlags9::ZBUFFER | ClearFlags9::STENCIL) {
                if let Some(ds) = inner.state.depth_stencil.clone() {
                    let mut aspects = vk::ImageAspectFlags::empty();
                    if flags.contains(ClearFlags9::ZBUFFER) {
                        aspects |= vk::ImageAspectFlags::DEPTH;
                    }
                    if flags.contains(ClearFlags9::STENCIL) {
                        aspects |= vk::ImageAspectFlags::STENCIL;
                    }
                    aspects &= ds.view.info().aspect;
                    if !aspects.is_empty() {
                        inner.emit(
                            &self.core,
                            CsCmd::ClearDepthStencil {
                                view: Arc::clone(&ds.view),
                                aspects,
                                depth,
                                stencil,
                                rect,
                            },
                        );
                    }
                }
            }
        }

        Status::OK
    }

    // ------------------------------------------------------------------
    // Draws
    // ------------------------------------------------------------------

    pub fn draw_primitive(
        &self,
        primitive: PrimitiveType9,
        start_vertex: u32,
        primitive_count: u32,
    ) -> Status {
        if primitive_count == 0 {
            return Status::OK;
        }
        let mut inner = self.lock();
        if let Err(err) = inner.prepare_draw(&self.core, &self.options, &self.ff_cache, primitive)
        {
            error!(?err, "draw preparation failed");
            return Status::from(&err);
        }
        inner.emit(
            &self.core,
            CsCmd::Draw {
                vertex_count: primitive.vertex_count(primitive_count),
                instance_count: 1,
                first_vertex: start_vertex,
                first_instance: 0,
            },
        );
        Status::OK
    }

    pub fn draw_indexed_primitive(
        &self,
        primitive: PrimitiveType9,
        base_vertex: i32,
        start_index: u32,
        primitive_count: u32,
    ) -> Status {
        if primitive_count == 0 {
            return Status::OK;
        }
        let mut inner = self.lock();
        if inner.state.indices.is_none() {
            return Status::INVALID_CALL;
        }
        if let Err(err) = inner.prepare_draw(&self.core, &self.options, &self.ff_cache, primitive)
        {
            error!(?err, "draw preparation failed");
            return Status::from(&err);
        }
        inner.emit(
            &self.core,
            CsCmd::DrawIndexed {
                index_count: primitive.vertex_count(primitive_count),
                instance_count: 1,
                first_index: start_index,
                vertex_offset: base_vertex,
                first_instance: 0,
            },
        );
        Status::OK
    }

    // ------------------------------------------------------------------
    // Flush policy
    // ------------------------------------------------------------------

    pub fn flush(&self) {
        let mut inner = self.lock();
        inner.flush(&self.core);
    }

    pub fn flush_implicit(&self, strong_hint: bool) {
        let mut inner = self.lock();
        inner.flush_implicit(&self.core, strong_hint);
    }

    /// Blocks until the worker has drained every published chunk.
    pub fn synchronize_cs(&self) {
        {
            let mut inner = self.lock();
            inner.flush_chunk(&self.core);
        }
        self.core.cs().synchronize();
    }

    pub fn wait_for_idle(&self) {
        self.synchronize_cs();
        self.core.wait_for_idle();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn create_query(&self, kind: QueryKind9) -> Result<Arc<Query9>, Status> {
        Query9::new(&self.core, kind).map_err(|err| Status::from(&err))
    }

    pub fn issue_begin(&self, query: &Arc<Query9>) -> Status {
        if query.is_event() {
            return Status::INVALID_CALL;
        }
        query.core().set_state(prism_gpu::QueryState::Begun);
        let mut inner = self.lock();
        inner.emit(&self.core, CsCmd::BeginQuery(Arc::clone(query.core())));
        Status::OK
    }

    pub fn issue_end(&self, query: &Arc<Query9>) -> Status {
        let stalling = query.core().is_stalling();
        query.core().notify_end();
        query.core().set_state(prism_gpu::QueryState::Ended);

        {
            let mut inner = self.lock();
            let cmd = match query.kind() {
                QueryKind9::Event => CsCmd::SignalEvent(Arc::clone(query.core())),
                QueryKind9::Timestamp => CsCmd::WriteTimestamp(Arc::clone(query.core())),
                QueryKind9::Occlusion => CsCmd::EndQuery(Arc::clone(query.core())),
            };
            inner.emit(&self.core, cmd);
        }

        if query.is_event() {
            if stalling {
                self.flush();
            } else {
                self.flush_implicit(true);
            }
        } else if stalling {
            self.flush_implicit(true);
        }
        Status::OK
    }

    /// Polls a query. `flush` mirrors the legacy GetData flush flag: when
    /// set and the query is stalling, an implicit flush keeps the GPU fed.
    pub fn get_query_data(
        &self,
        query: &Arc<Query9>,
        flush: bool,
    ) -> Result<Option<QueryData>, Status> {
        self.synchronize_cs();

        let result = self
            .core
            .query_data(query.core())
            .map_err(|err| Status::from(&err))?;

        if result.is_none() {
            query.core().notify_stall();
            if flush && query.core().is_stalling() {
                self.flush_implicit(false);
            }
        }

        Ok(result)
    }

    // ------------------------------------------------------------------
    // State blocks
    // ------------------------------------------------------------------

    /// Creates a state block of the given type, capturing the current
    /// state.
    pub fn create_state_block(&self, block_type: StateBlockType9) -> Arc<Mutex<StateBlock9>> {
        let inner = self.lock();
        let mut block = StateBlock9::new(block_type);
        block.capture(&inner.state);
        Arc::new(Mutex::new(block))
    }

    pub fn capture_state_block(&self, block: &Arc<Mutex<StateBlock9>>) -> Status {
        let inner = self.lock();
        block.lock().unwrap().capture(&inner.state);
        Status::OK
    }

    pub fn apply_state_block(&self, block: &Arc<Mutex<StateBlock9>>) -> Status {
        let mut inner = self.lock();
        if inner.recorder.is_some() {
            return Status::INVALID_CALL;
        }
        let dirty = block.lock().unwrap().apply(&mut inner.state);
        inner.dirty |= dirty;
        Status::OK
    }

    /// Enters recording mode: mutators are rerouted into a block until
    /// `end_state_block`.
    pub fn begin_state_block(&self) -> Status {
        let mut inner = self.lock();
        if inner.recorder.is_some() {
            return Status::INVALID_CALL;
        }
        inner.recorder = Some(StateBlock9::new(StateBlockType9::Custom));
        Status::OK
    }

    pub fn end_state_block(&self) -> Result<Arc<Mutex<StateBlock9>>, Status> {
        let mut inner = self.lock();
        match inner.recorder.take() {
            Some(block) => Ok(Arc::new(Mutex::new(block))),
            None => Err(Status::INVALID_CALL),
        }
    }

    // ------------------------------------------------------------------
    // Lock engine
    // ------------------------------------------------------------------

    pub fn lock_buffer(
        &self,
        buffer: &Arc<Buffer9>,
        offset: u32,
        mut flags: LockFlags,
    ) -> Result<*mut u8, Status> {
        if !self.options.allow_lock_flag_readonly {
            flags.remove(LockFlags::READONLY);
        }
        if !self.options.allow_lock_flag_no_wait {
            flags.remove(LockFlags::DONOTWAIT);
        }
        buffer.set_lock_flags(flags);

        let dynamic = buffer.desc().usage.contains(Usage9::DYNAMIC);

        if flags.contains(LockFlags::DISCARD) && dynamic {
            let slice = buffer
                .buffer()
                .alloc_slice()
                .map_err(|err| Status::from(&err))?;
            let mut inner = self.lock();
            inner.emit(
                &self.core,
                CsCmd::InvalidateBuffer {
                    buffer: Arc::clone(buffer.buffer()),
                    slice,
                },
            );
            return Ok(slice.map_ptr(u64::from(offset)));
        }

        if !flags.contains(LockFlags::NOOVERWRITE)
            && !flags.contains(LockFlags::READONLY)
            && !self.wait_for_resource(buffer.buffer().tracker(), flags)
        {
            return Err(Status::WAS_STILL_DRAWING);
        }

        Ok(buffer.buffer().map_ptr(u64::from(offset)))
    }

    pub fn unlock_buffer(&self, buffer: &Arc<Buffer9>) -> Status {
        // Direct-mapped memory; nothing to copy back.
        buffer.set_lock_flags(LockFlags::empty());
        Status::OK
    }

    pub fn lock_image(
        &self,
        texture: &Arc<Texture9>,
        level: u32,
        mut flags: LockFlags,
    ) -> Result<LockedRect, Status> {
        if level >= texture.desc().levels.max(1) {
            return Err(Status::INVALID_CALL);
        }
        if !self.options.allow_lock_flag_readonly {
            flags.remove(LockFlags::READONLY);
        }
        if !self.options.allow_lock_flag_no_wait {
            flags.remove(LockFlags::DONOTWAIT);
        }

        let staging = texture
            .staging_buffer(&self.core, level)
            .map_err(|err| Status::from(&err))?;

        let mapping = *texture.mapping();
        let extent = texture.image().mip_level_extent(level);
        let blocks = prism_gpu::compute_block_count(extent, mapping.info.block_size);

        let slice = if flags.contains(LockFlags::DISCARD) {
            let slice = staging.alloc_slice().map_err(|err| Status::from(&err))?;
            let mut inner = self.lock();
            inner.emit(
                &self.core,
                CsCmd::InvalidateBuffer {
                    buffer: Arc::clone(&staging),
                    slice,
                },
            );
            slice
        } else {
            let has_shadow = texture
                .with_lock_state(level, |state| state.shadow.is_some())
                .unwrap_or(false);

            if has_shadow {
                // Managed resources refill the staging buffer from the
                // host shadow without touching the GPU timeline.
                if !self.wait_for_resource(staging.tracker(), flags) {
                    return Err(Status::WAS_STILL_DRAWING);
                }
                let slice = staging.current_slice();
                texture.with_lock_state(level, |state| {
                    if let Some(shadow) = &state.shadow {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                shadow.as_ptr(),
                                slice.map_ptr(0),
                                shadow.len().min(slice.length as usize),
                            );
                        }
                    }
                });
                slice
            } else {
                // Refresh from the GPU image, then wait for the copy.
                {
                    let subresource = prism_gpu::Subresource {
                        aspect_mask: mapping.info.aspect_mask,
                        mip_level: level,
                        array_layer: 0,
                    };
                    let mut inner = self.lock();
                    inner.emit(
                        &self.core,
                        CsCmd::CopyImageToBuffer {
                            src: Arc::clone(texture.image()),
                            layers: vk::ImageSubresourceLayers {
                                aspect_mask: subresource.aspect_mask,
                                mip_level: subresource.mip_level,
                                base_array_layer: 0,
                                layer_count: 1,
                            },
                            offset: vk::Offset3D::default(),
                            extent,
                            dst: Arc::clone(&staging),
                            dst_offset: 0,
                        },
                    );
                }
                flags.remove(LockFlags::DONOTWAIT);
                if !self.wait_for_resource(staging.tracker(), flags) {
                    return Err(Status::WAS_STILL_DRAWING);
                }
                staging.current_slice()
            }
        };

        texture.with_lock_state(level, |state| {
            state.lock_flags = Some(flags);
            state.outstanding_locks += 1;
        });

        // The caller sees the host layout: fixed-up formats expose their
        // packed element size.
        let host_pitch = if mapping.requires_fixup {
            mapping.host_element_size * blocks.width
        } else {
            mapping.info.element_size * blocks.width
        };

        Ok(LockedRect {
            data: slice.map_ptr(0),
            pitch: host_pitch,
        })
    }

    pub fn unlock_image(&self, texture: &Arc<Texture9>, level: u32) -> Status {
        let flags = match texture.with_lock_state(level, |state| {
            state.outstanding_locks = state.outstanding_locks.saturating_sub(1);
            state.lock_flags.take()
        }) {
            Some(Some(flags)) => flags,
            _ => return Status::INVALID_CALL,
        };

        if flags.contains(LockFlags::READONLY) {
            return Status::OK;
        }

        let Ok(staging) = texture.staging_buffer(&self.core, level) else {
            return Status::INVALID_CALL;
        };

        let mapping = *texture.mapping();
        let extent = texture.image().mip_level_extent(level);
        let blocks = prism_gpu::compute_block_count(extent, mapping.info.block_size);
        let texel_count =
            u64::from(blocks.width) * u64::from(blocks.height) * u64::from(blocks.depth);

        // Formats with no native equivalent are widened into a corrected
        // buffer before the image copy.
        let source = if mapping.requires_fixup {
            match self.expand_fixup_source(&staging, texel_count) {
                Ok(fixed) => fixed,
                Err(err) => {
                    error!(?err, "fixup staging allocation failed");
                    return Status::from(&err);
                }
            }
        } else {
            Arc::clone(&staging)
        };

        // Managed resources keep (or drop) the host shadow for later locks.
        if texture.is_managed() {
            let evict = self.options.evict_managed_on_unlock;
            let slice = staging.current_slice();
            texture.with_lock_state(level, |state| {
                if evict {
                    state.shadow = None;
                } else if state.outstanding_locks == 0 {
                    let len = slice.length as usize;
                    let mut shadow = state.shadow.take().unwrap_or_default();
                    shadow.resize(len, 0);
                    unsafe {
                        std::ptr::copy_nonoverlapping(slice.map_ptr(0), shadow.as_mut_ptr(), len);
                    }
                    state.shadow = Some(shadow);
                }
            });
        }

        let mut inner = self.lock();
        inner.emit(
            &self.core,
            CsCmd::CopyBufferToImage {
                src: source,
                src_offset: 0,
                dst: Arc::clone(texture.image()),
                layers: vk::ImageSubresourceLayers {
                    aspect_mask: mapping.info.aspect_mask,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                offset: vk::Offset3D::default(),
                extent,
                packed_format: packed_depth_stencil_format(mapping.format),
            },
        );
        Status::OK
    }

    fn expand_fixup_source(
        &self,
        staging: &Arc<prism_gpu::Buffer>,
        texel_count: u64,
    ) -> Result<Arc<prism_gpu::Buffer>, GpuError> {
        let fixed = self.core.create_buffer(
            BufferCreateInfo {
                size: texel_count * 4,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                alignment: 256,
                slice_count: 1,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let src_slice = staging.current_slice();
        let dst_slice = fixed.current_slice();
        unsafe {
            let src = std::slice::from_raw_parts(src_slice.map_ptr(0), (texel_count * 3) as usize);
            let dst =
                std::slice::from_raw_parts_mut(dst_slice.map_ptr(0), (texel_count * 4) as usize);
            prism_gpu::expand_packed_rgb24(src, dst);
        }

        Ok(fixed)
    }

    fn wait_for_resource(&self, tracker: &UseTracker, flags: LockFlags) -> bool {
        self.synchronize_cs();

        let submissions = self.core.submissions();
        if tracker.is_in_use(submissions.last_completed()) {
            if flags.contains(LockFlags::DONOTWAIT) {
                self.flush_implicit(false);
                return false;
            }

            self.flush();
            self.synchronize_cs();

            while tracker.is_in_use(submissions.last_completed()) {
                submissions.poll();
                std::thread::yield_now();
            }
        }
        true
    }
}

impl Drop for Device9 {
    fn drop(&mut self) {
        self.flush();
        self.synchronize_cs();
        self.core.wait_for_idle();
    }
}

// ----------------------------------------------------------------------
// Emission machinery and draw preparation
// ----------------------------------------------------------------------

impl Inner {
    fn emit(&mut self, core: &Device, cmd: CsCmd) {
        if let Err(cmd) = self.chunk.try_push(cmd) {
            self.flush_chunk(core);
            let _ = self.chunk.try_push(cmd);
        }
    }

    fn flush_chunk(&mut self, core: &Device) {
        if self.chunk.is_empty() {
            return;
        }
        let chunk = Arc::new(std::mem::replace(
            &mut self.chunk,
            CsChunk::new(ChunkTag::SingleUse),
        ));
        core.cs().dispatch(chunk);
        self.cs_busy = true;
    }

    fn flush(&mut self, core: &Device) {
        if self.cs_busy || !self.chunk.is_empty() {
            self.emit(core, CsCmd::Flush);
            self.flush_chunk(core);
            self.last_flush = Instant::now();
            self.cs_busy = false;
        }
    }

    fn flush_implicit(&mut self, core: &Device, strong_hint: bool) {
        let pending = core.submissions().pending_submissions();

        if strong_hint || pending <= MAX_PENDING_SUBMITS {
            let delay = MIN_FLUSH_INTERVAL_US + INC_FLUSH_INTERVAL_US * u64::from(pending);
            if self.last_flush.elapsed() >= Duration::from_micros(delay) {
                self.flush(core);
            }
        }
    }

    /// Resolves every dirty category into worker commands, in fixed order.
    fn prepare_draw(
        &mut self,
        core: &Device,
        options: &Options9,
        ff_cache: &FfShaderCache,
        primitive: PrimitiveType9,
    ) -> Result<(), GpuError> {
        if options.has_hazards {
            self.check_hazards(core);
        }

        if self.dirty.contains(DirtyFlags9::FRAMEBUFFER) {
            let cmd = bind_framebuffer_cmd(&self.state);
            self.emit(core, cmd);
            self.dirty.remove(DirtyFlags9::FRAMEBUFFER);
        }

        if self.dirty.contains(DirtyFlags9::VIEWPORT_SCISSOR) {
            let viewport = translate::translate_viewport9(&self.state.viewport);
            let scissor_enabled = self.state.render_states[rs::SCISSORTESTENABLE as usize] != 0;
            let scissor = if scissor_enabled {
                let sc = self.state.scissor;
                vk::Rect2D {
                    offset: vk::Offset2D {
                        x: sc.left,
                        y: sc.top,
                    },
                    extent: vk::Extent2D {
                        width: (sc.right - sc.left).max(0) as u32,
                        height: (sc.bottom - sc.top).max(0) as u32,
                    },
                }
            } else {
                let vp = self.state.viewport;
                vk::Rect2D {
                    offset: vk::Offset2D {
                        x: vp.x as i32,
                        y: vp.y as i32,
                    },
                    extent: vk::Extent2D {
                        width: vp.width,
                        height: vp.height,
                    },
                }
            };
            self.emit(
                core,
                CsCmd::SetViewports {
                    viewports: vec![viewport],
                    scissors: vec![scissor],
                },
            );
            self.dirty.remove(DirtyFlags9::VIEWPORT_SCISSOR);
        }

        if self.dirty.contains(DirtyFlags9::BLEND) {
            let targets = translate::translate_blend9(&self.state);
            self.emit(core, CsCmd::SetBlendState { targets });
            let factor = translate::translate_blend_factor9(
                self.state.render_states[rs::BLENDFACTOR as usize],
            );
            self.emit(core, CsCmd::SetBlendConstants(factor));
            self.dirty.remove(DirtyFlags9::BLEND);
        }

        if self.dirty.contains(DirtyFlags9::DEPTH_STENCIL) {
            let ds = translate::translate_depth_stencil9(&self.state);
            self.emit(core, CsCmd::SetDepthStencilState(ds));
            self.emit(
                core,
                CsCmd::SetStencilReference(self.state.render_states[rs::STENCILREF as usize]),
            );
            self.dirty.remove(DirtyFlags9::DEPTH_STENCIL);
        }

        if self.dirty.contains(DirtyFlags9::RASTERIZER) {
            let (state, bias) = translate::translate_rasterizer9(&self.state);
            self.emit(core, CsCmd::SetRasterizerState { state, bias });
            self.dirty.remove(DirtyFlags9::RASTERIZER);
        }

        if self.dirty.contains(DirtyFlags9::MULTISAMPLE) {
            let sample_count = self.state.render_targets[0]
                .as_ref()
                .map(|rt| rt.sample_count())
                .unwrap_or(vk::SampleCountFlags::TYPE_1);
            // Without a maskable multisample target the mask is forced to
            // all-ones regardless of the render state.
            let sample_mask = if self.valid_sample_mask {
                self.state.render_states[rs::MULTISAMPLEMASK as usize]
            } else {
                u32::MAX
            };
            self.emit(
                core,
                CsCmd::SetMultisampleState(prism_gpu::MultisampleState {
                    sample_count,
                    sample_mask,
                    alpha_to_coverage: false,
                }),
            );
            self.dirty.remove(DirtyFlags9::MULTISAMPLE);
        }

        if self.dirty.contains(DirtyFlags9::ALPHA_TEST) {
            let (func, reference) = translate::translate_alpha_test9(&self.state)
                .unwrap_or((vk::CompareOp::ALWAYS, 0.0));
            self.emit(core, CsCmd::SetAlphaTest { func, reference });
            self.dirty.remove(DirtyFlags9::ALPHA_TEST);
        }

        if self.dirty.contains(DirtyFlags9::CLIP_PLANES) {
            // Clip planes travel in the vertex constant block.
            self.dirty |= DirtyFlags9::VS_CONSTANTS;
            self.dirty.remove(DirtyFlags9::CLIP_PLANES);
        }

        // Shader selection: application shaders win; otherwise the
        // fixed-function module cache picks a generated pair.
        let position_t = self
            .state
            .vertex_decl
            .as_ref()
            .map(|decl| {
                decl.elements
                    .iter()
                    .any(|e| e.usage == DeclUsage::PositionT)
            })
            .unwrap_or(false);

        let vs = match &self.state.vertex_shader {
            Some(shader) => Arc::clone(shader),
            None => {
                let key = vertex_key(&self.state, position_t);
                ff_cache.vertex_module(core, &key)?
            }
        };
        let ps = match &self.state.pixel_shader {
            Some(shader) => Arc::clone(shader),
            None => {
                let key = pixel_key(&self.state);
                ff_cache.pixel_module(core, &key)?
            }
        };

        if self
            .dirty
            .intersects(DirtyFlags9::SHADER_VS | DirtyFlags9::FF_VERTEX_SHADER)
        {
            self.emit(
                core,
                CsCmd::BindShader {
                    stage: ShaderStage::Vertex,
                    shader: Some(Arc::clone(&vs)),
                },
            );
            self.dirty
                .remove(DirtyFlags9::SHADER_VS | DirtyFlags9::FF_VERTEX_SHADER);
            self.dirty |= DirtyFlags9::INPUT_LAYOUT;
        }

        if self
            .dirty
            .intersects(DirtyFlags9::SHADER_PS | DirtyFlags9::FF_PIXEL_SHADER)
        {
            self.emit(
                core,
                CsCmd::BindShader {
                    stage: ShaderStage::Pixel,
                    shader: Some(Arc::clone(&ps)),
                },
            );
            self.dirty
                .remove(DirtyFlags9::SHADER_PS | DirtyFlags9::FF_PIXEL_SHADER);
        }

        if self.dirty.contains(DirtyFlags9::INPUT_LAYOUT) {
            if let Some(decl) = self.state.vertex_decl.clone() {
                let layout =
                    translate::resolve_declaration(&decl, vs.metadata(), &self.state.streams);
                self.emit(core, CsCmd::SetInputLayout(layout));
            }
            self.dirty.remove(DirtyFlags9::INPUT_LAYOUT);
        }

        let topology = primitive.to_vk();
        if self.last_topology != Some(topology) {
            self.emit(core, CsCmd::SetPrimitiveTopology(topology));
            self.last_topology = Some(topology);
        }

        if self.dirty.contains(DirtyFlags9::TEXTURES) {
            let binds: Vec<CsCmd> = self
                .state
                .textures
                .iter()
                .enumerate()
                .map(|(slot, texture)| {
                    let (stage, stage_slot) = if slot < PS_SAMPLER_COUNT {
                        (ShaderStage::Pixel, slot as u32)
                    } else {
                        (ShaderStage::Vertex, (slot - PS_SAMPLER_COUNT) as u32)
                    };
                    CsCmd::BindImageView {
                        stage,
                        slot: stage_slot,
                        view: texture.as_ref().map(|t| Arc::clone(t.sample_view())),
                    }
                })
                .collect();
            for cmd in binds {
                self.emit(core, cmd);
            }
            self.dirty.remove(DirtyFlags9::TEXTURES);
        }

        if self.dirty.contains(DirtyFlags9::SAMPLERS) {
            for slot in 0..SAMPLER_COUNT {
                let key = translate::translate_sampler9(&self.state.sampler_states[slot]);
                let pair = match core.sampler(key) {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?err, slot, "sampler creation failed");
                        continue;
                    }
                };
                let (stage, stage_slot) = if slot < PS_SAMPLER_COUNT {
                    (ShaderStage::Pixel, slot as u32)
                } else {
                    (ShaderStage::Vertex, (slot - PS_SAMPLER_COUNT) as u32)
                };
                self.emit(
                    core,
                    CsCmd::BindSampler {
                        stage,
                        slot: stage_slot,
                        sampler: pair.color,
                        depth_compare_sampler: pair.depth_compare,
                    },
                );
            }
            self.dirty.remove(DirtyFlags9::SAMPLERS);
        }

        if self.dirty.contains(DirtyFlags9::STREAMS) {
            let binds: Vec<CsCmd> = self
                .state
                .streams
                .iter()
                .enumerate()
                .map(|(slot, stream)| CsCmd::BindVertexBuffer {
                    slot: slot as u32,
                    buffer: stream.buffer.as_ref().map(|b| Arc::clone(b.buffer())),
                    offset: u64::from(stream.offset),
                    stride: stream.stride,
                })
                .collect();
            for cmd in binds {
                self.emit(core, cmd);
            }
            self.dirty.remove(DirtyFlags9::STREAMS);
        }

        if self.dirty.contains(DirtyFlags9::INDICES) {
            let binding = self.state.indices.clone();
            let index_type = binding
                .as_ref()
                .map(|b| match b.desc().format {
                    crate::format::Format9::Index32 => vk::IndexType::UINT32,
                    _ => vk::IndexType::UINT16,
                })
                .unwrap_or(vk::IndexType::UINT16);
            self.emit(
                core,
                CsCmd::BindIndexBuffer {
                    buffer: binding.map(|b| Arc::clone(b.buffer())),
                    offset: 0,
                    index_type,
                },
            );
            self.dirty.remove(DirtyFlags9::INDICES);
        }

        // Constant uploads happen last.
        if self.dirty.contains(DirtyFlags9::VS_CONSTANTS) {
            self.upload_constants(core, ShaderStage::Vertex, &vs)?;
            self.dirty.remove(DirtyFlags9::VS_CONSTANTS);
        }
        if self.dirty.contains(DirtyFlags9::PS_CONSTANTS) {
            self.upload_constants(core, ShaderStage::Pixel, &ps)?;
            self.dirty.remove(DirtyFlags9::PS_CONSTANTS);
        }

        Ok(())
    }

    /// Allocates a fresh slice of the stage's constant buffer, copies the
    /// live constant range (or the full set when the shader uses relative
    /// indexing) and rebinds the block.
    fn upload_constants(
        &mut self,
        core: &Device,
        stage: ShaderStage,
        shader: &Arc<Shader>,
    ) -> Result<(), GpuError> {
        let buffer = match stage {
            ShaderStage::Vertex => Arc::clone(&self.vs_const_buffer),
            _ => Arc::clone(&self.ps_const_buffer),
        };
        let slice = buffer.alloc_slice()?;

        {
            let constants = match stage {
                ShaderStage::Vertex => &self.state.vs_constants,
                _ => &self.state.ps_constants,
            };

            let metadata = shader.metadata();
            let float_count = if metadata.relative_addressing || metadata.max_float_const == 0 {
                constants.float.len()
            } else {
                (metadata.max_float_const as usize).min(constants.float.len())
            };

            let float_bytes: &[u8] = bytemuck::cast_slice(&constants.float[..float_count]);
            let int_bytes: &[u8] = bytemuck::cast_slice(&constants.int);
            let int_offset = constants.float.len() * 16;
            let bool_offset = int_offset + int_bytes.len();

            unsafe {
                std::ptr::copy_nonoverlapping(
                    float_bytes.as_ptr(),
                    slice.map_ptr(0),
                    float_bytes.len(),
                );
                std::ptr::copy_nonoverlapping(
                    int_bytes.as_ptr(),
                    slice.map_ptr(int_offset as u64),
                    int_bytes.len(),
                );
                std::ptr::copy_nonoverlapping(
                    constants.bools.to_le_bytes().as_ptr(),
                    slice.map_ptr(bool_offset as u64),
                    4,
                );
            }

            // Immediate constants defined in bytecode are folded in on top.
            for copy in &metadata.constant_copies {
                if let Some(offset) = (copy.register as usize).checked_mul(16) {
                    if offset + 16 <= slice.length as usize {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                copy.data.as_ptr().cast::<u8>(),
                                slice.map_ptr(offset as u64),
                                16,
                            );
                        }
                    }
                }
            }
        }

        self.emit(
            core,
            CsCmd::InvalidateBuffer {
                buffer: Arc::clone(&buffer),
                slice,
            },
        );
        self.emit(
            core,
            CsCmd::BindUniformBuffer {
                stage,
                slot: 0,
                buffer: Some(Arc::clone(&buffer)),
                offset: 0,
                length: slice.length,
            },
        );
        Ok(())
    }

    /// Transitions images bound both as a texture and as a render target to
    /// the shared layout, once, and rebinds the framebuffer afterwards.
    fn check_hazards(&mut self, core: &Device) {
        let mut hazards = Vec::new();
        for texture in self.state.textures.iter().flatten() {
            let image = texture.image();
            let bound = self
                .state
                .render_targets
                .iter()
                .flatten()
                .any(|rt| Arc::ptr_eq(rt.texture.image(), image))
                || self
                    .state
                    .depth_stencil
                    .as_ref()
                    .map(|ds| Arc::ptr_eq(ds.texture.image(), image))
                    .unwrap_or(false);
            if bound && !image.set_hazardous() {
                hazards.push(Arc::clone(image));
            }
        }

        for image in hazards {
            self.emit(
                core,
                CsCmd::TransitionLayout {
                    image,
                    layout: vk::ImageLayout::GENERAL,
                },
            );
            self.dirty |= DirtyFlags9::FRAMEBUFFER;
        }
    }
}

fn bind_framebuffer_cmd(state: &State9) -> CsCmd {
    let color: Vec<Option<Arc<prism_gpu::ImageView>>> = state
        .render_targets
        .iter()
        .map(|rt| rt.as_ref().map(|s| Arc::clone(&s.view)))
        .collect();
    let depth = state.depth_stencil.as_ref().map(|s| Arc::clone(&s.view));
    CsCmd::BindFramebuffer { color, depth }
}

fn create_constant_buffer(
    core: &Device,
    float_count: usize,
) -> Result<Arc<prism_gpu::Buffer>, GpuError> {
    // Floats, then ints, then the packed bool bits.
    let size = (float_count * 16 + INT_CONSTANT_COUNT * 16 + 16) as u64;
    core.create_buffer(
        BufferCreateInfo {
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            alignment: 256,
            slice_count: 8,
        },
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
}

/// Reports multisample support for a format/sample-count pair.
pub fn check_multisample_quality_levels(
    format: crate::format::Format9,
    sample_count: u32,
) -> Result<u32, Status> {
    if sample_count == 0 {
        return Err(Status::INVALID_CALL);
    }
    if format == crate::format::Format9::Unknown {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multisample_quality_boundaries() {
        assert_eq!(
            check_multisample_quality_levels(crate::format::Format9::Unknown, 1),
            Ok(1)
        );
        assert!(check_multisample_quality_levels(crate::format::Format9::Unknown, 0).is_err());
        assert_eq!(
            check_multisample_quality_levels(crate::format::Format9::A8R8G8B8, 64),
            Ok(0)
        );
    }
}

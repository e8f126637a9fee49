//! The command stream: bounded chunks of recording commands handed from the
//! API contexts to the worker thread that drives the native recording
//! context.
//!
//! Commands capture everything they need by value (plain state) or by
//! strong reference (resources), never by pointer into caller-owned
//! storage, so a chunk outlives any API-side state change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use ash::vk;
use tracing::error;

use crate::buffer::{Buffer, BufferSlice};
use crate::context::{BarrierControl, NativeContext};
use crate::image::{Image, ImageView};
use crate::pipeline::{
    BlendMode, DepthBias, DepthStencilState, InputLayout, MultisampleState, RasterizerState,
};
use crate::query::Query;
use crate::shader::{Shader, ShaderStage};

/// Maximum number of commands per chunk. Producers publish the chunk and
/// start a new one when this is reached.
pub const CHUNK_CAPACITY: usize = 256;

/// Whether the worker releases a chunk after running it, or the chunk
/// survives for re-submission (deferred-context command lists).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkTag {
    SingleUse,
    Replayable,
}

/// One recording step, applied by the worker to the native context.
#[derive(Debug)]
pub enum CsCmd {
    SetBarrierControl(BarrierControl),

    /// Transition a freshly created image into its standing layout.
    InitImage(Arc<Image>),

    /// Apply a rename: subsequent GPU reads of `buffer` observe `slice`.
    InvalidateBuffer {
        buffer: Arc<Buffer>,
        slice: BufferSlice,
    },

    UpdateBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        data: Vec<u8>,
    },

    CopyBuffer {
        src: Arc<Buffer>,
        src_offset: u64,
        dst: Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    },

    CopyBufferToImage {
        src: Arc<Buffer>,
        src_offset: u64,
        dst: Arc<Image>,
        layers: vk::ImageSubresourceLayers,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        /// Set for combined depth-stencil images whose staging data is
        /// packed; selects the packed copy path.
        packed_format: Option<vk::Format>,
    },

    CopyImageToBuffer {
        src: Arc<Image>,
        layers: vk::ImageSubresourceLayers,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        dst: Arc<Buffer>,
        dst_offset: u64,
    },

    ClearRenderTarget {
        view: Arc<ImageView>,
        color: [f32; 4],
        rect: Option<vk::Rect2D>,
    },

    ClearDepthStencil {
        view: Arc<ImageView>,
        aspects: vk::ImageAspectFlags,
        depth: f32,
        stencil: u32,
        rect: Option<vk::Rect2D>,
    },

    BindFramebuffer {
        color: Vec<Option<Arc<ImageView>>>,
        depth: Option<Arc<ImageView>>,
    },

    SetViewports {
        viewports: Vec<vk::Viewport>,
        scissors: Vec<vk::Rect2D>,
    },

    SetBlendState {
        targets: Vec<BlendMode>,
    },
    SetBlendConstants([f32; 4]),
    SetDepthStencilState(DepthStencilState),
    SetStencilReference(u32),
    SetRasterizerState {
        state: RasterizerState,
        bias: DepthBias,
    },
    SetMultisampleState(MultisampleState),
    SetAlphaTest {
        func: vk::CompareOp,
        reference: f32,
    },

    SetInputLayout(InputLayout),
    SetPrimitiveTopology(vk::PrimitiveTopology),

    BindShader {
        stage: ShaderStage,
        shader: Option<Arc<Shader>>,
    },

    BindVertexBuffer {
        slot: u32,
        buffer: Option<Arc<Buffer>>,
        offset: u64,
        stride: u32,
    },

    BindIndexBuffer {
        buffer: Option<Arc<Buffer>>,
        offset: u64,
        index_type: vk::IndexType,
    },

    BindUniformBuffer {
        stage: ShaderStage,
        slot: u32,
        buffer: Option<Arc<Buffer>>,
        offset: u64,
        length: u64,
    },

    BindImageView {
        stage: ShaderStage,
        slot: u32,
        view: Option<Arc<ImageView>>,
    },

    BindSampler {
        stage: ShaderStage,
        slot: u32,
        sampler: vk::Sampler,
        depth_compare_sampler: vk::Sampler,
    },

    /// Move an image to a new standing layout (hazard handling).
    TransitionLayout {
        image: Arc<Image>,
        layout: vk::ImageLayout,
    },

    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },

    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },

    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },

    BeginQuery(Arc<Query>),
    EndQuery(Arc<Query>),
    WriteTimestamp(Arc<Query>),
    /// Associate an event query with the submission that carries it.
    SignalEvent(Arc<Query>),

    /// Close the current native command buffer and submit it.
    Flush,
}

/// A bounded, append-only chunk of commands.
#[derive(Debug)]
pub struct CsChunk {
    tag: ChunkTag,
    commands: Vec<CsCmd>,
}

impl CsChunk {
    pub fn new(tag: ChunkTag) -> Self {
        Self {
            tag,
            commands: Vec::with_capacity(CHUNK_CAPACITY),
        }
    }

    pub fn tag(&self) -> ChunkTag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Appends a command, or hands it back if the chunk is full so the
    /// caller can publish this chunk and retry on a fresh one.
    pub fn try_push(&mut self, cmd: CsCmd) -> Result<(), CsCmd> {
        if self.commands.len() >= CHUNK_CAPACITY {
            return Err(cmd);
        }
        self.commands.push(cmd);
        Ok(())
    }

    pub fn commands(&self) -> &[CsCmd] {
        &self.commands
    }
}

enum WorkerMsg {
    Chunk(Arc<CsChunk>),
    Stop,
}

/// The worker half of the command stream.
///
/// A single long-lived thread drains chunks in dispatch order and applies
/// each command to the native recording context. Commands are never
/// reordered.
pub struct CsThread {
    sender: SyncSender<WorkerMsg>,
    dispatched: AtomicU64,
    drained: Arc<(Mutex<u64>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl CsThread {
    /// Channel depth of the chunk hand-off. Producers block when the worker
    /// falls this far behind.
    const QUEUE_DEPTH: usize = 64;

    pub fn new(mut context: NativeContext) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<WorkerMsg>(Self::QUEUE_DEPTH);
        let drained = Arc::new((Mutex::new(0u64), Condvar::new()));
        let drained_worker = Arc::clone(&drained);

        let thread = std::thread::Builder::new()
            .name("prism-cs".into())
            .spawn(move || {
                while let Ok(msg) = receiver.recv() {
                    let chunk = match msg {
                        WorkerMsg::Chunk(chunk) => chunk,
                        WorkerMsg::Stop => break,
                    };

                    for cmd in chunk.commands() {
                        if let Err(err) = context.apply(cmd) {
                            error!(?err, "worker failed to record command");
                            context.mark_lost();
                        }
                    }

                    let (count, condvar) = &*drained_worker;
                    *count.lock().unwrap() += 1;
                    condvar.notify_all();
                }

                context.finalize();
            })
            .expect("failed to spawn command-stream worker");

        Self {
            sender,
            dispatched: AtomicU64::new(0),
            drained,
            thread: Some(thread),
        }
    }

    /// Publishes a chunk to the worker. Commands run in dispatch order.
    pub fn dispatch(&self, chunk: Arc<CsChunk>) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        // The worker only stops when `CsThread` is dropped, so the channel
        // outlives every dispatch call.
        let _ = self.sender.send(WorkerMsg::Chunk(chunk));
    }

    /// Blocks until the worker has drained every chunk dispatched so far.
    pub fn synchronize(&self) {
        let target = self.dispatched.load(Ordering::SeqCst);
        let (count, condvar) = &*self.drained;
        let mut done = count.lock().unwrap();
        while *done < target {
            done = condvar.wait(done).unwrap();
        }
    }

    /// Number of chunks dispatched but not yet drained.
    pub fn pending_chunks(&self) -> u64 {
        let dispatched = self.dispatched.load(Ordering::SeqCst);
        let done = *self.drained.0.lock().unwrap();
        dispatched.saturating_sub(done)
    }
}

impl CsThread {
    /// Stops the worker and joins it. Idempotent; also run on drop.
    pub fn stop(&mut self) {
        let _ = self.sender.send(WorkerMsg::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CsThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_hands_back_commands_when_full() {
        let mut chunk = CsChunk::new(ChunkTag::SingleUse);
        for _ in 0..CHUNK_CAPACITY {
            assert!(chunk
                .try_push(CsCmd::SetBlendConstants([0.0; 4]))
                .is_ok());
        }
        let overflow = chunk.try_push(CsCmd::SetStencilReference(1));
        assert!(matches!(overflow, Err(CsCmd::SetStencilReference(1))));
        assert_eq!(chunk.len(), CHUNK_CAPACITY);
    }

    #[test]
    fn replayable_tag_survives() {
        let chunk = CsChunk::new(ChunkTag::Replayable);
        assert_eq!(chunk.tag(), ChunkTag::Replayable);
    }
}

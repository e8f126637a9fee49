use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::error;

use prism_gpu::cs::{ChunkTag, CsChunk, CsCmd};
use prism_gpu::{Device, Status};

use crate::context::{CommonContext, Sink};
use crate::resource::{Buffer11, MapFlags, MapType, MappedSubresource};

/// A recorded sequence of chunks, replayable any number of times on the
/// immediate context.
pub struct CommandList {
    chunks: Vec<Arc<CsChunk>>,
}

impl CommandList {
    pub fn chunks(&self) -> &[Arc<CsChunk>] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// A deferred context: records state changes and draws into a command list
/// instead of dispatching them to the worker.
///
/// Emitted chunks are tagged replayable so the worker never releases them;
/// the application may execute the finished list repeatedly.
pub struct DeferredContext {
    ctx: CommonContext,
}

impl Deref for DeferredContext {
    type Target = CommonContext;

    fn deref(&self) -> &CommonContext {
        &self.ctx
    }
}

impl DerefMut for DeferredContext {
    fn deref_mut(&mut self) -> &mut CommonContext {
        &mut self.ctx
    }
}

impl DeferredContext {
    pub fn new(device: Device) -> Self {
        Self {
            ctx: CommonContext::new(device, ChunkTag::Replayable, Sink::List(Vec::new())),
        }
    }

    /// Seals the recording into a command list and resets the context for
    /// the next one.
    pub fn finish_command_list(&mut self, restore_deferred_state: bool) -> CommandList {
        self.ctx.flush_chunk();

        let chunks = match &mut self.ctx.sink {
            Sink::List(chunks) => std::mem::take(chunks),
            Sink::Worker => Vec::new(),
        };

        if !restore_deferred_state {
            self.ctx.clear_state();
        }

        CommandList { chunks }
    }

    /// Deferred maps only support the rename protocol: there is no GPU
    /// timeline to wait on while recording.
    pub fn map_buffer(
        &mut self,
        buffer: &Arc<Buffer11>,
        map_type: MapType,
        _map_flags: MapFlags,
    ) -> Result<MappedSubresource, Status> {
        match map_type {
            MapType::WriteDiscard => {
                let slice = buffer
                    .buffer()
                    .alloc_slice()
                    .map_err(|err| Status::from(&err))?;
                self.ctx.emit(CsCmd::InvalidateBuffer {
                    buffer: Arc::clone(buffer.buffer()),
                    slice,
                });
                let byte_width = buffer.desc().byte_width as u32;
                Ok(MappedSubresource {
                    data: slice.map_ptr(0),
                    row_pitch: byte_width,
                    depth_pitch: byte_width,
                })
            }
            MapType::WriteNoOverwrite => {
                let slice = buffer.buffer().current_slice();
                let byte_width = buffer.desc().byte_width as u32;
                Ok(MappedSubresource {
                    data: slice.map_ptr(0),
                    row_pitch: byte_width,
                    depth_pitch: byte_width,
                })
            }
            _ => {
                error!("deferred contexts only support discard and no-overwrite maps");
                Err(Status::INVALID_CALL)
            }
        }
    }
}

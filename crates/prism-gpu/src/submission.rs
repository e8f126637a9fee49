use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::error;

use crate::buffer::{Buffer, BufferSlice};
use crate::error::GpuError;
use crate::image::{Image, ImageView};
use crate::query::Query;

/// A strong reference the worker retains for a submission's lifetime, so a
/// producer-side release can never free memory the GPU still names.
#[derive(Debug)]
pub enum TrackedObject {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
    View(Arc<ImageView>),
    Query(Arc<Query>),
}

impl TrackedObject {
    fn mark(&self, submission: u64) {
        match self {
            TrackedObject::Buffer(buffer) => buffer.tracker().mark(submission),
            TrackedObject::Image(image) => image.tracker().mark(submission),
            TrackedObject::View(view) => {
                view.tracker().mark(submission);
                view.image().tracker().mark(submission);
            }
            TrackedObject::Query(_) => {}
        }
    }
}

/// Command buffer, fence and descriptor pools returned to the worker for
/// reuse once their submission completed.
pub(crate) struct Recycled {
    pub cmd_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub pools: Vec<vk::DescriptorPool>,
}

struct Pending {
    id: u64,
    fence: vk::Fence,
    cmd_buffer: vk::CommandBuffer,
    tracked: Vec<TrackedObject>,
    retired_slices: Vec<(Arc<Buffer>, BufferSlice)>,
    pools: Vec<vk::DescriptorPool>,
}

/// Submission bookkeeping shared between the worker (submit) and producer
/// threads (poll, wait).
///
/// Submission ids are dense and monotonically increasing; `completed` only
/// ever advances in submission order, so `id <= completed` is a reliable
/// "the GPU is done with everything this submission touched" test.
pub struct SubmissionTracker {
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    next_id: AtomicU64,
    completed: AtomicU64,
    pending: Mutex<VecDeque<Pending>>,
    recycle: Mutex<Vec<Recycled>>,
    lost: AtomicBool,
}

impl SubmissionTracker {
    pub fn new(device: ash::Device, queue: vk::Queue) -> Self {
        Self {
            device,
            queue: Mutex::new(queue),
            next_id: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            recycle: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
        }
    }

    /// Submits a closed command buffer. Worker use only.
    ///
    /// Marks every tracked resource with the new submission id and retains
    /// the references until the fence signals.
    pub(crate) fn submit(
        &self,
        cmd_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        tracked: Vec<TrackedObject>,
        retired_slices: Vec<(Arc<Buffer>, BufferSlice)>,
        pools: Vec<vk::DescriptorPool>,
        signaled_events: Vec<Arc<Query>>,
    ) -> Result<u64, GpuError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        for object in &tracked {
            object.mark(id);
        }
        for query in &signaled_events {
            query.set_event_submission(id);
        }

        {
            let queue = self.queue.lock().unwrap();
            let buffers = [cmd_buffer];
            let submit = vk::SubmitInfo::default().command_buffers(&buffers);
            unsafe { self.device.queue_submit(*queue, &[submit], fence) }?;
        }

        self.pending.lock().unwrap().push_back(Pending {
            id,
            fence,
            cmd_buffer,
            tracked,
            retired_slices,
            pools,
        });

        Ok(id)
    }

    /// Retires every submission whose fence has signaled and returns the
    /// number still pending.
    pub fn poll(&self) -> u32 {
        let mut pending = self.pending.lock().unwrap();

        while let Some(front) = pending.front() {
            let signaled = match unsafe { self.device.get_fence_status(front.fence) } {
                Ok(signaled) => signaled,
                Err(err) => {
                    error!(?err, "fence status query failed");
                    self.lost.store(true, Ordering::Release);
                    false
                }
            };
            if !signaled {
                break;
            }

            let done = pending.pop_front().expect("front checked above");
            self.retire(done);
        }

        pending.len() as u32
    }

    /// Number of submissions not yet observed to complete.
    pub fn pending_submissions(&self) -> u32 {
        self.poll()
    }

    /// Id of the last submission known to have completed.
    pub fn last_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether submission `id` has completed.
    pub fn is_complete(&self, id: u64) -> bool {
        if id <= self.last_completed() {
            return true;
        }
        self.poll();
        id <= self.last_completed()
    }

    /// Blocks until submission `id` completes.
    pub fn wait_for_submission(&self, id: u64) {
        loop {
            if self.is_complete(id) {
                return;
            }
            let fence = {
                let pending = self.pending.lock().unwrap();
                match pending.iter().find(|p| p.id >= id) {
                    Some(p) => p.fence,
                    // Not yet submitted; the caller is responsible for
                    // flushing first. Yield instead of spinning hot.
                    None => {
                        drop(pending);
                        std::thread::yield_now();
                        continue;
                    }
                }
            };
            let fences = [fence];
            let _ = unsafe { self.device.wait_for_fences(&fences, true, u64::MAX) };
        }
    }

    /// Blocks until every pending submission completes.
    pub fn wait_for_idle(&self) {
        loop {
            let fence = match self.pending.lock().unwrap().back() {
                Some(p) => p.fence,
                None => return,
            };
            let fences = [fence];
            let _ = unsafe { self.device.wait_for_fences(&fences, true, u64::MAX) };
            if self.poll() == 0 {
                return;
            }
        }
    }

    /// Sticky device-removed flag, set on worker-side failures.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Drains recycled per-submission objects. Worker use only.
    pub(crate) fn take_recycled(&self) -> Vec<Recycled> {
        std::mem::take(&mut self.recycle.lock().unwrap())
    }

    fn retire(&self, done: Pending) {
        self.completed.fetch_max(done.id, Ordering::AcqRel);

        for (buffer, slice) in done.retired_slices {
            buffer.free_slice(slice);
        }
        drop(done.tracked);

        self.recycle.lock().unwrap().push(Recycled {
            cmd_buffer: done.cmd_buffer,
            fence: done.fence,
            pools: done.pools,
        });
    }
}

impl Drop for SubmissionTracker {
    fn drop(&mut self) {
        self.wait_for_idle();
        for recycled in self.recycle.get_mut().unwrap().drain(..) {
            unsafe { self.device.destroy_fence(recycled.fence, None) };
        }
    }
}

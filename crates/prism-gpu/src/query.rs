use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::error::GpuError;
use crate::submission::SubmissionTracker;

/// Query kinds the core models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Occlusion,
    Timestamp,
    Statistics,
    /// A pure synchronization point: available once the submission that
    /// carried its End completes.
    Event,
}

/// Producer-visible query lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Begun,
    Ended,
}

/// Result data per query kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryData {
    Occlusion(u64),
    Timestamp(u64),
    Statistics(PipelineStatistics),
    Event,
}

/// The pipeline-statistics counters the core requests from the native
/// query pool, in pool result order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub ia_vertices: u64,
    pub ia_primitives: u64,
    pub vs_invocations: u64,
    pub clip_invocations: u64,
    pub clip_primitives: u64,
    pub ps_invocations: u64,
}

const STATISTICS_COUNTERS: usize = 6;

/// Consecutive unavailable polls before a query is considered stalling.
const STALL_THRESHOLD: u32 = 8;

/// Counts unavailable polls and raises the sticky stalling flag once they
/// exceed the threshold.
#[derive(Debug, Default)]
struct StallTracker {
    count: AtomicU32,
    flag: AtomicBool,
}

impl StallTracker {
    fn notify_stall(&self) {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > STALL_THRESHOLD {
            self.flag.store(true, Ordering::Release);
        }
    }

    fn notify_end(&self) {
        let count = self.count.load(Ordering::Acquire);
        self.count.store(count >> 1, Ordering::Release);
    }

    fn is_stalling(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct PoolBlock {
    pool: vk::QueryPool,
    free: Vec<u32>,
}

struct PoolSet {
    occlusion: Vec<PoolBlock>,
    timestamp: Vec<PoolBlock>,
    statistics: Vec<PoolBlock>,
}

/// Allocates slots out of shared native query pools, one pool family per
/// query kind. Event queries carry no native slot.
pub struct QueryAllocator {
    device: ash::Device,
    pools: Mutex<PoolSet>,
}

const POOL_SIZE: u32 = 128;

impl QueryAllocator {
    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
            pools: Mutex::new(PoolSet {
                occlusion: Vec::new(),
                timestamp: Vec::new(),
                statistics: Vec::new(),
            }),
        }
    }

    fn alloc_slot(&self, kind: QueryKind) -> Result<Option<(vk::QueryPool, u32)>, GpuError> {
        let (query_type, statistics) = match kind {
            QueryKind::Occlusion => (vk::QueryType::OCCLUSION, vk::QueryPipelineStatisticFlags::empty()),
            QueryKind::Timestamp => (vk::QueryType::TIMESTAMP, vk::QueryPipelineStatisticFlags::empty()),
            QueryKind::Statistics => (
                vk::QueryType::PIPELINE_STATISTICS,
                vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES
                    | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES
                    | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES
                    | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS,
            ),
            QueryKind::Event => return Ok(None),
        };

        let mut pools = self.pools.lock().unwrap();
        let family = match kind {
            QueryKind::Occlusion => &mut pools.occlusion,
            QueryKind::Timestamp => &mut pools.timestamp,
            QueryKind::Statistics => &mut pools.statistics,
            QueryKind::Event => unreachable!(),
        };

        for block in family.iter_mut() {
            if let Some(index) = block.free.pop() {
                return Ok(Some((block.pool, index)));
            }
        }

        let info = vk::QueryPoolCreateInfo::default()
            .query_type(query_type)
            .query_count(POOL_SIZE)
            .pipeline_statistics(statistics);
        let pool = unsafe { self.device.create_query_pool(&info, None) }?;

        let mut free: Vec<u32> = (0..POOL_SIZE).rev().collect();
        let index = free.pop().expect("fresh pool has free slots");
        family.push(PoolBlock { pool, free });
        Ok(Some((pool, index)))
    }

    fn free_slot(&self, kind: QueryKind, pool: vk::QueryPool, index: u32) {
        let mut pools = self.pools.lock().unwrap();
        let family = match kind {
            QueryKind::Occlusion => &mut pools.occlusion,
            QueryKind::Timestamp => &mut pools.timestamp,
            QueryKind::Statistics => &mut pools.statistics,
            QueryKind::Event => return,
        };
        if let Some(block) = family.iter_mut().find(|b| b.pool == pool) {
            block.free.push(index);
        }
    }
}

impl Drop for QueryAllocator {
    fn drop(&mut self) {
        let pools = self.pools.get_mut().unwrap();
        for block in pools
            .occlusion
            .iter()
            .chain(pools.timestamp.iter())
            .chain(pools.statistics.iter())
        {
            unsafe { self.device.destroy_query_pool(block.pool, None) };
        }
    }
}

/// A single query object.
///
/// The state machine is `created -> begun -> ended`; availability is a
/// dynamic property of the native pool (or, for events, of the submission
/// that carried the End).
pub struct Query {
    kind: QueryKind,
    state: Mutex<QueryState>,
    slot: Option<(vk::QueryPool, u32)>,
    allocator: Arc<QueryAllocator>,
    stall: StallTracker,
    event_submission: AtomicU64,
}

impl Query {
    pub fn new(allocator: Arc<QueryAllocator>, kind: QueryKind) -> Result<Arc<Self>, GpuError> {
        let slot = allocator.alloc_slot(kind)?;
        Ok(Arc::new(Self {
            kind,
            state: Mutex::new(QueryState::Created),
            slot,
            allocator,
            stall: StallTracker::default(),
            // Sentinel: the event has not ridden any submission yet.
            event_submission: AtomicU64::new(u64::MAX),
        }))
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn state(&self) -> QueryState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: QueryState) {
        *self.state.lock().unwrap() = state;
    }

    /// Native pool slot, if the kind has one. Worker use only.
    pub fn slot(&self) -> Option<(vk::QueryPool, u32)> {
        self.slot
    }

    /// Records that a producer polled an unavailable result. Once polls
    /// exceed the threshold the query is considered stalling and its
    /// context should escalate the next End to a strong flush.
    pub fn notify_stall(&self) {
        self.stall.notify_stall();
    }

    /// Decays the stall counter when the query is reused.
    pub fn notify_end(&self) {
        self.stall.notify_end();
    }

    pub fn is_stalling(&self) -> bool {
        self.stall.is_stalling()
    }

    /// Associates an event query with the submission carrying its End.
    /// Worker use only.
    pub fn set_event_submission(&self, id: u64) {
        self.event_submission.store(id, Ordering::Release);
    }

    /// Reads back the query result, or `None` if it is not yet available.
    pub fn get_data(
        &self,
        device: &ash::Device,
        submissions: &SubmissionTracker,
    ) -> Result<Option<QueryData>, GpuError> {
        if self.state() != QueryState::Ended {
            return Ok(None);
        }

        match self.kind {
            QueryKind::Event => {
                let id = self.event_submission.load(Ordering::Acquire);
                if id != u64::MAX && submissions.is_complete(id) {
                    Ok(Some(QueryData::Event))
                } else {
                    Ok(None)
                }
            }
            QueryKind::Occlusion | QueryKind::Timestamp => {
                let Some((pool, index)) = self.slot else {
                    return Ok(None);
                };
                let mut data = [0u64; 1];
                match unsafe {
                    device.get_query_pool_results(
                        pool,
                        index,
                        &mut data,
                        vk::QueryResultFlags::TYPE_64,
                    )
                } {
                    Ok(()) => Ok(Some(if self.kind == QueryKind::Occlusion {
                        QueryData::Occlusion(data[0])
                    } else {
                        QueryData::Timestamp(data[0])
                    })),
                    Err(vk::Result::NOT_READY) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
            QueryKind::Statistics => {
                let Some((pool, index)) = self.slot else {
                    return Ok(None);
                };
                // One query result is the whole counter block; a flat u64
                // slice would be interpreted as one query per element.
                let mut data = [[0u64; STATISTICS_COUNTERS]; 1];
                match unsafe {
                    device.get_query_pool_results(
                        pool,
                        index,
                        &mut data,
                        vk::QueryResultFlags::TYPE_64,
                    )
                } {
                    Ok(()) => Ok(Some(QueryData::Statistics(PipelineStatistics {
                        ia_vertices: data[0][0],
                        ia_primitives: data[0][1],
                        vs_invocations: data[0][2],
                        clip_invocations: data[0][3],
                        clip_primitives: data[0][4],
                        ps_invocations: data[0][5],
                    }))),
                    Err(vk::Result::NOT_READY) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if let Some((pool, index)) = self.slot {
            self.allocator.free_slot(self.kind, pool, index);
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_flag_raises_after_threshold() {
        let stall = StallTracker::default();
        for _ in 0..STALL_THRESHOLD {
            stall.notify_stall();
        }
        assert!(!stall.is_stalling());

        stall.notify_stall();
        assert!(stall.is_stalling());
    }

    #[test]
    fn notify_end_decays_stall_count() {
        let stall = StallTracker::default();
        for _ in 0..6 {
            stall.notify_stall();
        }
        stall.notify_end();
        assert_eq!(stall.count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn stall_flag_is_sticky() {
        let stall = StallTracker::default();
        for _ in 0..STALL_THRESHOLD + 1 {
            stall.notify_stall();
        }
        stall.notify_end();
        assert!(stall.is_stalling());
    }
}

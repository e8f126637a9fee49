use std::sync::Arc;

use prism_gpu::{Device, GpuError, Query, QueryKind};

/// Legacy query kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind11 {
    Event,
    Occlusion,
    Timestamp,
    TimestampDisjoint,
    PipelineStatistics,
    OcclusionPredicate,
}

#[derive(Clone, Copy, Debug)]
pub struct QueryDesc {
    pub kind: QueryKind11,
}

/// A version-11 query or predicate.
pub struct Query11 {
    kind: QueryKind11,
    query: Arc<Query>,
}

impl Query11 {
    pub fn new(device: &Device, desc: QueryDesc) -> Result<Arc<Self>, GpuError> {
        let core_kind = match desc.kind {
            QueryKind11::Event => QueryKind::Event,
            QueryKind11::Occlusion | QueryKind11::OcclusionPredicate => QueryKind::Occlusion,
            QueryKind11::Timestamp => QueryKind::Timestamp,
            // The disjoint query carries no GPU work; it reports the
            // timestamp frequency at GetData time.
            QueryKind11::TimestampDisjoint => QueryKind::Event,
            QueryKind11::PipelineStatistics => QueryKind::Statistics,
        };

        Ok(Arc::new(Self {
            kind: desc.kind,
            query: device.create_query(core_kind)?,
        }))
    }

    pub fn kind(&self) -> QueryKind11 {
        self.kind
    }

    pub fn is_event(&self) -> bool {
        matches!(self.kind, QueryKind11::Event | QueryKind11::TimestampDisjoint)
    }

    /// Size in bytes of the data block `get_data` fills.
    pub fn data_size(&self) -> u32 {
        match self.kind {
            QueryKind11::Event => 4,
            QueryKind11::Occlusion => 8,
            QueryKind11::Timestamp => 8,
            QueryKind11::TimestampDisjoint => 16,
            QueryKind11::PipelineStatistics => 88,
            QueryKind11::OcclusionPredicate => 4,
        }
    }

    pub fn core(&self) -> &Arc<Query> {
        &self.query
    }
}

impl std::fmt::Debug for Query11 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query11").field("kind", &self.kind).finish()
    }
}

use std::sync::Arc;

use prism_gpu::{Device, GpuError, Query, QueryKind};

/// Version-9 query kinds the runtime models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind9 {
    Event,
    Occlusion,
    Timestamp,
}

/// A version-9 query. Issue(BEGIN) and Issue(END) drive the state machine;
/// event queries only accept END.
pub struct Query9 {
    kind: QueryKind9,
    query: Arc<Query>,
}

impl Query9 {
    pub fn new(device: &Device, kind: QueryKind9) -> Result<Arc<Self>, GpuError> {
        let core_kind = match kind {
            QueryKind9::Event => QueryKind::Event,
            QueryKind9::Occlusion => QueryKind::Occlusion,
            QueryKind9::Timestamp => QueryKind::Timestamp,
        };
        Ok(Arc::new(Self {
            kind,
            query: device.create_query(core_kind)?,
        }))
    }

    pub fn kind(&self) -> QueryKind9 {
        self.kind
    }

    pub fn is_event(&self) -> bool {
        self.kind == QueryKind9::Event
    }

    pub fn core(&self) -> &Arc<Query> {
        &self.query
    }
}

impl std::fmt::Debug for Query9 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query9").field("kind", &self.kind).finish()
    }
}

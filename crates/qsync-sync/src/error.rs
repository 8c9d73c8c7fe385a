use crate::{request::SyncRequestId, SyncPhase};
use qsync_graph::GraphError;

/// A sync transaction that aborted. The previously published snapshot stays in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sync request {request_id} failed while {stage}: {kind}")]
pub struct SyncError {
    pub request_id: SyncRequestId,
    /// Phase the transaction was in when it aborted.
    pub stage: SyncPhase,
    #[source]
    pub kind: SyncErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncErrorKind {
    #[error("published snapshot is corrupt: {0}")]
    CorruptSnapshot(#[source] GraphError),

    #[error("merged graph is corrupt: {0}")]
    CorruptGraph(#[source] GraphError),

    #[error("record batch of {count} targets exceeds the limit of {max}")]
    TooManyTargets { count: usize, max: usize },

    #[error("worker panicked: {message}")]
    Panicked { message: String },

    /// The service shut down before the request ran.
    #[error("sync service stopped")]
    Stopped,
}

impl SyncError {
    pub(crate) fn new(request_id: SyncRequestId, stage: SyncPhase, kind: SyncErrorKind) -> Self {
        Self {
            request_id,
            stage,
            kind,
        }
    }
}

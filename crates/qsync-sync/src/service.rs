use crate::{
    error::{SyncError, SyncErrorKind},
    orchestrator::{SyncOrchestrator, SyncPhase},
    request::{SyncOutcome, SyncRequest, SyncRequestId},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

/// Single-slot holder for the next sync request.
///
/// Posting while a request is pending folds the new one into it with
/// [`SyncRequest::coalesce`]; the merged request takes the newest id.
#[derive(Debug, Default)]
pub struct SyncMailbox {
    pending: Option<(SyncRequestId, SyncRequest)>,
}

impl SyncMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `request`, returning the id of the pending request it superseded.
    pub fn post(&mut self, id: SyncRequestId, request: SyncRequest) -> Option<SyncRequestId> {
        match self.pending.take() {
            Some((superseded, pending)) => {
                self.pending = Some((id, pending.coalesce(request)));
                Some(superseded)
            }
            None => {
                self.pending = Some((id, request));
                None
            }
        }
    }

    pub fn take(&mut self) -> Option<(SyncRequestId, SyncRequest)> {
        self.pending.take()
    }

    pub fn pending_id(&self) -> Option<SyncRequestId> {
        self.pending.as_ref().map(|(id, _)| *id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub active_id: Option<SyncRequestId>,
    pub pending_id: Option<SyncRequestId>,
    pub last_completed_id: Option<SyncRequestId>,
    pub last_error: Option<String>,
    /// Generation of the published snapshot.
    pub generation: u64,
    /// Requests folded into a later one instead of running on their own.
    pub coalesced: u64,
}

#[derive(Debug, Clone, Default)]
struct Progress {
    /// Every request id up to and including this one has been covered by a finished sync.
    completed_through: Option<SyncRequestId>,
    last: Option<Result<Arc<SyncOutcome>, SyncError>>,
}

#[derive(Debug, Default)]
struct ServiceState {
    mailbox: SyncMailbox,
    active: Option<SyncRequestId>,
    last_completed: Option<SyncRequestId>,
    last_error: Option<String>,
    coalesced: u64,
    stopping: bool,
}

struct Inner {
    orchestrator: Arc<SyncOrchestrator>,
    state: Mutex<ServiceState>,
    wake: Notify,
    progress: watch::Sender<Progress>,
}

/// Background worker that runs sync requests one at a time, coalescing requests that arrive
/// while a sync is in flight.
pub struct SyncService {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl SyncService {
    /// Start the worker task. Must be called from within a tokio runtime.
    pub fn start(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        let inner = Arc::new(Inner {
            orchestrator,
            state: Mutex::new(ServiceState::default()),
            wake: Notify::new(),
            progress,
        });
        let worker = tokio::spawn(worker_loop(Arc::clone(&inner)));
        Self {
            inner,
            worker: Some(worker),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }

    /// Queue `request`. If another request is still pending the two are merged.
    pub fn submit(&self, request: SyncRequest) -> SyncRequestId {
        let id = self.inner.orchestrator.allocate_request_id();
        {
            let mut state = self.inner.state.lock();
            if let Some(superseded) = state.mailbox.post(id, request) {
                state.coalesced += 1;
                tracing::debug!(
                    target = "qsync.sync",
                    superseded,
                    request_id = id,
                    "coalesced pending sync request"
                );
            }
        }
        self.inner.wake.notify_one();
        id
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.inner.state.lock();
        SyncStatus {
            phase: self.inner.orchestrator.phase(),
            active_id: state.active,
            pending_id: state.mailbox.pending_id(),
            last_completed_id: state.last_completed,
            last_error: state.last_error.clone(),
            generation: self.inner.orchestrator.snapshot().generation(),
            coalesced: state.coalesced,
        }
    }

    /// Wait until a sync covering `id` has finished and return the latest finished result.
    ///
    /// A request merged into a later one is covered by that later sync.
    pub async fn wait_for(&self, id: SyncRequestId) -> Result<Arc<SyncOutcome>, SyncError> {
        let mut rx = self.inner.progress.subscribe();
        let stopped = || SyncError::new(id, SyncPhase::Idle, SyncErrorKind::Stopped);
        let progress = rx
            .wait_for(|progress| progress.completed_through.is_some_and(|done| done >= id))
            .await
            .map_err(|_| stopped())?;
        progress.last.clone().unwrap_or_else(|| Err(stopped()))
    }

    /// Stop the worker after the running sync (if any); a pending request is dropped.
    pub async fn shutdown(mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                tracing::warn!(target = "qsync.sync", error = %err, "sync worker failed");
            }
        }
    }

    fn request_stop(&self) {
        self.inner.state.lock().stopping = true;
        self.inner.wake.notify_one();
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.request_stop();
        }
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            if state.stopping {
                let dropped = state.mailbox.take().map(|(id, _)| id);
                drop(state);
                if let Some(id) = dropped {
                    let err = SyncError::new(id, SyncPhase::Idle, SyncErrorKind::Stopped);
                    finish(&inner, id, Err(err));
                }
                break;
            }
            let next = state.mailbox.take();
            if let Some((id, _)) = &next {
                state.active = Some(*id);
            }
            next
        };
        let Some((id, request)) = next else {
            inner.wake.notified().await;
            continue;
        };

        let result = inner.orchestrator.run(id, request).await.map(Arc::new);
        finish(&inner, id, result);
    }
    tracing::debug!(target = "qsync.sync", "sync worker stopped");
}

fn finish(inner: &Inner, id: SyncRequestId, result: Result<Arc<SyncOutcome>, SyncError>) {
    {
        let mut state = inner.state.lock();
        state.active = None;
        state.last_completed = Some(id);
        state.last_error = result.as_ref().err().map(ToString::to_string);
    }
    inner.progress.send_modify(|progress| {
        progress.completed_through = Some(progress.completed_through.map_or(id, |done| done.max(id)));
        progress.last = Some(result);
    });
}

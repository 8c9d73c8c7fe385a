//! Incremental sync transactions over the build graph.
//!
//! A [`SyncOrchestrator`] takes a batch of query output plus the current VCS state, applies it to a
//! copy-on-write working copy of the published graph, reclassifies only what changed, fetches the
//! artifacts the project now needs and atomically publishes a new [`ProjectGraph`]. A failed
//! transaction leaves the previous snapshot published.
//!
//! [`SyncService`] runs the orchestrator on a background task behind a single-slot
//! [`SyncMailbox`], so bursts of requests collapse into one sync of the end state.

mod diagnostics;
mod error;
mod fetch;
mod orchestrator;
mod request;
mod service;
mod snapshot;

pub use crate::{
    diagnostics::{DiagnosticKind, SyncDiagnostic},
    error::{SyncError, SyncErrorKind},
    orchestrator::{SyncOptions, SyncOrchestrator, SyncPhase},
    request::{ArtifactPins, SyncOutcome, SyncRequest, SyncRequestId},
    service::{SyncMailbox, SyncService, SyncStatus},
    snapshot::{ProjectGraph, SnapshotCell},
};

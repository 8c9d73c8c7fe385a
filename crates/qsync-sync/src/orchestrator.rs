use crate::{
    diagnostics::{DiagnosticKind, SyncDiagnostic},
    error::{SyncError, SyncErrorKind},
    fetch::{fetch_with_retry, FetchFailure},
    request::{ArtifactPins, SyncOutcome, SyncRequest, SyncRequestId},
    snapshot::{ProjectGraph, SnapshotCell},
};
use futures::StreamExt;
use parking_lot::Mutex;
use qsync_cache::ArtifactCache;
use qsync_core::{panic_payload_to_str, ArtifactDigest, Label, PathResolver};
use qsync_graph::{AffectedSet, BuildGraph, ProjectRules};
use qsync_vcs::{affected_packages, WorkingSetDiffer};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::Instrument;

/// Where a sync transaction is. Phases advance strictly in declaration order; `Failed` can follow
/// any phase after `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Diffing,
    Merging,
    Classifying,
    Fetching,
    Published,
    Failed,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Merging => "merging",
            SyncPhase::Classifying => "classifying",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Published => "published",
            SyncPhase::Failed => "failed",
        }
    }

    /// Whether a transaction is running in this phase.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            SyncPhase::Idle | SyncPhase::Published | SyncPhase::Failed
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Artifact fetches in flight at once.
    pub fetch_parallelism: usize,
    /// Limit for one fetch attempt.
    pub fetch_timeout: Duration,
    /// Attempts per artifact before it is reported unavailable.
    pub fetch_attempts: u32,
    /// Delay before the first retry; doubles for each further one.
    pub retry_backoff: Duration,
    /// Largest record batch one sync accepts.
    pub max_targets: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch_parallelism: 8,
            fetch_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            max_targets: 5_000_000,
        }
    }
}

#[derive(Debug)]
struct Control {
    phase: SyncPhase,
    rules: Arc<ProjectRules>,
    /// Set by rule changes; cleared once a snapshot classified with the new rules is published.
    reclassify_all: bool,
}

/// Runs incremental sync transactions and publishes their [`ProjectGraph`] snapshots.
///
/// Transactions are serialized: a second `sync` call waits for the first to finish. Readers of
/// [`snapshot`](Self::snapshot) never wait on a transaction.
pub struct SyncOrchestrator {
    snapshot: Arc<SnapshotCell>,
    cache: ArtifactCache,
    resolver: PathResolver,
    options: SyncOptions,
    control: Mutex<Control>,
    transaction: tokio::sync::Mutex<()>,
    next_request_id: AtomicU64,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("snapshot", &self.snapshot.load())
            .field("phase", &self.phase())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        cache: ArtifactCache,
        resolver: PathResolver,
        rules: ProjectRules,
        options: SyncOptions,
    ) -> Self {
        let rules = Arc::new(rules);
        Self {
            snapshot: Arc::new(SnapshotCell::new(ProjectGraph::empty(Arc::clone(&rules)))),
            cache,
            resolver,
            options,
            control: Mutex::new(Control {
                phase: SyncPhase::Idle,
                rules,
                reclassify_all: false,
            }),
            transaction: tokio::sync::Mutex::new(()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// The last published snapshot.
    pub fn snapshot(&self) -> Arc<ProjectGraph> {
        self.snapshot.load()
    }

    /// Shared handle readers can keep to follow publications.
    pub fn snapshot_cell(&self) -> Arc<SnapshotCell> {
        Arc::clone(&self.snapshot)
    }

    pub fn phase(&self) -> SyncPhase {
        self.control.lock().phase
    }

    pub fn rules(&self) -> Arc<ProjectRules> {
        Arc::clone(&self.control.lock().rules)
    }

    /// Replace the membership rules. The next sync reclassifies every label.
    pub fn set_rules(&self, rules: ProjectRules) {
        let mut control = self.control.lock();
        control.rules = Arc::new(rules);
        control.reclassify_all = true;
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Apply `request` on top of the published snapshot and publish the result.
    ///
    /// Per-label and per-artifact problems are returned as diagnostics on a published snapshot.
    /// Only structural failures return `Err`, leaving the previous snapshot published.
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncOutcome, SyncError> {
        let request_id = self.allocate_request_id();
        self.run(request_id, request).await
    }

    pub(crate) fn allocate_request_id(&self) -> SyncRequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn run(
        &self,
        request_id: SyncRequestId,
        request: SyncRequest,
    ) -> Result<SyncOutcome, SyncError> {
        let _transaction = self.transaction.lock().await;
        let span = tracing::info_span!("sync", request_id);
        let result = self.transact(request_id, request).instrument(span).await;
        if let Err(err) = &result {
            self.set_phase(SyncPhase::Failed);
            tracing::warn!(
                target = "qsync.sync",
                request_id,
                stage = %err.stage,
                error = %err.kind,
                "sync failed; previous snapshot stays published"
            );
        }
        result
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.control.lock().phase = phase;
        tracing::debug!(target = "qsync.sync", phase = %phase, "sync phase");
    }

    async fn transact(
        &self,
        request_id: SyncRequestId,
        request: SyncRequest,
    ) -> Result<SyncOutcome, SyncError> {
        let fail = |stage, kind| SyncError::new(request_id, stage, kind);
        let previous = self.snapshot.load();
        let (rules, reclassify_all) = {
            let control = self.control.lock();
            (Arc::clone(&control.rules), control.reclassify_all)
        };

        self.set_phase(SyncPhase::Diffing);
        let changed_paths = WorkingSetDiffer::diff(&previous.vcs_state, &request.vcs_state);
        let affected_packages = affected_packages(
            &changed_paths,
            &previous.graph.packages(),
            &request.subincludes,
            |path| rules.includes_path(path),
        );
        let full_revision_changed = changed_paths.full_revision_changed;
        tracing::debug!(
            target = "qsync.sync",
            changed = changed_paths.len(),
            full_revision_changed,
            affected_packages = affected_packages.affected.len(),
            deleted_packages = affected_packages.deleted.len(),
            incomplete = affected_packages.incomplete,
            "diffed working set"
        );

        self.set_phase(SyncPhase::Merging);
        let SyncRequest {
            vcs_state,
            records,
            mut removed,
            ..
        } = request;
        if records.len() > self.options.max_targets {
            return Err(fail(
                SyncPhase::Merging,
                SyncErrorKind::TooManyTargets {
                    count: records.len(),
                    max: self.options.max_targets,
                },
            ));
        }
        let resupplied: BTreeSet<Label> = records.iter().map(|r| r.label.clone()).collect();
        for package in &affected_packages.deleted {
            removed.extend(previous.graph.labels_in_package(package));
        }
        removed.retain(|label| !resupplied.contains(label));

        previous
            .graph
            .check_invariants_for(resupplied.iter().chain(&removed))
            .map_err(|err| fail(SyncPhase::Merging, SyncErrorKind::CorruptSnapshot(err)))?;

        let mut working = BuildGraph::clone(&previous.graph);
        let merged = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(move || {
                let mut affected = working.remove(removed);
                affected.extend(working.merge(records));
                if full_revision_changed {
                    affected.invalidated.extend(working.invalidate_all());
                }
                (working, affected)
            }))
        })
        .await;
        let (graph, affected) = match merged {
            Ok(Ok(merged)) => merged,
            Ok(Err(payload)) => {
                let message = panic_payload_to_str(&*payload).to_string();
                return Err(fail(SyncPhase::Merging, SyncErrorKind::Panicked { message }));
            }
            Err(err) => {
                let message = err.to_string();
                return Err(fail(SyncPhase::Merging, SyncErrorKind::Panicked { message }));
            }
        };
        let AffectedSet {
            invalidated,
            inserted,
            removed,
            diagnostics: graph_diagnostics,
        } = affected;
        graph
            .check_invariants_for(invalidated.iter().chain(&inserted).chain(&removed))
            .map_err(|err| fail(SyncPhase::Merging, SyncErrorKind::CorruptGraph(err)))?;

        self.set_phase(SyncPhase::Classifying);
        let mut membership = previous.membership.clone();
        for label in &removed {
            membership.remove(label);
        }
        let reclassified: BTreeSet<Label> = if reclassify_all || full_revision_changed {
            membership.clear();
            graph.labels().cloned().collect()
        } else {
            invalidated
                .iter()
                .chain(&inserted)
                .filter(|label| graph.contains(label))
                .cloned()
                .collect()
        };
        for label in &reclassified {
            membership.insert(label.clone(), rules.classify(label));
        }
        tracing::debug!(
            target = "qsync.sync",
            reclassified = reclassified.len(),
            full = reclassify_all || full_revision_changed,
            "classified labels"
        );

        self.set_phase(SyncPhase::Fetching);
        let graph = Arc::new(graph);
        let mut affected_labels = reclassified;
        affected_labels.extend(invalidated);
        // All in-project labels, so artifacts that failed or were evicted earlier are fetched again.
        let in_project: Vec<Label> = graph
            .labels()
            .filter(|label| membership.get(label).copied().unwrap_or(false))
            .cloned()
            .collect();

        let warm_graph = Arc::clone(&graph);
        let warm_labels = in_project.clone();
        let cycle_diagnostics =
            tokio::task::spawn_blocking(move || warm_graph.warm_closures(&warm_labels))
                .await
                .map_err(|err| {
                    let message = err.to_string();
                    fail(SyncPhase::Fetching, SyncErrorKind::Panicked { message })
                })?;

        let mut graph_degraded: BTreeSet<Label> = previous
            .graph_degraded
            .iter()
            .filter(|label| graph.contains(label) && !affected_labels.contains(*label))
            .cloned()
            .collect();
        let mut diagnostics = Vec::new();
        for diagnostic in graph_diagnostics.into_iter().chain(cycle_diagnostics) {
            if graph.contains(diagnostic.label()) {
                graph_degraded.insert(diagnostic.label().clone());
            }
            diagnostics.push(SyncDiagnostic::from(diagnostic));
        }

        let mut wanted: BTreeMap<ArtifactDigest, Label> = BTreeMap::new();
        let mut resolved = BTreeMap::new();
        let mut visited = HashSet::new();
        for label in &in_project {
            let closure = graph.closure_of(label);
            for reached in std::iter::once(label).chain(&closure.transitive_deps) {
                if !visited.insert(reached.clone()) {
                    continue;
                }
                let Some(record) = graph.get(reached) else {
                    continue;
                };
                for artifact in &record.artifacts {
                    if wanted.contains_key(&artifact.digest) {
                        continue;
                    }
                    wanted.insert(artifact.digest.clone(), reached.clone());
                    match self.resolver.resolve(&artifact.path) {
                        Ok(path) => {
                            resolved.insert(artifact.path.clone(), path);
                        }
                        Err(err) => diagnostics.push(SyncDiagnostic::unknown_root(
                            reached.clone(),
                            artifact.digest.clone(),
                            err,
                        )),
                    }
                }
            }
        }

        let cache = &self.cache;
        let options = &self.options;
        let mut fetched: Vec<_> = futures::stream::iter(wanted)
            .map(|(digest, owner)| async move {
                let result = fetch_with_retry(cache, &digest, options).await;
                (digest, owner, result)
            })
            .buffer_unordered(self.options.fetch_parallelism.max(1))
            .collect()
            .await;
        fetched.sort_by(|a, b| a.0.cmp(&b.0));

        let mut artifacts = BTreeMap::new();
        let mut pins = Vec::new();
        for (digest, owner, result) in fetched {
            match result {
                Ok(source) => {
                    artifacts.insert(digest, source.path().to_path_buf());
                    pins.push(source);
                }
                Err(FetchFailure::Missing) => diagnostics.push(SyncDiagnostic::for_artifact(
                    owner,
                    digest,
                    DiagnosticKind::ArtifactMissing,
                )),
                Err(FetchFailure::Unavailable { attempts, error }) => {
                    diagnostics.push(SyncDiagnostic::for_artifact(
                        owner,
                        digest,
                        DiagnosticKind::ArtifactUnavailable { attempts, error },
                    ))
                }
            }
        }
        let cache_stats = self.cache.stats();
        if cache_stats.total_bytes > cache_stats.max_bytes {
            tracing::warn!(
                target = "qsync.sync",
                total_bytes = cache_stats.total_bytes,
                max_bytes = cache_stats.max_bytes,
                pinned = pins.len(),
                "project artifacts exceed the cache budget; keeping them until the outcome is dropped"
            );
        }

        let mut degraded = graph_degraded.clone();
        degraded.extend(
            diagnostics
                .iter()
                .filter_map(|diagnostic| diagnostic.label.as_ref())
                .filter(|label| graph.contains(label))
                .cloned(),
        );

        let snapshot = Arc::new(ProjectGraph {
            generation: previous.generation + 1,
            graph,
            membership,
            vcs_state,
            degraded,
            graph_degraded,
            rules: Arc::clone(&rules),
        });
        {
            let mut control = self.control.lock();
            self.snapshot.publish(Arc::clone(&snapshot));
            if Arc::ptr_eq(&control.rules, &rules) {
                control.reclassify_all = false;
            }
            control.phase = SyncPhase::Published;
        }
        tracing::info!(
            target = "qsync.sync",
            generation = snapshot.generation,
            targets = snapshot.len(),
            affected = affected_labels.len(),
            artifacts = artifacts.len(),
            diagnostics = diagnostics.len(),
            "published project snapshot"
        );

        Ok(SyncOutcome {
            request_id,
            snapshot,
            artifacts,
            pins: ArtifactPins::new(pins),
            resolved,
            diagnostics,
            affected: affected_labels,
            affected_packages,
            changed_paths,
        })
    }
}

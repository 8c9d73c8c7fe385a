use crate::{diagnostics::SyncDiagnostic, snapshot::ProjectGraph};
use qsync_cache::ByteSource;
use qsync_core::{ArtifactDigest, FileRef, Label, TargetRecord};
use qsync_vcs::{AffectedPackages, ChangedPaths, VcsState};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    sync::Arc,
};

pub type SyncRequestId = u64;

/// One batch of query output to apply on top of the published snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// VCS state the records were queried at.
    pub vcs_state: VcsState,
    /// New or changed target records. A record replaces any stored record for its label.
    pub records: Vec<TargetRecord>,
    /// Targets the query layer reports as gone.
    pub removed: BTreeSet<Label>,
    /// `.bzl` file -> BUILD files that load it, both workspace-relative.
    pub subincludes: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl SyncRequest {
    pub fn new(vcs_state: VcsState) -> Self {
        Self {
            vcs_state,
            ..Self::default()
        }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item = TargetRecord>) -> Self {
        self.records.extend(records);
        self
    }

    pub fn with_removed(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.removed.extend(labels);
        self
    }

    pub fn with_subincludes(
        mut self,
        subincludes: impl IntoIterator<Item = (PathBuf, BTreeSet<PathBuf>)>,
    ) -> Self {
        self.subincludes.extend(subincludes);
        self
    }

    /// Fold a newer request into this pending one so applying the result equals applying both in
    /// order.
    ///
    /// The newer VCS state wins. Records merge label-wise with the newer record replacing the
    /// older; a removal cancels an older record for the label and a newer record cancels an older
    /// removal.
    pub fn coalesce(self, newer: SyncRequest) -> SyncRequest {
        let mut records: BTreeMap<Label, TargetRecord> = self
            .records
            .into_iter()
            .map(|record| (record.label.clone(), record))
            .collect();
        let mut removed = self.removed;

        for label in &newer.removed {
            records.remove(label);
        }
        removed.extend(newer.removed);
        for record in newer.records {
            removed.remove(&record.label);
            records.insert(record.label.clone(), record);
        }

        let mut subincludes = self.subincludes;
        subincludes.extend(newer.subincludes);

        SyncRequest {
            vcs_state: newer.vcs_state,
            records: records.into_values().collect(),
            removed,
            subincludes,
        }
    }
}

/// Result of a published sync.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub request_id: SyncRequestId,
    /// The snapshot this sync published.
    pub snapshot: Arc<ProjectGraph>,
    /// Cache locations of the artifacts this sync materialized.
    pub artifacts: BTreeMap<ArtifactDigest, PathBuf>,
    /// Keeps every path in `artifacts` on disk while any clone of the outcome is alive.
    pub pins: ArtifactPins,
    /// Where the build tool placed those artifacts, resolved to absolute paths.
    pub resolved: BTreeMap<FileRef, PathBuf>,
    pub diagnostics: Vec<SyncDiagnostic>,
    /// Labels whose closure or membership was recomputed.
    pub affected: BTreeSet<Label>,
    pub affected_packages: AffectedPackages,
    pub changed_paths: ChangedPaths,
}

impl SyncOutcome {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Cache pins held for a published sync. Eviction skips pinned objects, so the cache may run
/// over its byte budget while the pins are alive.
#[derive(Clone)]
pub struct ArtifactPins(Arc<[ByteSource]>);

impl ArtifactPins {
    pub(crate) fn new(sources: Vec<ByteSource>) -> Self {
        Self(sources.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteSource> + '_ {
        self.0.iter()
    }
}

impl fmt::Debug for ArtifactPins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactPins")
            .field("pinned", &self.0.len())
            .finish()
    }
}

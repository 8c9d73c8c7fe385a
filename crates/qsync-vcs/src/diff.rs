use crate::{FileChangeKind, VcsState};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Paths that differ between two [`VcsState`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPaths {
    /// Effective change of each path, relative to the old state.
    pub changes: BTreeMap<PathBuf, FileChangeKind>,
    /// The upstream revision moved; any tracked file may have changed.
    pub full_revision_changed: bool,
}

impl ChangedPaths {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.full_revision_changed
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.full_revision_changed || self.changes.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, FileChangeKind)> + '_ {
        self.changes
            .iter()
            .map(|(path, kind)| (path.as_path(), *kind))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkingSetDiffer;

impl WorkingSetDiffer {
    /// Compare two states. Never fails; the worst case is `full_revision_changed`.
    pub fn diff(old: &VcsState, new: &VcsState) -> ChangedPaths {
        let full_revision_changed = old.upstream_revision != new.upstream_revision;
        let old_by_path = old.by_path();
        let new_by_path = new.by_path();

        let mut changes = BTreeMap::new();
        for (path, old_kind) in &old_by_path {
            match new_by_path.get(path) {
                Some(new_kind) if new_kind == old_kind => {}
                new_kind => {
                    changes.insert(
                        path.to_path_buf(),
                        effective_kind(Some(*old_kind), new_kind.copied()),
                    );
                }
            }
        }
        for (path, new_kind) in &new_by_path {
            if !old_by_path.contains_key(path) {
                changes.insert(path.to_path_buf(), effective_kind(None, Some(*new_kind)));
            }
        }

        tracing::trace!(
            target = "qsync.vcs",
            old_revision = %old.upstream_revision,
            new_revision = %new.upstream_revision,
            changed = changes.len(),
            full_revision_changed,
            "diffed working sets"
        );

        ChangedPaths {
            changes,
            full_revision_changed,
        }
    }
}

/// Derive the change seen by someone who holds the old state and moves to the new one.
///
/// A path missing from a working set is at its upstream state. Upstream existence follows from any
/// recorded kind: only `Added` files were absent upstream.
fn effective_kind(old: Option<FileChangeKind>, new: Option<FileChangeKind>) -> FileChangeKind {
    let upstream_exists = new
        .or(old)
        .map_or(true, |kind| kind != FileChangeKind::Added);
    let before = old.map_or(upstream_exists, FileChangeKind::file_exists);
    let after = new.map_or(upstream_exists, FileChangeKind::file_exists);
    match (before, after) {
        (false, true) => FileChangeKind::Added,
        (true, false) => FileChangeKind::Deleted,
        _ => FileChangeKind::Modified,
    }
}

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Added,
    Modified,
    Deleted,
}

impl FileChangeKind {
    /// Whether the file exists on disk after a change of this kind.
    pub fn file_exists(self) -> bool {
        self != FileChangeKind::Deleted
    }
}

/// A workspace-relative path changed relative to the upstream revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Snapshot of the VCS: upstream revision plus working set.
///
/// Equality is structural; the working set is a set, so insertion order never matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsState {
    pub upstream_revision: String,
    #[serde(default)]
    pub working_set: BTreeSet<FileChange>,
}

impl VcsState {
    /// Build a state from a change list. A later change for the same path supersedes an earlier
    /// one, so each path appears at most once.
    pub fn new(
        upstream_revision: impl Into<String>,
        changes: impl IntoIterator<Item = FileChange>,
    ) -> Self {
        let mut by_path = BTreeMap::new();
        for change in changes {
            by_path.insert(change.path, change.kind);
        }
        Self {
            upstream_revision: upstream_revision.into(),
            working_set: by_path
                .into_iter()
                .map(|(path, kind)| FileChange { path, kind })
                .collect(),
        }
    }

    pub fn kind_of(&self, path: &Path) -> Option<FileChangeKind> {
        self.working_set
            .iter()
            .find(|change| change.path == path)
            .map(|change| change.kind)
    }

    pub(crate) fn by_path(&self) -> BTreeMap<&Path, FileChangeKind> {
        self.working_set
            .iter()
            .map(|change| (change.path.as_path(), change.kind))
            .collect()
    }
}

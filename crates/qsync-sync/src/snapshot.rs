use parking_lot::RwLock;
use qsync_core::{FileRef, Label};
use qsync_graph::{BuildGraph, ClosureInfo, ProjectRules, ShardedMap};
use qsync_vcs::VcsState;
use std::{collections::BTreeSet, fmt, sync::Arc};

/// An immutable, published view of the project.
///
/// Produced whole by one sync transaction; nothing mutates it after publication. The closure memo
/// inside the graph may still fill lazily as readers query it.
#[derive(Clone)]
pub struct ProjectGraph {
    pub(crate) generation: u64,
    pub(crate) graph: Arc<BuildGraph>,
    pub(crate) membership: ShardedMap<Label, bool>,
    pub(crate) vcs_state: VcsState,
    pub(crate) degraded: BTreeSet<Label>,
    /// The part of `degraded` caused by graph diagnostics. Artifact problems are recomputed by
    /// every sync; these carry over until the label changes.
    pub(crate) graph_degraded: BTreeSet<Label>,
    pub(crate) rules: Arc<ProjectRules>,
}

impl ProjectGraph {
    /// The snapshot a project starts from: no targets, an empty VCS state.
    pub fn empty(rules: Arc<ProjectRules>) -> Self {
        Self {
            generation: 0,
            graph: Arc::new(BuildGraph::new()),
            membership: ShardedMap::default(),
            vcs_state: VcsState::default(),
            degraded: BTreeSet::new(),
            graph_degraded: BTreeSet::new(),
            rules,
        }
    }

    /// Publication counter; strictly increases from one published snapshot to the next.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn vcs_state(&self) -> &VcsState {
        &self.vcs_state
    }

    /// The rules the membership map was computed with.
    pub fn rules(&self) -> &ProjectRules {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.graph.contains(label)
    }

    /// Labels without a record are never in the project.
    pub fn is_in_project(&self, label: &Label) -> bool {
        self.membership.get(label).copied().unwrap_or(false)
    }

    pub fn in_project_labels(&self) -> BTreeSet<Label> {
        self.membership
            .iter()
            .filter(|(_, in_project)| **in_project)
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn closure_of(&self, label: &Label) -> Arc<ClosureInfo> {
        self.graph.closure_of(label)
    }

    /// Direct sources of `label`; empty for unknown labels.
    pub fn sources_of(&self, label: &Label) -> &[FileRef] {
        self.graph
            .get(label)
            .map(|record| record.sources.as_slice())
            .unwrap_or_default()
    }

    pub fn owners_of(&self, file: &FileRef) -> BTreeSet<Label> {
        self.graph.owners_of(file)
    }

    /// Labels that carried a diagnostic when they were last synced.
    pub fn degraded(&self) -> &BTreeSet<Label> {
        &self.degraded
    }

    pub fn is_degraded(&self, label: &Label) -> bool {
        self.degraded.contains(label)
    }
}

impl fmt::Debug for ProjectGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectGraph")
            .field("generation", &self.generation)
            .field("targets", &self.graph.len())
            .field("upstream_revision", &self.vcs_state.upstream_revision)
            .field("degraded", &self.degraded.len())
            .finish_non_exhaustive()
    }
}

/// Holder of the currently published [`ProjectGraph`].
///
/// Readers take a cheap `Arc` clone and keep reading it however long they like; publishing swaps
/// the pointer.
#[derive(Debug)]
pub struct SnapshotCell {
    current: RwLock<Arc<ProjectGraph>>,
}

impl SnapshotCell {
    pub fn new(snapshot: ProjectGraph) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<ProjectGraph> {
        Arc::clone(&self.current.read())
    }

    pub(crate) fn publish(&self, snapshot: Arc<ProjectGraph>) -> Arc<ProjectGraph> {
        std::mem::replace(&mut *self.current.write(), snapshot)
    }
}

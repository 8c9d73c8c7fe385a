use crate::shard::ShardedMap;
use parking_lot::RwLock;
use qsync_core::{FileRef, Label, PackagePath, TargetRecord};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

/// Transitive closure of one label over `deps`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClosureInfo {
    /// Sources of the label itself and of everything it reaches.
    pub transitive_sources: BTreeSet<FileRef>,
    /// Every label reachable through `deps`, external leaves included. Never contains the label
    /// itself.
    pub transitive_deps: BTreeSet<Label>,
}

/// A data problem in the record batch. The graph stays usable around it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphDiagnostic {
    /// `from -> to` closes a dependency cycle; the edge is ignored for closure purposes.
    Cycle { from: Label, to: Label },
    MalformedRecord { label: Label, reason: String },
    SelfDependency { label: Label },
}

impl GraphDiagnostic {
    /// The label the diagnostic is attached to.
    pub fn label(&self) -> &Label {
        match self {
            GraphDiagnostic::Cycle { from, .. } => from,
            GraphDiagnostic::MalformedRecord { label, .. } => label,
            GraphDiagnostic::SelfDependency { label } => label,
        }
    }
}

impl fmt::Display for GraphDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphDiagnostic::Cycle { from, to } => {
                write!(f, "dependency cycle through {from} -> {to}")
            }
            GraphDiagnostic::MalformedRecord { label, reason } => {
                write!(f, "malformed record {label}: {reason}")
            }
            GraphDiagnostic::SelfDependency { label } => write!(f, "{label} depends on itself"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("build graph is corrupt: {reason}")]
    Corrupt { reason: String },
}

fn corrupt(reason: String) -> GraphError {
    GraphError::Corrupt { reason }
}

/// What a [`BuildGraph::merge`] or [`BuildGraph::remove`] touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedSet {
    /// Labels whose closure became invalid: every changed label and its transitive dependents.
    pub invalidated: BTreeSet<Label>,
    /// Labels that had no record before.
    pub inserted: BTreeSet<Label>,
    pub removed: BTreeSet<Label>,
    pub diagnostics: Vec<GraphDiagnostic>,
}

impl AffectedSet {
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty() && self.inserted.is_empty() && self.removed.is_empty()
    }

    pub fn extend(&mut self, other: AffectedSet) {
        self.invalidated.extend(other.invalidated);
        self.inserted.extend(other.inserted);
        self.removed.extend(other.removed);
        self.diagnostics.extend(other.diagnostics);
    }
}

/// Dependency graph of [`TargetRecord`]s with memoized transitive closures.
///
/// Alongside the forward records the graph keeps a reverse-edge index (dep -> dependents), a
/// file-owner index (source -> labels) and a package index, all updated incrementally by
/// [`merge`](Self::merge) and [`remove`](Self::remove). Closures are computed lazily and memoized;
/// the memo sits behind a lock so a shared, frozen graph can still fill it from reader threads.
///
/// Cloning is cheap and copy-on-write: the clone shares storage with the original until either
/// side writes.
pub struct BuildGraph {
    records: ShardedMap<Label, Arc<TargetRecord>>,
    reverse: ShardedMap<Label, BTreeSet<Label>>,
    owners: ShardedMap<FileRef, BTreeSet<Label>>,
    packages: ShardedMap<PackagePath, BTreeSet<Label>>,
    memo: RwLock<ShardedMap<Label, Arc<ClosureInfo>>>,
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BuildGraph {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            reverse: self.reverse.clone(),
            owners: self.owners.clone(),
            packages: self.packages.clone(),
            memo: RwLock::new(self.memo.read().clone()),
        }
    }
}

impl fmt::Debug for BuildGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildGraph")
            .field("records", &self.records.len())
            .field("packages", &self.packages.len())
            .field("memoized", &self.memo.read().len())
            .finish()
    }
}

/// Structural equality over the stored records and indexes; memo state is ignored.
impl PartialEq for BuildGraph {
    fn eq(&self, other: &Self) -> bool {
        fn same<K, V>(a: &ShardedMap<K, V>, b: &ShardedMap<K, V>) -> bool
        where
            K: Eq + std::hash::Hash + Clone,
            V: Clone + PartialEq,
        {
            a.len() == b.len() && a.iter().all(|(key, value)| b.get(key) == Some(value))
        }
        same(&self.records, &other.records)
            && same(&self.reverse, &other.reverse)
            && same(&self.owners, &other.owners)
            && same(&self.packages, &other.packages)
    }
}

impl Eq for BuildGraph {}

impl BuildGraph {
    pub fn new() -> Self {
        Self {
            records: ShardedMap::default(),
            reverse: ShardedMap::default(),
            owners: ShardedMap::default(),
            packages: ShardedMap::default(),
            memo: RwLock::new(ShardedMap::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.len() == 0
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.records.contains_key(label)
    }

    pub fn get(&self, label: &Label) -> Option<&Arc<TargetRecord>> {
        self.records.get(label)
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<TargetRecord>> + '_ {
        self.records.values()
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> + '_ {
        self.records.keys()
    }

    /// Upsert `records`, invalidating the memo of each changed label and of everything that
    /// transitively depends on it.
    ///
    /// A record identical to the stored one is skipped entirely. Records for external
    /// repositories are rejected with a diagnostic.
    pub fn merge(&mut self, records: impl IntoIterator<Item = TargetRecord>) -> AffectedSet {
        let mut affected = AffectedSet::default();
        let mut changed = Vec::new();
        let mut skipped = 0usize;
        for record in records {
            if let Some(repository) = record.label.repository() {
                affected.diagnostics.push(GraphDiagnostic::MalformedRecord {
                    label: record.label.clone(),
                    reason: format!("record belongs to external repository `@{repository}`"),
                });
                continue;
            }

            let label = record.label.clone();
            let previous = match self.records.get(&label) {
                Some(existing) if **existing == record => {
                    skipped += 1;
                    continue;
                }
                Some(existing) => Some(Arc::clone(existing)),
                None => None,
            };

            if record.deps.contains(&label) {
                affected.diagnostics.push(GraphDiagnostic::SelfDependency {
                    label: label.clone(),
                });
            }

            match previous {
                Some(previous) => self.unlink(&previous),
                None => {
                    affected.inserted.insert(label.clone());
                }
            }
            let record = Arc::new(record);
            self.link(&record);
            self.records.insert(label.clone(), record);
            changed.push(label);
        }
        affected.invalidated = self.invalidate_from(changed);

        tracing::debug!(
            target = "qsync.graph",
            inserted = affected.inserted.len(),
            invalidated = affected.invalidated.len(),
            unchanged = skipped,
            diagnostics = affected.diagnostics.len(),
            "merged records"
        );
        affected
    }

    /// Delete records. Dependents keep their edges; the removed labels become external leaves.
    pub fn remove(&mut self, labels: impl IntoIterator<Item = Label>) -> AffectedSet {
        let mut affected = AffectedSet::default();
        for label in labels {
            let Some(previous) = self.records.remove(&label) else {
                continue;
            };
            self.unlink(&previous);
            affected.removed.insert(label);
        }
        affected.invalidated = self.invalidate_from(affected.removed.iter().cloned());
        affected
            .invalidated
            .retain(|label| !affected.removed.contains(label));

        tracing::debug!(
            target = "qsync.graph",
            removed = affected.removed.len(),
            invalidated = affected.invalidated.len(),
            "removed records"
        );
        affected
    }

    /// Drop every memoized closure and return all known labels.
    pub fn invalidate_all(&mut self) -> BTreeSet<Label> {
        self.memo.get_mut().clear();
        self.records.keys().cloned().collect()
    }

    pub fn is_memoized(&self, label: &Label) -> bool {
        self.memo.read().contains_key(label)
    }

    pub fn closure_of(&self, label: &Label) -> Arc<ClosureInfo> {
        self.closure_of_with_diagnostics(label).0
    }

    /// Like [`closure_of`](Self::closure_of), also returning the cycles met while computing.
    ///
    /// A memo hit reports nothing; cycles are only discovered on cold paths.
    pub fn closure_of_with_diagnostics(
        &self,
        label: &Label,
    ) -> (Arc<ClosureInfo>, Vec<GraphDiagnostic>) {
        if let Some(hit) = self.memo.read().get(label) {
            return (Arc::clone(hit), Vec::new());
        }
        let Some(record) = self.records.get(label) else {
            return (Arc::default(), Vec::new());
        };

        let mut walk = ClosureWalk::new(self);
        walk.run(record);
        let closure = walk.computed.remove(label).unwrap_or_default();
        (closure, walk.diagnostics)
    }

    /// Compute (and memoize) the closures of `labels` in parallel.
    pub fn warm_closures(&self, labels: &[Label]) -> Vec<GraphDiagnostic> {
        let mut diagnostics: Vec<GraphDiagnostic> = labels
            .par_iter()
            .flat_map_iter(|label| self.closure_of_with_diagnostics(label).1)
            .collect();
        diagnostics.sort();
        diagnostics.dedup();
        diagnostics
    }

    /// Labels whose records list `path` among their sources.
    pub fn owners_of(&self, path: &FileRef) -> BTreeSet<Label> {
        self.owners.get(path).cloned().unwrap_or_default()
    }

    /// Direct dependents of `label`.
    pub fn dependents_of(&self, label: &Label) -> BTreeSet<Label> {
        self.reverse.get(label).cloned().unwrap_or_default()
    }

    /// Every label that reaches one of `labels`, the starting labels included.
    pub fn transitive_dependents<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a Label>,
    ) -> BTreeSet<Label> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        for label in labels {
            if seen.insert(label.clone()) {
                queue.push_back(label.clone());
            }
        }
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.reverse.get(&current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        seen
    }

    pub fn labels_in_package(&self, package: &PackagePath) -> BTreeSet<Label> {
        self.packages.get(package).cloned().unwrap_or_default()
    }

    /// Packages that own at least one record.
    pub fn packages(&self) -> BTreeSet<PackagePath> {
        self.packages.keys().cloned().collect()
    }

    /// Verify every index against the forward records.
    pub fn check_invariants(&self) -> Result<(), GraphError> {
        let labels: BTreeSet<&Label> = self.records.keys().chain(self.reverse.keys()).collect();
        self.check_labels(labels)?;

        for (file, labels) in self.owners.iter() {
            for label in labels {
                let owns = self
                    .records
                    .get(label)
                    .is_some_and(|record| record.sources.contains(file));
                if !owns {
                    return Err(corrupt(format!("stale owner {label} for {file}")));
                }
            }
        }
        for (package, labels) in self.packages.iter() {
            for label in labels {
                if !self.records.contains_key(label) || label.package_str() != package.as_str() {
                    return Err(corrupt(format!("stale package entry {label} in {package}")));
                }
            }
        }
        let memo = self.memo.read();
        if let Some(label) = memo.keys().find(|label| !self.records.contains_key(label)) {
            return Err(corrupt(format!("memoized closure for unknown label {label}")));
        }
        Ok(())
    }

    /// Verify the index entries that mention `labels`.
    pub fn check_invariants_for<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a Label>,
    ) -> Result<(), GraphError> {
        self.check_labels(labels)
    }

    fn check_labels<'a>(&self, labels: impl IntoIterator<Item = &'a Label>) -> Result<(), GraphError> {
        for label in labels {
            match self.records.get(label) {
                Some(record) => {
                    if record.label != *label {
                        return Err(corrupt(format!(
                            "record {} stored under {label}",
                            record.label
                        )));
                    }
                    for dep in record.deps.iter().filter(|dep| *dep != label) {
                        if !self.reverse.get(dep).is_some_and(|set| set.contains(label)) {
                            return Err(corrupt(format!("missing reverse edge {dep} <- {label}")));
                        }
                    }
                    for source in &record.sources {
                        if !self.owners.get(source).is_some_and(|set| set.contains(label)) {
                            return Err(corrupt(format!("missing owner {label} for {source}")));
                        }
                    }
                    let in_package = self
                        .packages
                        .get(&label.package())
                        .is_some_and(|set| set.contains(label));
                    if !in_package {
                        return Err(corrupt(format!("{label} missing from package index")));
                    }
                }
                None => {
                    if self.memo.read().contains_key(label) {
                        return Err(corrupt(format!(
                            "memoized closure for unknown label {label}"
                        )));
                    }
                }
            }

            if let Some(dependents) = self.reverse.get(label) {
                for dependent in dependents {
                    let depends = self
                        .records
                        .get(dependent)
                        .is_some_and(|record| record.deps.contains(label));
                    if !depends {
                        return Err(corrupt(format!(
                            "stale reverse edge {label} <- {dependent}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop the memo of `changed` and of every label reaching them through the current edges.
    ///
    /// Runs once per batch, after all edges are updated. A dependent that only reached a changed
    /// label through a removed edge was itself changed, so it is among the seeds.
    fn invalidate_from(&mut self, changed: impl IntoIterator<Item = Label>) -> BTreeSet<Label> {
        let memo = self.memo.get_mut();
        let mut invalidated = BTreeSet::new();
        let mut queue = VecDeque::new();
        for label in changed {
            if invalidated.insert(label.clone()) {
                queue.push_back(label);
            }
        }
        while let Some(current) = queue.pop_front() {
            memo.remove(&current);
            if let Some(dependents) = self.reverse.get(&current) {
                for dependent in dependents {
                    if invalidated.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        invalidated
    }

    fn link(&mut self, record: &TargetRecord) {
        let label = &record.label;
        for dep in record.deps.iter().filter(|dep| *dep != label) {
            self.reverse
                .get_or_insert_with(dep.clone(), BTreeSet::new)
                .insert(label.clone());
        }
        for source in &record.sources {
            self.owners
                .get_or_insert_with(source.clone(), BTreeSet::new)
                .insert(label.clone());
        }
        self.packages
            .get_or_insert_with(label.package(), BTreeSet::new)
            .insert(label.clone());
    }

    fn unlink(&mut self, record: &TargetRecord) {
        let label = &record.label;
        for dep in record.deps.iter().filter(|dep| *dep != label) {
            self.reverse.update_or_remove(dep, |set| {
                set.remove(label);
                !set.is_empty()
            });
        }
        for source in &record.sources {
            self.owners.update_or_remove(source, |set| {
                set.remove(label);
                !set.is_empty()
            });
        }
        self.packages.update_or_remove(&label.package(), |set| {
            set.remove(label);
            !set.is_empty()
        });
    }
}

#[derive(Clone, Copy)]
struct NodeState {
    index: usize,
    lowlink: usize,
    on_stack: bool,
}

struct Frame<'g> {
    record: &'g TargetRecord,
    next: usize,
}

/// One cold closure computation: an iterative Tarjan walk that closes each strongly connected
/// component once all of its successors are known, so every member of a cycle gets the same,
/// complete closure.
struct ClosureWalk<'g> {
    graph: &'g BuildGraph,
    nodes: HashMap<Label, NodeState>,
    stack: Vec<Label>,
    next_index: usize,
    back_edges: Vec<(Label, Label)>,
    computed: HashMap<Label, Arc<ClosureInfo>>,
    diagnostics: Vec<GraphDiagnostic>,
}

impl<'g> ClosureWalk<'g> {
    fn new(graph: &'g BuildGraph) -> Self {
        Self {
            graph,
            nodes: HashMap::new(),
            stack: Vec::new(),
            next_index: 0,
            back_edges: Vec::new(),
            computed: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn resolved(&self, label: &Label) -> Option<Arc<ClosureInfo>> {
        if let Some(closure) = self.computed.get(label) {
            return Some(Arc::clone(closure));
        }
        self.graph.memo.read().get(label).cloned()
    }

    fn run(&mut self, root: &'g TargetRecord) {
        let mut frames = Vec::new();
        self.open(root, &mut frames);

        while let Some(frame) = frames.last_mut() {
            let record = frame.record;
            let Some(dep) = record.deps.get(frame.next) else {
                frames.pop();
                self.finish(record, frames.last().map(|parent| parent.record));
                continue;
            };
            frame.next += 1;

            if *dep == record.label || self.resolved(dep).is_some() {
                continue;
            }
            let Some(dep_record) = self.graph.records.get(dep) else {
                continue;
            };
            match self.nodes.get(dep).copied() {
                None => self.open(dep_record, &mut frames),
                Some(state) if state.on_stack => {
                    self.lower(&record.label, state.index);
                    self.back_edges.push((record.label.clone(), dep.clone()));
                }
                Some(_) => {}
            }
        }
    }

    fn open(&mut self, record: &'g TargetRecord, frames: &mut Vec<Frame<'g>>) {
        let index = self.next_index;
        self.next_index += 1;
        self.nodes.insert(
            record.label.clone(),
            NodeState {
                index,
                lowlink: index,
                on_stack: true,
            },
        );
        self.stack.push(record.label.clone());
        frames.push(Frame { record, next: 0 });
    }

    fn lower(&mut self, label: &Label, to: usize) {
        if let Some(state) = self.nodes.get_mut(label) {
            state.lowlink = state.lowlink.min(to);
        }
    }

    fn finish(&mut self, record: &'g TargetRecord, parent: Option<&'g TargetRecord>) {
        let Some(state) = self.nodes.get(&record.label).copied() else {
            return;
        };
        if let Some(parent) = parent {
            self.lower(&parent.label, state.lowlink);
        }
        if state.lowlink != state.index {
            return;
        }

        let mut members = Vec::new();
        while let Some(member) = self.stack.pop() {
            if let Some(member_state) = self.nodes.get_mut(&member) {
                member_state.on_stack = false;
            }
            let is_root = member == record.label;
            members.push(member);
            if is_root {
                break;
            }
        }
        self.close_component(members);
    }

    fn close_component(&mut self, members: Vec<Label>) {
        let member_set: HashSet<&Label> = members.iter().collect();
        let mut transitive_sources = BTreeSet::new();
        let mut transitive_deps = BTreeSet::new();

        for member in &members {
            let Some(record) = self.graph.records.get(member) else {
                continue;
            };
            transitive_sources.extend(record.sources.iter().cloned());
            for dep in record.deps.iter().filter(|dep| *dep != member) {
                transitive_deps.insert(dep.clone());
                if member_set.contains(dep) {
                    continue;
                }
                if let Some(child) = self.resolved(dep) {
                    transitive_sources.extend(child.transitive_sources.iter().cloned());
                    transitive_deps.extend(child.transitive_deps.iter().cloned());
                }
            }
        }

        if members.len() > 1 {
            let (cyclic, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.back_edges)
                .into_iter()
                .partition(|(from, to)| member_set.contains(from) && member_set.contains(to));
            self.back_edges = rest;
            for (from, to) in cyclic {
                tracing::debug!(
                    target = "qsync.graph",
                    from = %from,
                    to = %to,
                    "dependency cycle"
                );
                self.diagnostics.push(GraphDiagnostic::Cycle { from, to });
            }
        }

        // A child closure memoized by another walk may reach back to this component, so the
        // member itself is dropped from every closure, singletons included.
        let mut memo = self.graph.memo.write();
        for member in members {
            let mut deps = transitive_deps.clone();
            deps.remove(&member);
            let closure = Arc::new(ClosureInfo {
                transitive_sources: transitive_sources.clone(),
                transitive_deps: deps,
            });
            // First writer wins; every concurrent walk computes the same closure.
            let stored = Arc::clone(memo.get_or_insert_with(member.clone(), || closure));
            self.computed.insert(member, stored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsync_core::TargetKind;

    fn label(s: &str) -> Label {
        Label::parse_with_repository(s).unwrap()
    }

    fn src(path: &str) -> FileRef {
        FileRef::workspace(path).unwrap()
    }

    fn record(name: &str, deps: &[&str], sources: &[&str]) -> TargetRecord {
        TargetRecord::new(label(name), TargetKind::Library)
            .with_deps(deps.iter().map(|d| label(d)))
            .with_sources(sources.iter().map(|s| src(s)))
    }

    #[test]
    fn indexes_follow_merge_and_remove() {
        let mut graph = BuildGraph::new();
        graph.merge([
            record("//a:a", &["//b:b"], &["a/A.java"]),
            record("//b:b", &[], &["b/B.java", "shared/S.java"]),
            record("//c:c", &["//b:b"], &["shared/S.java"]),
        ]);
        graph.check_invariants().unwrap();

        assert_eq!(
            graph.dependents_of(&label("//b:b")),
            BTreeSet::from([label("//a:a"), label("//c:c")])
        );
        assert_eq!(
            graph.owners_of(&src("shared/S.java")),
            BTreeSet::from([label("//b:b"), label("//c:c")])
        );

        let affected = graph.remove([label("//c:c")]);
        assert_eq!(affected.removed, BTreeSet::from([label("//c:c")]));
        assert_eq!(
            graph.owners_of(&src("shared/S.java")),
            BTreeSet::from([label("//b:b")])
        );
        assert_eq!(
            graph.dependents_of(&label("//b:b")),
            BTreeSet::from([label("//a:a")])
        );
        assert!(!graph.packages().contains(&PackagePath::new("c").unwrap()));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn removed_dependency_becomes_external_leaf() {
        let mut graph = BuildGraph::new();
        graph.merge([
            record("//a:a", &["//b:b"], &["a/A.java"]),
            record("//b:b", &[], &["b/B.java"]),
        ]);
        graph.closure_of(&label("//a:a"));

        let affected = graph.remove([label("//b:b")]);
        assert_eq!(affected.invalidated, BTreeSet::from([label("//a:a")]));

        let closure = graph.closure_of(&label("//a:a"));
        assert_eq!(closure.transitive_sources, BTreeSet::from([src("a/A.java")]));
        assert_eq!(closure.transitive_deps, BTreeSet::from([label("//b:b")]));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn external_records_are_rejected() {
        let mut graph = BuildGraph::new();
        let affected = graph.merge([record("@maven//:guava", &[], &[])]);
        assert!(graph.is_empty());
        assert!(matches!(
            affected.diagnostics.as_slice(),
            [GraphDiagnostic::MalformedRecord { .. }]
        ));
    }

    #[test]
    fn self_dependency_is_reported_and_ignored() {
        let mut graph = BuildGraph::new();
        let affected = graph.merge([record("//a:a", &["//a:a", "//b:b"], &["a/A.java"])]);
        assert_eq!(
            affected.diagnostics,
            vec![GraphDiagnostic::SelfDependency {
                label: label("//a:a")
            }]
        );
        let closure = graph.closure_of(&label("//a:a"));
        assert_eq!(closure.transitive_deps, BTreeSet::from([label("//b:b")]));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn clone_is_isolated_from_later_writes() {
        let mut graph = BuildGraph::new();
        graph.merge([record("//a:a", &[], &["a/A.java"])]);
        let frozen = graph.clone();

        graph.merge([record("//a:a", &[], &["a/A.java", "a/A2.java"])]);
        assert_eq!(frozen.closure_of(&label("//a:a")).transitive_sources.len(), 1);
        assert_eq!(graph.closure_of(&label("//a:a")).transitive_sources.len(), 2);
    }

    #[test]
    fn corrupt_reverse_index_is_detected() {
        let mut graph = BuildGraph::new();
        graph.merge([record("//a:a", &["//b:b"], &[])]);
        graph.reverse.clear();
        assert!(matches!(
            graph.check_invariants(),
            Err(GraphError::Corrupt { .. })
        ));
        assert!(graph.check_invariants_for([&label("//a:a")]).is_err());
    }

    #[test]
    fn unknown_label_has_empty_closure() {
        let graph = BuildGraph::new();
        assert_eq!(*graph.closure_of(&label("//nope:nope")), ClosureInfo::default());
        assert!(!graph.is_memoized(&label("//nope:nope")));
    }
}

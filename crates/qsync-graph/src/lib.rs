//! Build-graph model: target records, memoized transitive closures and project membership.
//!
//! [`BuildGraph`] owns the records and keeps every derived index (reverse edges, file owners,
//! packages, closure memo) consistent with them across incremental merges. [`ProjectRules`]
//! decides which labels belong to the user's project.

mod graph;
mod membership;
mod shard;

pub use crate::{
    graph::{AffectedSet, BuildGraph, ClosureInfo, GraphDiagnostic, GraphError},
    membership::{classify, PatternError, ProjectRules, Rule, RuleKind, TargetPattern},
    shard::ShardedMap,
};

//! Version-control state and working-set diffing.
//!
//! A [`VcsState`] is an upstream revision plus the set of files changed relative to it. Comparing
//! two states yields [`ChangedPaths`]; when the upstream revisions differ nothing can be assumed
//! about files outside the working sets, so the result degrades to "everything changed".

mod affected;
mod diff;
mod state;

pub use crate::{
    affected::{affected_packages, is_build_file, AffectedPackages},
    diff::{ChangedPaths, WorkingSetDiffer},
    state::{FileChange, FileChangeKind, VcsState},
};

use crate::{ChangedPaths, FileChangeKind};
use qsync_core::PackagePath;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

/// Packages whose targets must be re-queried after a set of file changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedPackages {
    pub affected: BTreeSet<PackagePath>,
    /// Packages whose BUILD file was deleted.
    pub deleted: BTreeSet<PackagePath>,
    /// Some changes could not be mapped onto known packages; the result may miss packages.
    pub incomplete: bool,
}

impl AffectedPackages {
    pub fn is_empty(&self) -> bool {
        self.affected.is_empty() && self.deleted.is_empty()
    }
}

pub fn is_build_file(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|name| name.to_str()),
        Some("BUILD" | "BUILD.bazel")
    )
}

/// Map changed files onto the packages they invalidate.
///
/// `known_packages` are the packages seen by the last query; `subincludes` maps a `.bzl` file to
/// the BUILD files that load it.
pub fn affected_packages(
    changes: &ChangedPaths,
    known_packages: &BTreeSet<PackagePath>,
    subincludes: &BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    is_in_project: impl Fn(&Path) -> bool,
) -> AffectedPackages {
    let mut result = AffectedPackages {
        incomplete: changes.full_revision_changed,
        ..AffectedPackages::default()
    };

    let mut outside_project = 0usize;
    for (path, kind) in changes.iter() {
        if !is_in_project(path) {
            outside_project += 1;
            continue;
        }
        if !is_build_file(path) {
            continue;
        }
        let Some(package) = package_of_build_file(path) else {
            result.incomplete = true;
            continue;
        };

        if kind != FileChangeKind::Added && !known_packages.contains(&package) {
            tracing::debug!(
                target = "qsync.vcs",
                path = %path.display(),
                "changed BUILD file is not in a known package"
            );
            result.incomplete = true;
        }

        let parent = nearest_known_parent(&package, known_packages);
        match kind {
            FileChangeKind::Added => {
                result.affected.insert(package);
                result.affected.extend(parent);
            }
            FileChangeKind::Deleted => {
                result.deleted.insert(package);
                result.affected.extend(parent);
            }
            FileChangeKind::Modified => {
                result.affected.insert(package);
            }
        }
    }
    if outside_project > 0 {
        tracing::info!(
            target = "qsync.vcs",
            count = outside_project,
            "edited files outside of the project; the project may be out of sync"
        );
        result.incomplete = true;
    }

    let loaded_by: BTreeSet<&PathBuf> = changes
        .changes
        .keys()
        .filter_map(|path| subincludes.get(path))
        .flatten()
        .filter(|build_file| is_build_file(build_file))
        .collect();
    for build_file in loaded_by {
        if !is_in_project(build_file) {
            result.incomplete = true;
            continue;
        }
        let Some(package) = package_of_build_file(build_file) else {
            result.incomplete = true;
            continue;
        };
        if !known_packages.contains(&package) {
            result.incomplete = true;
        }
        result.affected.insert(package);
    }

    // A deleted package has nothing left to re-query.
    for deleted in &result.deleted {
        result.affected.remove(deleted);
    }

    tracing::debug!(
        target = "qsync.vcs",
        affected = result.affected.len(),
        deleted = result.deleted.len(),
        incomplete = result.incomplete,
        "computed affected packages"
    );
    result
}

fn package_of_build_file(path: &Path) -> Option<PackagePath> {
    PackagePath::from_dir(path.parent().unwrap_or(Path::new(""))).ok()
}

fn nearest_known_parent(
    package: &PackagePath,
    known_packages: &BTreeSet<PackagePath>,
) -> Option<PackagePath> {
    let mut current = package.parent();
    while let Some(candidate) = current {
        if known_packages.contains(&candidate) {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}

use crate::{ArtifactDigest, FileRef, Label};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Library,
    Binary,
    Test,
    Generated,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Jar,
    GeneratedSource,
    ObjectFile,
    #[default]
    #[serde(other)]
    Other,
}

/// A compiled output of a target, addressed by content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub digest: ArtifactDigest,
    #[serde(default)]
    pub kind: ArtifactKind,
    /// Where the build tool placed the artifact.
    pub path: FileRef,
}

/// One node of the build graph, as produced by the query layer.
///
/// Records are immutable once ingested: a later record for the same label replaces the earlier
/// one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub label: Label,
    #[serde(default)]
    pub kind: TargetKind,
    #[serde(default)]
    pub sources: Vec<FileRef>,
    /// Direct, unresolved dependencies.
    #[serde(default)]
    pub deps: Vec<Label>,
    /// Code generator this target's outputs come from.
    #[serde(default)]
    pub generated_from: Option<Label>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl TargetRecord {
    pub fn new(label: Label, kind: TargetKind) -> Self {
        Self {
            label,
            kind,
            sources: Vec::new(),
            deps: Vec::new(),
            generated_from: None,
            tags: BTreeSet::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = FileRef>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = Label>) -> Self {
        self.deps.extend(deps);
        self
    }

    pub fn with_artifacts(mut self, artifacts: impl IntoIterator<Item = ArtifactRef>) -> Self {
        self.artifacts.extend(artifacts);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_generated_from(mut self, generator: Label) -> Self {
        self.generated_from = Some(generator);
        self
    }

    pub fn is_generated(&self) -> bool {
        self.kind == TargetKind::Generated || self.generated_from.is_some()
    }
}

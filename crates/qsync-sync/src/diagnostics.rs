use qsync_core::{ArtifactDigest, Label, ResolveError};
use qsync_graph::GraphDiagnostic;
use serde::Serialize;
use std::fmt;

/// A per-label or per-artifact problem. The sync still publishes; the label is marked degraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncDiagnostic {
    pub label: Option<Label>,
    pub digest: Option<ArtifactDigest>,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The label's edge to `to` closes a dependency cycle.
    Cycle { to: Label },
    MalformedRecord { reason: String },
    SelfDependency,
    /// An artifact lives in an external repository with no configured root.
    UnknownRoot { repository: String, file: String },
    /// The backing store has no object for the digest.
    ArtifactMissing,
    /// Transient fetch failures persisted past the retry budget.
    ArtifactUnavailable { attempts: u32, error: String },
}

impl SyncDiagnostic {
    pub fn for_label(label: Label, kind: DiagnosticKind) -> Self {
        Self {
            label: Some(label),
            digest: None,
            kind,
        }
    }

    pub fn for_artifact(label: Label, digest: ArtifactDigest, kind: DiagnosticKind) -> Self {
        Self {
            label: Some(label),
            digest: Some(digest),
            kind,
        }
    }

    pub(crate) fn unknown_root(label: Label, digest: ArtifactDigest, err: ResolveError) -> Self {
        let ResolveError::UnknownRoot { repository, file } = err;
        Self::for_artifact(label, digest, DiagnosticKind::UnknownRoot { repository, file })
    }
}

impl From<GraphDiagnostic> for SyncDiagnostic {
    fn from(diagnostic: GraphDiagnostic) -> Self {
        match diagnostic {
            GraphDiagnostic::Cycle { from, to } => {
                SyncDiagnostic::for_label(from, DiagnosticKind::Cycle { to })
            }
            GraphDiagnostic::MalformedRecord { label, reason } => {
                SyncDiagnostic::for_label(label, DiagnosticKind::MalformedRecord { reason })
            }
            GraphDiagnostic::SelfDependency { label } => {
                SyncDiagnostic::for_label(label, DiagnosticKind::SelfDependency)
            }
        }
    }
}

impl fmt::Display for SyncDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(label) = &self.label {
            write!(f, "{label}: ")?;
        }
        match &self.kind {
            DiagnosticKind::Cycle { to } => write!(f, "dependency cycle through {to}")?,
            DiagnosticKind::MalformedRecord { reason } => write!(f, "malformed record: {reason}")?,
            DiagnosticKind::SelfDependency => f.write_str("depends on itself")?,
            DiagnosticKind::UnknownRoot { repository, file } => {
                write!(f, "unknown external repository `@{repository}` for {file}")?
            }
            DiagnosticKind::ArtifactMissing => f.write_str("artifact missing from the store")?,
            DiagnosticKind::ArtifactUnavailable { attempts, error } => {
                write!(f, "artifact unavailable after {attempts} attempts: {error}")?
            }
        }
        if let Some(digest) = &self.digest {
            write!(f, " ({digest})")?;
        }
        Ok(())
    }
}

use qsync_core::ArtifactDigest;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the artifact cache.
///
/// Cloneable so one fetch outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("artifact {digest} is missing from the backing store")]
    ArtifactMissing { digest: ArtifactDigest },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: ArtifactDigest,
        actual: String,
    },

    #[error("fetch of {digest} failed: {message}")]
    Fetch {
        digest: ArtifactDigest,
        message: String,
    },

    #[error("fetch of {digest} was interrupted")]
    Interrupted { digest: ArtifactDigest },

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("walkdir error: {0}")]
    WalkDir(Arc<walkdir::Error>),
}

impl CacheError {
    /// Whether retrying may succeed. Only a missing object is permanent.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CacheError::ArtifactMissing { .. })
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<walkdir::Error> for CacheError {
    fn from(err: walkdir::Error) -> Self {
        CacheError::WalkDir(Arc::new(err))
    }
}

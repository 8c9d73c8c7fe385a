use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, sync::Arc};

const MAX_DIGEST_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("artifact digest is empty")]
    Empty,
    #[error("artifact digest is longer than {MAX_DIGEST_LEN} characters")]
    TooLong,
    #[error("artifact digest must be hexadecimal")]
    NotHex,
}

/// Content digest of an artifact, in lowercase hexadecimal.
///
/// Digests are the only way callers address cached artifacts. Validation guarantees a digest is
/// safe to use as a single path component.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactDigest(Arc<str>);

impl ArtifactDigest {
    pub fn new(raw: &str) -> Result<Self, DigestError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DigestError::Empty);
        }
        if raw.len() > MAX_DIGEST_LEN {
            return Err(DigestError::TooLong);
        }
        if !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::NotHex);
        }
        Ok(Self(Arc::from(raw.to_ascii_lowercase())))
    }

    /// SHA-256 of `bytes`.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Arc::from(hex::encode(Sha256::digest(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character fan-out prefix used by on-disk layouts.
    pub fn shard(&self) -> &str {
        let end = self.0.len().min(2);
        &self.0[..end]
    }

    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        *self == Self::of_bytes(bytes)
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactDigest({})", self.0)
    }
}

impl TryFrom<String> for ArtifactDigest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ArtifactDigest::new(&value)
    }
}

impl From<ArtifactDigest> for String {
    fn from(value: ArtifactDigest) -> Self {
        value.0.to_string()
    }
}

use crate::error::{CacheError, Result};
use qsync_core::ArtifactDigest;
use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Backing store the cache fetches missing digests from.
///
/// Implementations block; the cache calls them from the blocking pool.
pub trait ArtifactFetcher: Send + Sync + 'static {
    /// Stream the object for `digest` into `out`.
    ///
    /// Return [`CacheError::ArtifactMissing`] when the store has no such object; every other error
    /// is treated as transient.
    fn fetch(&self, digest: &ArtifactDigest, out: &mut dyn Write) -> Result<()>;
}

/// Serves objects stored as `<root>/<digest>` files.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactFetcher for DirectoryFetcher {
    fn fetch(&self, digest: &ArtifactDigest, out: &mut dyn Write) -> Result<()> {
        let path = self.root.join(digest.as_str());
        let mut reader = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::ArtifactMissing {
                    digest: digest.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        if reader.metadata()?.is_dir() {
            return Err(CacheError::Fetch {
                digest: digest.clone(),
                message: format!("{} is a directory", path.display()),
            });
        }
        io::copy(&mut reader, out)?;
        Ok(())
    }
}

/// A store that has nothing; every fetch reports the digest missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

impl ArtifactFetcher for OfflineFetcher {
    fn fetch(&self, digest: &ArtifactDigest, _out: &mut dyn Write) -> Result<()> {
        Err(CacheError::ArtifactMissing {
            digest: digest.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_fetcher_copies_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let digest = ArtifactDigest::of_bytes(b"jar bytes");
        std::fs::write(dir.path().join(digest.as_str()), b"jar bytes").unwrap();

        let fetcher = DirectoryFetcher::new(dir.path());
        let mut out = Vec::new();
        fetcher.fetch(&digest, &mut out).unwrap();
        assert_eq!(out, b"jar bytes");

        let other = ArtifactDigest::of_bytes(b"other");
        let err = fetcher.fetch(&other, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, CacheError::ArtifactMissing { .. }));
        assert!(!err.is_transient());
    }
}

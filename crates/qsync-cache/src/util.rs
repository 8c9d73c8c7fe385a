use crate::error::CacheError;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Infix of in-progress object files; anything carrying it after a crash is garbage.
pub(crate) const TMP_MARKER: &str = ".tmp.";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a unique temp file and a rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    atomic_write_with(path, |file| Ok(file.write_all(bytes)?))
}

/// Like [`atomic_write`], with the content produced by `write`. Nothing appears at `path` unless
/// `write` succeeds.
pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let mut staged = StagedFile::create(path)?;
    write(&mut staged.file)?;
    staged.commit()?;
    Ok(())
}

/// A sibling temp file that replaces its destination on [`commit`](Self::commit) and is
/// removed if dropped first.
struct StagedFile {
    dest: PathBuf,
    tmp: PathBuf,
    file: fs::File,
    committed: bool,
}

impl StagedFile {
    fn create(dest: &Path) -> io::Result<Self> {
        let parent = match dest.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => return Err(io::Error::other("object path has no parent")),
        };
        let name = dest
            .file_name()
            .ok_or_else(|| io::Error::other("object path has no file name"))?;
        fs::create_dir_all(parent)?;

        let pid = std::process::id();
        loop {
            let mut tmp_name = name.to_os_string();
            tmp_name.push(format!(
                "{TMP_MARKER}{pid}.{}",
                TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            let tmp = parent.join(tmp_name);
            match fs::OpenOptions::new().write(true).create_new(true).open(&tmp) {
                Ok(file) => {
                    return Ok(Self {
                        dest: dest.to_path_buf(),
                        tmp,
                        file,
                        committed: false,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn commit(mut self) -> io::Result<()> {
        self.file.sync_all()?;
        if let Err(err) = fs::rename(&self.tmp, &self.dest) {
            // Windows refuses to rename over an existing file. Objects are immutable, so an
            // existing destination already holds the same bytes.
            if !(cfg!(windows) && self.dest.is_file()) {
                return Err(err);
            }
        } else {
            self.committed = true;
        }
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            remove_file_best_effort(&self.tmp, "staged_file.abandoned");
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "qsync.cache",
                path = %path.display(),
                reason,
                error = %err,
                "could not remove file"
            );
            false
        }
    }
}

/// Forwards writes while hashing them with SHA-256.
pub(crate) struct HashingWriter<'a, W: Write + ?Sized> {
    inner: &'a mut W,
    hasher: Sha256,
    written: u64,
}

impl<'a, W: Write + ?Sized> HashingWriter<'a, W> {
    pub(crate) fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub(crate) fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write + ?Sized> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("object");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(TMP_MARKER))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_write_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object");
        let err = atomic_write_with(&path, |_| Err(io::Error::other("boom").into())).unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn hashing_writer_matches_one_shot_digest() {
        let mut out = Vec::new();
        let mut writer = HashingWriter::new(&mut out);
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (digest, len) = writer.finish();
        assert_eq!(len, 11);
        assert_eq!(
            digest,
            qsync_core::ArtifactDigest::of_bytes(b"hello world").as_str()
        );
        assert_eq!(out, b"hello world");
    }
}

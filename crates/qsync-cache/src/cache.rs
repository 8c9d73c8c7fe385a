use crate::{
    error::{CacheError, Result},
    fetcher::ArtifactFetcher,
    util::{self, HashingWriter, TMP_MARKER},
};
use parking_lot::Mutex;
use qsync_core::ArtifactDigest;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ffi::OsStr,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::UNIX_EPOCH,
};
use tokio::sync::watch;
use walkdir::WalkDir;

/// Digests of this length are SHA-256 and can be verified locally.
const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Soft limit on the bytes stored; pinned entries may push the cache past it.
    pub max_bytes: u64,
    /// Hash fetched and `put` bytes and reject them when they don't match their digest.
    pub verify_digests: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024 * 1024,
            verify_digests: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub pinned_entries: usize,
    pub in_flight: usize,
    pub missing: usize,
    pub fetches_started: u64,
    pub evictions: u64,
}

type FetchOutcome = Option<Result<()>>;

struct Entry {
    len: u64,
    tick: u64,
    readers: usize,
}

struct InFlight {
    id: u64,
    /// Callers currently waiting; a successful fetch pins the entry once for each.
    waiters: usize,
    rx: watch::Receiver<FetchOutcome>,
}

#[derive(Default)]
struct State {
    entries: HashMap<ArtifactDigest, Entry>,
    /// Access order, oldest first.
    lru: BTreeMap<u64, ArtifactDigest>,
    next_tick: u64,
    total_bytes: u64,
    in_flight: HashMap<ArtifactDigest, InFlight>,
    next_fetch_id: u64,
    missing: HashSet<ArtifactDigest>,
    fetches_started: u64,
    evictions: u64,
}

impl State {
    fn touch(&mut self, digest: &ArtifactDigest) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(digest) {
            self.next_tick += 1;
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            self.lru.insert(tick, digest.clone());
        }
    }

    fn insert(&mut self, digest: ArtifactDigest, len: u64, readers: usize) {
        if let Some(entry) = self.entries.get_mut(&digest) {
            entry.readers += readers;
            self.touch(&digest);
            return;
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.lru.insert(tick, digest.clone());
        self.entries.insert(digest, Entry { len, tick, readers });
        self.total_bytes += len;
    }
}

struct Inner {
    root: PathBuf,
    options: CacheOptions,
    fetcher: Arc<dyn ArtifactFetcher>,
    state: Mutex<State>,
}

/// Content-addressed artifact store with deduplicated fetches and LRU eviction.
///
/// Objects live at `<root>/objects/<shard>/<digest>`. At most one fetch per digest runs at a time;
/// every concurrent [`get`](Self::get) for that digest completes from the same outcome. Eviction
/// never removes an object while a [`ByteSource`] for it is alive.
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("root", &self.inner.root)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    /// Open (or create) a cache rooted at `root`, indexing objects left by earlier runs.
    pub fn open(
        root: impl Into<PathBuf>,
        options: CacheOptions,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self> {
        let root = root.into();
        let objects = root.join("objects");
        fs::create_dir_all(&objects)?;

        let mut found = Vec::new();
        for entry in WalkDir::new(&objects).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.contains(TMP_MARKER) {
                util::remove_file_best_effort(entry.path(), "open.stale_tmp");
                continue;
            }
            let Ok(digest) = ArtifactDigest::new(&name) else {
                continue;
            };
            let in_shard = entry.path().parent().and_then(Path::file_name)
                == Some(OsStr::new(digest.shard()));
            if digest.as_str() != name || !in_shard {
                continue;
            }
            let meta = entry.metadata()?;
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);
            found.push((modified, digest, meta.len()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut state = State::default();
        for (_, digest, len) in found {
            state.insert(digest, len, 0);
        }
        let cache = Self {
            inner: Arc::new(Inner {
                root,
                options,
                fetcher,
                state: Mutex::new(state),
            }),
        };
        {
            let mut state = cache.inner.state.lock();
            cache.inner.evict_locked(&mut state);
            tracing::debug!(
                target = "qsync.cache",
                root = %cache.inner.root.display(),
                entries = state.entries.len(),
                total_bytes = state.total_bytes,
                "opened artifact cache"
            );
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn options(&self) -> CacheOptions {
        self.inner.options
    }

    pub fn object_path(&self, digest: &ArtifactDigest) -> PathBuf {
        self.inner.object_path(digest)
    }

    pub fn contains(&self, digest: &ArtifactDigest) -> bool {
        self.inner.state.lock().entries.contains_key(digest)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.inner.options.max_bytes,
            pinned_entries: state.entries.values().filter(|e| e.readers > 0).count(),
            in_flight: state.in_flight.len(),
            missing: state.missing.len(),
            fetches_started: state.fetches_started,
            evictions: state.evictions,
        }
    }

    /// Obtain the bytes for `digest`, fetching them from the backing store if needed.
    ///
    /// A digest the store reported missing fails with [`CacheError::ArtifactMissing`] without a
    /// new fetch until it is `put` or forgotten. Dropping the returned future does not cancel a
    /// fetch other callers (or a later retry) may still use.
    pub async fn get(&self, digest: &ArtifactDigest) -> Result<ByteSource> {
        let (id, mut rx) = {
            let mut state = self.inner.state.lock();
            if let Some(source) = self.pin_locked(&mut state, digest) {
                return Ok(source);
            }
            if state.missing.contains(digest) {
                return Err(CacheError::ArtifactMissing {
                    digest: digest.clone(),
                });
            }
            match state.in_flight.get_mut(digest) {
                Some(flight) => {
                    flight.waiters += 1;
                    (flight.id, flight.rx.clone())
                }
                None => {
                    let id = state.next_fetch_id;
                    state.next_fetch_id += 1;
                    state.fetches_started += 1;
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(
                        digest.clone(),
                        InFlight {
                            id,
                            waiters: 1,
                            rx: rx.clone(),
                        },
                    );
                    self.spawn_fetch(digest.clone(), id, tx);
                    (id, rx)
                }
            }
        };

        let mut waiter = Waiter {
            inner: &self.inner,
            digest,
            id,
            rx: rx.clone(),
            settled: false,
        };
        let outcome = rx.wait_for(Option::is_some).await.map(|value| (*value).clone());
        waiter.settled = true;

        let mut state = self.inner.state.lock();
        match outcome {
            Ok(Some(Ok(()))) => match state.entries.get(digest) {
                // The completed fetch already pinned the entry for this caller.
                Some(entry) => Ok(ByteSource {
                    inner: Arc::clone(&self.inner),
                    digest: digest.clone(),
                    path: self.inner.object_path(digest),
                    len: entry.len,
                }),
                None => Err(CacheError::Interrupted {
                    digest: digest.clone(),
                }),
            },
            Ok(Some(Err(err))) => Err(err),
            Ok(None) | Err(_) => {
                if state.in_flight.get(digest).is_some_and(|f| f.id == id) {
                    state.in_flight.remove(digest);
                }
                Err(CacheError::Interrupted {
                    digest: digest.clone(),
                })
            }
        }
    }

    /// Seed the cache with bytes the caller already has.
    pub fn put_blocking(&self, digest: &ArtifactDigest, bytes: &[u8]) -> Result<()> {
        if self.inner.should_verify(digest) && !digest.matches_bytes(bytes) {
            return Err(CacheError::DigestMismatch {
                expected: digest.clone(),
                actual: ArtifactDigest::of_bytes(bytes).to_string(),
            });
        }
        {
            let mut state = self.inner.state.lock();
            state.missing.remove(digest);
            if state.entries.contains_key(digest) {
                state.touch(digest);
                return Ok(());
            }
        }

        util::atomic_write(&self.inner.object_path(digest), bytes)?;

        let mut state = self.inner.state.lock();
        state.missing.remove(digest);
        state.insert(digest.clone(), bytes.len() as u64, 0);
        self.inner.evict_locked(&mut state);
        tracing::trace!(
            target = "qsync.cache",
            digest = %digest,
            len = bytes.len(),
            "stored artifact"
        );
        Ok(())
    }

    pub async fn put(&self, digest: ArtifactDigest, bytes: Vec<u8>) -> Result<()> {
        let cache = self.clone();
        let task_digest = digest.clone();
        tokio::task::spawn_blocking(move || cache.put_blocking(&task_digest, &bytes))
            .await
            .map_err(|_| CacheError::Interrupted { digest })?
    }

    /// Forget that the backing store reported `digest` missing, so the next `get` fetches again.
    pub fn forget_missing(&self, digest: &ArtifactDigest) -> bool {
        self.inner.state.lock().missing.remove(digest)
    }

    fn pin_locked(&self, state: &mut State, digest: &ArtifactDigest) -> Option<ByteSource> {
        let entry = state.entries.get_mut(digest)?;
        entry.readers += 1;
        let len = entry.len;
        state.touch(digest);
        Some(ByteSource {
            inner: Arc::clone(&self.inner),
            digest: digest.clone(),
            path: self.inner.object_path(digest),
            len,
        })
    }

    fn spawn_fetch(&self, digest: ArtifactDigest, id: u64, tx: watch::Sender<FetchOutcome>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let fetch_inner = Arc::clone(&inner);
            let fetch_digest = digest.clone();
            let result =
                match tokio::task::spawn_blocking(move || fetch_inner.fetch_to_store(&fetch_digest))
                    .await
                {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(
                            target = "qsync.cache",
                            digest = %digest,
                            error = %err,
                            "artifact fetch task failed"
                        );
                        Err(CacheError::Interrupted {
                            digest: digest.clone(),
                        })
                    }
                };
            inner.complete_fetch(&digest, id, result, &tx);
        });
    }
}

impl Inner {
    fn object_path(&self, digest: &ArtifactDigest) -> PathBuf {
        self.root
            .join("objects")
            .join(digest.shard())
            .join(digest.as_str())
    }

    fn should_verify(&self, digest: &ArtifactDigest) -> bool {
        self.options.verify_digests && digest.as_str().len() == SHA256_HEX_LEN
    }

    fn fetch_to_store(&self, digest: &ArtifactDigest) -> Result<u64> {
        let verify = self.should_verify(digest);
        let mut len = 0;
        util::atomic_write_with(&self.object_path(digest), |file| {
            let mut writer = HashingWriter::new(file);
            self.fetcher.fetch(digest, &mut writer)?;
            let (actual, written) = writer.finish();
            if verify && actual != digest.as_str() {
                return Err(CacheError::DigestMismatch {
                    expected: digest.clone(),
                    actual,
                });
            }
            len = written;
            Ok(())
        })?;
        Ok(len)
    }

    fn complete_fetch(
        &self,
        digest: &ArtifactDigest,
        id: u64,
        result: Result<u64>,
        tx: &watch::Sender<FetchOutcome>,
    ) {
        let mut state = self.state.lock();
        let waiters = match state.in_flight.get(digest) {
            Some(flight) if flight.id == id => {
                let waiters = flight.waiters;
                state.in_flight.remove(digest);
                waiters
            }
            _ => 0,
        };

        let outcome = match result {
            Ok(len) => {
                state.missing.remove(digest);
                state.insert(digest.clone(), len, waiters);
                self.evict_locked(&mut state);
                tracing::debug!(
                    target = "qsync.cache",
                    digest = %digest,
                    len,
                    waiters,
                    "fetched artifact"
                );
                Ok(())
            }
            Err(err) => {
                if matches!(err, CacheError::ArtifactMissing { .. })
                    && !state.entries.contains_key(digest)
                {
                    state.missing.insert(digest.clone());
                }
                tracing::debug!(
                    target = "qsync.cache",
                    digest = %digest,
                    error = %err,
                    "artifact fetch failed"
                );
                Err(err)
            }
        };
        // Sent under the state lock so a dropped waiter sees a consistent outcome.
        tx.send_replace(Some(outcome));
    }

    fn release(&self, digest: &ArtifactDigest) {
        let mut state = self.state.lock();
        self.release_locked(&mut state, digest);
    }

    fn release_locked(&self, state: &mut State, digest: &ArtifactDigest) {
        let Some(entry) = state.entries.get_mut(digest) else {
            return;
        };
        entry.readers = entry.readers.saturating_sub(1);
        if entry.readers == 0 && state.total_bytes > self.options.max_bytes {
            self.evict_locked(state);
        }
    }

    fn evict_locked(&self, state: &mut State) {
        let max = self.options.max_bytes;
        if state.total_bytes <= max {
            return;
        }

        let mut excess = state.total_bytes - max;
        let mut victims = Vec::new();
        for (tick, digest) in &state.lru {
            if excess == 0 {
                break;
            }
            let Some(entry) = state.entries.get(digest) else {
                continue;
            };
            if entry.readers > 0 {
                continue;
            }
            excess = excess.saturating_sub(entry.len);
            victims.push((*tick, digest.clone()));
        }

        for (tick, digest) in victims {
            state.lru.remove(&tick);
            if let Some(entry) = state.entries.remove(&digest) {
                state.total_bytes -= entry.len;
                state.evictions += 1;
                util::remove_file_best_effort(&self.object_path(&digest), "evict");
                tracing::trace!(
                    target = "qsync.cache",
                    digest = %digest,
                    len = entry.len,
                    "evicted artifact"
                );
            }
        }

        if state.total_bytes > max {
            tracing::debug!(
                target = "qsync.cache",
                total_bytes = state.total_bytes,
                max_bytes = max,
                "artifact cache over budget; remaining entries are pinned"
            );
        }
    }
}

/// A caller waiting on an in-flight fetch. Dropped unsettled, it withdraws from the fetch or
/// releases the pin the completed fetch took on its behalf.
struct Waiter<'a> {
    inner: &'a Arc<Inner>,
    digest: &'a ArtifactDigest,
    id: u64,
    rx: watch::Receiver<FetchOutcome>,
    settled: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.state.lock();
        let completed_ok = match &*self.rx.borrow() {
            Some(Ok(())) => true,
            Some(Err(_)) => return,
            None => false,
        };
        if completed_ok {
            self.inner.release_locked(&mut state, self.digest);
        } else if let Some(flight) = state.in_flight.get_mut(self.digest) {
            if flight.id == self.id {
                flight.waiters = flight.waiters.saturating_sub(1);
            }
        }
    }
}

/// Pinned handle to a cached object. The object stays on disk while any handle is alive.
pub struct ByteSource {
    inner: Arc<Inner>,
    digest: ArtifactDigest,
    path: PathBuf,
    len: u64,
}

impl ByteSource {
    pub fn digest(&self) -> &ArtifactDigest {
        &self.digest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn open(&self) -> io::Result<fs::File> {
        fs::File::open(&self.path)
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

impl Clone for ByteSource {
    fn clone(&self) -> Self {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get_mut(&self.digest) {
            entry.readers += 1;
        }
        Self {
            inner: Arc::clone(&self.inner),
            digest: self.digest.clone(),
            path: self.path.clone(),
            len: self.len,
        }
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        self.inner.release(&self.digest);
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("digest", &self.digest)
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

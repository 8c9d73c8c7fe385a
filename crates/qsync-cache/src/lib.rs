//! Content-addressed artifact cache.
//!
//! Artifacts are addressed only by [`ArtifactDigest`](qsync_core::ArtifactDigest); a digest's
//! bytes never change once observed. Missing objects are fetched from an [`ArtifactFetcher`] with
//! at most one fetch per digest in flight.

mod cache;
mod error;
mod fetcher;
mod util;

pub use crate::{
    cache::{ArtifactCache, ByteSource, CacheOptions, CacheStats},
    error::{CacheError, Result},
    fetcher::{ArtifactFetcher, DirectoryFetcher, OfflineFetcher},
    util::atomic_write,
};

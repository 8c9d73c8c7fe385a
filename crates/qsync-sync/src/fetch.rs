use crate::SyncOptions;
use qsync_cache::{ArtifactCache, ByteSource};
use qsync_core::ArtifactDigest;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FetchFailure {
    Missing,
    Unavailable { attempts: u32, error: String },
}

/// Materialize and pin `digest` in the cache, retrying transient failures with exponential backoff.
///
/// A timed-out attempt does not cancel the cache's fetch; the next attempt joins it.
pub(crate) async fn fetch_with_retry(
    cache: &ArtifactCache,
    digest: &ArtifactDigest,
    options: &SyncOptions,
) -> Result<ByteSource, FetchFailure> {
    let attempts = options.fetch_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match tokio::time::timeout(options.fetch_timeout, cache.get(digest)).await {
            Ok(Ok(source)) => return Ok(source),
            Ok(Err(err)) if !err.is_transient() => return Err(FetchFailure::Missing),
            Ok(Err(err)) => last_error = err.to_string(),
            Err(_) => {
                last_error = format!("timed out after {:?}", options.fetch_timeout);
            }
        }
        tracing::debug!(
            target = "qsync.sync",
            digest = %digest,
            attempt,
            error = %last_error,
            "artifact fetch attempt failed"
        );
        if attempt < attempts {
            tokio::time::sleep(backoff(options.retry_backoff, attempt)).await;
        }
    }
    Err(FetchFailure::Unavailable {
        attempts,
        error: last_error,
    })
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(16))
}

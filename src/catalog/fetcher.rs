//! Rate-limited, cached, retrying candidate lookup for one batch run.

use crate::catalog::{CallLimiter, Catalog};
use crate::data::models::{LocalRecord, MatchCandidate};
use crate::data::names::{collapse_whitespace, normalize_title};
use crate::error::CatalogError;
use crate::utils::{fmt_duration, log_if_slow};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Exponential backoff for transient catalog failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base_delay * 2^retry`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Why no candidate list could be produced for a record.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("run cancelled before the catalog was called")]
    Cancelled,
    #[error("catalog rate limit exceeded")]
    RateLimitExceeded,
    #[error("catalog still failing after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: CatalogError,
    },
    #[error(transparent)]
    Permanent(CatalogError),
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Catalog calls issued, retries included.
    pub calls: u64,
    /// Lookups answered from the run cache.
    pub cache_hits: u64,
    /// Lookups that produced a candidate list (possibly empty).
    pub succeeded: u64,
    /// Lookups that gave up with an error.
    pub failed: u64,
}

impl FetchStats {
    /// Every lookup that reached the catalog failed.
    pub fn catalog_unreachable(&self) -> bool {
        self.failed > 0 && self.succeeded == 0
    }
}

type CacheSlot = Arc<OnceCell<Vec<MatchCandidate>>>;

/// Fetches candidates for local records.
///
/// Every catalog call waits on the shared [`CallLimiter`]. Results are cached
/// per normalized title for the lifetime of the fetcher, and concurrent
/// lookups of the same title share one call. "Not found" is cached as an
/// empty list; failures are not cached.
pub struct CandidateFetcher {
    catalog: Arc<dyn Catalog>,
    limiter: Arc<CallLimiter>,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancellationToken,
    cache: DashMap<String, CacheSlot>,
    calls: AtomicU64,
    cache_hits: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl CandidateFetcher {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        limiter: Arc<CallLimiter>,
        retry: RetryPolicy,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            limiter,
            retry,
            call_timeout,
            cancel,
            cache: DashMap::new(),
            calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Candidates for `record`, from the cache when possible.
    pub async fn fetch(&self, record: &LocalRecord) -> Result<Vec<MatchCandidate>, FetchError> {
        let key = normalize_title(&record.title);
        if key.is_empty() {
            debug!(record_id = record.id.as_str(), "Blank title, skipping catalog");
            return Ok(Vec::new());
        }

        let slot = self.cache.entry(key).or_default().clone();
        if let Some(hit) = slot.get() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(record_id = record.id.as_str(), "Candidate cache hit");
            return Ok(hit.clone());
        }

        let mut fetched_here = false;
        let candidates = slot
            .get_or_try_init(|| {
                fetched_here = true;
                self.fetch_uncached(record)
            })
            .await?;

        if !fetched_here {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(candidates.clone())
    }

    async fn fetch_uncached(&self, record: &LocalRecord) -> Result<Vec<MatchCandidate>, FetchError> {
        let result = self.fetch_with_retry(record).await;
        match &result {
            Ok(_) => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(FetchError::Exhausted { .. } | FetchError::Permanent(_)) => {
                self.failed.fetch_add(1, Ordering::Relaxed)
            }
            Err(_) => 0,
        };
        result
    }

    async fn fetch_with_retry(&self, record: &LocalRecord) -> Result<Vec<MatchCandidate>, FetchError> {
        let query = collapse_whitespace(&record.title);
        let mut attempt = 0;

        loop {
            attempt += 1;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = self.limiter.acquire() => {}
            }

            self.calls.fetch_add(1, Ordering::Relaxed);
            let start = Instant::now();
            let outcome = match tokio::time::timeout(self.call_timeout, self.catalog.search(&query)).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(CatalogError::Transient(format!(
                    "timed out after {}",
                    fmt_duration(self.call_timeout)
                ))),
            };
            log_if_slow(start, SLOW_CALL_THRESHOLD, "catalog search");

            let error = match outcome {
                Ok(candidates) => {
                    debug!(
                        record_id = record.id.as_str(),
                        attempt,
                        candidates = candidates.len(),
                        duration = fmt_duration(start.elapsed()),
                        "Fetched candidates"
                    );
                    return Ok(candidates);
                }
                Err(CatalogError::NotFound(_)) => {
                    debug!(record_id = record.id.as_str(), "Catalog has no entry");
                    return Ok(Vec::new());
                }
                Err(CatalogError::RateLimitExceeded) => return Err(FetchError::RateLimitExceeded),
                Err(e) if !e.is_transient() => return Err(FetchError::Permanent(e)),
                Err(e) => e,
            };

            if attempt >= self.retry.max_attempts {
                warn!(
                    record_id = record.id.as_str(),
                    attempts = attempt,
                    error = %error,
                    "Catalog retries exhausted"
                );
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.retry.delay_for(attempt - 1);
            warn!(
                record_id = record.id.as_str(),
                attempt,
                max_attempts = self.retry.max_attempts,
                delay = fmt_duration(delay),
                error = %error,
                "Transient catalog failure, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn unreachable_needs_failures_and_no_success() {
        let stats = FetchStats {
            failed: 3,
            ..Default::default()
        };
        assert!(stats.catalog_unreachable());
        assert!(
            !FetchStats {
                failed: 3,
                succeeded: 1,
                ..Default::default()
            }
            .catalog_unreachable()
        );
        assert!(!FetchStats::default().catalog_unreachable());
    }
}

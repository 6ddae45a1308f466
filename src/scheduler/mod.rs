//! Batch matching of local records against the catalog.
//!
//! A run releases records in batches sized so that even a batch whose every
//! record exhausts its retries fits in one quota window, and releases the
//! next batch no sooner than one window later. Within the run, a fixed pool
//! of workers pulls records from a shared queue, and every catalog call
//! waits on the scheduler's [`CallLimiter`].

use crate::catalog::{CallLimiter, CandidateFetcher, Catalog, FetchStats, RetryPolicy};
use crate::data::classifier::MatchClassifier;
use crate::data::matching::ConfidenceScorer;
use crate::data::models::{LocalRecord, MatchResult};
use crate::error::{RecordError, RunError};
use futures::Stream;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod worker;

use worker::Worker;

/// Limits and pacing for batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Catalog calls allowed per `window`.
    pub quota: u32,
    pub window: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on a single catalog call.
    pub call_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            quota: 60,
            window: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Derived batch pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    /// Minimum time between the release of two consecutive batches.
    pub release_interval: Duration,
}

impl SchedulerConfig {
    /// Check the limits and derive the batch plan.
    pub fn plan(&self) -> Result<BatchPlan, RunError> {
        let misconfigured = |msg: String| Err(RunError::Misconfigured(msg));

        if self.workers == 0 {
            return misconfigured("workers must be at least 1".into());
        }
        if self.quota == 0 {
            return misconfigured("rate limit quota must be at least 1".into());
        }
        if self.window.is_zero() {
            return misconfigured("rate limit window must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return misconfigured("retry.max_attempts must be at least 1".into());
        }
        if self.call_timeout.is_zero() {
            return misconfigured("catalog timeout must be positive".into());
        }
        if self.workers > self.quota as usize {
            return misconfigured(format!(
                "{} workers exceed a quota of {} calls per window",
                self.workers, self.quota
            ));
        }
        if (self.window / self.quota).is_zero() {
            return misconfigured(format!(
                "a quota of {} per {:?} is finer than the limiter can pace",
                self.quota, self.window
            ));
        }

        let worst_case_calls = self.retry.max_attempts as usize;
        Ok(BatchPlan {
            batch_size: (self.quota as usize / worst_case_calls).max(1),
            release_interval: self.window,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip records that already have an accepted result.
    pub resume: bool,
}

/// State shared between a [`MatchRun`] and its tasks.
pub(crate) struct RunShared {
    fetcher: Arc<CandidateFetcher>,
    skipped: AtomicUsize,
    fatal: Mutex<Option<RunError>>,
}

impl RunShared {
    /// Record the first fatal error; later ones are logged and dropped.
    pub(crate) fn set_fatal(&self, e: RunError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if fatal.is_none() {
            error!(error = %e, "Batch run failed, cancelling");
            *fatal = Some(e);
        } else {
            debug!(error = %e, "Additional fatal error after run already failed");
        }
    }
}

/// Counters available once a run's stream has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Records skipped because they were already accepted (resume only).
    pub skipped: usize,
    pub fetch: FetchStats,
    pub cancelled: bool,
    pub fatal: Option<RunError>,
}

/// Drives record matching under the shared call limiter.
pub struct BatchScheduler {
    config: SchedulerConfig,
    plan: BatchPlan,
    limiter: Arc<CallLimiter>,
    catalog: Arc<dyn Catalog>,
    scorer: Arc<ConfidenceScorer>,
    classifier: MatchClassifier,
}

impl BatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: Arc<dyn Catalog>,
        scorer: Arc<ConfidenceScorer>,
        classifier: MatchClassifier,
    ) -> Result<Self, RunError> {
        let plan = config.plan()?;
        let quota = NonZeroU32::new(config.quota)
            .ok_or_else(|| RunError::Misconfigured("rate limit quota must be at least 1".into()))?;
        let limiter = CallLimiter::new(quota, config.window)
            .ok_or_else(|| RunError::Misconfigured("rate limit window too small".into()))?;

        Ok(Self {
            config,
            plan,
            limiter: Arc::new(limiter),
            catalog,
            scorer,
            classifier,
        })
    }

    pub fn plan(&self) -> BatchPlan {
        self.plan
    }

    /// Start matching `records`.
    ///
    /// Nothing happens until the returned stream is first polled. The stream
    /// yields one item per processed record, in completion order.
    pub fn run(&self, records: Vec<LocalRecord>, options: RunOptions) -> MatchRun {
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(CandidateFetcher::new(
            self.catalog.clone(),
            self.limiter.clone(),
            self.config.retry,
            self.config.call_timeout,
            cancel.clone(),
        ));
        let shared = Arc::new(RunShared {
            fetcher: fetcher.clone(),
            skipped: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        });
        let (tx, rx) = mpsc::channel(self.config.workers.max(1) * 2);

        let driver = RunDriver {
            records,
            options,
            plan: self.plan,
            workers: self.config.workers,
            fetcher,
            scorer: self.scorer.clone(),
            classifier: self.classifier.clone(),
            results: tx,
            cancel: cancel.clone(),
            shared: shared.clone(),
        };

        MatchRun {
            rx,
            driver: Some(driver),
            cancel,
            shared,
        }
    }
}

/// A running (or not yet started) batch.
///
/// Yields `Ok(MatchResult)` for every classified record and `Err(RecordError)`
/// for every record that failed on its own. Run-level failures end the stream
/// early and are reported by [`MatchRun::fatal`].
pub struct MatchRun {
    rx: mpsc::Receiver<Result<MatchResult, RecordError>>,
    driver: Option<RunDriver>,
    cancel: CancellationToken,
    shared: Arc<RunShared>,
}

impl MatchRun {
    /// Handle that cancels the run when triggered.
    ///
    /// Cancellation stops new catalog calls at once. Calls already in flight
    /// complete, and their records are still classified, persisted and
    /// yielded.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn fatal(&self) -> Option<RunError> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            skipped: self.shared.skipped.load(Ordering::Relaxed),
            fetch: self.shared.fetcher.stats(),
            cancelled: self.cancel.is_cancelled(),
            fatal: self.fatal(),
        }
    }
}

impl Stream for MatchRun {
    type Item = Result<MatchResult, RecordError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(driver) = this.driver.take() {
            tokio::spawn(driver.run());
        }
        this.rx.poll_recv(cx)
    }
}

/// Everything a run needs, moved into its driver task on first poll.
struct RunDriver {
    records: Vec<LocalRecord>,
    options: RunOptions,
    plan: BatchPlan,
    workers: usize,
    fetcher: Arc<CandidateFetcher>,
    scorer: Arc<ConfidenceScorer>,
    classifier: MatchClassifier,
    results: mpsc::Sender<Result<MatchResult, RecordError>>,
    cancel: CancellationToken,
    shared: Arc<RunShared>,
}

impl RunDriver {
    async fn run(self) {
        let total = self.records.len();
        info!(
            records = total,
            workers = self.workers,
            batch_size = self.plan.batch_size,
            resume = self.options.resume,
            "Starting batch run"
        );

        let pending = self.skip_accepted().await;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let worker = Worker {
                id,
                queue: queue.clone(),
                results: self.results.clone(),
                fetcher: self.fetcher.clone(),
                scorer: self.scorer.clone(),
                classifier: self.classifier.clone(),
                cancel: self.cancel.clone(),
                shared: self.shared.clone(),
            };
            workers.spawn(worker.run());
        }
        // Workers hold the only senders now; the stream ends when they exit.
        drop(self.results);

        let mut records = pending.into_iter().peekable();
        let mut last_release: Option<Instant> = None;
        let mut batches = 0usize;

        while records.peek().is_some() {
            if let Some(released) = last_release {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(released + self.plan.release_interval) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let mut released = 0usize;
            for record in records.by_ref().take(self.plan.batch_size) {
                if queue_tx.send(record).is_err() {
                    break;
                }
                released += 1;
            }
            last_release = Some(Instant::now());
            batches += 1;
            debug!(batch = batches, records = released, "Released batch");
        }
        drop(queue_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = ?e, "Worker task failed");
            }
        }

        let stats = self.fetcher.stats();
        info!(
            records = total,
            batches,
            skipped = self.shared.skipped.load(Ordering::Relaxed),
            catalog_calls = stats.calls,
            cache_hits = stats.cache_hits,
            cancelled = self.cancel.is_cancelled(),
            "Batch run finished"
        );
    }

    /// With `resume`, drop records that already have an accepted result.
    async fn skip_accepted(&self) -> Vec<LocalRecord> {
        if !self.options.resume {
            return self.records.clone();
        }

        let mut pending = Vec::with_capacity(self.records.len());
        for record in &self.records {
            match self.classifier.existing_acceptance(&record.id).await {
                Ok(Some(_)) => {
                    self.shared.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => pending.push(record.clone()),
                Err(source) => {
                    let failure = RecordError::Store {
                        record_id: record.id.clone(),
                        source,
                    };
                    if self.results.send(Err(failure)).await.is_err() {
                        self.cancel.cancel();
                        break;
                    }
                }
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize, quota: u32, attempts: u32) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            quota,
            retry: RetryPolicy {
                max_attempts: attempts,
                ..RetryPolicy::default()
            },
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn batch_size_covers_worst_case_retries() {
        assert_eq!(config(4, 60, 3).plan().unwrap().batch_size, 20);
        assert_eq!(config(1, 10, 3).plan().unwrap().batch_size, 3);
        assert_eq!(config(1, 2, 5).plan().unwrap().batch_size, 1);
    }

    #[test]
    fn rejects_zero_limits() {
        for bad in [config(0, 10, 3), config(1, 0, 3), config(1, 10, 0)] {
            assert!(matches!(bad.plan(), Err(RunError::Misconfigured(_))));
        }
        let zero_window = SchedulerConfig {
            window: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(zero_window.plan().is_err());
    }

    #[test]
    fn rejects_more_workers_than_quota() {
        let err = config(8, 4, 1).plan().unwrap_err();
        assert!(matches!(err, RunError::Misconfigured(msg) if msg.contains("8 workers")));
    }

    #[test]
    fn release_interval_is_the_window() {
        let plan = SchedulerConfig::default().plan().unwrap();
        assert_eq!(plan.release_interval, Duration::from_secs(60));
    }
}

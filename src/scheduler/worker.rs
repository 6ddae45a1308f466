use crate::catalog::{CandidateFetcher, FetchError};
use crate::data::classifier::{MatchClassifier, MatchStage, MatchState};
use crate::data::matching::ConfidenceScorer;
use crate::data::models::{LocalRecord, MatchResult};
use crate::error::{IllegalTransition, RecordError, RunError};
use crate::scheduler::RunShared;
use crate::utils::fmt_duration;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

const SLOW_RECORD_THRESHOLD: Duration = Duration::from_secs(30);

pub(crate) type WorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<LocalRecord>>>;
pub(crate) type ResultSender = mpsc::Sender<Result<MatchResult, RecordError>>;

/// Why a record stopped before producing a result.
enum Halt {
    /// Report this record as failed; the run continues.
    Record(RecordError),
    /// The run was cancelled before any catalog call was made for the record.
    Cancelled,
    /// The whole run must stop.
    Fatal(RunError),
}

impl From<RecordError> for Halt {
    fn from(e: RecordError) -> Self {
        Halt::Record(e)
    }
}

impl From<IllegalTransition> for Halt {
    fn from(e: IllegalTransition) -> Self {
        Halt::Record(e.into())
    }
}

/// One worker of a batch run. Pulls records off the shared queue until it is
/// empty or the run is cancelled.
pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) queue: WorkQueue,
    pub(crate) results: ResultSender,
    pub(crate) fetcher: Arc<CandidateFetcher>,
    pub(crate) scorer: Arc<ConfidenceScorer>,
    pub(crate) classifier: MatchClassifier,
    pub(crate) cancel: CancellationToken,
    pub(crate) shared: Arc<RunShared>,
}

impl Worker {
    pub(crate) async fn run(self) {
        trace!(worker_id = self.id, "Worker started");

        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    record = queue.recv() => record,
                }
            };
            let Some(record) = next else {
                break;
            };

            let record_id = record.id.clone();
            let start = Instant::now();
            let span = tracing::debug_span!("match_record", record_id = record_id.as_str());
            let outcome = self.process(record).instrument(span).await;
            let duration = start.elapsed();

            if duration > SLOW_RECORD_THRESHOLD {
                warn!(
                    worker_id = self.id,
                    record_id = record_id.as_str(),
                    duration = fmt_duration(duration),
                    "Slow record (likely rate limiting or retries)"
                );
            }

            let item = match outcome {
                Ok(result) => {
                    debug!(
                        worker_id = self.id,
                        record_id = record_id.as_str(),
                        decision = result.decision.as_str(),
                        duration = fmt_duration(duration),
                        "Record processed"
                    );
                    Ok(result)
                }
                Err(Halt::Record(e)) => {
                    warn!(worker_id = self.id, error = %e, "Record failed");
                    Err(e)
                }
                Err(Halt::Cancelled) => {
                    debug!(worker_id = self.id, record_id = record_id.as_str(), "Record abandoned, run cancelled");
                    break;
                }
                Err(Halt::Fatal(e)) => {
                    self.shared.set_fatal(e);
                    self.cancel.cancel();
                    break;
                }
            };

            if self.results.send(item).await.is_err() {
                info!(worker_id = self.id, "Result stream dropped, cancelling run");
                self.cancel.cancel();
                break;
            }
        }

        trace!(worker_id = self.id, "Worker exiting");
    }

    async fn process(&self, record: LocalRecord) -> Result<MatchResult, Halt> {
        let existing = self
            .classifier
            .existing_acceptance(&record.id)
            .await
            .map_err(|source| RecordError::Store {
                record_id: record.id.clone(),
                source,
            })?;
        if let Some(existing) = existing {
            debug!("Record already accepted, returning stored result");
            return Ok(existing);
        }

        let mut state = MatchState::new(record.id.as_str());

        let candidates = self.fetcher.fetch(&record).await.map_err(|e| match e {
            FetchError::Cancelled => Halt::Cancelled,
            FetchError::RateLimitExceeded => Halt::Fatal(RunError::RateLimitExceeded),
            FetchError::Exhausted { attempts, source } => Halt::Record(RecordError::RetriesExhausted {
                record_id: record.id.clone(),
                attempts,
                source,
            }),
            FetchError::Permanent(source) => Halt::Record(RecordError::Catalog {
                record_id: record.id.clone(),
                source,
            }),
        })?;
        state.advance(MatchStage::CandidatesFetched)?;

        let scored = self.scorer.score_all(&record, &candidates);
        state.advance(MatchStage::Scored)?;

        Ok(self.classifier.classify(&mut state, &scored).await?)
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use canonry::catalog::{Catalog, RetryPolicy};
use canonry::data::aliases::AliasIndex;
use canonry::data::classifier::MatchClassifier;
use canonry::data::matching::ConfidenceScorer;
use canonry::data::models::{CanonicalEntity, EntityId, EntityType, LocalRecord, MatchCandidate, MatchResult};
use canonry::data::store::MatchStore;
use canonry::error::{CatalogError, RecordError};
use canonry::scheduler::{BatchScheduler, MatchRun, RunSummary, SchedulerConfig};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Reply = Result<Vec<MatchCandidate>, CatalogError>;

/// In-memory catalog with scripted replies.
///
/// For each name, queued replies are served first, then the standing reply.
/// Names with neither answer `NotFound`. Every call is recorded.
#[derive(Default)]
pub struct FakeCatalog {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, Instant)>>,
    delay: Duration,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Always answer `name` with `candidates` once the queue is drained.
    pub fn respond(self, name: &str, candidates: Vec<MatchCandidate>) -> Self {
        self.standing.lock().unwrap().insert(name.to_string(), Ok(candidates));
        self
    }

    /// Always fail `name` with `error` once the queue is drained.
    pub fn fail(self, name: &str, error: CatalogError) -> Self {
        self.standing.lock().unwrap().insert(name.to_string(), Err(error));
        self
    }

    /// Serve these replies for `name`, in order, before the standing one.
    pub fn script<I>(self, name: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = Reply>,
    {
        self.queued
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(replies);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(n, _)| n == name).count()
    }

    /// Call times, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn call_times_for(&self, name: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn search(&self, name: &str) -> Result<Vec<MatchCandidate>, CatalogError> {
        self.calls.lock().unwrap().push((name.to_string(), Instant::now()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let queued = self.queued.lock().unwrap().get_mut(name).and_then(VecDeque::pop_front);
        if let Some(reply) = queued {
            return reply;
        }
        self.standing
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Err(CatalogError::NotFound(name.to_string())))
    }
}

/// Networks FOX and ABC, roles Writer (`w`) and Executive Producer (`ep`).
pub fn alias_index() -> Arc<AliasIndex> {
    let index = AliasIndex::new();
    index
        .add_entity(CanonicalEntity::new(1, "FOX", EntityType::Network))
        .unwrap();
    index.register_alias("Fox Broadcasting", EntityId(1)).unwrap();
    index
        .add_entity(CanonicalEntity::new(2, "ABC", EntityType::Network))
        .unwrap();
    index
        .add_entity(CanonicalEntity::new(10, "Writer", EntityType::Role))
        .unwrap();
    index.register_alias("w", EntityId(10)).unwrap();
    index
        .add_entity(CanonicalEntity::new(11, "Executive Producer", EntityType::Role))
        .unwrap();
    index.register_alias("ep", EntityId(11)).unwrap();
    index.seal();
    Arc::new(index)
}

/// Generous quota, one-second window, short backoff.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        quota: 100,
        window: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        call_timeout: Duration::from_secs(1),
    }
}

pub fn scheduler(
    config: SchedulerConfig,
    catalog: Arc<FakeCatalog>,
    store: Arc<dyn MatchStore>,
) -> BatchScheduler {
    let scorer = Arc::new(ConfidenceScorer::new(alias_index()));
    match BatchScheduler::new(config, catalog, scorer, MatchClassifier::new(store)) {
        Ok(scheduler) => scheduler,
        Err(e) => panic!("test scheduler misconfigured: {e}"),
    }
}

/// Scores 90: same name, network via alias, one writer, same episode count.
pub fn ally_mcbeal() -> (LocalRecord, MatchCandidate) {
    (
        LocalRecord::new("r-ally", "Ally McBeal")
            .with_network("FOX")
            .with_key_creatives("David E. Kelley (w, ep), Jeffrey Kramer (p)")
            .with_episode_count(112),
        MatchCandidate::new("tt0118254", "Ally McBeal")
            .with_network("Fox Broadcasting")
            .with_team(["David E. Kelley"])
            .with_episode_count(112),
    )
}

/// Scores 70: same name and network only.
pub fn the_practice() -> (LocalRecord, MatchCandidate) {
    (
        LocalRecord::new("r-practice", "The Practice").with_network("ABC"),
        MatchCandidate::new("tt0118437", "The Practice").with_network("ABC"),
    )
}

/// Scores under 50: a different show with a similar name.
pub fn boston_legal() -> (LocalRecord, MatchCandidate) {
    (
        LocalRecord::new("r-boston", "Boston Legal"),
        MatchCandidate::new("tt0212671", "Boston Public"),
    )
}

pub struct Collected {
    pub results: Vec<MatchResult>,
    pub errors: Vec<RecordError>,
    pub summary: RunSummary,
}

impl Collected {
    pub fn result(&self, record_id: &str) -> &MatchResult {
        self.results
            .iter()
            .find(|r| r.local_record_id == record_id)
            .unwrap_or_else(|| panic!("no result for {record_id}"))
    }
}

/// Drain a run, with a generous timeout so a stuck run fails the test.
pub async fn collect(mut run: MatchRun) -> Collected {
    let mut results = Vec::new();
    let mut errors = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(item) = run.next().await {
            match item {
                Ok(result) => results.push(result),
                Err(e) => errors.push(e),
            }
        }
    })
    .await;
    assert!(drained.is_ok(), "run did not finish in time");

    Collected {
        results,
        errors,
        summary: run.summary(),
    }
}

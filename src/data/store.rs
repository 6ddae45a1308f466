//! Match result persistence.
//!
//! The pipeline talks to storage only through [`MatchStore`], so the batch
//! tool runs against [`MemoryStore`] by default and against PostgreSQL
//! ([`PgStore`](crate::data::pg::PgStore)) when a database is configured.

use crate::data::models::MatchResult;
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// What happened to a result handed to [`MatchStore::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The result is now the stored result for its record.
    Stored,
    /// The record was already accepted; the stored result is returned and the
    /// new one discarded.
    AlreadyAccepted(MatchResult),
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// The accepted result for a record, if any.
    async fn accepted(&self, record_id: &str) -> Result<Option<MatchResult>, StoreError>;

    /// Persist a result.
    ///
    /// Must behave as a compare-and-set on the decision: a record that is
    /// already accepted keeps its result, whatever the new decision is.
    /// Otherwise the new result replaces any previous one.
    async fn record(&self, result: &MatchResult) -> Result<RecordOutcome, StoreError>;

    /// Every stored result, ordered by record id.
    async fn results(&self) -> Result<Vec<MatchResult>, StoreError>;
}

/// In-process store. Results live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    results: DashMap<String, MatchResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn accepted(&self, record_id: &str) -> Result<Option<MatchResult>, StoreError> {
        Ok(self
            .results
            .get(record_id)
            .filter(|r| r.is_accepted())
            .map(|r| r.value().clone()))
    }

    async fn record(&self, result: &MatchResult) -> Result<RecordOutcome, StoreError> {
        // The entry lock makes check-then-write atomic per record.
        match self.results.entry(result.local_record_id.clone()) {
            Entry::Occupied(existing) if existing.get().is_accepted() => {
                Ok(RecordOutcome::AlreadyAccepted(existing.get().clone()))
            }
            Entry::Occupied(mut existing) => {
                existing.insert(result.clone());
                Ok(RecordOutcome::Stored)
            }
            Entry::Vacant(slot) => {
                slot.insert(result.clone());
                Ok(RecordOutcome::Stored)
            }
        }
    }

    async fn results(&self) -> Result<Vec<MatchResult>, StoreError> {
        let mut all: Vec<MatchResult> = self.results.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.local_record_id.cmp(&b.local_record_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::{Decision, ScoreBreakdown, Tier};
    use chrono::Utc;
    use std::sync::Arc;

    fn result(record: &str, candidate: &str, decision: Decision) -> MatchResult {
        let tier = match decision {
            Decision::AutoAccepted => Tier::High,
            Decision::PendingReview => Tier::Medium,
            Decision::Flagged => Tier::Low,
            Decision::NoCandidate => Tier::None,
        };
        MatchResult {
            local_record_id: record.to_string(),
            candidate_id: Some(candidate.to_string()),
            score: 0,
            factor_breakdown: ScoreBreakdown::default(),
            tier,
            decision,
            candidates_considered: 1,
            scorer_version: 1,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn non_accepted_results_replace_each_other() {
        let store = MemoryStore::new();
        store.record(&result("r1", "a", Decision::Flagged)).await.unwrap();
        let outcome = store
            .record(&result("r1", "b", Decision::PendingReview))
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Stored);
        let all = store.results().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].candidate_id.as_deref(), Some("b"));
        assert!(store.accepted("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accepted_result_is_never_replaced() {
        let store = MemoryStore::new();
        let first = result("r1", "a", Decision::AutoAccepted);
        store.record(&first).await.unwrap();

        for late in [
            result("r1", "b", Decision::AutoAccepted),
            result("r1", "c", Decision::Flagged),
        ] {
            let outcome = store.record(&late).await.unwrap();
            assert_eq!(outcome, RecordOutcome::AlreadyAccepted(first.clone()));
        }
        assert_eq!(store.accepted("r1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn concurrent_accepts_keep_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .record(&result("r1", &format!("c{i}"), Decision::AutoAccepted))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut stored = 0;
        for handle in handles {
            if handle.await.unwrap() == RecordOutcome::Stored {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn results_are_ordered_by_record() {
        let store = MemoryStore::new();
        for id in ["r3", "r1", "r2"] {
            store.record(&result(id, "x", Decision::Flagged)).await.unwrap();
        }
        let ids: Vec<_> = store
            .results()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.local_record_id)
            .collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }
}

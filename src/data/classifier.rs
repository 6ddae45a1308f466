//! Tiering and persistence of scored candidates.
//!
//! Every local record walks the same stages:
//!
//! ```text
//! pending -> candidates_fetched -> scored -> classified -> decided(decision)
//! ```
//!
//! [`MatchState`] enforces that order. The classifier never auto-accepts more
//! than one candidate per record and never overwrites an accepted result.

use crate::data::matching::{MatchScore, SCORER_VERSION};
use crate::data::models::{Decision, MatchCandidate, MatchResult, ScoreBreakdown, Tier};
use crate::data::store::{MatchStore, RecordOutcome};
use crate::error::{AmbiguousMatch, IllegalTransition, RecordError, StoreError};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Score at or above which the best candidate is accepted automatically.
pub const AUTO_ACCEPT_THRESHOLD: u8 = 80;

/// Score at or above which a candidate is worth a human look.
pub const REVIEW_THRESHOLD: u8 = 50;

/// Map a total score to its tier and decision.
///
/// Only meaningful when at least one candidate was scored; a record with no
/// candidates is [`Tier::None`] regardless of score.
pub fn tier_for(score: u8) -> (Tier, Decision) {
    match score {
        s if s >= AUTO_ACCEPT_THRESHOLD => (Tier::High, Decision::AutoAccepted),
        s if s >= REVIEW_THRESHOLD => (Tier::Medium, Decision::PendingReview),
        _ => (Tier::Low, Decision::Flagged),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStage {
    Pending,
    CandidatesFetched,
    Scored,
    Classified,
    Decided(Decision),
}

impl fmt::Display for MatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchStage::Pending => f.write_str("pending"),
            MatchStage::CandidatesFetched => f.write_str("candidates_fetched"),
            MatchStage::Scored => f.write_str("scored"),
            MatchStage::Classified => f.write_str("classified"),
            MatchStage::Decided(d) => f.write_str(d.as_str()),
        }
    }
}

/// Progress of one local record through the pipeline.
#[derive(Debug, Clone)]
pub struct MatchState {
    record_id: String,
    stage: MatchStage,
}

impl MatchState {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            stage: MatchStage::Pending,
        }
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn stage(&self) -> MatchStage {
        self.stage
    }

    /// Move to the next stage. Skipping a stage, going backwards or leaving a
    /// decided state is an error.
    pub fn advance(&mut self, to: MatchStage) -> Result<(), IllegalTransition> {
        let legal = matches!(
            (self.stage, to),
            (MatchStage::Pending, MatchStage::CandidatesFetched)
                | (MatchStage::CandidatesFetched, MatchStage::Scored)
                | (MatchStage::Scored, MatchStage::Classified)
                | (MatchStage::Classified, MatchStage::Decided(_))
        );
        if !legal {
            return Err(IllegalTransition {
                record_id: self.record_id.clone(),
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }
}

/// A tiered decision before it is stamped and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub candidate_id: Option<String>,
    pub score: u8,
    pub breakdown: ScoreBreakdown,
    pub tier: Tier,
    pub decision: Decision,
    pub candidates_considered: u32,
}

/// Pick at most one candidate and tier it.
///
/// The best candidate is the one with the highest total, ties broken by the
/// name sub-score and then by catalog order. At or above the auto-accept
/// threshold a tie that survives the name tie-break is not guessed at: the
/// record is downgraded to pending review with the first tied candidate.
pub fn classify_scores(record_id: &str, scored: &[(&MatchCandidate, MatchScore)]) -> Classification {
    let candidates_considered = u32::try_from(scored.len()).unwrap_or(u32::MAX);

    let Some(top) = scored.iter().map(|(_, s)| s.total).max() else {
        return Classification {
            candidate_id: None,
            score: 0,
            breakdown: ScoreBreakdown::default(),
            tier: Tier::None,
            decision: Decision::NoCandidate,
            candidates_considered,
        };
    };

    let best_name = scored
        .iter()
        .filter(|(_, s)| s.total == top)
        .map(|(_, s)| s.breakdown.name)
        .max()
        .unwrap_or_default();
    let leaders: Vec<&(&MatchCandidate, MatchScore)> = scored
        .iter()
        .filter(|(_, s)| s.total == top && s.breakdown.name == best_name)
        .collect();

    let (candidate, score) = *leaders[0];
    let (mut tier, mut decision) = tier_for(top);

    if decision == Decision::AutoAccepted && leaders.len() > 1 {
        let ambiguity = AmbiguousMatch {
            record_id: record_id.to_string(),
            score: top,
            candidate_ids: leaders.iter().map(|(c, _)| c.external_id.clone()).collect(),
        };
        warn!(error = %ambiguity, candidates = ?ambiguity.candidate_ids, "Downgrading ambiguous match to review");
        tier = Tier::Medium;
        decision = Decision::PendingReview;
    }

    Classification {
        candidate_id: Some(candidate.external_id.clone()),
        score: score.total,
        breakdown: score.breakdown,
        tier,
        decision,
        candidates_considered,
    }
}

/// Classifies scored candidates and records the decision in a [`MatchStore`].
#[derive(Clone)]
pub struct MatchClassifier {
    store: Arc<dyn MatchStore>,
}

impl MatchClassifier {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }

    /// The stored accepted result for a record. When present the record must
    /// not be re-fetched or re-scored.
    pub async fn existing_acceptance(&self, record_id: &str) -> Result<Option<MatchResult>, StoreError> {
        self.store.accepted(record_id).await
    }

    /// Classify a scored record, persist the decision and mark the state
    /// decided.
    ///
    /// Returns the result now authoritative for the record. If another worker
    /// accepted the record first, that stored result is returned instead of
    /// the freshly computed one.
    pub async fn classify(
        &self,
        state: &mut MatchState,
        scored: &[(&MatchCandidate, MatchScore)],
    ) -> Result<MatchResult, RecordError> {
        state.advance(MatchStage::Classified)?;
        let classification = classify_scores(state.record_id(), scored);

        let result = MatchResult {
            local_record_id: state.record_id().to_string(),
            candidate_id: classification.candidate_id,
            score: classification.score,
            factor_breakdown: classification.breakdown,
            tier: classification.tier,
            decision: classification.decision,
            candidates_considered: classification.candidates_considered,
            scorer_version: SCORER_VERSION,
            decided_at: Utc::now(),
        };

        let outcome = self
            .store
            .record(&result)
            .await
            .map_err(|source| RecordError::Store {
                record_id: result.local_record_id.clone(),
                source,
            })?;

        let result = match outcome {
            RecordOutcome::Stored => result,
            RecordOutcome::AlreadyAccepted(existing) => {
                debug!(
                    record_id = state.record_id(),
                    discarded = result.decision.as_str(),
                    "Record already accepted, keeping stored result"
                );
                existing
            }
        };

        state.advance(MatchStage::Decided(result.decision))?;

        if result.is_accepted() {
            info!(
                record_id = state.record_id(),
                candidate_id = result.candidate_id.as_deref(),
                score = result.score,
                "Match auto-accepted"
            );
        } else {
            debug!(
                record_id = state.record_id(),
                tier = result.tier.as_str(),
                decision = result.decision.as_str(),
                score = result.score,
                "Match classified"
            );
        }

        Ok(result)
    }
}

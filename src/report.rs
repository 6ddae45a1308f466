//! Run report: one row per processed record, failures, alias changes and a
//! per-tier summary.

use crate::data::aliases::AliasIndex;
use crate::data::matching::SCORER_VERSION;
use crate::data::models::{AliasRecord, Decision, MatchResult, Tier, UnresolvedToken};
use crate::error::RecordError;
use crate::scheduler::RunSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub local_record_id: String,
    pub candidate_id: Option<String>,
    pub score: u8,
    pub factor_breakdown: BTreeMap<&'static str, u8>,
    pub tier: Tier,
    pub decision: Decision,
    pub candidates_considered: u32,
}

impl From<&MatchResult> for ReportRow {
    fn from(r: &MatchResult) -> Self {
        Self {
            local_record_id: r.local_record_id.clone(),
            candidate_id: r.candidate_id.clone(),
            score: r.score,
            factor_breakdown: r.factor_breakdown.as_map(),
            tier: r.tier,
            decision: r.decision,
            candidates_considered: r.candidates_considered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub local_record_id: String,
    /// Full error chain.
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub none: usize,
}

impl TierCounts {
    fn add(&mut self, tier: Tier) {
        match tier {
            Tier::High => self.high += 1,
            Tier::Medium => self.medium += 1,
            Tier::Low => self.low += 1,
            Tier::None => self.none += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.none
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Sortable unique id, also attached to the run's log events.
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub scorer_version: u16,
    pub rows: Vec<ReportRow>,
    pub failures: Vec<FailedRecord>,
    pub tiers: TierCounts,
    pub skipped: usize,
    pub catalog_calls: u64,
    pub cache_hits: u64,
    pub new_aliases: Vec<AliasRecord>,
    /// Most frequent first.
    pub unresolved_tokens: Vec<UnresolvedToken>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            run_id: Ulid::new().to_string(),
            generated_at: Utc::now(),
            scorer_version: SCORER_VERSION,
            rows: Vec::new(),
            failures: Vec::new(),
            tiers: TierCounts::default(),
            skipped: 0,
            catalog_calls: 0,
            cache_hits: 0,
            new_aliases: Vec::new(),
            unresolved_tokens: Vec::new(),
        }
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one item from a run's result stream.
    pub fn push(&mut self, item: Result<MatchResult, RecordError>) {
        match item {
            Ok(result) => {
                self.tiers.add(result.tier);
                self.rows.push(ReportRow::from(&result));
            }
            Err(e) => {
                let local_record_id = e.record_id().to_string();
                self.failures.push(FailedRecord {
                    local_record_id,
                    error: format!("{:#}", anyhow::Error::new(e)),
                });
            }
        }
    }

    /// Fill in run counters and the alias index's view of the run, and order
    /// rows by record id.
    pub fn finish(mut self, summary: &RunSummary, aliases: &AliasIndex) -> Self {
        self.rows
            .sort_by(|a, b| a.local_record_id.cmp(&b.local_record_id));
        self.failures
            .sort_by(|a, b| a.local_record_id.cmp(&b.local_record_id));
        self.skipped = summary.skipped;
        self.catalog_calls = summary.fetch.calls;
        self.cache_hits = summary.fetch.cache_hits;
        self.new_aliases = aliases.new_aliases();
        self.unresolved_tokens = aliases.unresolved_tokens();
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

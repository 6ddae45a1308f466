//! Error taxonomy for alias registration, catalog access, persistence and
//! batch runs.
//!
//! Recoverable local conditions (an unresolved alias, a record with no
//! candidate, a low score) are outcomes in the data model, not errors. Only
//! structural violations live here.

use crate::data::classifier::MatchStage;
use crate::data::models::{EntityId, EntityType};

/// Alias registration failures. Fatal to the registration, never to a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error(
        "alias {raw_text:?} already maps to {entity_type} entity {existing}, refusing to remap it to {requested}"
    )]
    ConflictingAlias {
        raw_text: String,
        entity_type: EntityType,
        existing: EntityId,
        requested: EntityId,
    },
    #[error("unknown canonical entity {0}")]
    UnknownEntity(EntityId),
    #[error("alias text is empty")]
    EmptyAlias,
    #[error("canonical entity {id} is already {existing}, refusing to redefine it as {requested}")]
    EntityRedefined {
        id: EntityId,
        existing: String,
        requested: String,
    },
}

/// Failures reported by a [`Catalog`](crate::catalog::Catalog) search.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Timeout, connection failure or 5xx. Safe to retry.
    #[error("transient catalog failure: {0}")]
    Transient(String),
    /// The catalog positively reports no such entity.
    #[error("catalog has no entry for {0:?}")]
    NotFound(String),
    /// The catalog refused a call for exceeding its quota.
    #[error("catalog rate limit exceeded")]
    RateLimitExceeded,
    #[error("catalog rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("failed to decode catalog response: {0}")]
    Decode(String),
}

impl CatalogError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Transient(_))
    }
}

/// A credit segment that cannot be split into name and roles safely.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed credit segment {segment:?}: {reason}")]
pub struct MalformedCreditString {
    pub segment: String,
    pub reason: &'static str,
}

/// Two or more candidates remain tied for auto-acceptance after tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} candidates tie at score {score} for record {record_id}", candidate_ids.len())]
pub struct AmbiguousMatch {
    pub record_id: String,
    pub score: u8,
    pub candidate_ids: Vec<String>,
}

/// A match state machine was asked to skip or repeat a stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record {record_id}: illegal match state transition {from} -> {to}")]
pub struct IllegalTransition {
    pub record_id: String,
    pub from: MatchStage,
    pub to: MatchStage,
}

/// Match result persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored {column} has unexpected value {value:?}")]
    Corrupt { column: &'static str, value: String },
}

/// Failure of a single record. The rest of the run continues.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record {record_id}: catalog still failing after {attempts} attempts")]
    RetriesExhausted {
        record_id: String,
        attempts: u32,
        #[source]
        source: CatalogError,
    },
    #[error("record {record_id}: catalog request failed")]
    Catalog {
        record_id: String,
        #[source]
        source: CatalogError,
    },
    #[error("record {record_id}: failed to persist match result")]
    Store {
        record_id: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    State(#[from] IllegalTransition),
}

impl RecordError {
    pub fn record_id(&self) -> &str {
        match self {
            RecordError::RetriesExhausted { record_id, .. }
            | RecordError::Catalog { record_id, .. }
            | RecordError::Store { record_id, .. } => record_id,
            RecordError::State(e) => &e.record_id,
        }
    }
}

/// Run-level failures. These are the only conditions that make a batch
/// invocation exit non-zero.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("scheduler misconfigured: {0}")]
    Misconfigured(String),
    #[error("catalog reported its rate limit exceeded; the call limiter let too many calls through")]
    RateLimitExceeded,
    #[error("catalog unreachable: {failed} record(s) failed and no fetch succeeded")]
    CatalogUnreachable { failed: usize },
}

//! PostgreSQL persistence for match results, aliases and unresolved tokens.

use crate::data::aliases::AliasIndex;
use crate::data::models::{
    AliasRecord, CanonicalEntity, EntityId, EntityType, MatchResult, ScoreBreakdown,
    UnresolvedToken,
};
use crate::data::names::alias_key;
use crate::data::store::{MatchStore, RecordOutcome};
use crate::error::StoreError;
use crate::utils::fmt_duration;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{ConnectOptions, PgPool};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(sqlx::FromRow)]
struct MatchResultRow {
    local_record_id: String,
    candidate_id: Option<String>,
    score: i16,
    factor_breakdown: Json<ScoreBreakdown>,
    tier: String,
    decision: String,
    candidates_considered: i32,
    scorer_version: i16,
    decided_at: DateTime<Utc>,
}

impl TryFrom<MatchResultRow> for MatchResult {
    type Error = StoreError;

    fn try_from(row: MatchResultRow) -> Result<Self, Self::Error> {
        let corrupt = |column, value: String| StoreError::Corrupt { column, value };
        Ok(MatchResult {
            score: u8::try_from(row.score).map_err(|_| corrupt("score", row.score.to_string()))?,
            tier: row.tier.parse().map_err(|_| corrupt("tier", row.tier.clone()))?,
            decision: row
                .decision
                .parse()
                .map_err(|_| corrupt("decision", row.decision.clone()))?,
            candidates_considered: u32::try_from(row.candidates_considered)
                .map_err(|_| corrupt("candidates_considered", row.candidates_considered.to_string()))?,
            scorer_version: u16::try_from(row.scorer_version)
                .map_err(|_| corrupt("scorer_version", row.scorer_version.to_string()))?,
            local_record_id: row.local_record_id,
            candidate_id: row.candidate_id,
            factor_breakdown: row.factor_breakdown.0,
            decided_at: row.decided_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: i32,
    canonical_name: String,
    entity_type: String,
    category_tags: Vec<String>,
    active: bool,
}

#[derive(sqlx::FromRow)]
struct AliasRow {
    raw_text: String,
    canonical_entity_id: i32,
}

const RESULT_COLUMNS: &str = "local_record_id, candidate_id, score, factor_breakdown, tier, \
     decision, candidates_considered, scorer_version, decided_at";

/// [`MatchStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let slow_threshold = Duration::from_millis(500);
        let connect_options = PgConnectOptions::from_str(database_url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(4)
            .acquire_slow_threshold(slow_threshold)
            .acquire_timeout(Duration::from_secs(4))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            max_connections = 4,
            acquire_slow_threshold = fmt_duration(slow_threshold),
            "Database pool established"
        );

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed");

        Ok(Self::new(pool))
    }

    /// Load every canonical entity and alias into `index`.
    ///
    /// Returns the number of entities loaded. Stored aliases that conflict
    /// with each other are logged and skipped.
    pub async fn load_aliases(&self, index: &AliasIndex) -> anyhow::Result<usize> {
        let entities: Vec<EntityRow> = sqlx::query_as(
            "SELECT id, canonical_name, entity_type, category_tags, active \
             FROM canonical_entities ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load canonical entities")?;

        let count = entities.len();
        for row in entities {
            let entity_type = EntityType::from_str(&row.entity_type)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("Canonical entity {} has a bad type", row.id))?;
            let entity = CanonicalEntity {
                id: EntityId(row.id),
                canonical_name: row.canonical_name,
                entity_type,
                category_tags: row.category_tags.into_iter().collect::<BTreeSet<_>>(),
                active: row.active,
            };
            index
                .add_entity(entity)
                .with_context(|| format!("Failed to index canonical entity {}", row.id))?;
        }

        let aliases: Vec<AliasRow> =
            sqlx::query_as("SELECT raw_text, canonical_entity_id FROM aliases ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .context("Failed to load aliases")?;

        for row in aliases {
            if let Err(e) = index.register_alias(&row.raw_text, EntityId(row.canonical_entity_id)) {
                warn!(error = %e, "Skipping stored alias");
            }
        }

        info!(entities = count, aliases = index.alias_count(), "Loaded aliases from database");
        Ok(count)
    }

    /// Persist aliases registered during a run and drop the unresolved tokens
    /// they cover.
    pub async fn save_aliases(&self, aliases: &[AliasRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for alias in aliases {
            let key = alias_key(&alias.raw_text);
            inserted += sqlx::query(
                "INSERT INTO aliases (entity_type, alias_key, raw_text, canonical_entity_id) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (entity_type, alias_key) DO NOTHING",
            )
            .bind(alias.entity_type.as_str())
            .bind(&key)
            .bind(&alias.raw_text)
            .bind(alias.canonical_entity_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            sqlx::query("DELETE FROM unresolved_tokens WHERE entity_type = $1 AND token_key = $2")
                .bind(alias.entity_type.as_str())
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Add this run's unresolved tokens to the stored tallies.
    pub async fn save_unresolved(&self, tokens: &[UnresolvedToken]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for token in tokens {
            sqlx::query(
                "INSERT INTO unresolved_tokens \
                     (entity_type, token_key, raw_text, first_seen_at, occurrence_count) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (entity_type, token_key) DO UPDATE SET \
                     occurrence_count = unresolved_tokens.occurrence_count + EXCLUDED.occurrence_count, \
                     first_seen_at = LEAST(unresolved_tokens.first_seen_at, EXCLUDED.first_seen_at)",
            )
            .bind(token.entity_type.as_str())
            .bind(alias_key(&token.raw_text))
            .bind(&token.raw_text)
            .bind(token.first_seen_at)
            .bind(i64::try_from(token.occurrence_count).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn accepted(&self, record_id: &str) -> Result<Option<MatchResult>, StoreError> {
        let row: Option<MatchResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM match_results \
             WHERE local_record_id = $1 AND decision = 'auto_accepted'"
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MatchResult::try_from).transpose()
    }

    async fn record(&self, result: &MatchResult) -> Result<RecordOutcome, StoreError> {
        // The WHERE clause turns the upsert into a compare-and-set: an
        // accepted row is left alone and no row comes back.
        let written: Option<(String,)> = sqlx::query_as(
            "INSERT INTO match_results \
                 (local_record_id, candidate_id, score, factor_breakdown, tier, decision, \
                  candidates_considered, scorer_version, decided_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (local_record_id) DO UPDATE SET \
                 candidate_id = EXCLUDED.candidate_id, \
                 score = EXCLUDED.score, \
                 factor_breakdown = EXCLUDED.factor_breakdown, \
                 tier = EXCLUDED.tier, \
                 decision = EXCLUDED.decision, \
                 candidates_considered = EXCLUDED.candidates_considered, \
                 scorer_version = EXCLUDED.scorer_version, \
                 decided_at = EXCLUDED.decided_at \
             WHERE match_results.decision <> 'auto_accepted' \
             RETURNING local_record_id",
        )
        .bind(&result.local_record_id)
        .bind(&result.candidate_id)
        .bind(i16::from(result.score))
        .bind(Json(result.factor_breakdown))
        .bind(result.tier.as_str())
        .bind(result.decision.as_str())
        .bind(i32::try_from(result.candidates_considered).unwrap_or(i32::MAX))
        .bind(i16::try_from(result.scorer_version).unwrap_or(i16::MAX))
        .bind(result.decided_at)
        .fetch_optional(&self.pool)
        .await?;

        if written.is_some() {
            return Ok(RecordOutcome::Stored);
        }

        match self.accepted(&result.local_record_id).await? {
            Some(existing) => Ok(RecordOutcome::AlreadyAccepted(existing)),
            None => Err(StoreError::Corrupt {
                column: "decision",
                value: format!("no row written for {}", result.local_record_id),
            }),
        }
    }

    async fn results(&self) -> Result<Vec<MatchResult>, StoreError> {
        let rows: Vec<MatchResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM match_results ORDER BY local_record_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MatchResult::try_from).collect()
    }
}

//! Data model shared by the alias index, the credit parser, the scorer and
//! the batch pipeline.

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Namespace of a canonical entity. Aliases never collide across types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Studio,
    Network,
    Genre,
    Role,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Studio => "studio",
            EntityType::Network => "network",
            EntityType::Genre => "genre",
            EntityType::Role => "role",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "studio" => Ok(EntityType::Studio),
            "network" => Ok(EntityType::Network),
            "genre" => Ok(EntityType::Genre),
            "role" => Ok(EntityType::Role),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Identifier of a canonical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The single authoritative record a set of raw text variants resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub canonical_name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub category_tags: BTreeSet<String>,
    /// Entities are never deleted. Inactive entities stop resolving.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl CanonicalEntity {
    pub fn new(id: i32, canonical_name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            id: EntityId(id),
            canonical_name: canonical_name.into(),
            entity_type,
            category_tags: BTreeSet::new(),
            active: true,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.category_tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A raw text variant registered as referring to a canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub raw_text: String,
    pub canonical_entity_id: EntityId,
    pub entity_type: EntityType,
}

/// A raw string the alias index could not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedToken {
    pub raw_text: String,
    pub entity_type: EntityType,
    pub first_seen_at: DateTime<Utc>,
    pub occurrence_count: u64,
}

impl UnresolvedToken {
    /// The tag under which this token is grouped in denormalized output.
    pub fn label(&self) -> String {
        format!("Other: {}", self.raw_text)
    }
}

/// One role held by a credited person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreditRole {
    Canonical { id: EntityId, name: String },
    /// An abbreviation with no registered alias, kept exactly as written.
    Raw { text: String },
}

impl CreditRole {
    pub fn name(&self) -> &str {
        match self {
            CreditRole::Canonical { name, .. } => name,
            CreditRole::Raw { text } => text,
        }
    }
}

/// A structured person/role record parsed from a credits field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEntry {
    pub person_name: String,
    pub roles: IndexSet<CreditRole>,
    /// 1-based position of the credit in the original field.
    pub team_order: Option<u32>,
}

impl CreditEntry {
    pub fn role_names(&self) -> Vec<&str> {
        self.roles.iter().map(CreditRole::name).collect()
    }
}

/// A local show record awaiting a catalog match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub network: Option<String>,
    /// Free-text "key creatives" field, e.g. `"Jane Doe (w, ep), John Roe (d)"`.
    #[serde(default)]
    pub key_creatives: Option<String>,
    #[serde(default)]
    pub episode_count: Option<u32>,
}

impl LocalRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            network: None,
            key_creatives: None,
            episode_count: None,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_key_creatives(mut self, credits: impl Into<String>) -> Self {
        self.key_creatives = Some(credits.into());
        self
    }

    pub fn with_episode_count(mut self, count: u32) -> Self {
        self.episode_count = Some(count);
        self
    }
}

/// An external record proposed as a possible match for a local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub external_id: String,
    pub name: String,
    /// Networks the catalog reports for this show. Accepts a bare string.
    #[serde(default, deserialize_with = "one_or_many")]
    pub network: Vec<String>,
    #[serde(default)]
    pub team_members: BTreeSet<String>,
    #[serde(default)]
    pub episode_count: Option<u32>,
}

impl MatchCandidate {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            network: Vec::new(),
            team_members: BTreeSet::new(),
            episode_count: None,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network.push(network.into());
        self
    }

    pub fn with_team<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.team_members.extend(members.into_iter().map(Into::into));
        self
    }

    pub fn with_episode_count(mut self, count: u32) -> Self {
        self.episode_count = Some(count);
        self
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// Per-factor points behind a match score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Title similarity, 0-50.
    pub name: u8,
    /// Canonical network agreement, 0 or 20.
    pub network: u8,
    /// Creative-team overlap, 0-15.
    pub team: u8,
    /// Exact episode-count agreement, 0 or 15.
    pub episodes: u8,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u8 {
        let sum = u16::from(self.name)
            + u16::from(self.network)
            + u16::from(self.team)
            + u16::from(self.episodes);
        sum.min(100) as u8
    }

    /// Factor name to points, for audit output.
    pub fn as_map(&self) -> BTreeMap<&'static str, u8> {
        BTreeMap::from([
            ("name", self.name),
            ("network", self.network),
            ("team", self.team),
            ("episodes", self.episodes),
        ])
    }
}

/// Classification bucket of a scored match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Medium,
    Low,
    None,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
            Tier::None => "none",
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Tier::High),
            "medium" => Ok(Tier::Medium),
            "low" => Ok(Tier::Low),
            "none" => Ok(Tier::None),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// The action taken for a classified record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoAccepted,
    PendingReview,
    Flagged,
    NoCandidate,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::AutoAccepted => "auto_accepted",
            Decision::PendingReview => "pending_review",
            Decision::Flagged => "flagged",
            Decision::NoCandidate => "no_candidate",
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_accepted" => Ok(Decision::AutoAccepted),
            "pending_review" => Ok(Decision::PendingReview),
            "flagged" => Ok(Decision::Flagged),
            "no_candidate" => Ok(Decision::NoCandidate),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// The recorded outcome of classifying one local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub local_record_id: String,
    pub candidate_id: Option<String>,
    pub score: u8,
    pub factor_breakdown: ScoreBreakdown,
    pub tier: Tier,
    pub decision: Decision,
    pub candidates_considered: u32,
    pub scorer_version: u16,
    pub decided_at: DateTime<Utc>,
}

impl MatchResult {
    pub fn is_accepted(&self) -> bool {
        self.decision == Decision::AutoAccepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_network_accepts_single_string() {
        let c: MatchCandidate = serde_json::from_str(
            r#"{"external_id": "t1", "name": "Ally McBeal", "network": "FOX"}"#,
        )
        .unwrap();
        assert_eq!(c.network, vec!["FOX".to_string()]);
        assert!(c.team_members.is_empty());
        assert_eq!(c.episode_count, None);
    }

    #[test]
    fn candidate_network_accepts_list_and_null() {
        let c: MatchCandidate = serde_json::from_str(
            r#"{"external_id": "t1", "name": "x", "network": ["FOX", "Hulu"], "episode_count": 112}"#,
        )
        .unwrap();
        assert_eq!(c.network.len(), 2);
        assert_eq!(c.episode_count, Some(112));

        let c: MatchCandidate =
            serde_json::from_str(r#"{"external_id": "t2", "name": "y", "network": null}"#).unwrap();
        assert!(c.network.is_empty());
    }

    #[test]
    fn breakdown_total_is_bounded() {
        let b = ScoreBreakdown {
            name: 50,
            network: 20,
            team: 15,
            episodes: 15,
        };
        assert_eq!(b.total(), 100);

        let overflow = ScoreBreakdown {
            name: 200,
            network: 20,
            team: 15,
            episodes: 15,
        };
        assert_eq!(overflow.total(), 100);
    }

    #[test]
    fn breakdown_map_names_every_factor() {
        let map = ScoreBreakdown::default().as_map();
        assert_eq!(
            map.keys().copied().collect::<Vec<_>>(),
            vec!["episodes", "name", "network", "team"]
        );
    }

    #[test]
    fn decision_round_trips_through_str() {
        for d in [
            Decision::AutoAccepted,
            Decision::PendingReview,
            Decision::Flagged,
            Decision::NoCandidate,
        ] {
            assert_eq!(d.as_str().parse::<Decision>().unwrap(), d);
        }
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn unresolved_label_is_stable() {
        let token = UnresolvedToken {
            raw_text: "Quibi".to_string(),
            entity_type: EntityType::Network,
            first_seen_at: Utc::now(),
            occurrence_count: 3,
        };
        assert_eq!(token.label(), "Other: Quibi");
    }
}

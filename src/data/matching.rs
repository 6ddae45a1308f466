//! Confidence scoring between a local show record and one catalog candidate.

use crate::data::aliases::{AliasIndex, Resolution};
use crate::data::credits::CreditStringParser;
use crate::data::models::{EntityId, EntityType, LocalRecord, MatchCandidate, ScoreBreakdown};
use crate::data::names::{normalize_for_matching, normalize_title};
use std::sync::Arc;
use tracing::trace;

/// Stamped on every match result. Bump whenever a factor or weight changes.
pub const SCORER_VERSION: u16 = 1;

const MAX_NAME_POINTS: f64 = 50.0;
const NETWORK_POINTS: u8 = 20;
const EPISODE_POINTS: u8 = 15;

const TEAM_FIRST_MATCH_POINTS: u8 = 5;
const TEAM_EXTRA_MATCH_POINTS: u8 = 2;
const MAX_TEAM_POINTS: u8 = 15;

/// Jaro-Winkler similarity at or above which two normalized person names are
/// treated as the same person.
const TEAM_NAME_THRESHOLD: f64 = 0.92;

/// Roles whose holders count towards the creative-team factor.
pub const DEFAULT_TEAM_ROLES: &[&str] = &["Writer", "Executive Producer"];

/// Result of scoring a single local record against one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchScore {
    pub total: u8,
    pub breakdown: ScoreBreakdown,
}

/// Character-level similarity ratio of two strings.
///
/// `2 * LCS(a, b) / (len(a) + len(b))`, where LCS is the length of the longest
/// common subsequence. Symmetric and within `[0, 1]`; two empty strings give 0.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }

    // Two-row LCS table.
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];

    (2 * lcs) as f64 / total as f64
}

/// Title similarity points, 0-50.
pub fn name_points(local_title: &str, candidate_name: &str) -> u8 {
    let ratio = similarity_ratio(&normalize_title(local_title), &normalize_title(candidate_name));
    (ratio * MAX_NAME_POINTS).round().clamp(0.0, MAX_NAME_POINTS) as u8
}

/// Creative-team points for a number of matched people.
fn team_points(matches: usize) -> u8 {
    match matches {
        0 => 0,
        n => {
            let extra = u8::try_from(n - 1).unwrap_or(u8::MAX);
            TEAM_FIRST_MATCH_POINTS
                .saturating_add(extra.saturating_mul(TEAM_EXTRA_MATCH_POINTS))
                .min(MAX_TEAM_POINTS)
        }
    }
}

/// Count local names that fuzzy-match a distinct candidate member.
///
/// Each candidate member is consumed by at most one local name; a local name
/// takes the most similar member still available.
fn count_team_matches(local: &[String], candidate: &[String]) -> usize {
    let mut used = vec![false; candidate.len()];
    let mut matches = 0;

    for name in local {
        let best = candidate
            .iter()
            .enumerate()
            .filter(|(i, _)| !used[*i])
            .map(|(i, member)| (i, strsim::jaro_winkler(name, member)))
            .filter(|(_, sim)| *sim >= TEAM_NAME_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((i, _)) = best {
            used[i] = true;
            matches += 1;
        }
    }

    matches
}

/// Computes weighted match scores.
///
/// The network factor resolves both sides through the alias index, and the
/// team factor parses the local `key_creatives` field with a
/// [`CreditStringParser`] backed by the same index.
pub struct ConfidenceScorer {
    aliases: Arc<AliasIndex>,
    team_roles: Vec<String>,
}

impl ConfidenceScorer {
    pub fn new(aliases: Arc<AliasIndex>) -> Self {
        Self {
            aliases,
            team_roles: DEFAULT_TEAM_ROLES.iter().map(|r| r.to_lowercase()).collect(),
        }
    }

    /// Replace the set of roles counted by the creative-team factor.
    pub fn with_team_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.team_roles = roles.into_iter().map(|r| r.as_ref().to_lowercase()).collect();
        self
    }

    /// Score one candidate.
    pub fn score(&self, local: &LocalRecord, candidate: &MatchCandidate) -> MatchScore {
        let team = self.local_team(local);
        let network = self.local_network(local);
        self.score_prepared(local, network, &team, candidate)
    }

    /// Score every candidate for one record, parsing the record's credits once.
    pub fn score_all<'c>(
        &self,
        local: &LocalRecord,
        candidates: &'c [MatchCandidate],
    ) -> Vec<(&'c MatchCandidate, MatchScore)> {
        let team = self.local_team(local);
        let network = self.local_network(local);
        candidates
            .iter()
            .map(|c| (c, self.score_prepared(local, network, &team, c)))
            .collect()
    }

    fn score_prepared(
        &self,
        local: &LocalRecord,
        local_network: Option<EntityId>,
        local_team: &[String],
        candidate: &MatchCandidate,
    ) -> MatchScore {
        let name = name_points(&local.title, &candidate.name);

        let network = match local_network {
            Some(id) if self.candidate_has_network(candidate, id) => NETWORK_POINTS,
            _ => 0,
        };

        let team = if local_team.is_empty() {
            0
        } else {
            let members: Vec<String> = candidate
                .team_members
                .iter()
                .map(|m| normalize_for_matching(m))
                .filter(|m| !m.is_empty())
                .collect();
            team_points(count_team_matches(local_team, &members))
        };

        let episodes = match (local.episode_count, candidate.episode_count) {
            (Some(a), Some(b)) if a == b => EPISODE_POINTS,
            _ => 0,
        };

        let breakdown = ScoreBreakdown {
            name,
            network,
            team,
            episodes,
        };
        let total = breakdown.total();

        trace!(
            record_id = local.id.as_str(),
            candidate_id = candidate.external_id.as_str(),
            total,
            name,
            network,
            team,
            episodes,
            "Scored candidate"
        );

        MatchScore { total, breakdown }
    }

    fn local_network(&self, local: &LocalRecord) -> Option<EntityId> {
        let raw = local.network.as_deref()?;
        match self.aliases.resolve(raw, EntityType::Network) {
            Resolution::Resolved(entity) => Some(entity.id),
            Resolution::Unresolved(_) => None,
        }
    }

    fn candidate_has_network(&self, candidate: &MatchCandidate, id: EntityId) -> bool {
        candidate.network.iter().any(|raw| {
            matches!(
                self.aliases.resolve(raw, EntityType::Network),
                Resolution::Resolved(entity) if entity.id == id
            )
        })
    }

    /// Normalized names of credited people holding a creative-team role,
    /// deduplicated in credit order.
    fn local_team(&self, local: &LocalRecord) -> Vec<String> {
        let Some(raw) = local.key_creatives.as_deref() else {
            return Vec::new();
        };

        let mut names: Vec<String> = Vec::new();
        for entry in CreditStringParser::new(&self.aliases).parse(&local.id, raw) {
            let on_team = entry
                .roles
                .iter()
                .any(|role| self.team_roles.contains(&role.name().to_lowercase()));
            if !on_team {
                continue;
            }
            let key = normalize_for_matching(&entry.person_name);
            if !key.is_empty() && !names.contains(&key) {
                names.push(key);
            }
        }
        names
    }
}

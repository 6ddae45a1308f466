//! Canonical-name lookup: raw text to canonical entity, or an explicit
//! "unresolved" outcome.
//!
//! Aliases are keyed by `(entity_type, alias_key(raw_text))`, so a studio and a
//! role may share a short name without colliding. Registration never
//! overwrites: a raw string bound to one entity cannot be rebound to another.

use crate::data::models::{AliasRecord, CanonicalEntity, EntityId, EntityType, UnresolvedToken};
use crate::data::names::{alias_key, collapse_whitespace};
use crate::error::AliasError;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace};

/// A raw string with no known alias, tagged rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub raw_text: String,
    pub entity_type: EntityType,
}

impl Unresolved {
    /// Stable grouping tag for downstream aggregation: `"Other: <raw_text>"`.
    pub fn label(&self) -> String {
        format!("Other: {}", self.raw_text)
    }
}

/// Outcome of [`AliasIndex::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(CanonicalEntity),
    Unresolved(Unresolved),
}

impl Resolution {
    pub fn entity(&self) -> Option<&CanonicalEntity> {
        match self {
            Resolution::Resolved(entity) => Some(entity),
            Resolution::Unresolved(_) => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    /// Canonical name when resolved, `"Other: <raw_text>"` otherwise.
    pub fn label(&self) -> String {
        match self {
            Resolution::Resolved(entity) => entity.canonical_name.clone(),
            Resolution::Unresolved(unresolved) => unresolved.label(),
        }
    }
}

/// Result of a successful alias registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasOutcome {
    Registered,
    /// The exact mapping already existed.
    Unchanged,
}

#[derive(Debug, Clone)]
struct AliasSlot {
    entity_id: EntityId,
    /// Text as first registered, for reporting.
    raw_text: String,
    /// Registered before [`AliasIndex::seal`] was called.
    seeded: bool,
}

type AliasKey = (EntityType, String);

/// Injectable, append-mostly alias table.
///
/// Reads never block on each other. Registrations of the same key are
/// serialized by the map's per-shard entry lock.
#[derive(Debug, Default)]
pub struct AliasIndex {
    entities: DashMap<EntityId, CanonicalEntity>,
    aliases: DashMap<AliasKey, AliasSlot>,
    unresolved: DashMap<AliasKey, UnresolvedToken>,
    sealed: AtomicBool,
}

impl AliasIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a canonical entity and register its canonical name as its own
    /// alias. Re-adding an identical entity is a no-op; an id may not be
    /// redefined with another name, type or active state.
    pub fn add_entity(&self, entity: CanonicalEntity) -> Result<(), AliasError> {
        let key = alias_key(&entity.canonical_name);
        if key.is_empty() {
            return Err(AliasError::EmptyAlias);
        }

        if let Some(slot) = self.aliases.get(&(entity.entity_type, key))
            && slot.entity_id != entity.id
        {
            return Err(AliasError::ConflictingAlias {
                raw_text: entity.canonical_name.clone(),
                entity_type: entity.entity_type,
                existing: slot.entity_id,
                requested: entity.id,
            });
        }

        let id = entity.id;
        let name = entity.canonical_name.clone();
        // The entry guard must be gone before register_alias reads `entities`
        match self.entities.entry(id) {
            Entry::Occupied(existing) if existing.get() == &entity => return Ok(()),
            Entry::Occupied(existing) => {
                return Err(AliasError::EntityRedefined {
                    id,
                    existing: describe(existing.get()),
                    requested: describe(&entity),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(entity);
            }
        }
        self.register_alias(&name, id)?;
        Ok(())
    }

    pub fn entity(&self, id: EntityId) -> Option<CanonicalEntity> {
        self.entities.get(&id).map(|e| e.value().clone())
    }

    /// Mark an entity inactive. Its aliases stay reserved but stop resolving.
    pub fn deactivate(&self, id: EntityId) -> Result<(), AliasError> {
        let mut entity = self
            .entities
            .get_mut(&id)
            .ok_or(AliasError::UnknownEntity(id))?;
        entity.active = false;
        info!(entity_id = %id, name = entity.canonical_name.as_str(), "Deactivated canonical entity");
        Ok(())
    }

    /// Resolve raw text within an entity-type namespace.
    ///
    /// Misses are tallied as [`UnresolvedToken`]s so they can be promoted later.
    pub fn resolve(&self, raw_text: &str, entity_type: EntityType) -> Resolution {
        let key = alias_key(raw_text);
        let unresolved = || {
            Resolution::Unresolved(Unresolved {
                raw_text: collapse_whitespace(raw_text),
                entity_type,
            })
        };

        if key.is_empty() {
            return unresolved();
        }

        let entity_id = self
            .aliases
            .get(&(entity_type, key.clone()))
            .map(|slot| slot.entity_id);

        if let Some(id) = entity_id
            && let Some(entity) = self.entity(id)
        {
            if entity.active {
                return Resolution::Resolved(entity);
            }
            trace!(entity_id = %id, raw_text, "Alias points at inactive entity");
        }

        self.record_miss(raw_text, entity_type, key);
        unresolved()
    }

    fn record_miss(&self, raw_text: &str, entity_type: EntityType, key: String) {
        self.unresolved
            .entry((entity_type, key))
            .and_modify(|token| token.occurrence_count += 1)
            .or_insert_with(|| {
                debug!(%entity_type, raw_text, "New unresolved token");
                UnresolvedToken {
                    raw_text: collapse_whitespace(raw_text),
                    entity_type,
                    first_seen_at: Utc::now(),
                    occurrence_count: 1,
                }
            });
    }

    /// Bind `raw_text` to an existing canonical entity.
    ///
    /// Fails with [`AliasError::ConflictingAlias`] if the text already maps to a
    /// different entity of the same type. Re-registering the same mapping is a
    /// no-op.
    pub fn register_alias(
        &self,
        raw_text: &str,
        canonical_entity_id: EntityId,
    ) -> Result<AliasOutcome, AliasError> {
        let key = alias_key(raw_text);
        if key.is_empty() {
            return Err(AliasError::EmptyAlias);
        }

        let entity_type = self
            .entities
            .get(&canonical_entity_id)
            .map(|e| e.entity_type)
            .ok_or(AliasError::UnknownEntity(canonical_entity_id))?;

        let outcome = match self.aliases.entry((entity_type, key.clone())) {
            Entry::Occupied(existing) => {
                let existing_id = existing.get().entity_id;
                if existing_id != canonical_entity_id {
                    return Err(AliasError::ConflictingAlias {
                        raw_text: raw_text.to_string(),
                        entity_type,
                        existing: existing_id,
                        requested: canonical_entity_id,
                    });
                }
                AliasOutcome::Unchanged
            }
            Entry::Vacant(slot) => {
                slot.insert(AliasSlot {
                    entity_id: canonical_entity_id,
                    raw_text: collapse_whitespace(raw_text),
                    seeded: !self.sealed.load(Ordering::Acquire),
                });
                AliasOutcome::Registered
            }
        };

        if outcome == AliasOutcome::Registered {
            self.unresolved.remove(&(entity_type, key));
            trace!(raw_text, entity_id = %canonical_entity_id, %entity_type, "Registered alias");
        }

        Ok(outcome)
    }

    /// Promote an observed unresolved string to an alias of an existing entity.
    ///
    /// Returns the token that was being tracked for it, if any.
    pub fn promote(
        &self,
        raw_text: &str,
        entity_type: EntityType,
        canonical_entity_id: EntityId,
    ) -> Result<Option<UnresolvedToken>, AliasError> {
        let target_type = self
            .entities
            .get(&canonical_entity_id)
            .map(|e| e.entity_type)
            .ok_or(AliasError::UnknownEntity(canonical_entity_id))?;
        if target_type != entity_type {
            return Err(AliasError::UnknownEntity(canonical_entity_id));
        }

        let token = self
            .unresolved
            .get(&(entity_type, alias_key(raw_text)))
            .map(|t| t.value().clone());
        self.register_alias(raw_text, canonical_entity_id)?;

        info!(
            raw_text,
            %entity_type,
            entity_id = %canonical_entity_id,
            occurrences = token.as_ref().map(|t| t.occurrence_count).unwrap_or(0),
            "Promoted unresolved token to alias"
        );
        Ok(token)
    }

    /// Mark everything registered so far as seed data. Aliases registered
    /// afterwards are reported by [`AliasIndex::new_aliases`].
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Aliases registered since [`AliasIndex::seal`].
    pub fn new_aliases(&self) -> Vec<AliasRecord> {
        self.collect_aliases(|slot| !slot.seeded)
    }

    pub fn aliases(&self) -> Vec<AliasRecord> {
        self.collect_aliases(|_| true)
    }

    fn collect_aliases(&self, keep: impl Fn(&AliasSlot) -> bool) -> Vec<AliasRecord> {
        let mut records: Vec<AliasRecord> = self
            .aliases
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| AliasRecord {
                raw_text: entry.value().raw_text.clone(),
                canonical_entity_id: entry.value().entity_id,
                entity_type: entry.key().0,
            })
            .collect();
        records.sort_by(|a, b| {
            (a.entity_type, &a.raw_text).cmp(&(b.entity_type, &b.raw_text))
        });
        records
    }

    /// Unresolved strings, most frequent first.
    pub fn unresolved_tokens(&self) -> Vec<UnresolvedToken> {
        let mut tokens: Vec<UnresolvedToken> =
            self.unresolved.iter().map(|t| t.value().clone()).collect();
        tokens.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.raw_text.cmp(&b.raw_text))
        });
        tokens
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}

fn describe(entity: &CanonicalEntity) -> String {
    let state = if entity.active { "active" } else { "inactive" };
    format!("{state} {} {:?}", entity.entity_type, entity.canonical_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> AliasIndex {
        let index = AliasIndex::new();
        index
            .add_entity(CanonicalEntity::new(1, "Warner Bros. Television", EntityType::Studio))
            .unwrap();
        index
            .add_entity(CanonicalEntity::new(2, "20th Television", EntityType::Studio))
            .unwrap();
        index
            .add_entity(CanonicalEntity::new(10, "Director", EntityType::Role))
            .unwrap();
        index.register_alias("WBTV", EntityId(1)).unwrap();
        index
    }

    #[test]
    fn canonical_name_is_its_own_alias() {
        let index = index();
        let resolved = index.resolve("Warner Bros. Television", EntityType::Studio);
        assert_eq!(resolved.entity().unwrap().id, EntityId(1));
    }

    #[test]
    fn resolve_ignores_case_and_whitespace() {
        let index = index();
        for raw in ["WBTV", "wbtv", "  WbTv  "] {
            let resolved = index.resolve(raw, EntityType::Studio);
            assert_eq!(resolved.entity().map(|e| e.id), Some(EntityId(1)), "raw {raw:?}");
        }
    }

    #[test]
    fn entity_type_is_a_namespace() {
        let index = index();
        index
            .add_entity(CanonicalEntity::new(20, "Dick Wolf Entertainment", EntityType::Studio))
            .unwrap();
        index.register_alias("d", EntityId(10)).unwrap();
        index.register_alias("D", EntityId(10)).unwrap();
        // Same text, different namespace: no conflict.
        index.register_alias("d", EntityId(20)).unwrap();

        assert_eq!(
            index.resolve("d", EntityType::Role).entity().unwrap().id,
            EntityId(10)
        );
        assert_eq!(
            index.resolve("d", EntityType::Studio).entity().unwrap().id,
            EntityId(20)
        );
        assert!(!index.resolve("d", EntityType::Network).is_resolved());
    }

    #[test]
    fn conflicting_alias_fails_without_overwriting() {
        let index = index();
        let err = index.register_alias("wbtv", EntityId(2)).unwrap_err();
        assert_eq!(
            err,
            AliasError::ConflictingAlias {
                raw_text: "wbtv".to_string(),
                entity_type: EntityType::Studio,
                existing: EntityId(1),
                requested: EntityId(2),
            }
        );
        assert_eq!(
            index.resolve("WBTV", EntityType::Studio).entity().unwrap().id,
            EntityId(1)
        );
    }

    #[test]
    fn reregistering_same_mapping_is_a_noop() {
        let index = index();
        let before = index.alias_count();
        assert_eq!(
            index.register_alias("WBTV", EntityId(1)).unwrap(),
            AliasOutcome::Unchanged
        );
        assert_eq!(index.alias_count(), before);
    }

    #[test]
    fn unknown_entity_and_empty_alias_are_rejected() {
        let index = index();
        assert_eq!(
            index.register_alias("HBO", EntityId(99)),
            Err(AliasError::UnknownEntity(EntityId(99)))
        );
        assert_eq!(
            index.register_alias("   ", EntityId(1)),
            Err(AliasError::EmptyAlias)
        );
    }

    #[test]
    fn readding_identical_entity_is_a_noop() {
        let index = index();
        let before = index.alias_count();
        index
            .add_entity(CanonicalEntity::new(1, "Warner Bros. Television", EntityType::Studio))
            .unwrap();
        assert_eq!(index.entity_count(), 3);
        assert_eq!(index.alias_count(), before);
    }

    #[test]
    fn redefining_an_entity_is_rejected() {
        let index = AliasIndex::new();
        index
            .add_entity(CanonicalEntity::new(1, "FOX", EntityType::Network))
            .unwrap();
        index.deactivate(EntityId(1)).unwrap();

        let err = index
            .add_entity(CanonicalEntity::new(1, "Fox Studios", EntityType::Studio))
            .unwrap_err();
        assert!(matches!(err, AliasError::EntityRedefined { id: EntityId(1), .. }));

        // Same name and type, but it would bring the entity back to life
        let err = index
            .add_entity(CanonicalEntity::new(1, "FOX", EntityType::Network))
            .unwrap_err();
        assert!(matches!(err, AliasError::EntityRedefined { .. }));

        let kept = index.entity(EntityId(1)).unwrap();
        assert_eq!(kept.canonical_name, "FOX");
        assert_eq!(kept.entity_type, EntityType::Network);
        assert!(!kept.active);
        assert!(!index.resolve("FOX", EntityType::Network).is_resolved());
        assert!(!index.resolve("Fox Studios", EntityType::Studio).is_resolved());
    }

    #[test]
    fn canonical_name_collision_rejects_entity() {
        let index = index();
        let err = index
            .add_entity(CanonicalEntity::new(3, "wbtv", EntityType::Studio))
            .unwrap_err();
        assert!(matches!(err, AliasError::ConflictingAlias { .. }));
        assert!(index.entity(EntityId(3)).is_none());
    }

    #[test]
    fn miss_is_tagged_and_counted() {
        let index = index();
        let miss = index.resolve("Lionsgate  TV", EntityType::Studio);
        assert_eq!(miss.label(), "Other: Lionsgate TV");
        index.resolve("lionsgate tv", EntityType::Studio);
        index.resolve("Amblin", EntityType::Studio);

        let tokens = index.unresolved_tokens();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].raw_text, "Lionsgate TV");
        assert_eq!(tokens[0].occurrence_count, 2);
        assert_eq!(tokens[1].raw_text, "Amblin");
    }

    #[test]
    fn blank_input_is_unresolved_but_not_tracked() {
        let index = index();
        assert!(!index.resolve("  ", EntityType::Studio).is_resolved());
        assert!(index.unresolved_tokens().is_empty());
    }

    #[test]
    fn promotion_registers_alias_and_clears_token() {
        let index = index();
        index.resolve("Warner Brothers TV", EntityType::Studio);
        index.resolve("Warner Brothers TV", EntityType::Studio);

        let token = index
            .promote("Warner Brothers TV", EntityType::Studio, EntityId(1))
            .unwrap()
            .expect("token was tracked");
        assert_eq!(token.occurrence_count, 2);
        assert!(index.unresolved_tokens().is_empty());
        assert!(index.resolve("warner brothers tv", EntityType::Studio).is_resolved());
    }

    #[test]
    fn promotion_into_wrong_namespace_fails() {
        let index = index();
        assert!(index.promote("dir", EntityType::Studio, EntityId(10)).is_err());
    }

    #[test]
    fn deactivated_entity_stops_resolving_but_keeps_aliases() {
        let index = index();
        index.deactivate(EntityId(1)).unwrap();
        let miss = index.resolve("WBTV", EntityType::Studio);
        assert_eq!(miss.label(), "Other: WBTV");
        assert!(matches!(
            index.register_alias("WBTV", EntityId(2)),
            Err(AliasError::ConflictingAlias { .. })
        ));
    }

    #[test]
    fn new_aliases_only_lists_post_seal_registrations() {
        let index = index();
        index.seal();
        assert!(index.new_aliases().is_empty());
        index.register_alias("WB Television", EntityId(1)).unwrap();

        let fresh = index.new_aliases();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].raw_text, "WB Television");
        assert_eq!(fresh[0].canonical_entity_id, EntityId(1));
        assert!(index.aliases().len() > fresh.len());
    }

    #[test]
    fn concurrent_conflicting_registrations_admit_one_winner() {
        use std::sync::Arc;

        let index = Arc::new(index());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = index.clone();
                std::thread::spawn(move || {
                    let target = if i % 2 == 0 { EntityId(1) } else { EntityId(2) };
                    index.register_alias("The Studio", target)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winner = index
            .resolve("the studio", EntityType::Studio)
            .entity()
            .unwrap()
            .id;
        for result in results {
            match result {
                Ok(_) => {}
                Err(AliasError::ConflictingAlias { existing, .. }) => assert_eq!(existing, winner),
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
    }
}

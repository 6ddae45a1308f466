//! Alias seed files.
//!
//! A seed file is a JSON array of canonical entities, each with the raw
//! variants already known to refer to it:
//!
//! ```json
//! [
//!   {"id": 1, "canonical_name": "Warner Bros. Television", "entity_type": "studio",
//!    "category_tags": ["major"], "aliases": ["WBTV", "Warner Bros TV"]},
//!   {"id": 40, "canonical_name": "Writer", "entity_type": "role", "aliases": ["w"]}
//! ]
//! ```

use crate::data::aliases::{AliasIndex, AliasOutcome};
use crate::data::models::CanonicalEntity;
use crate::utils::read_json_file;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntity {
    #[serde(flatten)]
    pub entity: CanonicalEntity,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedStats {
    pub entities: usize,
    pub aliases: usize,
    /// Alias registrations refused because they contradict earlier ones.
    pub conflicts: usize,
}

/// Load seed entries into `index`.
///
/// A conflicting alias is logged and skipped; it does not abort the load.
/// A conflicting canonical name or a redefined entity id does.
pub fn load(index: &AliasIndex, seeds: Vec<SeedEntity>) -> anyhow::Result<SeedStats> {
    let mut stats = SeedStats::default();

    for seed in seeds {
        let id = seed.entity.id;
        let name = seed.entity.canonical_name.clone();
        index
            .add_entity(seed.entity)
            .with_context(|| format!("Failed to add canonical entity {id} ({name})"))?;
        stats.entities += 1;

        for alias in &seed.aliases {
            match index.register_alias(alias, id) {
                Ok(AliasOutcome::Registered) => stats.aliases += 1,
                Ok(AliasOutcome::Unchanged) => {}
                Err(e) => {
                    warn!(error = %e, "Skipping seed alias");
                    stats.conflicts += 1;
                }
            }
        }
    }

    Ok(stats)
}

/// Read a seed file into `index`.
pub fn load_file(index: &AliasIndex, path: &Path) -> anyhow::Result<SeedStats> {
    let seeds: Vec<SeedEntity> = read_json_file(path, "alias seed file")?;

    let stats = load(index, seeds)?;
    info!(
        path = %path.display(),
        entities = stats.entities,
        aliases = stats.aliases,
        conflicts = stats.conflicts,
        "Loaded alias seed file"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::{EntityId, EntityType};
    use std::io::Write;

    const SEED: &str = r#"[
        {"id": 1, "canonical_name": "Warner Bros. Television", "entity_type": "studio",
         "category_tags": ["major"], "aliases": ["WBTV", "Warner Bros TV"]},
        {"id": 2, "canonical_name": "Writer", "entity_type": "role", "aliases": ["w", "W"]},
        {"id": 3, "canonical_name": "Wishbone TV", "entity_type": "studio", "aliases": ["wbtv"]},
        {"id": 4, "canonical_name": "DuMont", "entity_type": "network", "active": false}
    ]"#;

    #[test]
    fn loads_entities_and_aliases() {
        let index = AliasIndex::new();
        let seeds: Vec<SeedEntity> = serde_json::from_str(SEED).unwrap();
        let stats = load(&index, seeds).unwrap();

        assert_eq!(
            stats,
            SeedStats {
                entities: 4,
                aliases: 3,
                conflicts: 1
            }
        );
        let resolved = index.resolve("wbtv", EntityType::Studio);
        assert_eq!(resolved.entity().map(|e| e.id), Some(EntityId(1)));
        assert!(resolved.entity().unwrap().category_tags.contains("major"));
        assert!(!index.resolve("DuMont", EntityType::Network).is_resolved());
    }

    #[test]
    fn seeded_aliases_are_not_new() {
        let index = AliasIndex::new();
        load(&index, serde_json::from_str(SEED).unwrap()).unwrap();
        index.seal();
        assert!(index.new_aliases().is_empty());

        index.register_alias("exec writer", EntityId(2)).unwrap();
        assert_eq!(index.new_aliases().len(), 1);
    }

    #[test]
    fn duplicate_canonical_name_aborts() {
        let index = AliasIndex::new();
        let seeds: Vec<SeedEntity> = serde_json::from_str(
            r#"[
                {"id": 1, "canonical_name": "FOX", "entity_type": "network"},
                {"id": 2, "canonical_name": "Fox", "entity_type": "network"}
            ]"#,
        )
        .unwrap();
        assert!(load(&index, seeds).is_err());
    }

    #[test]
    fn load_file_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id": "one", "canonical_name": "x", "entity_type": "role"}}]"#).unwrap();

        let index = AliasIndex::new();
        let err = load_file(&index, file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid alias seed file"));
        assert!(format!("{err:#}").contains("[0]"));
    }

    #[test]
    fn load_file_reads_seed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();

        let index = AliasIndex::new();
        let stats = load_file(&index, file.path()).unwrap();
        assert_eq!(stats.entities, 4);
        assert_eq!(index.entity_count(), 4);
    }
}

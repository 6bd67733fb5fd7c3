use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::flags::FlagDefinition;

/// Immutable point-in-time view of every active flag, tagged with a generation.
///
/// A snapshot is never edited after it is built. Refreshes build a new one and
/// swap it in, so readers holding an older `Arc<FlagSnapshot>` keep a complete view.
#[derive(Debug, Clone)]
pub struct FlagSnapshot {
    generation: u64,
    flags: HashMap<String, FlagDefinition>,
    loaded_at: DateTime<Utc>,
}

impl FlagSnapshot {
    /// Builds a snapshot from a full load.
    ///
    /// Inactive flags and flags that fail validation are left out. If a name shows up
    /// twice, the higher `version` wins, then the later `updated_at`.
    pub fn build(generation: u64, definitions: impl IntoIterator<Item = FlagDefinition>) -> Self {
        let mut flags: HashMap<String, FlagDefinition> = HashMap::new();

        for flag in definitions {
            if !flag.is_active {
                continue;
            }

            if let Err(reason) = flag.validate() {
                warn!(flag = %flag.name, %reason, "Skipping invalid flag definition");
                continue;
            }

            match flags.get(&flag.name) {
                Some(existing) if (existing.version, existing.updated_at) >= (flag.version, flag.updated_at) => {
                    warn!(
                        flag = %flag.name,
                        kept_version = existing.version,
                        dropped_version = flag.version,
                        "Duplicate flag name in load, keeping newer definition"
                    );
                }
                _ => {
                    flags.insert(flag.name.clone(), flag);
                }
            }
        }

        Self {
            generation,
            flags,
            loaded_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn get(&self, name: &str) -> Option<&FlagDefinition> {
        self.flags.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlagDefinition> {
        self.flags.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_flags_are_excluded() {
        let snapshot = FlagSnapshot::build(
            1,
            vec![
                FlagDefinition::new("x").enabled(true).active(false),
                FlagDefinition::new("y").enabled(true),
            ],
        );

        assert!(!snapshot.contains("x"));
        assert!(snapshot.contains("y"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_invalid_flags_are_skipped() {
        let snapshot = FlagSnapshot::build(
            1,
            vec![
                FlagDefinition::new("").enabled(true),
                FlagDefinition::new("too-much").rollout(150),
                FlagDefinition::new("ok"),
            ],
        );

        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["ok"]);
    }

    #[test]
    fn test_duplicate_names_keep_highest_version() {
        let snapshot = FlagSnapshot::build(
            4,
            vec![
                FlagDefinition::new("dup").version(7).enabled(true),
                FlagDefinition::new("dup").version(3).enabled(false),
            ],
        );

        let flag = snapshot.get("dup").unwrap();
        assert_eq!(flag.version, 7);
        assert!(flag.enabled);
        assert_eq!(snapshot.generation(), 4);
    }

    #[test]
    fn test_empty_load_is_a_valid_snapshot() {
        let snapshot = FlagSnapshot::build(1, Vec::new());
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.iter().count(), 0);
    }
}

use crate::config::CompactionStrategy;
use crate::model::{FileIndex, LevelOrTier, StoreId, Tsn};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Placement of one file within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_index: FileIndex,
    pub level_or_tier: LevelOrTier,
}

/// Identity, lifetime and file layout of one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub store_id: StoreId,
    /// TSN of the operation that created the store.
    pub valid_from: Tsn,
    /// TSN of the operation that deleted the store, if any.
    pub valid_to: Option<Tsn>,
    pub compaction_strategy: CompactionStrategy,
    pub files: BTreeMap<FileIndex, FileInfo>,
}

impl StoreMetadata {
    pub fn new(store_id: StoreId, valid_from: Tsn, compaction_strategy: CompactionStrategy) -> Self {
        Self {
            store_id,
            valid_from,
            valid_to: None,
            compaction_strategy,
            files: BTreeMap::new(),
        }
    }

    pub fn file_infos_at(&self, level_or_tier: LevelOrTier) -> Vec<FileInfo> {
        self.files
            .values()
            .filter(|info| info.level_or_tier == level_or_tier)
            .copied()
            .collect()
    }

    pub fn file_indices_at(&self, level_or_tier: LevelOrTier) -> BTreeSet<FileIndex> {
        self.file_infos_at(level_or_tier)
            .into_iter()
            .map(|info| info.file_index)
            .collect()
    }

    pub fn highest_non_empty_level_or_tier(&self) -> Option<LevelOrTier> {
        self.files.values().map(|info| info.level_or_tier).max()
    }

    pub fn number_of_non_empty_tiers(&self) -> usize {
        self.files
            .values()
            .map(|info| info.level_or_tier)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_terminated(&self) -> bool {
        self.valid_to.is_some()
    }

    /// A store is visible to readers whose snapshot lies within `[valid_from, valid_to)`.
    pub fn is_visible_at(&self, tsn: Tsn) -> bool {
        self.valid_from <= tsn && self.valid_to.map_or(true, |valid_to| tsn < valid_to)
    }
}

/// The state obtained by replaying every manifest operation in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub stores: BTreeMap<StoreId, StoreMetadata>,
    pub last_sequence_number: u64,
}

impl Manifest {
    pub fn store(&self, store_id: &StoreId) -> Option<&StoreMetadata> {
        self.stores.get(store_id)
    }

    /// Largest file index of any store, used to seed file index allocation.
    pub fn max_file_index(&self, store_id: &StoreId) -> Option<FileIndex> {
        self.stores
            .get(store_id)
            .and_then(|store| store.files.keys().next_back().copied())
    }

    /// Highest TSN recorded by store creation or deletion.
    pub fn max_tsn(&self) -> Tsn {
        self.stores
            .values()
            .map(|store| store.valid_to.unwrap_or(0).max(store.valid_from))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieredCompaction;
    use crate::error::Result;

    fn metadata(files: &[(FileIndex, LevelOrTier)]) -> Result<StoreMetadata> {
        let mut store = StoreMetadata::new(
            StoreId::new("test")?,
            5,
            CompactionStrategy::Tiered(TieredCompaction::default()),
        );
        for (file_index, level_or_tier) in files {
            store.files.insert(
                *file_index,
                FileInfo {
                    file_index: *file_index,
                    level_or_tier: *level_or_tier,
                },
            );
        }
        Ok(store)
    }

    #[test]
    fn test_level_queries() -> Result<()> {
        let store = metadata(&[(0, 2), (3, 0), (4, 0), (7, 5)])?;
        assert_eq!(store.file_indices_at(0), BTreeSet::from([3, 4]));
        assert_eq!(store.file_indices_at(1), BTreeSet::new());
        assert_eq!(store.highest_non_empty_level_or_tier(), Some(5));
        assert_eq!(store.number_of_non_empty_tiers(), 3);

        let empty = metadata(&[])?;
        assert_eq!(empty.highest_non_empty_level_or_tier(), None);
        assert_eq!(empty.number_of_non_empty_tiers(), 0);
        Ok(())
    }

    #[test]
    fn test_visibility() -> Result<()> {
        let mut store = metadata(&[])?;
        assert!(!store.is_visible_at(4));
        assert!(store.is_visible_at(5));
        assert!(store.is_visible_at(100));

        store.valid_to = Some(9);
        assert!(store.is_terminated());
        assert!(store.is_visible_at(8));
        assert!(!store.is_visible_at(9));
        Ok(())
    }
}

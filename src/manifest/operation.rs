use super::metadata::{FileInfo, Manifest, StoreMetadata};
use crate::config::CompactionStrategy;
use crate::error::Result;
use crate::model::{FileIndex, LevelOrTier, StoreId, Tsn};
use crate::Error;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One durable change to the store layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManifestOperation {
    CreateStore {
        seq: u64,
        store_id: StoreId,
        valid_from: Tsn,
        compaction_strategy: CompactionStrategy,
    },
    DeleteStore {
        seq: u64,
        store_id: StoreId,
        valid_to: Tsn,
    },
    /// A new file in level or tier 0.
    Flush {
        seq: u64,
        store_id: StoreId,
        file_index: FileIndex,
    },
    TieredCompaction {
        seq: u64,
        store_id: StoreId,
        tier_to_file_indices: BTreeMap<LevelOrTier, BTreeSet<FileIndex>>,
        output_tier: LevelOrTier,
        output_file_indices: BTreeSet<FileIndex>,
    },
    LeveledCompaction {
        seq: u64,
        store_id: StoreId,
        lower_level: LevelOrTier,
        lower_level_file_indices: BTreeSet<FileIndex>,
        upper_level: LevelOrTier,
        upper_level_file_indices: BTreeSet<FileIndex>,
        output_level: LevelOrTier,
        output_file_indices: BTreeSet<FileIndex>,
    },
    FullCompaction {
        seq: u64,
        store_id: StoreId,
        input_file_indices: BTreeSet<FileIndex>,
        output_level_or_tier: LevelOrTier,
        output_file_indices: BTreeSet<FileIndex>,
    },
}

impl ManifestOperation {
    pub fn seq(&self) -> u64 {
        match self {
            ManifestOperation::CreateStore { seq, .. }
            | ManifestOperation::DeleteStore { seq, .. }
            | ManifestOperation::Flush { seq, .. }
            | ManifestOperation::TieredCompaction { seq, .. }
            | ManifestOperation::LeveledCompaction { seq, .. }
            | ManifestOperation::FullCompaction { seq, .. } => *seq,
        }
    }

    pub fn store_id(&self) -> &StoreId {
        match self {
            ManifestOperation::CreateStore { store_id, .. }
            | ManifestOperation::DeleteStore { store_id, .. }
            | ManifestOperation::Flush { store_id, .. }
            | ManifestOperation::TieredCompaction { store_id, .. }
            | ManifestOperation::LeveledCompaction { store_id, .. }
            | ManifestOperation::FullCompaction { store_id, .. } => store_id,
        }
    }

    fn fail(&self, message: impl std::fmt::Display) -> Error {
        Error::InvalidData(format!(
            "Cannot apply manifest operation {} to store '{}': {}",
            self.seq(),
            self.store_id(),
            message
        ))
    }

    /// Validates the operation against `manifest` and applies it.
    ///
    /// On error the manifest is left untouched.
    pub fn apply_to(&self, manifest: &mut Manifest) -> Result<()> {
        let expected = manifest.last_sequence_number + 1;
        if self.seq() != expected {
            return Err(self.fail(format!("expected sequence number {}", expected)));
        }

        match self {
            ManifestOperation::CreateStore {
                store_id,
                valid_from,
                compaction_strategy,
                ..
            } => {
                if manifest.stores.contains_key(store_id) {
                    return Err(self.fail("store already exists"));
                }
                manifest.stores.insert(
                    store_id.clone(),
                    StoreMetadata::new(store_id.clone(), *valid_from, compaction_strategy.clone()),
                );
            }

            ManifestOperation::DeleteStore {
                store_id, valid_to, ..
            } => {
                let store = self.live_store(manifest, store_id)?;
                if *valid_to < store.valid_from {
                    return Err(self.fail("store would be deleted before its creation"));
                }
                if let Some(store) = manifest.stores.get_mut(store_id) {
                    store.valid_to = Some(*valid_to);
                }
            }

            ManifestOperation::Flush {
                store_id,
                file_index,
                ..
            } => {
                let store = self.live_store(manifest, store_id)?;
                if store.files.contains_key(file_index) {
                    return Err(self.fail(format!("file {} already exists", file_index)));
                }
                let mut store = store.clone();
                store.files.insert(
                    *file_index,
                    FileInfo {
                        file_index: *file_index,
                        level_or_tier: 0,
                    },
                );
                manifest.stores.insert(store_id.clone(), store);
            }

            ManifestOperation::TieredCompaction {
                store_id,
                tier_to_file_indices,
                output_tier,
                output_file_indices,
                ..
            } => {
                let store = self.live_store(manifest, store_id)?;
                if !matches!(store.compaction_strategy, CompactionStrategy::Tiered(_)) {
                    return Err(self.fail("store does not use tiered compaction"));
                }
                for (tier, files) in tier_to_file_indices {
                    if files.is_empty() {
                        return Err(self.fail(format!("tier {} lists no files", tier)));
                    }
                    if store.file_indices_at(*tier) != *files {
                        return Err(self.fail(format!(
                            "files {:?} are not exactly the files of tier {}",
                            files, tier
                        )));
                    }
                }
                let inputs: BTreeSet<FileIndex> =
                    tier_to_file_indices.values().flatten().copied().collect();
                let store = self.replace_files(store, &inputs, output_file_indices, *output_tier)?;
                manifest.stores.insert(store_id.clone(), store);
            }

            ManifestOperation::LeveledCompaction {
                store_id,
                lower_level,
                lower_level_file_indices,
                upper_level,
                upper_level_file_indices,
                output_level,
                output_file_indices,
                ..
            } => {
                let store = self.live_store(manifest, store_id)?;
                if !matches!(store.compaction_strategy, CompactionStrategy::Leveled(_)) {
                    return Err(self.fail("store does not use leveled compaction"));
                }
                if !(lower_level <= upper_level && upper_level <= output_level) {
                    return Err(self.fail(format!(
                        "levels {} -> {} -> {} are out of order",
                        lower_level, upper_level, output_level
                    )));
                }
                if lower_level_file_indices.is_empty() {
                    return Err(self.fail("lower level lists no files"));
                }
                for (level, files) in [
                    (lower_level, lower_level_file_indices),
                    (upper_level, upper_level_file_indices),
                ] {
                    let at_level = store.file_indices_at(*level);
                    if let Some(missing) = files.iter().find(|f| !at_level.contains(f)) {
                        return Err(self.fail(format!("file {} is not in level {}", missing, level)));
                    }
                }
                let inputs: BTreeSet<FileIndex> = lower_level_file_indices
                    .union(upper_level_file_indices)
                    .copied()
                    .collect();
                let store = self.replace_files(store, &inputs, output_file_indices, *output_level)?;
                manifest.stores.insert(store_id.clone(), store);
            }

            ManifestOperation::FullCompaction {
                store_id,
                input_file_indices,
                output_level_or_tier,
                output_file_indices,
                ..
            } => {
                let store = self.live_store(manifest, store_id)?;
                let store = self.replace_files(
                    store,
                    input_file_indices,
                    output_file_indices,
                    *output_level_or_tier,
                )?;
                manifest.stores.insert(store_id.clone(), store);
            }
        }

        manifest.last_sequence_number = self.seq();
        Ok(())
    }

    fn live_store<'a>(&self, manifest: &'a Manifest, store_id: &StoreId) -> Result<&'a StoreMetadata> {
        match manifest.stores.get(store_id) {
            Some(store) if !store.is_terminated() => Ok(store),
            Some(_) => Err(self.fail("store has been deleted")),
            None => Err(self.fail("store does not exist")),
        }
    }

    fn replace_files(
        &self,
        store: &StoreMetadata,
        inputs: &BTreeSet<FileIndex>,
        outputs: &BTreeSet<FileIndex>,
        output_level_or_tier: LevelOrTier,
    ) -> Result<StoreMetadata> {
        if let Some(missing) = inputs.iter().find(|f| !store.files.contains_key(f)) {
            return Err(self.fail(format!("input file {} does not exist", missing)));
        }
        if let Some(existing) = outputs.iter().find(|f| store.files.contains_key(f)) {
            return Err(self.fail(format!("output file {} already exists", existing)));
        }

        let mut store = store.clone();
        store.files.retain(|index, _| !inputs.contains(index));
        for file_index in outputs {
            store.files.insert(
                *file_index,
                FileInfo {
                    file_index: *file_index,
                    level_or_tier: output_level_or_tier,
                },
            );
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeveledCompaction, TieredCompaction};

    fn store_id() -> StoreId {
        StoreId::new("users").expect("valid store id")
    }

    fn create(seq: u64, strategy: CompactionStrategy) -> ManifestOperation {
        ManifestOperation::CreateStore {
            seq,
            store_id: store_id(),
            valid_from: 1,
            compaction_strategy: strategy,
        }
    }

    fn flush(seq: u64, file_index: FileIndex) -> ManifestOperation {
        ManifestOperation::Flush {
            seq,
            store_id: store_id(),
            file_index,
        }
    }

    #[test]
    fn test_sequence_numbers_must_be_consecutive() -> Result<()> {
        let mut manifest = Manifest::default();
        create(1, CompactionStrategy::default()).apply_to(&mut manifest)?;
        assert!(flush(3, 0).apply_to(&mut manifest).is_err());
        flush(2, 0).apply_to(&mut manifest)?;
        assert_eq!(manifest.last_sequence_number, 2);
        Ok(())
    }

    #[test]
    fn test_tiered_compaction() -> Result<()> {
        let mut manifest = Manifest::default();
        create(1, CompactionStrategy::Tiered(TieredCompaction::default())).apply_to(&mut manifest)?;
        flush(2, 0).apply_to(&mut manifest)?;
        flush(3, 1).apply_to(&mut manifest)?;

        // Tier 0 holds two files; listing only one of them is rejected.
        let partial = ManifestOperation::TieredCompaction {
            seq: 4,
            store_id: store_id(),
            tier_to_file_indices: BTreeMap::from([(0, BTreeSet::from([0]))]),
            output_tier: 1,
            output_file_indices: BTreeSet::from([2]),
        };
        assert!(partial.apply_to(&mut manifest).is_err());
        assert_eq!(manifest.last_sequence_number, 3);

        ManifestOperation::TieredCompaction {
            seq: 4,
            store_id: store_id(),
            tier_to_file_indices: BTreeMap::from([(0, BTreeSet::from([0, 1]))]),
            output_tier: 1,
            output_file_indices: BTreeSet::from([2]),
        }
        .apply_to(&mut manifest)?;

        let store = manifest.store(&store_id()).expect("store exists");
        assert_eq!(store.file_indices_at(0), BTreeSet::new());
        assert_eq!(store.file_indices_at(1), BTreeSet::from([2]));
        Ok(())
    }

    #[test]
    fn test_leveled_compaction_requires_leveled_store() -> Result<()> {
        let mut manifest = Manifest::default();
        create(1, CompactionStrategy::Tiered(TieredCompaction::default())).apply_to(&mut manifest)?;
        flush(2, 0).apply_to(&mut manifest)?;

        let op = ManifestOperation::LeveledCompaction {
            seq: 3,
            store_id: store_id(),
            lower_level: 0,
            lower_level_file_indices: BTreeSet::from([0]),
            upper_level: 1,
            upper_level_file_indices: BTreeSet::new(),
            output_level: 1,
            output_file_indices: BTreeSet::from([1]),
        };
        assert!(op.apply_to(&mut manifest).is_err());

        let mut manifest = Manifest::default();
        create(1, CompactionStrategy::Leveled(LeveledCompaction::default())).apply_to(&mut manifest)?;
        flush(2, 0).apply_to(&mut manifest)?;
        op.apply_to(&mut manifest)?;
        let store = manifest.store(&store_id()).expect("store exists");
        assert_eq!(store.file_indices_at(1), BTreeSet::from([1]));
        Ok(())
    }

    #[test]
    fn test_deleted_store_rejects_flushes() -> Result<()> {
        let mut manifest = Manifest::default();
        create(1, CompactionStrategy::default()).apply_to(&mut manifest)?;
        ManifestOperation::DeleteStore {
            seq: 2,
            store_id: store_id(),
            valid_to: 4,
        }
        .apply_to(&mut manifest)?;

        assert!(flush(3, 0).apply_to(&mut manifest).is_err());
        assert_eq!(manifest.max_tsn(), 4);
        Ok(())
    }
}

use crate::sstable::CompressionType;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Upper bound for the in-memory data of all stores combined (default: 250MB)
    pub max_forest_size: usize,

    /// Fraction of `max_forest_size` at which flushes get dispatched (default: 0.33)
    pub forest_flush_threshold: f64,

    /// Target size of a data block inside a store file (default: 64KB)
    pub max_block_size: usize,

    /// Codec for the data blocks of new store files; existing files keep
    /// theirs (default: snappy)
    pub compression: CompressionType,

    /// Compaction output is split into several files beyond this size (default: 512MB)
    pub max_file_size: u64,

    /// Number of file headers kept in memory, 0 disables the cache (default: 1024)
    pub header_cache_capacity: usize,

    /// WAL segments roll over beyond this size (default: 128MB)
    pub max_wal_file_size: u64,

    /// Number of WAL segments that are never removed by shortening (default: 3)
    pub min_wal_files: usize,

    /// fsync the WAL after every commit (default: true)
    pub wal_sync: bool,

    /// Upper bound for a single batch applied to an in-memory tree during commit (default: 64MB)
    pub commit_batch_size: usize,

    /// How long READ_WRITE and EXCLUSIVE transactions wait for admission (default: 10s)
    pub lock_acquisition_timeout: Duration,

    /// Threads executing flush tasks (default: 4)
    pub flush_threads: usize,

    /// Threads executing compaction tasks (default: 4)
    pub compaction_threads: usize,

    /// Run periodic background tasks (default: true)
    pub background_tasks: bool,

    /// How often to check for flush opportunities (default: 3s)
    pub flush_interval: Duration,

    /// How often to run minor compactions (default: 10min)
    pub minor_compaction_interval: Duration,

    /// How often to delete garbage files (default: 10min)
    pub garbage_collection_interval: Duration,

    /// How often to flush everything and shorten the WAL (default: 10min)
    pub checkpoint_interval: Duration,

    /// Strategy for stores created without an explicit one
    pub default_compaction_strategy: CompactionStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompactionStrategy {
    Tiered(TieredCompaction),
    Leveled(LeveledCompaction),
}

impl CompactionStrategy {
    /// Index of the highest level or tier files may be placed in.
    pub fn max_level_or_tier(&self) -> u32 {
        match self {
            CompactionStrategy::Tiered(tiered) => tiered.number_of_tiers.saturating_sub(1),
            CompactionStrategy::Leveled(leveled) => leveled.max_levels,
        }
    }
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        CompactionStrategy::Tiered(TieredCompaction::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TieredCompaction {
    /// Number of tiers; the highest tier is `number_of_tiers - 1` (default: 10)
    pub number_of_tiers: u32,

    /// Size of all tiers except the highest one, relative to the highest tier,
    /// at which everything gets merged (default: 2.0)
    pub max_space_amplification_percent: f64,

    /// Size of a tier relative to all tiers below it at which those
    /// tiers get merged (default: 1.0)
    pub size_ratio: f64,

    /// Minimum number of tiers participating in a merge (default: 4)
    pub min_merge_tiers: u32,
}

impl Default for TieredCompaction {
    fn default() -> Self {
        Self {
            number_of_tiers: 10,
            max_space_amplification_percent: 2.0,
            size_ratio: 1.0,
            min_merge_tiers: 4,
        }
    }
}

impl TieredCompaction {
    pub fn number_of_tiers(mut self, tiers: u32) -> Self {
        self.number_of_tiers = tiers;
        self
    }

    pub fn max_space_amplification_percent(mut self, percent: f64) -> Self {
        self.max_space_amplification_percent = percent;
        self
    }

    pub fn size_ratio(mut self, ratio: f64) -> Self {
        self.size_ratio = ratio;
        self
    }

    pub fn min_merge_tiers(mut self, tiers: u32) -> Self {
        self.min_merge_tiers = tiers;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeveledCompaction {
    /// Target size of level N+1 relative to level N (default: 10.0)
    pub level_size_multiplier: f64,

    /// Level 0 file count that triggers a merge into level 1 (default: 5)
    pub level0_file_number_compaction_trigger: u32,

    /// Number of levels above level 0 (default: 8)
    pub max_levels: u32,

    /// Target size of level 1 in bytes (default: 200MB)
    pub base_level_min_size: u64,
}

impl Default for LeveledCompaction {
    fn default() -> Self {
        Self {
            level_size_multiplier: 10.0,
            level0_file_number_compaction_trigger: 5,
            max_levels: 8,
            base_level_min_size: 200 * MIB as u64,
        }
    }
}

impl LeveledCompaction {
    pub fn level_size_multiplier(mut self, multiplier: f64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    pub fn level0_file_number_compaction_trigger(mut self, files: u32) -> Self {
        self.level0_file_number_compaction_trigger = files;
        self
    }

    pub fn max_levels(mut self, levels: u32) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn base_level_min_size(mut self, bytes: u64) -> Self {
        self.base_level_min_size = bytes;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./stratadb"),
            max_forest_size: 250 * MIB,
            forest_flush_threshold: 0.33,
            max_block_size: 64 * KIB,
            compression: CompressionType::default(),
            max_file_size: 512 * MIB as u64,
            header_cache_capacity: 1024,
            max_wal_file_size: 128 * MIB as u64,
            min_wal_files: 3,
            wal_sync: true,
            commit_batch_size: 64 * MIB,
            lock_acquisition_timeout: Duration::from_secs(10),
            flush_threads: 4,
            compaction_threads: 4,
            background_tasks: true,
            flush_interval: Duration::from_secs(3),
            minor_compaction_interval: Duration::from_secs(600),
            garbage_collection_interval: Duration::from_secs(600),
            checkpoint_interval: Duration::from_secs(600),
            default_compaction_strategy: CompactionStrategy::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn max_forest_size(mut self, bytes: usize) -> Self {
        self.max_forest_size = bytes;
        self
    }

    pub fn forest_flush_threshold(mut self, fraction: f64) -> Self {
        self.forest_flush_threshold = fraction;
        self
    }

    pub fn max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn header_cache_capacity(mut self, headers: usize) -> Self {
        self.header_cache_capacity = headers;
        self
    }

    pub fn max_wal_file_size(mut self, bytes: u64) -> Self {
        self.max_wal_file_size = bytes;
        self
    }

    pub fn min_wal_files(mut self, files: usize) -> Self {
        self.min_wal_files = files;
        self
    }

    pub fn wal_sync(mut self, enabled: bool) -> Self {
        self.wal_sync = enabled;
        self
    }

    pub fn commit_batch_size(mut self, bytes: usize) -> Self {
        self.commit_batch_size = bytes;
        self
    }

    pub fn lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    pub fn flush_threads(mut self, threads: usize) -> Self {
        self.flush_threads = threads;
        self
    }

    pub fn compaction_threads(mut self, threads: usize) -> Self {
        self.compaction_threads = threads;
        self
    }

    /// Enable or disable the periodic background tasks
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn minor_compaction_interval(mut self, interval: Duration) -> Self {
        self.minor_compaction_interval = interval;
        self
    }

    pub fn garbage_collection_interval(mut self, interval: Duration) -> Self {
        self.garbage_collection_interval = interval;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn default_compaction_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.default_compaction_strategy = strategy;
        self
    }

    /// Forest size at which flushes get dispatched, in bytes.
    pub fn flush_threshold_bytes(&self) -> usize {
        let threshold = (self.max_forest_size as f64 * self.forest_flush_threshold) as usize;
        threshold.clamp(1, self.max_forest_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dir, PathBuf::from("./stratadb"));
        assert_eq!(config.max_forest_size, 250 * 1024 * 1024);
        assert_eq!(config.commit_batch_size, 64 * 1024 * 1024);
        assert!(config.wal_sync);
        assert!(config.background_tasks);

        match config.default_compaction_strategy {
            CompactionStrategy::Tiered(tiered) => {
                assert_eq!(tiered.number_of_tiers, 10);
                assert_eq!(tiered.min_merge_tiers, 4);
            }
            other => panic!("unexpected default strategy: {:?}", other),
        }
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/test")
            .max_forest_size(8 * 1024 * 1024)
            .forest_flush_threshold(0.5)
            .wal_sync(false)
            .lock_acquisition_timeout(Duration::from_millis(250))
            .minor_compaction_interval(Duration::from_secs(5))
            .default_compaction_strategy(CompactionStrategy::Leveled(
                LeveledCompaction::default()
                    .max_levels(3)
                    .level0_file_number_compaction_trigger(2),
            ));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.max_forest_size, 8 * 1024 * 1024);
        assert_eq!(config.flush_threshold_bytes(), 4 * 1024 * 1024);
        assert!(!config.wal_sync);
        assert_eq!(config.lock_acquisition_timeout, Duration::from_millis(250));
        assert_eq!(config.minor_compaction_interval, Duration::from_secs(5));
        assert_eq!(config.default_compaction_strategy.max_level_or_tier(), 3);
    }

    #[test]
    fn test_tiered_max_tier() {
        let strategy = CompactionStrategy::Tiered(TieredCompaction::default().number_of_tiers(4));
        assert_eq!(strategy.max_level_or_tier(), 3);
    }
}

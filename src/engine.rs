//! The public entry point.
//!
//! Opening an engine recovers its state from disk:
//!
//! 1. lock the directory against other processes
//! 2. replay the manifest and open one tree per live store
//! 3. replay the WAL into every tree above what its files already hold
//! 4. continue TSN assignment after the highest TSN seen anywhere
//! 5. start the periodic background tasks

use crate::config::{CompactionStrategy, EngineConfig};
use crate::error::Result;
use crate::flock::DirectoryLock;
use crate::lsm::{CompactionResult, FlushResult, StoreReport, WorkerPool};
use crate::manifest::ManifestFile;
use crate::model::{StoreId, Tsn};
use crate::scheduler::{Scheduler, TaskStats};
use crate::store::tasks::{CheckpointTask, FlushTask, GarbageCollectionTask, MinorCompactionTask};
use crate::store::StoreManager;
use crate::txn::{Killswitch, Transaction, TransactionManager, TransactionMode};
use crate::wal::{WalOptions, WriteAheadLog};
use crate::Error;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct EngineReport {
    pub last_visible_tsn: Tsn,
    pub open_transactions: usize,
    pub forest_size: usize,
    pub wal_segments: usize,
    pub stores: Vec<StoreReport>,
    /// Empty when background tasks are disabled.
    pub background_tasks: Vec<TaskStats>,
}

struct Background {
    scheduler: Scheduler,
    pool: WorkerPool,
}

/// An embedded transactional key-value engine.
///
/// Maintenance operations that wait for flushes or compactions block the
/// calling thread and must not be called from async code.
pub struct Engine {
    config: EngineConfig,
    _lock: DirectoryLock,
    wal: Arc<WriteAheadLog>,
    stores: Arc<StoreManager>,
    transactions: Arc<TransactionManager>,
    killswitch: Arc<Killswitch>,
    background: Mutex<Option<Background>>,
    closed: AtomicBool,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = DirectoryLock::lock(&config.dir)?;

        let manifest = Arc::new(ManifestFile::open(&config.dir)?);
        let stores = StoreManager::open(&config, manifest.clone())?;

        let wal = Arc::new(WriteAheadLog::open(
            &config.dir,
            WalOptions {
                max_file_size: config.max_wal_file_size,
                min_files: config.min_wal_files,
                sync: config.wal_sync,
            },
        )?);
        let wal_tsn = match Self::replay_wal(&wal, &stores) {
            Ok(tsn) => tsn,
            Err(e) => {
                stores.close(SHUTDOWN_TIMEOUT);
                return Err(e);
            }
        };

        let last_tsn = wal_tsn
            .max(manifest.get_manifest().max_tsn())
            .max(stores.high_watermark_tsn());

        let killswitch = Arc::new(Killswitch::new());
        let transactions =
            TransactionManager::new(stores.clone(), wal.clone(), killswitch.clone(), last_tsn, &config);

        let horizon_source = Arc::downgrade(&transactions);
        stores.set_horizon_provider(Arc::new(move || {
            horizon_source
                .upgrade()
                .map_or(0, |transactions| transactions.get_smallest_open_read_tsn())
        }));

        let (panic_transactions, panic_stores) = (Arc::downgrade(&transactions), Arc::downgrade(&stores));
        killswitch.set_handler(Box::new(move |message| {
            if let Some(transactions) = panic_transactions.upgrade() {
                transactions.close_panic(message);
            }
            if let Some(stores) = panic_stores.upgrade() {
                stores.interrupt();
            }
        }));

        let engine = Self {
            _lock: lock,
            wal,
            stores,
            transactions,
            killswitch,
            background: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        };
        if engine.config.background_tasks {
            engine.start_background_tasks()?;
        }

        tracing::info!(
            dir = %engine.config.dir.display(),
            stores = engine.stores.all_stores().len(),
            last_tsn,
            "Engine opened"
        );
        Ok(engine)
    }

    /// Re-inserts logged transactions that no store file holds yet.
    fn replay_wal(wal: &WriteAheadLog, stores: &StoreManager) -> Result<Tsn> {
        let mut replayed = 0usize;
        let last_tsn = wal.read_wal_streaming(|transaction| {
            for (store_id, commands) in transaction.stores {
                let Some(tree) = stores.get_store(&store_id) else {
                    tracing::debug!(store = %store_id, tsn = transaction.tsn, "Skipping WAL entry of deleted store");
                    continue;
                };
                if transaction.tsn <= tree.persisted_tsn() {
                    continue;
                }
                tree.put_all(commands)?;
                tree.record_highest_written_tsn(transaction.tsn);
                replayed += 1;
            }
            Ok(())
        })?;
        tracing::info!(replayed, last_tsn, "Recovered in-memory data from the WAL");
        Ok(last_tsn)
    }

    fn start_background_tasks(&self) -> Result<()> {
        let pool = WorkerPool::new("background", 2)?;
        let scheduler = Scheduler::new(pool.handle()?);
        let config = &self.config;
        scheduler
            .register(Arc::new(FlushTask::new(self.stores.clone(), config.flush_interval)))
            .register(Arc::new(MinorCompactionTask::new(
                self.stores.clone(),
                config.minor_compaction_interval,
            )))
            .register(Arc::new(GarbageCollectionTask::new(
                self.stores.clone(),
                config.garbage_collection_interval,
            )))
            .register(Arc::new(CheckpointTask::new(
                self.stores.clone(),
                self.wal.clone(),
                config.checkpoint_interval,
            )));
        *self.background.lock() = Some(Background { scheduler, pool });
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        self.transactions.check_open()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn last_visible_tsn(&self) -> Tsn {
        self.transactions.last_visible_tsn()
    }

    /// Creates a store with the configured default compaction strategy.
    pub fn create_store(&self, store_id: &StoreId) -> Result<Tsn> {
        self.create_store_with_strategy(store_id, self.config.default_compaction_strategy.clone())
    }

    /// Creates a store visible to every transaction that begins afterwards.
    /// Returns the TSN the store became visible at.
    pub fn create_store_with_strategy(&self, store_id: &StoreId, strategy: CompactionStrategy) -> Result<Tsn> {
        self.check_open()?;
        self.transactions.with_commit_lock(|tsn| {
            self.stores.create_store(store_id, tsn, strategy)?;
            Ok(tsn)
        })
    }

    /// Deletes a store for every transaction that begins afterwards. Older
    /// snapshots keep seeing it.
    pub fn delete_store(&self, store_id: &StoreId) -> Result<Tsn> {
        self.check_open()?;
        self.transactions.with_commit_lock(|tsn| {
            self.stores.delete_store(store_id, tsn)?;
            Ok(tsn)
        })
    }

    /// Ids of the stores visible to new transactions.
    pub fn store_ids(&self) -> Result<Vec<StoreId>> {
        self.check_open()?;
        let tsn = self.last_visible_tsn();
        Ok(self
            .stores
            .all_stores()
            .iter()
            .filter(|tree| tree.is_visible_at(tsn))
            .map(|tree| tree.store_id().clone())
            .collect())
    }

    pub fn begin_read_only(&self) -> Result<Transaction> {
        self.transactions.begin_read_only()
    }

    pub fn begin_read_write(&self) -> Result<Transaction> {
        self.transactions.begin_read_write()
    }

    pub fn begin_read_write_with_timeout(&self, timeout: Duration) -> Result<Transaction> {
        self.transactions.begin(TransactionMode::ReadWrite, timeout)
    }

    pub fn begin_exclusive(&self) -> Result<Transaction> {
        self.transactions.begin_exclusive()
    }

    pub fn begin_exclusive_with_timeout(&self, timeout: Duration) -> Result<Transaction> {
        self.transactions.begin(TransactionMode::Exclusive, timeout)
    }

    fn live_store(&self, store_id: &StoreId) -> Result<Arc<crate::lsm::LsmTree>> {
        self.check_open()?;
        self.stores
            .get_store(store_id)
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))
    }

    /// Writes the in-memory data of the store to disk and waits for it.
    pub fn flush(&self, store_id: &StoreId) -> Result<Option<FlushResult>> {
        self.live_store(store_id)?.schedule_flush(0).wait()
    }

    pub fn flush_all(&self) -> Result<Vec<FlushResult>> {
        self.check_open()?;
        self.stores.flush_all()
    }

    /// Runs the compaction the store's strategy asks for and waits for it.
    pub fn compact_minor(&self, store_id: &StoreId) -> Result<Option<CompactionResult>> {
        self.live_store(store_id)?.schedule_minor_compaction().wait()
    }

    /// Merges every file of the store into its highest level or tier.
    pub fn compact_major(&self, store_id: &StoreId) -> Result<Option<CompactionResult>> {
        self.live_store(store_id)?.schedule_major_compaction().wait()
    }

    /// Deletes unused files and drops deleted stores no reader can see.
    pub fn collect_garbage(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.stores.perform_garbage_collection())
    }

    /// Flushes every store and shortens the WAL. Returns the number of
    /// removed WAL segments.
    pub fn checkpoint(&self) -> Result<usize> {
        self.check_open()?;
        self.stores.checkpoint(&self.wal)
    }

    pub fn report(&self) -> Result<EngineReport> {
        self.check_open()?;
        Ok(EngineReport {
            last_visible_tsn: self.last_visible_tsn(),
            open_transactions: self.transactions.open_transaction_count(),
            forest_size: self.stores.forest().forest_size(),
            wal_segments: self.wal.segment_count(),
            stores: self.stores.reports(),
            background_tasks: self
                .background
                .lock()
                .as_ref()
                .map(|background| background.scheduler.stats())
                .unwrap_or_default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn killswitch(&self) -> &Killswitch {
        &self.killswitch
    }

    /// Stops background work and rejects further operations. Data of
    /// committed transactions stays recoverable from the WAL.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.killswitch.disable();
        self.transactions.close();

        if let Some(mut background) = self.background.lock().take() {
            background.scheduler.signal_shutdown();
            background.pool.shutdown(SHUTDOWN_TIMEOUT);
        }
        self.stores.close(SHUTDOWN_TIMEOUT);
        let synced = self.wal.sync();
        tracing::info!(dir = %self.config.dir.display(), "Engine closed");
        synced
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close engine cleanly");
        }
    }
}

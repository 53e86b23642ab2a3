//! The collection of stores of an engine.
//!
//! [`StoreManager`] owns one [`LsmTree`] per store together with everything
//! the trees share: the worker pools executing flushes and compactions, the
//! forest memory manager and the header cache.

pub mod tasks;

use crate::config::{CompactionStrategy, EngineConfig};
use crate::error::Result;
use crate::lsm::{
    header_cache, CompactionResult, FlushDispatcher, FlushResult, ForestMemoryManager,
    HeaderCache, HorizonProvider, Interrupt, LsmTree, StoreReport, TaskHandle, TreeContext,
    WorkerPool,
};
use crate::manifest::ManifestFile;
use crate::model::{StoreId, Tsn};
use crate::sstable::CompressionType;
use crate::wal::WriteAheadLog;
use crate::Error;

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const STORES_DIR: &str = "stores";

/// The stores of an engine, keyed by id.
pub type Stores = BTreeMap<StoreId, Arc<LsmTree>>;

pub struct StoreManager {
    root: PathBuf,
    manifest: Arc<ManifestFile>,
    stores: RwLock<Stores>,
    forest: Arc<ForestMemoryManager>,
    header_cache: Arc<dyn HeaderCache>,
    horizon: Arc<RwLock<Option<HorizonProvider>>>,
    interrupt: Interrupt,
    flush_pool: Mutex<WorkerPool>,
    compaction_pool: Mutex<WorkerPool>,
    max_block_size: usize,
    compression: CompressionType,
    max_file_size: u64,
    flush_threshold: usize,
    closed: AtomicBool,
}

impl StoreManager {
    /// Opens a tree for every live store of the manifest. Terminated stores
    /// are gone for good after a restart, so their directories are removed.
    pub fn open(config: &EngineConfig, manifest: Arc<ManifestFile>) -> Result<Arc<Self>> {
        let root = config.dir.join(STORES_DIR);
        std::fs::create_dir_all(&root)?;

        let manager = Arc::new(Self {
            root,
            manifest: manifest.clone(),
            stores: RwLock::new(BTreeMap::new()),
            forest: Arc::new(ForestMemoryManager::new(
                config.max_forest_size,
                config.flush_threshold_bytes(),
            )),
            header_cache: header_cache(config.header_cache_capacity),
            horizon: Arc::new(RwLock::new(None)),
            interrupt: Interrupt::new(),
            flush_pool: Mutex::new(WorkerPool::new("flush", config.flush_threads)?),
            compaction_pool: Mutex::new(WorkerPool::new("compaction", config.compaction_threads)?),
            max_block_size: config.max_block_size,
            compression: config.compression,
            max_file_size: config.max_file_size,
            flush_threshold: config.flush_threshold_bytes(),
            closed: AtomicBool::new(false),
        });
        let dispatcher: Arc<dyn FlushDispatcher> = manager.clone();
        manager.forest.set_flush_dispatcher(Arc::downgrade(&dispatcher));

        let state = manifest.get_manifest();
        let mut stores = BTreeMap::new();
        for metadata in state.stores.values() {
            let dir = manager.store_dir(&metadata.store_id);
            if metadata.is_terminated() {
                if dir.exists() {
                    tracing::info!(store = %metadata.store_id, "Removing files of deleted store");
                    std::fs::remove_dir_all(&dir)?;
                }
                continue;
            }
            let tree = LsmTree::open(dir, metadata, manager.tree_context()?)?;
            stores.insert(metadata.store_id.clone(), Arc::new(tree));
        }
        *manager.stores.write() = stores;
        Ok(manager)
    }

    fn store_dir(&self, store_id: &StoreId) -> PathBuf {
        self.root.join(store_id.as_str())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tree_context(&self) -> Result<TreeContext> {
        let horizon = self.horizon.clone();
        Ok(TreeContext {
            manifest: self.manifest.clone(),
            forest: self.forest.clone(),
            header_cache: self.header_cache.clone(),
            // Until a provider is installed nothing may be dropped.
            horizon: Arc::new(move || horizon.read().as_ref().map_or(0, |provider| provider())),
            interrupt: self.interrupt.clone(),
            flush_runtime: self.flush_pool.lock().handle()?,
            compaction_runtime: self.compaction_pool.lock().handle()?,
            max_block_size: self.max_block_size,
            compression: self.compression,
            max_file_size: self.max_file_size,
        })
    }

    /// Installs the source of the oldest TSN any reader may still use.
    pub fn set_horizon_provider(&self, provider: HorizonProvider) {
        *self.horizon.write() = Some(provider);
    }

    pub fn forest(&self) -> &Arc<ForestMemoryManager> {
        &self.forest
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Creates the store in the manifest and opens its tree.
    pub fn create_store(
        &self,
        store_id: &StoreId,
        valid_from: Tsn,
        compaction_strategy: CompactionStrategy,
    ) -> Result<Arc<LsmTree>> {
        self.check_open()?;
        let mut stores = self.stores.write();
        if stores.contains_key(store_id) || self.manifest.get_manifest().store(store_id).is_some() {
            return Err(Error::StoreAlreadyExists(store_id.to_string()));
        }
        let operation =
            self.manifest
                .append_create_store_operation(store_id, valid_from, compaction_strategy)?;
        tracing::info!(store = %store_id, valid_from, seq = operation.seq(), "Created store");

        let state = self.manifest.get_manifest();
        let metadata = state
            .store(store_id)
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))?;
        let tree = Arc::new(LsmTree::open(self.store_dir(store_id), metadata, self.tree_context()?)?);
        stores.insert(store_id.clone(), tree.clone());
        Ok(tree)
    }

    /// Marks the store as deleted from `valid_to` on. Readers with an older
    /// snapshot keep seeing it until garbage collection drops the tree.
    pub fn delete_store(&self, store_id: &StoreId, valid_to: Tsn) -> Result<()> {
        self.check_open()?;
        let stores = self.stores.read();
        let tree = stores
            .get(store_id)
            .filter(|tree| !tree.is_terminated())
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))?;
        self.manifest.append_delete_store_operation(store_id, valid_to)?;
        tree.terminate(valid_to);
        tracing::info!(store = %store_id, valid_to, "Deleted store");
        Ok(())
    }

    pub fn get_store(&self, store_id: &StoreId) -> Option<Arc<LsmTree>> {
        self.stores.read().get(store_id).cloned()
    }

    /// The store as seen by a reader at `tsn`.
    pub fn visible_store(&self, store_id: &StoreId, tsn: Tsn) -> Result<Arc<LsmTree>> {
        self.get_store(store_id)
            .filter(|tree| tree.is_visible_at(tsn))
            .ok_or_else(|| Error::StoreNotFound(store_id.to_string()))
    }

    pub fn all_stores(&self) -> Vec<Arc<LsmTree>> {
        self.stores.read().values().cloned().collect()
    }

    /// Runs `f` while no store can be created or removed.
    pub fn with_store_read_lock<T>(&self, f: impl FnOnce(&Stores) -> T) -> T {
        f(&self.stores.read())
    }

    /// Highest TSN written into any store.
    pub fn high_watermark_tsn(&self) -> Tsn {
        self.stores
            .read()
            .values()
            .map(|tree| tree.highest_written_tsn())
            .max()
            .unwrap_or(0)
    }

    /// Highest TSN up to which every transaction is persisted in the files of
    /// every live store, or `None` without live stores.
    pub fn low_watermark_tsn(&self) -> Option<Tsn> {
        let stores = self.stores.read();
        let live: Vec<&Arc<LsmTree>> = stores.values().filter(|t| !t.is_terminated()).collect();
        if live.is_empty() {
            return None;
        }
        let pending = live
            .iter()
            .filter(|tree| tree.has_in_memory_data())
            .map(|tree| tree.persisted_tsn())
            .min();
        Some(pending.unwrap_or_else(|| live.iter().map(|t| t.highest_written_tsn()).max().unwrap_or(0)))
    }

    /// Deletes unused garbage files of every store and drops deleted stores
    /// that no reader can see anymore. Returns the number of deleted files.
    pub fn perform_garbage_collection(&self) -> usize {
        let horizon = self.horizon.read().as_ref().map_or(0, |provider| provider());
        let mut deleted = 0;
        let mut expired = Vec::new();
        for tree in self.all_stores() {
            deleted += tree.perform_garbage_collection();
            if tree.valid_to().is_some_and(|valid_to| valid_to <= horizon) {
                expired.push(tree);
            }
        }
        for tree in expired {
            let open_cursors = tree
                .file_indices()
                .iter()
                .any(|index| tree.cursor_manager().has_open_cursors(&crate::lsm::file::file_name(*index)));
            if open_cursors {
                continue;
            }
            self.stores.write().remove(tree.store_id());
            self.forest.remove_tree(tree.store_id());
            match std::fs::remove_dir_all(tree.dir()) {
                Ok(()) => tracing::info!(store = %tree.store_id(), "Dropped deleted store"),
                Err(e) => tracing::warn!(store = %tree.store_id(), error = %e, "Failed to remove deleted store"),
            }
        }
        deleted
    }

    /// Flushes the in-memory data of every store and waits for completion.
    pub fn flush_all(&self) -> Result<Vec<FlushResult>> {
        self.check_open()?;
        let handles: Vec<TaskHandle<Option<FlushResult>>> = self
            .all_stores()
            .iter()
            .filter(|tree| tree.has_in_memory_data())
            .map(|tree| tree.schedule_flush(0))
            .collect();
        let mut results = Vec::new();
        let mut errors = Vec::new();
        for handle in handles {
            match handle.wait() {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        Error::aggregate(errors)?;
        Ok(results)
    }

    /// Flushes every store, then drops the WAL segments whose transactions
    /// are now all in store files. Returns the number of removed segments.
    pub fn checkpoint(&self, wal: &WriteAheadLog) -> Result<usize> {
        let flushed = self.flush_all()?;
        let removed = match self.low_watermark_tsn() {
            Some(low_watermark) => wal.shorten(low_watermark)?,
            None => 0,
        };
        tracing::info!(flushed = flushed.len(), removed_segments = removed, "Checkpoint complete");
        Ok(removed)
    }

    /// Requests a minor compaction of every live store.
    pub fn schedule_minor_compactions(&self) -> Vec<TaskHandle<Option<CompactionResult>>> {
        self.all_stores()
            .iter()
            .filter(|tree| !tree.is_terminated())
            .map(|tree| tree.schedule_minor_compaction())
            .collect()
    }

    /// Requests a flush of the largest store while the forest is over its
    /// flush threshold. Covers flush requests that failed earlier.
    pub fn flush_if_over_threshold(&self) {
        if self.forest.forest_size() < self.flush_threshold {
            return;
        }
        let largest = self
            .all_stores()
            .into_iter()
            .max_by_key(|tree| tree.in_memory_bytes());
        if let Some(tree) = largest {
            tracing::debug!(store = %tree.store_id(), forest = self.forest.forest_size(), "Forest over flush threshold");
            drop(tree.schedule_flush(0));
        }
    }

    pub fn reports(&self) -> Vec<StoreReport> {
        self.all_stores().iter().map(|tree| tree.report()).collect()
    }

    /// Cancels running work and releases stalled writers.
    pub fn interrupt(&self) {
        self.interrupt.trigger();
        self.forest.close();
    }

    /// Stops the worker pools, waiting up to `timeout` for running tasks.
    pub fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.forest.close();
        self.flush_pool.lock().shutdown(timeout);
        self.compaction_pool.lock().shutdown(timeout);
        tracing::debug!("Store manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl FlushDispatcher for StoreManager {
    fn dispatch_flush(&self, store_id: &StoreId) {
        // Called from writers that may already hold the store read lock.
        let tree = self.stores.read_recursive().get(store_id).cloned();
        match tree {
            Some(tree) if !self.closed.load(Ordering::Acquire) => drop(tree.schedule_flush(0)),
            _ => tracing::debug!(store = %store_id, "Skipping flush of unavailable store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeveledCompaction, TieredCompaction};
    use crate::model::Command;
    use crate::tmpfs::TempDir;

    fn open(dir: &TempDir) -> Result<(Arc<ManifestFile>, Arc<StoreManager>)> {
        let config = EngineConfig::new(dir.path()).flush_threads(1).compaction_threads(1);
        let manifest = Arc::new(ManifestFile::open(dir.path())?);
        let manager = StoreManager::open(&config, manifest.clone())?;
        Ok((manifest, manager))
    }

    fn id(name: &str) -> StoreId {
        StoreId::new(name).expect("valid store id")
    }

    #[test]
    fn test_create_and_delete_store() -> Result<()> {
        let dir = TempDir::new()?;
        let (_, manager) = open(&dir)?;

        manager.create_store(&id("users"), 1, CompactionStrategy::default())?;
        assert!(matches!(
            manager.create_store(&id("users"), 2, CompactionStrategy::default()),
            Err(Error::StoreAlreadyExists(_))
        ));
        assert!(manager.visible_store(&id("users"), 0).is_err());
        assert!(manager.visible_store(&id("users"), 1).is_ok());

        manager.delete_store(&id("users"), 5)?;
        assert!(manager.visible_store(&id("users"), 4).is_ok());
        assert!(matches!(manager.visible_store(&id("users"), 5), Err(Error::StoreNotFound(_))));
        assert!(matches!(manager.delete_store(&id("users"), 6), Err(Error::StoreNotFound(_))));

        manager.close(Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_watermarks_follow_flushes() -> Result<()> {
        let dir = TempDir::new()?;
        let (_, manager) = open(&dir)?;
        let a = manager.create_store(&id("a"), 1, CompactionStrategy::Tiered(TieredCompaction::default()))?;
        let b = manager.create_store(&id("b"), 2, CompactionStrategy::Leveled(LeveledCompaction::default()))?;
        assert_eq!(manager.low_watermark_tsn(), Some(0));

        a.put_all(vec![Command::put("k", 3, "v")])?;
        a.record_highest_written_tsn(3);
        b.put_all(vec![Command::put("k", 4, "v")])?;
        b.record_highest_written_tsn(4);
        assert_eq!(manager.high_watermark_tsn(), 4);
        assert_eq!(manager.low_watermark_tsn(), Some(0));

        a.flush_in_memory_data_to_disk(0)?;
        assert_eq!(manager.low_watermark_tsn(), Some(0));
        assert_eq!(manager.flush_all()?.len(), 1);
        assert_eq!(manager.low_watermark_tsn(), Some(4));

        manager.close(Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_reopen_drops_deleted_stores() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (_, manager) = open(&dir)?;
            let tree = manager.create_store(&id("gone"), 1, CompactionStrategy::default())?;
            tree.put_all(vec![Command::put("k", 2, "v")])?;
            tree.record_highest_written_tsn(2);
            tree.flush_in_memory_data_to_disk(0)?;
            manager.create_store(&id("kept"), 3, CompactionStrategy::default())?;
            manager.delete_store(&id("gone"), 4)?;
            manager.close(Duration::from_secs(1));
        }

        let (manifest, manager) = open(&dir)?;
        assert!(manager.get_store(&id("gone")).is_none());
        assert!(manager.get_store(&id("kept")).is_some());
        assert!(!manager.root().join("gone").exists());
        assert!(manifest.get_manifest().store(&id("gone")).is_some_and(|s| s.is_terminated()));
        manager.close(Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_garbage_collection_drops_unreadable_deleted_stores() -> Result<()> {
        let dir = TempDir::new()?;
        let (_, manager) = open(&dir)?;
        manager.create_store(&id("old"), 1, CompactionStrategy::default())?;
        manager.delete_store(&id("old"), 2)?;

        manager.set_horizon_provider(Arc::new(|| 1));
        manager.perform_garbage_collection();
        assert!(manager.get_store(&id("old")).is_some());

        manager.set_horizon_provider(Arc::new(|| 2));
        manager.perform_garbage_collection();
        assert!(manager.get_store(&id("old")).is_none());
        assert!(!manager.root().join("old").exists());
        manager.close(Duration::from_secs(1));
        Ok(())
    }
}

//! Admission, TSN assignment and the commit protocol.
//!
//! ```text
//!   commit lock ──► next TSN ──► WAL append ──► tree inserts ──► visible TSN
//! ```
//!
//! One global commit lock serializes commits, so TSN order, WAL order and
//! the order in which trees receive data are the same. A reader's snapshot
//! is the visible TSN at the time it began.

use super::killswitch::Killswitch;
use super::transaction::{Transaction, WriteSet};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{Command, StoreId, Tsn};
use crate::store::StoreManager;
use crate::wal::WriteAheadLog;
use crate::Error;

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Never waits and never writes.
    ReadOnly,
    /// Waits while an exclusive transaction is open.
    ReadWrite,
    /// Waits until no other read-write or exclusive transaction is open.
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ManagerState {
    Open,
    Closed,
    Panicked(String),
}

#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    mode: TransactionMode,
    read_tsn: Tsn,
}

#[derive(Default)]
struct Registry {
    open: HashMap<u64, OpenTransaction>,
    read_write: usize,
    exclusive: usize,
}

impl Registry {
    fn admits(&self, mode: TransactionMode) -> bool {
        match mode {
            TransactionMode::ReadOnly => true,
            TransactionMode::ReadWrite => self.exclusive == 0,
            TransactionMode::Exclusive => self.exclusive == 0 && self.read_write == 0,
        }
    }

    fn count(&mut self, mode: TransactionMode) -> Option<&mut usize> {
        match mode {
            TransactionMode::ReadOnly => None,
            TransactionMode::ReadWrite => Some(&mut self.read_write),
            TransactionMode::Exclusive => Some(&mut self.exclusive),
        }
    }
}

pub struct TransactionManager {
    stores: Arc<StoreManager>,
    wal: Arc<WriteAheadLog>,
    killswitch: Arc<Killswitch>,
    commit_lock: Mutex<()>,
    /// Highest TSN whose effects are visible to new transactions.
    visible_tsn: AtomicU64,
    registry: Mutex<Registry>,
    admission: Condvar,
    next_id: AtomicU64,
    state: RwLock<ManagerState>,
    commit_batch_size: usize,
    lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(
        stores: Arc<StoreManager>,
        wal: Arc<WriteAheadLog>,
        killswitch: Arc<Killswitch>,
        last_tsn: Tsn,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            stores,
            wal,
            killswitch,
            commit_lock: Mutex::new(()),
            visible_tsn: AtomicU64::new(last_tsn),
            registry: Mutex::new(Registry::default()),
            admission: Condvar::new(),
            next_id: AtomicU64::new(1),
            state: RwLock::new(ManagerState::Open),
            commit_batch_size: config.commit_batch_size.max(1),
            lock_timeout: config.lock_acquisition_timeout,
        })
    }

    pub fn stores(&self) -> &Arc<StoreManager> {
        &self.stores
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match &*self.state.read() {
            ManagerState::Open => Ok(()),
            ManagerState::Closed => Err(Error::Closed),
            ManagerState::Panicked(message) => Err(Error::Panicked(message.clone())),
        }
    }

    pub fn last_visible_tsn(&self) -> Tsn {
        self.visible_tsn.load(Ordering::Acquire)
    }

    pub fn begin_read_only(self: &Arc<Self>) -> Result<Transaction> {
        self.begin(TransactionMode::ReadOnly, Duration::ZERO)
    }

    pub fn begin_read_write(self: &Arc<Self>) -> Result<Transaction> {
        self.begin(TransactionMode::ReadWrite, self.lock_timeout)
    }

    pub fn begin_exclusive(self: &Arc<Self>) -> Result<Transaction> {
        self.begin(TransactionMode::Exclusive, self.lock_timeout)
    }

    /// Opens a transaction, waiting up to `timeout` for admission.
    pub fn begin(self: &Arc<Self>, mode: TransactionMode, timeout: Duration) -> Result<Transaction> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();
        while !registry.admits(mode) {
            if self.admission.wait_until(&mut registry, deadline).timed_out() && !registry.admits(mode) {
                tracing::debug!(?mode, timeout_ms = timeout.as_millis() as u64, "Transaction admission timed out");
                return Err(Error::TransactionLockAcquisition(timeout));
            }
            self.check_open()?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Read under the registry lock so the horizon never passes a new reader.
        let read_tsn = self.last_visible_tsn();
        registry.open.insert(id, OpenTransaction { mode, read_tsn });
        if let Some(count) = registry.count(mode) {
            *count += 1;
        }
        drop(registry);

        tracing::trace!(id, ?mode, read_tsn, "Transaction opened");
        Ok(Transaction::new(id, mode, read_tsn, Arc::clone(self)))
    }

    /// Removes a transaction from the open set, wakes waiting admissions and
    /// closes the cursors it left open.
    pub(crate) fn release(&self, id: u64) {
        let mut registry = self.registry.lock();
        let Some(transaction) = registry.open.remove(&id) else {
            return;
        };
        let wake = match registry.count(transaction.mode) {
            Some(count) => {
                *count -= 1;
                true
            }
            None => false,
        };
        drop(registry);
        if wake {
            self.admission.notify_all();
        }
        let orphaned: usize = self
            .stores
            .all_stores()
            .iter()
            .map(|tree| tree.cursor_manager().close_all_cursors(id))
            .sum();
        tracing::trace!(id, orphaned, "Transaction closed");
    }

    pub fn open_transaction_count(&self) -> usize {
        self.registry.lock().open.len()
    }

    /// Oldest snapshot any open or future transaction can read at.
    pub fn get_smallest_open_read_tsn(&self) -> Tsn {
        let registry = self.registry.lock();
        registry
            .open
            .values()
            .map(|t| t.read_tsn)
            .min()
            .unwrap_or_else(|| self.last_visible_tsn())
    }

    /// Runs `f` with the next TSN under the commit lock and makes the TSN
    /// visible if `f` succeeds.
    pub(crate) fn with_commit_lock<T>(&self, f: impl FnOnce(Tsn) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let _commit = self.commit_lock.lock();
        self.check_open()?;
        let tsn = self.last_visible_tsn() + 1;
        let value = f(tsn)?;
        self.visible_tsn.store(tsn, Ordering::Release);
        Ok(value)
    }

    /// Commits `writes` and returns the TSN they became visible at. Without
    /// writes nothing is logged and the current visible TSN is returned.
    pub(crate) fn commit(&self, id: u64, writes: &WriteSet) -> Result<Tsn> {
        self.check_open()?;
        if writes.values().all(BTreeMap::is_empty) {
            return Ok(self.last_visible_tsn());
        }

        self.with_commit_lock(|tsn| {
            self.stores.with_store_read_lock(|stores| {
                let mut targets = Vec::with_capacity(writes.len());
                let mut by_store: BTreeMap<StoreId, Vec<Command>> = BTreeMap::new();
                for (store_id, buffer) in writes.iter().filter(|(_, b)| !b.is_empty()) {
                    let tree = stores
                        .get(store_id)
                        .filter(|tree| !tree.is_terminated())
                        .ok_or_else(|| {
                            Error::Commit(format!("Store '{}' was deleted or does not exist", store_id))
                        })?;
                    targets.push(tree.clone());
                    by_store.insert(
                        store_id.clone(),
                        buffer.values().map(|command| command.with_tsn(tsn)).collect(),
                    );
                }

                if let Err(e) = self.wal.add_committed_transaction(tsn, &by_store) {
                    self.killswitch.panic("Failed to append commit to the WAL", Some(&e));
                    return Err(e);
                }

                for (tree, (_, commands)) in targets.iter().zip(by_store) {
                    if let Err(e) = self.apply(tree, commands) {
                        self.killswitch.panic("Failed to apply a logged commit", Some(&e));
                        return Err(e);
                    }
                    tree.record_highest_written_tsn(tsn);
                }
                tracing::debug!(id, tsn, stores = targets.len(), "Transaction committed");
                Ok(tsn)
            })
        })
    }

    fn apply(&self, tree: &crate::lsm::LsmTree, commands: Vec<Command>) -> Result<()> {
        let mut batch = Vec::new();
        let mut batch_bytes = 0;
        for command in commands {
            batch_bytes += command.byte_size();
            batch.push(command);
            if batch_bytes >= self.commit_batch_size {
                tree.put_all(std::mem::take(&mut batch))?;
                batch_bytes = 0;
            }
        }
        tree.put_all(batch)
    }

    fn transition(&self, next: ManagerState) {
        {
            let mut state = self.state.write();
            if matches!(*state, ManagerState::Panicked(_)) {
                return;
            }
            *state = next;
        }
        // Wake waiting admissions so they observe the new state.
        let _registry = self.registry.lock();
        self.admission.notify_all();
    }

    /// Rejects every new transaction and commit.
    pub fn close(&self) {
        self.transition(ManagerState::Closed);
    }

    /// Moves into the terminal panic state.
    pub fn close_panic(&self, message: &str) {
        self.transition(ManagerState::Panicked(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionStrategy;
    use crate::manifest::ManifestFile;
    use crate::tmpfs::TempDir;
    use crate::wal::WalOptions;
    use std::thread;

    struct Fixture {
        _dir: TempDir,
        stores: Arc<StoreManager>,
        wal: Arc<WriteAheadLog>,
        manager: Arc<TransactionManager>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.stores.close(Duration::from_secs(1));
        }
    }

    fn fixture() -> Result<Fixture> {
        let dir = TempDir::new()?;
        let config = EngineConfig::new(dir.path())
            .flush_threads(1)
            .compaction_threads(1)
            .lock_acquisition_timeout(Duration::from_millis(100));
        let manifest = Arc::new(ManifestFile::open(dir.path())?);
        let stores = StoreManager::open(&config, manifest)?;
        let wal = Arc::new(WriteAheadLog::open(
            dir.path(),
            WalOptions {
                max_file_size: 1 << 20,
                min_files: 1,
                sync: false,
            },
        )?);
        wal.read_wal_streaming(|_| Ok(()))?;
        let manager = TransactionManager::new(stores.clone(), wal.clone(), Arc::new(Killswitch::new()), 0, &config);
        manager.with_commit_lock(|tsn| {
            stores.create_store(&id("items"), tsn, CompactionStrategy::default())
        })?;
        Ok(Fixture {
            _dir: dir,
            stores,
            wal,
            manager,
        })
    }

    fn id(name: &str) -> StoreId {
        StoreId::new(name).expect("valid store id")
    }

    #[test]
    fn test_concurrent_commits_get_unique_ordered_tsns() -> Result<()> {
        let f = fixture()?;
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let manager = f.manager.clone();
                thread::spawn(move || -> Result<Vec<Tsn>> {
                    let mut tsns = Vec::new();
                    for i in 0..10 {
                        let mut txn = manager.begin_read_write()?;
                        txn.put(&id("items"), format!("w{}-{}", w, i), "v")?;
                        tsns.push(txn.commit()?);
                    }
                    Ok(tsns)
                })
            })
            .collect();

        let mut all: Vec<Tsn> = Vec::new();
        for writer in writers {
            all.extend(writer.join().expect("writer thread")?);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 40);
        assert_eq!(f.manager.last_visible_tsn(), 41);
        assert_eq!(f.wal.last_tsn(), 41);
        Ok(())
    }

    #[test]
    fn test_exclusive_waits_for_writers() -> Result<()> {
        let f = fixture()?;
        let writer = f.manager.begin_read_write()?;

        assert!(matches!(
            f.manager.begin_exclusive(),
            Err(Error::TransactionLockAcquisition(_))
        ));

        let waiting = {
            let manager = f.manager.clone();
            thread::spawn(move || manager.begin(TransactionMode::Exclusive, Duration::from_secs(5)).map(|t| t.mode()))
        };
        thread::sleep(Duration::from_millis(20));
        // Readers are never blocked.
        let reader = f.manager.begin_read_only()?;
        writer.rollback();

        assert_eq!(waiting.join().expect("exclusive thread")?, TransactionMode::Exclusive);
        drop(reader);
        assert_eq!(f.manager.open_transaction_count(), 0);
        Ok(())
    }

    #[test]
    fn test_commit_to_deleted_store_fails_without_logging() -> Result<()> {
        let f = fixture()?;
        let mut txn = f.manager.begin_read_write()?;
        txn.put(&id("items"), "k", "v")?;

        f.manager.with_commit_lock(|tsn| f.stores.delete_store(&id("items"), tsn))?;
        let wal_tsn = f.wal.last_tsn();
        assert!(matches!(txn.commit(), Err(Error::Commit(_))));
        assert_eq!(f.wal.last_tsn(), wal_tsn);
        Ok(())
    }

    #[test]
    fn test_empty_commit_keeps_tsn() -> Result<()> {
        let f = fixture()?;
        let before = f.manager.last_visible_tsn();
        let txn = f.manager.begin_read_write()?;
        assert_eq!(txn.commit()?, before);
        assert_eq!(f.manager.last_visible_tsn(), before);
        Ok(())
    }

    #[test]
    fn test_smallest_open_read_tsn() -> Result<()> {
        let f = fixture()?;
        let old_reader = f.manager.begin_read_only()?;
        let mut txn = f.manager.begin_read_write()?;
        txn.put(&id("items"), "k", "v")?;
        let tsn = txn.commit()?;

        assert_eq!(f.manager.get_smallest_open_read_tsn(), old_reader.read_tsn());
        drop(old_reader);
        assert_eq!(f.manager.get_smallest_open_read_tsn(), tsn);
        Ok(())
    }

    #[test]
    fn test_closed_manager_rejects_transactions() -> Result<()> {
        let f = fixture()?;
        let mut txn = f.manager.begin_read_write()?;
        txn.put(&id("items"), "k", "v")?;

        f.manager.close_panic("disk failure");
        assert!(matches!(f.manager.begin_read_only(), Err(Error::Panicked(_))));
        assert!(matches!(txn.commit(), Err(Error::Panicked(_))));

        // Panic is terminal.
        f.manager.close();
        assert!(matches!(f.manager.begin_read_only(), Err(Error::Panicked(_))));
        Ok(())
    }
}

use super::cursor::TransactionalCursor;
use super::manager::{TransactionManager, TransactionMode};
use crate::error::Result;
use crate::lsm::LsmTree;
use crate::model::{Command, KeyAndTsn, StoreId, Tsn};
use crate::Error;

use std::collections::BTreeMap;
use std::sync::Arc;

/// Buffered writes of a transaction, per store and key. Commands carry no
/// TSN until commit.
pub type WriteSet = BTreeMap<StoreId, BTreeMap<Vec<u8>, Command>>;

/// A snapshot of every store at the TSN the transaction began at, plus the
/// transaction's own uncommitted writes.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
pub struct Transaction {
    id: u64,
    mode: TransactionMode,
    read_tsn: Tsn,
    manager: Arc<TransactionManager>,
    writes: WriteSet,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(id: u64, mode: TransactionMode, read_tsn: Tsn, manager: Arc<TransactionManager>) -> Self {
        Self {
            id,
            mode,
            read_tsn,
            manager,
            writes: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// The snapshot this transaction reads.
    pub fn read_tsn(&self) -> Tsn {
        self.read_tsn
    }

    pub fn has_pending_writes(&self) -> bool {
        self.writes.values().any(|buffer| !buffer.is_empty())
    }

    fn store(&self, store_id: &StoreId) -> Result<Arc<LsmTree>> {
        if self.closed {
            return Err(Error::TransactionClosed);
        }
        self.manager.check_open()?;
        self.manager.stores().visible_store(store_id, self.read_tsn)
    }

    pub fn get(&self, store_id: &StoreId, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let tree = self.store(store_id)?;
        let key = key.as_ref();
        if let Some(command) = self.writes.get(store_id).and_then(|buffer| buffer.get(key)) {
            return Ok(command.value().map(<[u8]>::to_vec));
        }
        let found = tree.get_latest_version(&KeyAndTsn::new(key, self.read_tsn))?;
        Ok(found.and_then(|command| command.value().map(<[u8]>::to_vec)))
    }

    fn buffer(&mut self, store_id: &StoreId, command: Command) -> Result<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::ReadOnlyTransaction);
        }
        let tree = self.store(store_id)?;
        if tree.is_terminated() {
            return Err(Error::StoreTerminated(store_id.to_string()));
        }
        self.writes
            .entry(store_id.clone())
            .or_default()
            .insert(command.key.clone(), command);
        Ok(())
    }

    pub fn put(&mut self, store_id: &StoreId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.buffer(store_id, Command::put(key, 0, value))
    }

    pub fn delete(&mut self, store_id: &StoreId, key: impl Into<Vec<u8>>) -> Result<()> {
        self.buffer(store_id, Command::delete(key, 0))
    }

    /// Opens a cursor over the store as this transaction sees it. Writes made
    /// after the cursor was opened are not visible through it.
    pub fn cursor(&self, store_id: &StoreId) -> Result<TransactionalCursor> {
        let tree = self.store(store_id)?;
        let base = tree.open_cursor(self.read_tsn, self.id)?;
        let pending = self.writes.get(store_id).cloned().unwrap_or_default();
        Ok(TransactionalCursor::new(base, pending))
    }

    /// Makes the buffered writes durable and visible. Returns the commit TSN.
    pub fn commit(mut self) -> Result<Tsn> {
        self.closed = true;
        let outcome = self.manager.commit(self.id, &self.writes);
        self.manager.release(self.id);
        outcome
    }

    pub fn rollback(mut self) {
        self.close_without_commit();
    }

    fn close_without_commit(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.has_pending_writes() {
            tracing::debug!(id = self.id, "Transaction rolled back");
        }
        self.writes.clear();
        self.manager.release(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close_without_commit();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("read_tsn", &self.read_tsn)
            .field("closed", &self.closed)
            .finish()
    }
}

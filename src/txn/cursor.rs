use crate::cursor::{BoxedCursor, CloseAction, Cursor, MapCursor, OverlayCursor};
use crate::error::Result;
use crate::lsm::{OwnedCursor, Revocation};
use crate::model::Command;

use std::collections::BTreeMap;
use std::sync::Arc;

/// A store cursor with a transaction's pending writes layered on top.
/// Yields live values only; deleted keys are skipped.
///
/// Once the transaction commits or rolls back, every operation fails with
/// `TransactionClosed`.
pub struct TransactionalCursor {
    inner: OverlayCursor<Vec<u8>, Command>,
    revocation: Revocation,
}

impl TransactionalCursor {
    pub(crate) fn new(store: OwnedCursor, pending: BTreeMap<Vec<u8>, Command>) -> Self {
        let revocation = store.revocation();
        let store: BoxedCursor<Vec<u8>, Command> = Box::new(store);
        let pending: BoxedCursor<Vec<u8>, Command> = Box::new(MapCursor::new(Arc::new(pending)));
        Self {
            inner: OverlayCursor::new(vec![store, pending]),
            revocation,
        }
    }
}

impl Cursor<Vec<u8>, Vec<u8>> for TransactionalCursor {
    fn first(&mut self) -> Result<bool> {
        self.revocation.check()?;
        self.inner.first()
    }

    fn last(&mut self) -> Result<bool> {
        self.revocation.check()?;
        self.inner.last()
    }

    fn next(&mut self) -> Result<bool> {
        self.revocation.check()?;
        self.inner.next()
    }

    fn previous(&mut self) -> Result<bool> {
        self.revocation.check()?;
        self.inner.previous()
    }

    fn seek_exactly_or_next(&mut self, key: &Vec<u8>) -> Result<bool> {
        self.revocation.check()?;
        self.inner.seek_exactly_or_next(key)
    }

    fn seek_exactly_or_previous(&mut self, key: &Vec<u8>) -> Result<bool> {
        self.revocation.check()?;
        self.inner.seek_exactly_or_previous(key)
    }

    fn invalidate(&mut self) {
        self.inner.invalidate()
    }

    fn key(&self) -> Option<&Vec<u8>> {
        if self.revocation.is_revoked() {
            return None;
        }
        self.inner.key()
    }

    fn value(&self) -> Option<&Vec<u8>> {
        if self.revocation.is_revoked() {
            return None;
        }
        self.inner.value().map(|command| &command.value)
    }

    fn is_open(&self) -> bool {
        !self.revocation.is_revoked() && self.inner.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.inner.on_close(action)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

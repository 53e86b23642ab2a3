use crate::cursor::{BoxedCursor, CloseAction, Cursor};
use crate::error::Result;
use crate::model::Command;
use crate::Error;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies the transaction a cursor was opened for.
pub type OwnerId = u64;

/// Set when the owner of a cursor ended while the cursor was still open.
#[derive(Clone, Default)]
pub struct Revocation(Arc<AtomicBool>);

impl Revocation {
    pub fn is_revoked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn check(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(Error::TransactionClosed);
        }
        Ok(())
    }
}

struct Registered {
    owner: OwnerId,
    files: Vec<String>,
    revocation: Revocation,
}

#[derive(Default)]
struct Registry {
    /// file name -> ids of the cursors reading it
    by_file: HashMap<String, HashSet<u64>>,
    cursors: HashMap<u64, Registered>,
}

impl Registry {
    fn remove(&mut self, cursor_id: u64) -> Option<Registered> {
        let cursor = self.cursors.remove(&cursor_id)?;
        for file in &cursor.files {
            if let Some(ids) = self.by_file.get_mut(file) {
                ids.remove(&cursor_id);
                if ids.is_empty() {
                    self.by_file.remove(file);
                }
            }
        }
        Some(cursor)
    }
}

/// Tracks which files of a tree are being iterated and by whom, so that
/// garbage collection never deletes a file under an open cursor and the
/// cursors of a finished transaction can be closed.
#[derive(Default)]
pub struct CursorManager {
    registry: Mutex<Registry>,
    next_cursor_id: AtomicU64,
}

impl CursorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cursor of `owner` over `files`. The returned action
    /// deregisters it and belongs on the cursor's close hooks.
    pub fn register(self: &Arc<Self>, files: Vec<String>, owner: OwnerId) -> (CloseAction, Revocation) {
        let cursor_id = self.next_cursor_id.fetch_add(1, Ordering::Relaxed);
        let revocation = Revocation::default();
        {
            let mut registry = self.registry.lock();
            for file in &files {
                registry.by_file.entry(file.clone()).or_default().insert(cursor_id);
            }
            tracing::trace!(cursor_id, owner, files = files.len(), "Cursor registered");
            registry.cursors.insert(
                cursor_id,
                Registered {
                    owner,
                    files,
                    revocation: revocation.clone(),
                },
            );
        }

        let manager = Arc::clone(self);
        let release = Box::new(move || {
            if manager.registry.lock().remove(cursor_id).is_some() {
                tracing::trace!(cursor_id, "Cursor deregistered");
            }
            Ok(())
        });
        (release, revocation)
    }

    /// Closes every cursor `owner` still holds: their files are released
    /// and further use of the cursors fails. Returns the number of cursors
    /// closed.
    pub fn close_all_cursors(&self, owner: OwnerId) -> usize {
        let mut registry = self.registry.lock();
        let ids: Vec<u64> = registry
            .cursors
            .iter()
            .filter(|(_, cursor)| cursor.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(cursor) = registry.remove(*id) {
                cursor.revocation.revoke();
            }
        }
        if !ids.is_empty() {
            tracing::debug!(owner, cursors = ids.len(), "Closed cursors of finished transaction");
        }
        ids.len()
    }

    pub fn has_open_cursors(&self, file: &str) -> bool {
        self.registry.lock().by_file.contains_key(file)
    }

    pub fn open_cursor_count(&self, file: &str) -> usize {
        self.registry.lock().by_file.get(file).map_or(0, HashSet::len)
    }

    /// Number of cursors `owner` holds on this tree.
    pub fn cursors_of_owner(&self, owner: OwnerId) -> usize {
        self.registry
            .lock()
            .cursors
            .values()
            .filter(|cursor| cursor.owner == owner)
            .count()
    }
}

/// A tree cursor that stops working once its owner has ended.
pub struct OwnedCursor {
    inner: BoxedCursor<Vec<u8>, Command>,
    revocation: Revocation,
}

impl OwnedCursor {
    pub(crate) fn new(inner: BoxedCursor<Vec<u8>, Command>, revocation: Revocation) -> Self {
        Self { inner, revocation }
    }

    pub fn revocation(&self) -> Revocation {
        self.revocation.clone()
    }
}

impl Cursor<Vec<u8>, Command> for OwnedCursor {
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

    fn value(&self) -> Option<&Command> {
        if self.revocation.is_revoked() {
            return None;
        }
        self.inner.value()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MapCursor;
    use std::collections::BTreeMap;

    #[test]
    fn test_register_and_release() -> Result<()> {
        let manager = Arc::new(CursorManager::new());
        let (first, _) = manager.register(vec!["a.lsm".into(), "b.lsm".into()], 1);
        let (second, _) = manager.register(vec!["b.lsm".into()], 2);

        assert!(manager.has_open_cursors("a.lsm"));
        assert_eq!(manager.open_cursor_count("b.lsm"), 2);
        assert_eq!(manager.cursors_of_owner(1), 1);

        first()?;
        assert!(!manager.has_open_cursors("a.lsm"));
        assert_eq!(manager.open_cursor_count("b.lsm"), 1);

        second()?;
        assert!(!manager.has_open_cursors("b.lsm"));
        assert_eq!(manager.cursors_of_owner(2), 0);
        Ok(())
    }

    #[test]
    fn test_close_all_cursors_of_owner() -> Result<()> {
        let manager = Arc::new(CursorManager::new());
        let entries: BTreeMap<Vec<u8>, Command> = [(b"k".to_vec(), Command::put("k", 1, "v"))].into();

        let (release, revocation) = manager.register(vec!["a.lsm".into()], 5);
        let mut cursor = OwnedCursor::new(Box::new(MapCursor::new(Arc::new(entries))), revocation);
        cursor.on_close(release);
        let (other_release, other) = manager.register(vec!["a.lsm".into()], 6);

        assert!(cursor.first()?);
        assert_eq!(manager.close_all_cursors(5), 1);
        assert_eq!(manager.close_all_cursors(5), 0);
        assert_eq!(manager.cursors_of_owner(5), 0);
        assert_eq!(manager.open_cursor_count("a.lsm"), 1);
        assert!(!other.is_revoked());

        assert!(matches!(cursor.first(), Err(Error::TransactionClosed)));
        assert!(cursor.key().is_none());
        assert!(!cursor.is_open());
        // Closing a revoked cursor runs its deregistration again harmlessly.
        cursor.close()?;

        other_release()?;
        assert!(!manager.has_open_cursors("a.lsm"));
        Ok(())
    }
}

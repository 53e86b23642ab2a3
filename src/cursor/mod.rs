//! Bidirectional cursors and the combinators that compose them into the read path.
//!
//! A cursor starts unpositioned. `first`, `last` and the two seeks either
//! position it or leave it unpositioned; `next` and `previous` at an edge
//! return `false` and keep the current position, which lets composite cursors
//! retry or change direction without losing their place.
//!
//! ```text
//!                  OverlayCursor (user key -> Command)
//!        ┌──────────────┬──────────────┬──────────────┐
//!  VersioningCursor VersioningCursor VersioningCursor VersioningCursor
//!        │              │              │              │
//!  LevelOrTierCursor FileCursor    MemtableCursor  MemtableCursor
//!   (level N files)  (level 0)       (sealed)        (active)
//! ```
//!
//! Composite cursors own their children: a child is moved into its parent as a
//! `Box<dyn Cursor>` and can no longer be reached from outside. Closing a
//! parent closes every child and reports all failures together.

pub mod boundary;
pub mod empty;
pub mod level_or_tier;
pub mod map;
pub mod memtable;
pub mod overlay;
pub mod versioning;

pub use boundary::BoundaryCheckingCursor;
pub use empty::EmptyCursor;
pub use level_or_tier::{FileRange, LevelOrTierCursor};
pub use map::MapCursor;
pub use memtable::MemtableCursor;
pub use overlay::OverlayCursor;
pub use versioning::VersioningCursor;

use crate::error::Result;
use crate::Error;
use std::marker::PhantomData;

/// Action run exactly once when a cursor closes.
pub type CloseAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// A cursor as it is passed between layers.
pub type BoxedCursor<K, V> = Box<dyn Cursor<K, V>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

pub trait Cursor<K, V>: Send {
    /// Moves to the smallest key. Unpositioned if the cursor is empty.
    fn first(&mut self) -> Result<bool>;

    /// Moves to the largest key. Unpositioned if the cursor is empty.
    fn last(&mut self) -> Result<bool>;

    /// Moves to the next larger key. Keeps the position at the last key.
    fn next(&mut self) -> Result<bool>;

    /// Moves to the next smaller key. Keeps the position at the first key.
    fn previous(&mut self) -> Result<bool>;

    /// Moves to `key` or the smallest key above it.
    fn seek_exactly_or_next(&mut self, key: &K) -> Result<bool>;

    /// Moves to `key` or the largest key below it.
    fn seek_exactly_or_previous(&mut self, key: &K) -> Result<bool>;

    /// Drops the current position.
    fn invalidate(&mut self);

    fn key(&self) -> Option<&K>;

    fn value(&self) -> Option<&V>;

    fn is_positioned(&self) -> bool {
        self.key().is_some()
    }

    fn is_open(&self) -> bool;

    /// Registers an action to run when the cursor closes.
    fn on_close(&mut self, action: CloseAction);

    /// Closes this cursor and everything it owns. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Open/closed bookkeeping and close actions shared by all cursor types.
///
/// Dropping an unclosed lifecycle runs the pending close actions, so a cursor
/// that is simply dropped still releases its registrations.
#[derive(Default)]
pub struct CursorLifecycle {
    closed: bool,
    actions: Vec<CloseAction>,
}

impl CursorLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn on_close(&mut self, action: CloseAction) {
        if self.closed {
            if let Err(e) = action() {
                tracing::warn!(error = %e, "Close action on closed cursor failed");
            }
            return;
        }
        self.actions.push(action);
    }

    /// Marks the cursor closed, drains `children` (lazily, so an already closed
    /// cursor does not close its children twice) and runs the close actions.
    pub fn close(&mut self, children: impl IntoIterator<Item = Result<()>>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors: Vec<Error> = children.into_iter().filter_map(|r| r.err()).collect();
        for action in self.actions.drain(..) {
            if let Err(e) = action() {
                errors.push(e);
            }
        }
        Error::aggregate(errors)
    }
}

impl Drop for CursorLifecycle {
    fn drop(&mut self) {
        if let Err(e) = self.close(std::iter::empty()) {
            tracing::warn!(error = %e, "Failed to release cursor on drop");
        }
    }
}

/// Iteration helpers available on every cursor.
pub trait CursorExt<K, V>: Cursor<K, V> {
    /// Iterates all entries from the first key upwards.
    fn ascending_entries(&mut self) -> Entries<'_, K, V, Self> {
        Entries::new(self, Direction::Ascending)
    }

    /// Iterates all entries from the last key downwards.
    fn descending_entries(&mut self) -> Entries<'_, K, V, Self> {
        Entries::new(self, Direction::Descending)
    }
}

impl<K, V, C: Cursor<K, V> + ?Sized> CursorExt<K, V> for C {}

pub struct Entries<'a, K, V, C: ?Sized> {
    cursor: &'a mut C,
    direction: Direction,
    started: bool,
    done: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V, C: Cursor<K, V> + ?Sized> Entries<'a, K, V, C> {
    fn new(cursor: &'a mut C, direction: Direction) -> Self {
        Self {
            cursor,
            direction,
            started: false,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<K: Clone, V: Clone, C: Cursor<K, V> + ?Sized> Iterator for Entries<'_, K, V, C> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let moved = match (self.started, self.direction) {
            (false, Direction::Ascending) => self.cursor.first(),
            (false, Direction::Descending) => self.cursor.last(),
            (true, Direction::Ascending) => self.cursor.next(),
            (true, Direction::Descending) => self.cursor.previous(),
        };
        self.started = true;

        match moved {
            Ok(true) => match (self.cursor.key(), self.cursor.value()) {
                (Some(key), Some(value)) => Some(Ok((key.clone(), value.clone()))),
                _ => {
                    self.done = true;
                    Some(Err(Error::CursorNotPositioned))
                }
            },
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::{Command, KeyAndTsn};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Builds a raw `(key, tsn) -> command` cursor from `(key, tsn, value)`
    /// triples, where a `None` value is a tombstone.
    pub fn versioned_cursor(entries: &[(&str, u64, Option<&str>)]) -> BoxedCursor<KeyAndTsn, Command> {
        let map: BTreeMap<KeyAndTsn, Command> = entries
            .iter()
            .map(|(key, tsn, value)| {
                let command = match value {
                    Some(v) => Command::put(key.as_bytes(), *tsn, v.as_bytes()),
                    None => Command::delete(key.as_bytes(), *tsn),
                };
                (command.key_and_tsn(), command)
            })
            .collect();
        Box::new(MapCursor::new(Arc::new(map)))
    }

    /// Builds a plain `key -> Option<value>` cursor.
    pub fn option_cursor(entries: &[(&str, Option<&str>)]) -> BoxedCursor<Vec<u8>, Option<Vec<u8>>> {
        let map: BTreeMap<Vec<u8>, Option<Vec<u8>>> = entries
            .iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), value.map(|v| v.as_bytes().to_vec())))
            .collect();
        Box::new(MapCursor::new(Arc::new(map)))
    }

    pub fn key_str<K: AsRef<[u8]>>(key: &K) -> String {
        String::from_utf8_lossy(key.as_ref()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::option_cursor;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_entries_both_directions() -> Result<()> {
        let mut cursor = option_cursor(&[("a", Some("1")), ("b", Some("2")), ("c", Some("3"))]);

        let keys: Vec<_> = cursor
            .ascending_entries()
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let keys: Vec<_> = cursor
            .descending_entries()
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_close_runs_actions_once() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cursor = option_cursor(&[("a", Some("1"))]);

        let c = counter.clone();
        cursor.on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        cursor.close()?;
        cursor.close()?;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!cursor.is_open());
        assert!(matches!(cursor.first(), Err(Error::CursorClosed)));
        Ok(())
    }

    #[test]
    fn test_drop_runs_pending_actions() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut cursor = option_cursor(&[]);
            let c = counter.clone();
            cursor.on_close(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_aggregates_failures() {
        let mut lifecycle = CursorLifecycle::new();
        lifecycle.on_close(Box::new(|| Err(Error::InvalidState("first".into()))));
        lifecycle.on_close(Box::new(|| Err(Error::InvalidState("second".into()))));

        let children = vec![Err(Error::CursorClosed), Ok(())];
        match lifecycle.close(children) {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

use super::{CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::model::{Command, KeyAndTsn};
use crate::Error;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::Arc;

/// Cursor over an in-memory tree of a store.
///
/// The skip list is append-only, so entries inserted after the cursor was
/// opened may become visible. Readers rely on the versioning layer to hide
/// everything above their snapshot TSN.
pub struct MemtableCursor {
    lifecycle: CursorLifecycle,
    map: Arc<SkipMap<KeyAndTsn, Command>>,
    current: Option<(KeyAndTsn, Command)>,
}

impl MemtableCursor {
    pub fn new(map: Arc<SkipMap<KeyAndTsn, Command>>) -> Self {
        Self {
            lifecycle: CursorLifecycle::new(),
            map,
            current: None,
        }
    }

    fn position(
        entry: Option<crossbeam_skiplist::map::Entry<'_, KeyAndTsn, Command>>,
    ) -> Option<(KeyAndTsn, Command)> {
        entry.map(|e| (e.key().clone(), e.value().clone()))
    }

    fn current_key(&self) -> Result<KeyAndTsn> {
        self.current
            .as_ref()
            .map(|(k, _)| k.clone())
            .ok_or(Error::CursorNotPositioned)
    }
}

impl Cursor<KeyAndTsn, Command> for MemtableCursor {
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        self.current = Self::position(map.front());
        Ok(self.current.is_some())
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        self.current = Self::position(map.back());
        Ok(self.current.is_some())
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let key = self.current_key()?;
        let map = self.map.clone();
        match Self::position(map.lower_bound(Bound::Excluded(&key))) {
            Some(entry) => {
                self.current = Some(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let key = self.current_key()?;
        let map = self.map.clone();
        match Self::position(map.upper_bound(Bound::Excluded(&key))) {
            Some(entry) => {
                self.current = Some(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn seek_exactly_or_next(&mut self, key: &KeyAndTsn) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        self.current = Self::position(map.lower_bound(Bound::Included(key)));
        Ok(self.current.is_some())
    }

    fn seek_exactly_or_previous(&mut self, key: &KeyAndTsn) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        self.current = Self::position(map.upper_bound(Bound::Included(key)));
        Ok(self.current.is_some())
    }

    fn invalidate(&mut self) {
        self.current = None;
    }

    fn key(&self) -> Option<&KeyAndTsn> {
        self.current.as_ref().map(|(k, _)| k)
    }

    fn value(&self) -> Option<&Command> {
        self.current.as_ref().map(|(_, v)| v)
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.lifecycle.on_close(action);
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        self.lifecycle.close(std::iter::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorExt;

    fn memtable() -> Arc<SkipMap<KeyAndTsn, Command>> {
        let map = SkipMap::new();
        for command in [
            Command::put("a", 1, "a1"),
            Command::put("a", 4, "a4"),
            Command::delete("b", 2),
            Command::put("c", 3, "c3"),
        ] {
            map.insert(command.key_and_tsn(), command);
        }
        Arc::new(map)
    }

    #[test]
    fn test_iterates_in_key_and_tsn_order() -> Result<()> {
        let mut cursor = MemtableCursor::new(memtable());
        let keys: Vec<_> = cursor
            .ascending_entries()
            .map(|r| r.map(|(k, _)| k.to_string()))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec!["a@1", "a@4", "b@2", "c@3"]);
        Ok(())
    }

    #[test]
    fn test_floor_seek() -> Result<()> {
        let mut cursor = MemtableCursor::new(memtable());
        assert!(cursor.seek_exactly_or_previous(&KeyAndTsn::new("a", 3))?);
        assert_eq!(cursor.value().and_then(|c| c.value()), Some(&b"a1"[..]));

        assert!(cursor.seek_exactly_or_next(&KeyAndTsn::new("b", 0))?);
        assert!(cursor.value().map(|c| c.is_deletion()).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn test_sees_later_inserts() -> Result<()> {
        let map = memtable();
        let mut cursor = MemtableCursor::new(map.clone());
        assert!(cursor.last()?);

        let command = Command::put("d", 5, "d5");
        map.insert(command.key_and_tsn(), command);
        assert!(cursor.next()?);
        assert_eq!(cursor.key(), Some(&KeyAndTsn::new("d", 5)));
        Ok(())
    }
}

use super::{BoxedCursor, CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::model::{Command, KeyAndTsn};
use crate::Error;

/// User key range of one file. Files without entries have no range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRange {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// Opens a cursor over the file at the given position of the level.
pub type FileOpener = Box<dyn FnMut(usize) -> Result<BoxedCursor<KeyAndTsn, Command>> + Send>;

/// Concatenates the files of one level into a single cursor.
///
/// Files must be sorted by key range and must not overlap; every user key
/// lives in exactly one file. Only one file cursor is open at a time.
pub struct LevelOrTierCursor {
    lifecycle: CursorLifecycle,
    ranges: Vec<Option<FileRange>>,
    opener: FileOpener,
    current: Option<(usize, BoxedCursor<KeyAndTsn, Command>)>,
}

impl LevelOrTierCursor {
    pub fn new(ranges: Vec<Option<FileRange>>, opener: FileOpener) -> Self {
        Self {
            lifecycle: CursorLifecycle::new(),
            ranges,
            opener,
            current: None,
        }
    }

    fn replace_current(&mut self, next: Option<(usize, BoxedCursor<KeyAndTsn, Command>)>) -> Result<()> {
        if let Some((_, mut old)) = std::mem::replace(&mut self.current, next) {
            old.close()?;
        }
        Ok(())
    }

    /// Opens the file at `index` and positions it with `position`. Returns the
    /// cursor if it found an entry.
    fn try_file(
        &mut self,
        index: usize,
        position: impl FnOnce(&mut BoxedCursor<KeyAndTsn, Command>) -> Result<bool>,
    ) -> Result<Option<BoxedCursor<KeyAndTsn, Command>>> {
        if self.ranges[index].is_none() {
            return Ok(None);
        }
        let mut cursor = (self.opener)(index)?;
        match position(&mut cursor) {
            Ok(true) => Ok(Some(cursor)),
            Ok(false) => {
                cursor.close()?;
                Ok(None)
            }
            Err(e) => {
                let _ = cursor.close();
                Err(e)
            }
        }
    }

    /// Positions on the first entry found scanning `indices` in order. The
    /// first file is positioned with `seek`, the rest with `fallback`.
    fn scan(
        &mut self,
        indices: Vec<usize>,
        seek: impl FnOnce(&mut BoxedCursor<KeyAndTsn, Command>) -> Result<bool>,
        fallback: fn(&mut BoxedCursor<KeyAndTsn, Command>) -> Result<bool>,
    ) -> Result<Option<(usize, BoxedCursor<KeyAndTsn, Command>)>> {
        let mut seek = Some(seek);
        for index in indices {
            let found = match seek.take() {
                Some(seek) => self.try_file(index, seek)?,
                None => self.try_file(index, fallback)?,
            };
            if let Some(cursor) = found {
                return Ok(Some((index, cursor)));
            }
        }
        Ok(None)
    }

    fn positioned_index(&self) -> Result<usize> {
        match &self.current {
            Some((index, cursor)) if cursor.is_positioned() => Ok(*index),
            _ => Err(Error::CursorNotPositioned),
        }
    }
}

fn first(cursor: &mut BoxedCursor<KeyAndTsn, Command>) -> Result<bool> {
    cursor.first()
}

fn last(cursor: &mut BoxedCursor<KeyAndTsn, Command>) -> Result<bool> {
    cursor.last()
}

impl Cursor<KeyAndTsn, Command> for LevelOrTierCursor {
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let found = self.scan((0..self.ranges.len()).collect(), first, first)?;
        let positioned = found.is_some();
        self.replace_current(found)?;
        Ok(positioned)
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let found = self.scan((0..self.ranges.len()).rev().collect(), last, last)?;
        let positioned = found.is_some();
        self.replace_current(found)?;
        Ok(positioned)
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let index = self.positioned_index()?;
        if let Some((_, cursor)) = self.current.as_mut() {
            if cursor.next()? {
                return Ok(true);
            }
        }
        match self.scan((index + 1..self.ranges.len()).collect(), first, first)? {
            Some(found) => {
                self.replace_current(Some(found))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let index = self.positioned_index()?;
        if let Some((_, cursor)) = self.current.as_mut() {
            if cursor.previous()? {
                return Ok(true);
            }
        }
        match self.scan((0..index).rev().collect(), last, last)? {
            Some(found) => {
                self.replace_current(Some(found))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn seek_exactly_or_next(&mut self, key: &KeyAndTsn) -> Result<bool> {
        self.lifecycle.check_open()?;
        // First file whose range ends at or after the key.
        let start = self
            .ranges
            .iter()
            .position(|r| matches!(r, Some(r) if r.max_key >= key.key))
            .unwrap_or(self.ranges.len());
        let found = self.scan(
            (start..self.ranges.len()).collect(),
            |c| c.seek_exactly_or_next(key),
            first,
        )?;
        let positioned = found.is_some();
        self.replace_current(found)?;
        Ok(positioned)
    }

    fn seek_exactly_or_previous(&mut self, key: &KeyAndTsn) -> Result<bool> {
        self.lifecycle.check_open()?;
        // Last file whose range starts at or before the key.
        let end = self
            .ranges
            .iter()
            .rposition(|r| matches!(r, Some(r) if r.min_key <= key.key))
            .map(|i| i + 1)
            .unwrap_or(0);
        let found = self.scan(
            (0..end).rev().collect(),
            |c| c.seek_exactly_or_previous(key),
            last,
        )?;
        let positioned = found.is_some();
        self.replace_current(found)?;
        Ok(positioned)
    }

    fn invalidate(&mut self) {
        if let Some((_, cursor)) = self.current.as_mut() {
            cursor.invalidate();
        }
    }

    fn key(&self) -> Option<&KeyAndTsn> {
        self.current.as_ref().and_then(|(_, c)| c.key())
    }

    fn value(&self) -> Option<&Command> {
        self.current.as_ref().and_then(|(_, c)| c.value())
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.lifecycle.on_close(action);
    }

    fn close(&mut self) -> Result<()> {
        let current = &mut self.current;
        self.lifecycle.close(std::iter::once_with(|| match current.take() {
            Some((_, mut cursor)) => cursor.close(),
            None => Ok(()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::testing::versioned_cursor;
    use crate::cursor::CursorExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Files = Vec<Vec<(&'static str, u64, Option<&'static str>)>>;

    fn level(files: Files) -> (LevelOrTierCursor, Arc<AtomicUsize>) {
        let ranges = files
            .iter()
            .map(|entries| {
                let first = entries.first()?;
                let last = entries.last()?;
                Some(FileRange {
                    min_key: first.0.as_bytes().to_vec(),
                    max_key: last.0.as_bytes().to_vec(),
                })
            })
            .collect();
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let opener: FileOpener = Box::new(move |index| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(versioned_cursor(&files[index]))
        });
        (LevelOrTierCursor::new(ranges, opener), opened)
    }

    fn keys(cursor: &mut LevelOrTierCursor) -> Result<Vec<String>> {
        cursor
            .ascending_entries()
            .map(|r| r.map(|(k, _)| k.to_string()))
            .collect()
    }

    #[test]
    fn test_crosses_files_and_skips_empty() -> Result<()> {
        let (mut cursor, _) = level(vec![
            vec![],
            vec![("a", 1, Some("a")), ("b", 2, Some("b"))],
            vec![],
            vec![("c", 1, Some("c")), ("c", 3, None)],
            vec![("e", 1, Some("e"))],
            vec![],
        ]);
        assert_eq!(keys(&mut cursor)?, vec!["a@1", "b@2", "c@1", "c@3", "e@1"]);

        let descending: Vec<_> = cursor
            .descending_entries()
            .map(|r| r.map(|(k, _)| k.to_string()))
            .collect::<Result<_>>()?;
        assert_eq!(descending, vec!["e@1", "c@3", "c@1", "b@2", "a@1"]);
        Ok(())
    }

    #[test]
    fn test_edge_keeps_position() -> Result<()> {
        let (mut cursor, _) = level(vec![vec![("a", 1, Some("a"))], vec![("b", 1, Some("b"))], vec![]]);
        assert!(cursor.last()?);
        assert!(!cursor.next()?);
        assert_eq!(cursor.key(), Some(&KeyAndTsn::new("b", 1)));
        assert!(cursor.previous()?);
        assert!(!cursor.previous()?);
        assert_eq!(cursor.key(), Some(&KeyAndTsn::new("a", 1)));
        Ok(())
    }

    #[test]
    fn test_seek_uses_key_ranges() -> Result<()> {
        let (mut cursor, opened) = level(vec![
            vec![("a", 1, Some("a")), ("c", 1, Some("c"))],
            vec![("f", 1, Some("f")), ("h", 1, Some("h"))],
            vec![("m", 1, Some("m"))],
        ]);

        // Gap between files: lands on the next file without opening the first.
        assert!(cursor.seek_exactly_or_next(&KeyAndTsn::new("d", 0))?);
        assert_eq!(cursor.key(), Some(&KeyAndTsn::new("f", 1)));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        assert!(cursor.seek_exactly_or_previous(&KeyAndTsn::new("k", 0))?);
        assert_eq!(cursor.key(), Some(&KeyAndTsn::new("h", 1)));

        // Same user key with only older versions falls through to the next file.
        assert!(cursor.seek_exactly_or_next(&KeyAndTsn::new("h", 5))?);
        assert_eq!(cursor.key(), Some(&KeyAndTsn::new("m", 1)));

        assert!(!cursor.seek_exactly_or_next(&KeyAndTsn::new("z", 0))?);
        assert!(!cursor.is_positioned());
        assert!(!cursor.seek_exactly_or_previous(&KeyAndTsn::new("0", 0))?);
        assert!(!cursor.is_positioned());
        Ok(())
    }
}

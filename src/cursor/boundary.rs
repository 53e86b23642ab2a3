use super::{BoxedCursor, CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::Error;

/// Remembers that a step in one direction already failed, so exhausted
/// cursors are not asked again until they are repositioned.
pub struct BoundaryCheckingCursor<K, V> {
    lifecycle: CursorLifecycle,
    inner: BoxedCursor<K, V>,
    may_have_next: bool,
    may_have_previous: bool,
}

impl<K, V> BoundaryCheckingCursor<K, V> {
    pub fn new(inner: BoxedCursor<K, V>) -> Self {
        Self {
            lifecycle: CursorLifecycle::new(),
            inner,
            may_have_next: true,
            may_have_previous: true,
        }
    }

    fn reset(&mut self) {
        self.may_have_next = true;
        self.may_have_previous = true;
    }
}

impl<K, V> Cursor<K, V> for BoundaryCheckingCursor<K, V> {
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reset();
        self.inner.first()
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reset();
        self.inner.last()
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        if !self.inner.is_positioned() {
            return Err(Error::CursorNotPositioned);
        }
        if !self.may_have_next {
            return Ok(false);
        }
        let moved = self.inner.next()?;
        if moved {
            self.may_have_previous = true;
        } else {
            self.may_have_next = false;
        }
        Ok(moved)
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        if !self.inner.is_positioned() {
            return Err(Error::CursorNotPositioned);
        }
        if !self.may_have_previous {
            return Ok(false);
        }
        let moved = self.inner.previous()?;
        if moved {
            self.may_have_next = true;
        } else {
            self.may_have_previous = false;
        }
        Ok(moved)
    }

    fn seek_exactly_or_next(&mut self, key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reset();
        self.inner.seek_exactly_or_next(key)
    }

    fn seek_exactly_or_previous(&mut self, key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reset();
        self.inner.seek_exactly_or_previous(key)
    }

    fn invalidate(&mut self) {
        self.reset();
        self.inner.invalidate();
    }

    fn key(&self) -> Option<&K> {
        self.inner.key()
    }

    fn value(&self) -> Option<&V> {
        self.inner.value()
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.lifecycle.on_close(action);
    }

    fn close(&mut self) -> Result<()> {
        let inner = &mut self.inner;
        self.lifecycle.close(std::iter::once_with(|| inner.close()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::testing::option_cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts calls to `next` on the wrapped cursor.
    struct Counting {
        inner: BoxedCursor<Vec<u8>, Option<Vec<u8>>>,
        nexts: Arc<AtomicUsize>,
    }

    impl Cursor<Vec<u8>, Option<Vec<u8>>> for Counting {
        fn first(&mut self) -> Result<bool> {
            self.inner.first()
        }
        fn last(&mut self) -> Result<bool> {
            self.inner.last()
        }
        fn next(&mut self) -> Result<bool> {
            self.nexts.fetch_add(1, Ordering::SeqCst);
            self.inner.next()
        }
        fn previous(&mut self) -> Result<bool> {
            self.inner.previous()
        }
        fn seek_exactly_or_next(&mut self, key: &Vec<u8>) -> Result<bool> {
            self.inner.seek_exactly_or_next(key)
        }
        fn seek_exactly_or_previous(&mut self, key: &Vec<u8>) -> Result<bool> {
            self.inner.seek_exactly_or_previous(key)
        }
        fn invalidate(&mut self) {
            self.inner.invalidate()
        }
        fn key(&self) -> Option<&Vec<u8>> {
            self.inner.key()
        }
        fn value(&self) -> Option<&Option<Vec<u8>>> {
            self.inner.value()
        }
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
        fn on_close(&mut self, action: CloseAction) {
            self.inner.on_close(action)
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_exhausted_direction_is_remembered() -> Result<()> {
        let nexts = Arc::new(AtomicUsize::new(0));
        let inner = Counting {
            inner: option_cursor(&[("a", Some("1")), ("b", Some("2"))]),
            nexts: nexts.clone(),
        };
        let mut cursor = BoundaryCheckingCursor::new(Box::new(inner));

        assert!(cursor.last()?);
        assert!(!cursor.next()?);
        assert!(!cursor.next()?);
        assert_eq!(nexts.load(Ordering::SeqCst), 1);
        assert_eq!(cursor.key(), Some(&b"b".to_vec()));

        assert!(cursor.previous()?);
        assert!(cursor.next()?);
        assert_eq!(nexts.load(Ordering::SeqCst), 2);
        assert_eq!(cursor.key(), Some(&b"b".to_vec()));
        Ok(())
    }

    #[test]
    fn test_close_closes_inner() -> Result<()> {
        let mut cursor = BoundaryCheckingCursor::new(option_cursor(&[("a", Some("1"))]));
        cursor.close()?;
        assert!(matches!(cursor.first(), Err(Error::CursorClosed)));
        Ok(())
    }
}

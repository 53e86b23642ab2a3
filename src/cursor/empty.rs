use super::{CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::Error;
use std::marker::PhantomData;

/// A cursor over nothing. Used for stores and files without entries.
pub struct EmptyCursor<K, V> {
    lifecycle: CursorLifecycle,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> EmptyCursor<K, V> {
    pub fn new() -> Self {
        Self {
            lifecycle: CursorLifecycle::new(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for EmptyCursor<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cursor<K, V> for EmptyCursor<K, V> {
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        Ok(false)
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        Ok(false)
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        Err(Error::CursorNotPositioned)
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        Err(Error::CursorNotPositioned)
    }

    fn seek_exactly_or_next(&mut self, _key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        Ok(false)
    }

    fn seek_exactly_or_previous(&mut self, _key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        Ok(false)
    }

    fn invalidate(&mut self) {}

    fn key(&self) -> Option<&K> {
        None
    }

    fn value(&self) -> Option<&V> {
        None
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.lifecycle.on_close(action);
    }

    fn close(&mut self) -> Result<()> {
        self.lifecycle.close(std::iter::empty())
    }
}

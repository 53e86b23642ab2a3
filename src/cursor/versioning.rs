use super::{BoxedCursor, CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::model::{Command, KeyAndTsn, Tsn};
use crate::Error;

/// Projects a `(key, tsn) -> command` cursor onto `key -> command` as of one
/// TSN.
///
/// For each user key the cursor stops only on the newest version whose TSN
/// is at or below the target. When deletions are excluded, a key whose
/// newest visible version is a tombstone is skipped entirely.
pub struct VersioningCursor {
    lifecycle: CursorLifecycle,
    inner: BoxedCursor<KeyAndTsn, Command>,
    tsn: Tsn,
    include_deletions: bool,
}

impl VersioningCursor {
    pub fn new(inner: BoxedCursor<KeyAndTsn, Command>, tsn: Tsn, include_deletions: bool) -> Self {
        Self {
            lifecycle: CursorLifecycle::new(),
            inner,
            tsn,
            include_deletions,
        }
    }

    pub fn tsn(&self) -> Tsn {
        self.tsn
    }

    fn inner_key(&self) -> Result<KeyAndTsn> {
        self.inner.key().cloned().ok_or(Error::CursorNotPositioned)
    }

    fn hidden(&self) -> bool {
        !self.include_deletions && self.inner.value().map(|c| c.is_deletion()).unwrap_or(false)
    }

    /// Moves the inner cursor forward until it leaves `key`.
    fn advance_past_key(&mut self, key: &[u8]) -> Result<bool> {
        loop {
            if !self.inner.next()? {
                return Ok(false);
            }
            if self.inner_key()?.key != key {
                return Ok(true);
            }
        }
    }

    /// Moves the inner cursor backward until it leaves `key`.
    fn retreat_past_key(&mut self, key: &[u8]) -> Result<bool> {
        loop {
            if !self.inner.previous()? {
                return Ok(false);
            }
            if self.inner_key()?.key != key {
                return Ok(true);
            }
        }
    }

    /// Scans forward from the current inner position to the next output entry.
    fn scan_forward(&mut self) -> Result<bool> {
        loop {
            let current = self.inner_key()?;
            if current.tsn > self.tsn {
                if !self.inner.next()? {
                    return Ok(false);
                }
                continue;
            }

            // A newer visible version of the same key supersedes this one.
            if self.inner.next()? {
                let next = self.inner_key()?;
                if next.key == current.key && next.tsn <= self.tsn {
                    continue;
                }
                self.inner.previous()?;
            }

            if self.hidden() {
                if !self.advance_past_key(&current.key)? {
                    return Ok(false);
                }
                continue;
            }
            return Ok(true);
        }
    }

    /// Scans backward from the current inner position. The first visible
    /// version met for each key is its newest one.
    fn scan_backward(&mut self) -> Result<bool> {
        loop {
            let current = self.inner_key()?;
            if current.tsn > self.tsn {
                if !self.inner.previous()? {
                    return Ok(false);
                }
                continue;
            }
            if self.hidden() {
                if !self.retreat_past_key(&current.key)? {
                    return Ok(false);
                }
                continue;
            }
            return Ok(true);
        }
    }

    fn settle(&mut self, found: bool) -> bool {
        if !found {
            self.inner.invalidate();
        }
        found
    }
}

impl Cursor<Vec<u8>, Command> for VersioningCursor {
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let found = self.inner.first()? && self.scan_forward()?;
        Ok(self.settle(found))
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let found = self.inner.last()? && self.scan_backward()?;
        Ok(self.settle(found))
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let saved = self.inner_key()?;
        if self.advance_past_key(&saved.key)? && self.scan_forward()? {
            return Ok(true);
        }
        self.inner.seek_exactly_or_next(&saved)?;
        Ok(false)
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let saved = self.inner_key()?;
        if self.retreat_past_key(&saved.key)? && self.scan_backward()? {
            return Ok(true);
        }
        self.inner.seek_exactly_or_next(&saved)?;
        Ok(false)
    }

    fn seek_exactly_or_next(&mut self, key: &Vec<u8>) -> Result<bool> {
        self.lifecycle.check_open()?;

        // The exact key may only exist at a lower, visible TSN.
        let target = KeyAndTsn::new(key.clone(), self.tsn);
        let exact = self.inner.seek_exactly_or_previous(&target)?
            && self.inner_key()?.key == *key;

        let found = if exact {
            self.scan_forward()?
        } else {
            self.inner.seek_exactly_or_next(&KeyAndTsn::new(key.clone(), 0))? && self.scan_forward()?
        };
        Ok(self.settle(found))
    }

    fn seek_exactly_or_previous(&mut self, key: &Vec<u8>) -> Result<bool> {
        self.lifecycle.check_open()?;
        let target = KeyAndTsn::new(key.clone(), self.tsn);
        let found = self.inner.seek_exactly_or_previous(&target)? && self.scan_backward()?;
        Ok(self.settle(found))
    }

    fn invalidate(&mut self) {
        self.inner.invalidate();
    }

    fn key(&self) -> Option<&Vec<u8>> {
        self.inner.key().map(|k| &k.key)
    }

    fn value(&self) -> Option<&Command> {
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

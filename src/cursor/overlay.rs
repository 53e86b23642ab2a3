use super::{BoxedCursor, CloseAction, Cursor, CursorLifecycle, Direction};
use crate::error::Result;
use crate::model::Tombstone;
use crate::Error;

/// Merges prioritized cursors into one ordered cursor.
///
/// Priority follows construction order, the last cursor wins. When several
/// cursors share a key only the highest priority entry is considered; if that
/// entry is a tombstone the key is skipped in every cursor. The merged view
/// never yields tombstones.
pub struct OverlayCursor<K, V> {
    lifecycle: CursorLifecycle,
    cursors: Vec<BoxedCursor<K, V>>,
    /// Sub-cursors that failed to move further in `direction`.
    exhausted: Vec<bool>,
    direction: Direction,
    current: Option<usize>,
}

impl<K, V> OverlayCursor<K, V>
where
    K: Ord + Clone + Send,
    V: Tombstone + Send,
{
    /// Creates an overlay; `cursors` are ordered from lowest to highest priority.
    pub fn new(cursors: Vec<BoxedCursor<K, V>>) -> Self {
        let exhausted = vec![false; cursors.len()];
        Self {
            lifecycle: CursorLifecycle::new(),
            cursors,
            exhausted,
            direction: Direction::Ascending,
            current: None,
        }
    }

    fn active(&self, index: usize) -> bool {
        !self.exhausted[index] && self.cursors[index].is_positioned()
    }

    /// The sub-cursor that comes first in `direction`, ties going to the
    /// higher priority.
    fn select(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for index in 0..self.cursors.len() {
            if !self.active(index) {
                continue;
            }
            best = match best {
                None => Some(index),
                Some(b) => {
                    let (candidate, incumbent) = (self.cursors[index].key(), self.cursors[b].key());
                    let better = match self.direction {
                        Direction::Ascending => candidate <= incumbent,
                        Direction::Descending => candidate >= incumbent,
                    };
                    // Later indices win ties.
                    if better {
                        Some(index)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    /// Steps every active sub-cursor positioned on `key` once in `direction`.
    fn step_all_at(&mut self, key: &K) -> Result<()> {
        for index in 0..self.cursors.len() {
            if !self.active(index) || self.cursors[index].key() != Some(key) {
                continue;
            }
            let moved = match self.direction {
                Direction::Ascending => self.cursors[index].next()?,
                Direction::Descending => self.cursors[index].previous()?,
            };
            if !moved {
                self.exhausted[index] = true;
            }
        }
        Ok(())
    }

    /// Picks the winning sub-cursor, skipping keys whose winner is a tombstone.
    fn resolve(&mut self) -> Result<bool> {
        loop {
            let Some(winner) = self.select() else {
                self.current = None;
                return Ok(false);
            };
            let tombstone = self.cursors[winner]
                .value()
                .map(|v| v.is_tombstone())
                .unwrap_or(false);
            if !tombstone {
                self.current = Some(winner);
                return Ok(true);
            }
            let key = self.cursors[winner].key().cloned().ok_or(Error::CursorNotPositioned)?;
            self.step_all_at(&key)?;
        }
    }

    /// Repositions every sub-cursor with `position` and resolves the winner.
    fn reposition(
        &mut self,
        direction: Direction,
        mut position: impl FnMut(&mut BoxedCursor<K, V>) -> Result<bool>,
    ) -> Result<bool> {
        self.direction = direction;
        for index in 0..self.cursors.len() {
            self.exhausted[index] = !position(&mut self.cursors[index])?;
        }
        let found = self.resolve()?;
        if !found {
            self.invalidate_all();
        }
        Ok(found)
    }

    fn invalidate_all(&mut self) {
        self.current = None;
        for cursor in self.cursors.iter_mut() {
            cursor.invalidate();
        }
    }

    fn current_key(&self) -> Result<K> {
        self.key().cloned().ok_or(Error::CursorNotPositioned)
    }

    fn step(&mut self, direction: Direction) -> Result<bool> {
        let saved = self.current_key()?;

        if self.direction != direction {
            // Each sub-cursor only knows its own position; bring all of them
            // back to the reported key before turning around.
            self.direction = direction;
            for index in 0..self.cursors.len() {
                let cursor = &mut self.cursors[index];
                let positioned = match direction {
                    Direction::Ascending => cursor.seek_exactly_or_next(&saved)?,
                    Direction::Descending => cursor.seek_exactly_or_previous(&saved)?,
                };
                self.exhausted[index] = !positioned;
            }
        }

        self.step_all_at(&saved)?;
        if self.resolve()? {
            return Ok(true);
        }

        // Nothing further in this direction: return to the saved key.
        let restored = match direction {
            Direction::Ascending => self.reposition(direction, |c| c.seek_exactly_or_next(&saved))?,
            Direction::Descending => self.reposition(direction, |c| c.seek_exactly_or_previous(&saved))?,
        };
        if !restored {
            return Err(Error::InvalidState(
                "overlay lost its position while stepping".to_string(),
            ));
        }
        Ok(false)
    }
}

impl<K, V> Cursor<K, V> for OverlayCursor<K, V>
where
    K: Ord + Clone + Send,
    V: Tombstone + Send,
{
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reposition(Direction::Ascending, |c| c.first())
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reposition(Direction::Descending, |c| c.last())
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.step(Direction::Ascending)
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.step(Direction::Descending)
    }

    fn seek_exactly_or_next(&mut self, key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reposition(Direction::Ascending, |c| c.seek_exactly_or_next(key))
    }

    fn seek_exactly_or_previous(&mut self, key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        self.reposition(Direction::Descending, |c| c.seek_exactly_or_previous(key))
    }

    fn invalidate(&mut self) {
        self.invalidate_all();
    }

    fn key(&self) -> Option<&K> {
        self.current.and_then(|i| self.cursors[i].key())
    }

    fn value(&self) -> Option<&V> {
        self.current.and_then(|i| self.cursors[i].value())
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.lifecycle.on_close(action);
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        let cursors = &mut self.cursors;
        self.lifecycle.close(cursors.iter_mut().map(|c| c.close()))
    }
}

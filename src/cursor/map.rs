use super::{CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::Error;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Cursor over an immutable, shared `BTreeMap`.
///
/// Serves transaction write buffers and tests. The current entry is cloned
/// out of the map so the cursor does not borrow it.
pub struct MapCursor<K, V> {
    lifecycle: CursorLifecycle,
    map: Arc<BTreeMap<K, V>>,
    current: Option<(K, V)>,
}

impl<K: Ord + Clone, V: Clone> MapCursor<K, V> {
    pub fn new(map: Arc<BTreeMap<K, V>>) -> Self {
        Self {
            lifecycle: CursorLifecycle::new(),
            map,
            current: None,
        }
    }

    fn position(&mut self, entry: Option<(&K, &V)>) -> bool {
        self.current = entry.map(|(k, v)| (k.clone(), v.clone()));
        self.current.is_some()
    }

    fn step(&mut self, entry: Option<(K, V)>) -> bool {
        match entry {
            Some(entry) => {
                self.current = Some(entry);
                true
            }
            None => false,
        }
    }

    fn current_key(&self) -> Result<&K> {
        self.current
            .as_ref()
            .map(|(k, _)| k)
            .ok_or(Error::CursorNotPositioned)
    }
}

impl<K, V> Cursor<K, V> for MapCursor<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        Ok(self.position(map.iter().next()))
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        Ok(self.position(map.iter().next_back()))
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let key = self.current_key()?;
        let entry = self
            .map
            .range::<K, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(self.step(entry))
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let key = self.current_key()?;
        let entry = self
            .map
            .range::<K, _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(self.step(entry))
    }

    fn seek_exactly_or_next(&mut self, key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        Ok(self.position(map.range::<K, _>((Bound::Included(key), Bound::Unbounded)).next()))
    }

    fn seek_exactly_or_previous(&mut self, key: &K) -> Result<bool> {
        self.lifecycle.check_open()?;
        let map = self.map.clone();
        Ok(self.position(
            map.range::<K, _>((Bound::Unbounded, Bound::Included(key)))
                .next_back(),
        ))
    }

    fn invalidate(&mut self) {
        self.current = None;
    }

    fn key(&self) -> Option<&K> {
        self.current.as_ref().map(|(k, _)| k)
    }

    fn value(&self) -> Option<&V> {
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

    fn cursor() -> MapCursor<u32, &'static str> {
        let map: BTreeMap<u32, &'static str> = [(10, "ten"), (20, "twenty"), (30, "thirty")]
            .into_iter()
            .collect();
        MapCursor::new(Arc::new(map))
    }

    #[test]
    fn test_seeks() -> Result<()> {
        let mut c = cursor();
        assert!(c.seek_exactly_or_next(&15)?);
        assert_eq!(c.key(), Some(&20));
        assert!(c.seek_exactly_or_previous(&15)?);
        assert_eq!(c.key(), Some(&10));
        assert!(c.seek_exactly_or_next(&30)?);
        assert_eq!(c.value(), Some(&"thirty"));

        assert!(!c.seek_exactly_or_next(&31)?);
        assert!(!c.is_positioned());
        assert!(!c.seek_exactly_or_previous(&9)?);
        assert!(!c.is_positioned());
        Ok(())
    }

    #[test]
    fn test_edges_keep_position() -> Result<()> {
        let mut c = cursor();
        assert!(c.last()?);
        assert!(!c.next()?);
        assert_eq!(c.key(), Some(&30));
        assert!(c.previous()?);
        assert_eq!(c.key(), Some(&20));

        assert!(c.first()?);
        assert!(!c.previous()?);
        assert_eq!(c.key(), Some(&10));
        Ok(())
    }

    #[test]
    fn test_next_requires_position() {
        let mut c = cursor();
        assert!(matches!(c.next(), Err(Error::CursorNotPositioned)));
        assert!(matches!(c.previous(), Err(Error::CursorNotPositioned)));
    }
}

//! Memory accounting across the in-memory data of all trees.
//!
//! Every tree reports inserts before they happen and flushes after they
//! happen. Two sizes are tracked per tree: the *actual* size is the memory
//! really held and is used to stall writers once the forest is full; the
//! *virtual* size is reset whenever a flush is requested for the tree and
//! decides which tree gets flushed next.

use crate::error::Result;
use crate::model::StoreId;
use crate::Error;

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const STALL_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Receives flush requests from the memory manager.
pub trait FlushDispatcher: Send + Sync {
    fn dispatch_flush(&self, store_id: &StoreId);
}

#[derive(Debug, Default, Clone, Copy)]
struct TreeSize {
    actual: usize,
    virtual_size: usize,
}

#[derive(Default)]
struct ForestState {
    trees: HashMap<StoreId, TreeSize>,
    actual_total: usize,
    virtual_total: usize,
}

impl ForestState {
    fn largest_by(&self, size: impl Fn(&TreeSize) -> usize) -> Option<StoreId> {
        self.trees
            .iter()
            .filter(|(_, s)| size(s) > 0)
            .max_by_key(|(_, s)| size(s))
            .map(|(id, _)| id.clone())
    }
}

pub struct ForestMemoryManager {
    max_forest_size: usize,
    flush_threshold: usize,
    state: Mutex<ForestState>,
    space_freed: Condvar,
    dispatcher: RwLock<Option<Weak<dyn FlushDispatcher>>>,
    closed: AtomicBool,
}

impl ForestMemoryManager {
    pub fn new(max_forest_size: usize, flush_threshold: usize) -> Self {
        Self {
            max_forest_size: max_forest_size.max(1),
            flush_threshold: flush_threshold.max(1),
            state: Mutex::new(ForestState::default()),
            space_freed: Condvar::new(),
            dispatcher: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_flush_dispatcher(&self, dispatcher: Weak<dyn FlushDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    fn dispatch(&self, store_id: &StoreId) {
        let dispatcher = self.dispatcher.read().as_ref().and_then(Weak::upgrade);
        match dispatcher {
            Some(dispatcher) => {
                tracing::debug!(store = %store_id, "Dispatching flush");
                dispatcher.dispatch_flush(store_id);
            }
            None => tracing::trace!(store = %store_id, "No flush dispatcher registered"),
        }
    }

    /// Blocks while the forest is full, then accounts `bytes` for the tree.
    pub fn on_before_in_memory_insert(&self, store_id: &StoreId, bytes: usize) -> Result<()> {
        let mut state = self.state.lock();
        while state.actual_total >= self.max_forest_size {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            tracing::debug!(
                store = %store_id,
                forest = state.actual_total,
                max = self.max_forest_size,
                "Write stalled on forest size"
            );
            let timed_out = self
                .space_freed
                .wait_for(&mut state, STALL_RECHECK_INTERVAL)
                .timed_out();
            if timed_out && state.actual_total >= self.max_forest_size {
                // The earlier flush request may have failed; ask again.
                if let Some(largest) = state.largest_by(|s| s.actual) {
                    drop(state);
                    self.dispatch(&largest);
                    state = self.state.lock();
                }
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let tree = state.trees.entry(store_id.clone()).or_default();
        tree.actual += bytes;
        tree.virtual_size += bytes;
        state.actual_total += bytes;
        state.virtual_total += bytes;

        let mut to_flush = None;
        if state.virtual_total >= self.flush_threshold {
            if let Some(largest) = state.largest_by(|s| s.virtual_size) {
                if let Some(tree) = state.trees.get_mut(&largest) {
                    let released = std::mem::take(&mut tree.virtual_size);
                    state.virtual_total -= released;
                }
                to_flush = Some(largest);
            }
        }
        drop(state);

        if let Some(store_id) = to_flush {
            self.dispatch(&store_id);
        }
        Ok(())
    }

    /// Records that `released` bytes of the tree left memory. Inserts
    /// accounted concurrently stay counted.
    pub fn on_in_memory_flush(&self, store_id: &StoreId, released: usize) {
        let mut state = self.state.lock();
        let tree = state.trees.entry(store_id.clone()).or_default();
        let (old_actual, old_virtual) = (tree.actual, tree.virtual_size);
        tree.actual = tree.actual.saturating_sub(released);
        tree.virtual_size = tree.virtual_size.min(tree.actual);
        let (new_actual, new_virtual) = (tree.actual, tree.virtual_size);
        state.actual_total = state.actual_total - old_actual + new_actual;
        state.virtual_total = state.virtual_total - old_virtual + new_virtual;
        drop(state);
        self.space_freed.notify_all();
    }

    pub fn remove_tree(&self, store_id: &StoreId) {
        let mut state = self.state.lock();
        if let Some(tree) = state.trees.remove(store_id) {
            state.actual_total -= tree.actual;
            state.virtual_total -= tree.virtual_size;
        }
        drop(state);
        self.space_freed.notify_all();
    }

    pub fn forest_size(&self) -> usize {
        self.state.lock().actual_total
    }

    pub fn virtual_forest_size(&self) -> usize {
        self.state.lock().virtual_total
    }

    pub fn tree_size(&self, store_id: &StoreId) -> usize {
        self.state.lock().trees.get(store_id).map_or(0, |s| s.actual)
    }

    /// Wakes and fails every stalled writer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space_freed.notify_all();
    }
}

//! Per-store LSM trees and the machinery they share: file handles, memory
//! accounting, flush and compaction scheduling, and garbage tracking.

pub mod compaction;
pub mod cursor_manager;
pub mod file;
pub mod forest;
pub mod garbage;
pub mod task_queue;
pub mod tree;

pub use compaction::{CompactionPlan, CompactionTrigger};
pub use cursor_manager::{CursorManager, OwnedCursor, OwnerId, Revocation};
pub use file::{header_cache, HeaderCache, LsmFile};
pub use forest::{FlushDispatcher, ForestMemoryManager};
pub use task_queue::{TaskHandle, TaskKind, TaskQueue, WorkerPool};
pub use tree::{
    CompactionResult, FileReport, FlushResult, HorizonProvider, LayerReport, LsmTree, StoreReport,
    TreeContext,
};

use crate::error::Result;
use crate::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag polled by long-running flushes and merges.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

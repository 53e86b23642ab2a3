//! StrataDB: an embedded, transactional key-value engine.
//!
//! Every named store is an LSM tree. Transactions read consistent
//! snapshots across all stores and commit atomically through a shared
//! write-ahead log.

pub mod cache;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod flock;
pub mod lsm;
pub mod manifest;
pub mod model;
pub mod scheduler;
pub mod sstable;
pub mod store;
pub mod txn;
pub mod wal;

#[cfg(test)]
mod tmpfs;

pub use config::{CompactionStrategy, EngineConfig, LeveledCompaction, TieredCompaction};
pub use cursor::{Cursor, CursorExt};
pub use engine::{Engine, EngineReport};
pub use error::{Error, Result};
pub use model::{Command, KeyAndTsn, StoreId, Tsn};
pub use sstable::CompressionType;
pub use txn::{Transaction, TransactionMode, TransactionalCursor};

//! Transactions over the stores of an engine.
//!
//! A transaction reads a consistent snapshot taken when it began and keeps
//! its writes in a private buffer until commit. Read-write transactions may
//! commit concurrently; the last committer of a key wins.

pub mod cursor;
pub mod killswitch;
pub mod manager;
pub mod transaction;

pub use cursor::TransactionalCursor;
pub use killswitch::Killswitch;
pub use manager::{TransactionManager, TransactionMode};
pub use transaction::{Transaction, WriteSet};

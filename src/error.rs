use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    InvalidData(String),
    ChecksumMismatch(String),
    LockError(io::Error),
    InvalidInput(String),
    InvalidState(String),
    InvalidOperation(String),

    // Admission
    TransactionLockAcquisition(Duration),

    // Consistency violations
    DuplicateEntry(String),
    NonContiguousMerge(String),
    StoreNotFound(String),
    StoreAlreadyExists(String),
    StoreTerminated(String),
    Commit(String),
    ReadOnlyTransaction,
    TransactionClosed,
    CursorClosed,
    CursorNotPositioned,

    // Storage failures wrapped per operation
    FileMissing(PathBuf),
    Flush { store: String, source: Box<Error> },
    Compaction { store: String, source: Box<Error> },

    Aggregate(Vec<Error>),
    Cancelled,
    /// A failure reported to several waiters of the same task.
    Shared(Arc<Error>),

    // Lifecycle
    Panicked(String),
    Closed,
}

impl Error {
    /// Folds a list of failures into a single error, or `Ok` if there were none.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Panicked(_) => true,
            Error::Shared(err) => err.is_fatal(),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(format!("bincode: {}", err))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::ChecksumMismatch(msg) => write!(f, "Checksum mismatch: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::TransactionLockAcquisition(timeout) => write!(
                f,
                "Could not acquire transaction lock within {:?}",
                timeout
            ),
            Error::DuplicateEntry(msg) => write!(f, "Duplicate entry: {}", msg),
            Error::NonContiguousMerge(msg) => write!(f, "Non-contiguous merge: {}", msg),
            Error::StoreNotFound(name) => write!(f, "Store not found: {}", name),
            Error::StoreAlreadyExists(name) => write!(f, "Store already exists: {}", name),
            Error::StoreTerminated(name) => write!(f, "Store has been deleted: {}", name),
            Error::Commit(msg) => write!(f, "Commit failed: {}", msg),
            Error::ReadOnlyTransaction => write!(f, "Transaction is read-only"),
            Error::TransactionClosed => write!(f, "Transaction is already closed"),
            Error::CursorClosed => write!(f, "Cursor is closed"),
            Error::CursorNotPositioned => write!(f, "Cursor is not positioned"),
            Error::FileMissing(path) => write!(f, "File missing: {}", path.display()),
            Error::Flush { store, source } => write!(f, "Flush of store '{}' failed: {}", store, source),
            Error::Compaction { store, source } => {
                write!(f, "Compaction of store '{}' failed: {}", store, source)
            }
            Error::Aggregate(errors) => {
                write!(f, "{} errors occurred:", errors.len())?;
                for err in errors {
                    write!(f, " [{}]", err)?;
                }
                Ok(())
            }
            Error::Cancelled => write!(f, "Task was cancelled"),
            Error::Shared(err) => write!(f, "{}", err),
            Error::Panicked(msg) => write!(f, "Engine is in panic state: {}", msg),
            Error::Closed => write!(f, "Engine is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::Decode(_, err) | Error::LockError(err) => Some(err),
            Error::Flush { source, .. } | Error::Compaction { source, .. } => Some(source.as_ref()),
            Error::Shared(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        assert!(Error::aggregate(Vec::new()).is_ok());

        let single = Error::aggregate(vec![Error::CursorClosed]);
        assert!(matches!(single, Err(Error::CursorClosed)));

        let many = Error::aggregate(vec![Error::CursorClosed, Error::Cancelled]);
        match many {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_display_wraps_source() {
        let err = Error::Flush {
            store: "users".to_string(),
            source: Box::new(Error::InvalidData("bad block".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Flush of store 'users' failed: Invalid data: bad block"
        );
    }
}

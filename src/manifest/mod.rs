//! Durable log of store layout changes.
//!
//! The manifest records which stores exist and which files make up each
//! store, so that the engine can rebuild its trees after a restart. Like the
//! WAL it is an append-only log:
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Operation 1      |
//! +------------------+
//! | Operation 2      |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each operation is framed as:
//!
//! ```text
//! +-----------+---------------------------+-----------+
//! |length:u32 | bincode(ManifestOperation)|crc32:u32  |
//! +-----------+---------------------------+-----------+
//! ```
//!
//! Operations carry consecutive sequence numbers. An operation is validated
//! against the current state, written and synced before the in-memory state
//! changes, so [`ManifestFile::get_manifest`] always reflects every
//! successful append. A record torn by a crash at the end of the log is
//! discarded during replay.

pub mod header;
pub mod metadata;
pub mod operation;

pub use metadata::{FileInfo, Manifest, StoreMetadata};
pub use operation::ManifestOperation;

use crate::config::CompactionStrategy;
use crate::error::Result;
use crate::model::{FileIndex, StoreId, Tsn};
use crate::sstable::CRC32;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use header::{ManifestHeader, HEADER_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MANIFEST_FILE_NAME: &str = "manifest.log";

pub struct ManifestFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    state: RwLock<Arc<Manifest>>,
}

impl ManifestFile {
    /// Opens the manifest in `dir`, creating it if needed, and replays it.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let state = if file.metadata()?.len() == 0 {
            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            file.write_all(&ManifestHeader::new(created_at).encode())?;
            file.sync_all()?;
            Manifest::default()
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact(&mut buf)
                .map_err(|e| Error::Decode("manifest header", e))?;
            ManifestHeader::decode(&buf)?;
            Self::replay(&path, &file)?
        };

        let writer = OpenOptions::new().append(true).open(&path)?;
        tracing::info!(
            path = %path.display(),
            stores = state.stores.len(),
            seq = state.last_sequence_number,
            "Manifest opened"
        );

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(writer)),
            state: RwLock::new(Arc::new(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path, file: &File) -> Result<Manifest> {
        let file_len = file.metadata()?.len();
        let mut manifest = Manifest::default();
        let mut records = ManifestIterator {
            reader: BufReader::new(file.try_clone()?),
            offset: HEADER_SIZE as u64,
            file_len,
        };

        loop {
            let start = records.offset;
            match records.next() {
                None => break,
                Some(Ok(operation)) => operation.apply_to(&mut manifest)?,
                Some(Err(RecordError::Torn)) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = start,
                        "Discarding torn record at the end of the manifest"
                    );
                    file.set_len(start)?;
                    file.sync_all()?;
                    break;
                }
                Some(Err(RecordError::Failed(e))) => return Err(e),
            }
        }
        Ok(manifest)
    }

    /// Returns the current state, including every successful append.
    pub fn get_manifest(&self) -> Arc<Manifest> {
        self.state.read().clone()
    }

    /// Builds an operation from the next sequence number, validates it and
    /// makes it durable.
    pub fn append_operation<F>(&self, factory: F) -> Result<ManifestOperation>
    where
        F: FnOnce(u64) -> ManifestOperation,
    {
        let mut writer = self.writer.lock();

        let current = self.get_manifest();
        let operation = factory(current.last_sequence_number + 1);
        let mut next = current.as_ref().clone();
        operation.apply_to(&mut next)?;

        let bytes = bincode::serialize(&operation)?;
        let checksum = CRC32.checksum(&bytes);
        writer.write_u32::<BigEndian>(bytes.len() as u32)?;
        writer.write_all(&bytes)?;
        writer.write_u32::<BigEndian>(checksum)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        *self.state.write() = Arc::new(next);
        tracing::debug!(seq = operation.seq(), store = %operation.store_id(), "Manifest operation appended");
        Ok(operation)
    }

    pub fn append_create_store_operation(
        &self,
        store_id: &StoreId,
        valid_from: Tsn,
        compaction_strategy: CompactionStrategy,
    ) -> Result<ManifestOperation> {
        self.append_operation(|seq| ManifestOperation::CreateStore {
            seq,
            store_id: store_id.clone(),
            valid_from,
            compaction_strategy,
        })
    }

    pub fn append_delete_store_operation(
        &self,
        store_id: &StoreId,
        valid_to: Tsn,
    ) -> Result<ManifestOperation> {
        self.append_operation(|seq| ManifestOperation::DeleteStore {
            seq,
            store_id: store_id.clone(),
            valid_to,
        })
    }

    pub fn append_flush_operation(
        &self,
        store_id: &StoreId,
        file_index: FileIndex,
    ) -> Result<ManifestOperation> {
        self.append_operation(|seq| ManifestOperation::Flush {
            seq,
            store_id: store_id.clone(),
            file_index,
        })
    }
}

enum RecordError {
    /// The record extends past the end of the file or fails its checksum as
    /// the last record in the file.
    Torn,
    Failed(Error),
}

struct ManifestIterator {
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
}

impl Iterator for ManifestIterator {
    type Item = std::result::Result<ManifestOperation, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.file_len {
            return None;
        }

        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as u64,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Some(Err(RecordError::Torn)),
            Err(e) => return Some(Err(RecordError::Failed(e.into()))),
        };
        let end = self.offset + 4 + len + 4;
        if end > self.file_len {
            return Some(Err(RecordError::Torn));
        }

        let mut bytes = vec![0u8; len as usize];
        if let Err(e) = self.reader.read_exact(&mut bytes) {
            return Some(Err(RecordError::Failed(Error::Decode("manifest record", e))));
        }
        let stored_checksum = match self.reader.read_u32::<BigEndian>() {
            Ok(checksum) => checksum,
            Err(e) => return Some(Err(RecordError::Failed(e.into()))),
        };

        if CRC32.checksum(&bytes) != stored_checksum {
            if end == self.file_len {
                return Some(Err(RecordError::Torn));
            }
            return Some(Err(RecordError::Failed(Error::ChecksumMismatch(format!(
                "manifest record at offset {}",
                self.offset
            )))));
        }
        self.offset = end;

        Some(bincode::deserialize(&bytes).map_err(|e| RecordError::Failed(e.into())))
    }
}

//! Write-ahead log of committed transactions.
//!
//! Every commit is appended here before it becomes visible in any in-memory
//! tree, so that a crash never loses a transaction that reported success.
//! The log is a directory of segment files named after the first TSN they
//! contain (`{:020}.wal`):
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Transaction 1    |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each transaction is framed like a manifest record:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! Segments roll over once they exceed the configured size. Segments whose
//! transactions are all persisted in store files can be removed with
//! [`WriteAheadLog::shorten`].

pub mod record;

pub use record::WalTransaction;

use crate::error::Result;
use crate::model::{Command, StoreId, Tsn};
use crate::sstable::CRC32;
use crate::Error;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const WAL_DIR_NAME: &str = "wal";
pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"STRATAWL";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    pub max_file_size: u64,
    pub min_files: usize,
    pub sync: bool,
}

fn segment_name(first_tsn: Tsn) -> String {
    format!("{:020}.wal", first_tsn)
}

fn parse_segment_name(path: &Path) -> Option<Tsn> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".wal")?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

fn encode_header(first_tsn: Tsn) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..8].copy_from_slice(MAGIC);
    BigEndian::write_u32(&mut buf[8..12], VERSION);
    BigEndian::write_u64(&mut buf[12..20], first_tsn);
    buf
}

fn decode_header(buf: &[u8; HEADER_SIZE], path: &Path) -> Result<Tsn> {
    if &buf[0..8] != MAGIC {
        return Err(Error::InvalidData(format!(
            "Invalid WAL magic number in {}",
            path.display()
        )));
    }
    let version = BigEndian::read_u32(&buf[8..12]);
    if version != VERSION {
        return Err(Error::InvalidData(format!(
            "Unsupported WAL version {} in {}",
            version,
            path.display()
        )));
    }
    Ok(BigEndian::read_u64(&buf[12..20]))
}

struct Segment {
    first_tsn: Tsn,
    writer: BufWriter<File>,
    size: u64,
}

struct WalState {
    /// First TSN of every segment on disk, oldest first.
    segments: BTreeMap<Tsn, PathBuf>,
    current: Option<Segment>,
    last_tsn: Tsn,
}

pub struct WriteAheadLog {
    dir: PathBuf,
    options: WalOptions,
    state: Mutex<WalState>,
}

impl WriteAheadLog {
    /// Opens the log in `<root>/wal`, creating the directory if needed.
    pub fn open(root: &Path, options: WalOptions) -> Result<Self> {
        let dir = root.join(WAL_DIR_NAME);
        fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match parse_segment_name(&path) {
                Some(first_tsn) => {
                    segments.insert(first_tsn, path);
                }
                None => {
                    tracing::warn!(path = %path.display(), "Ignoring unexpected file in WAL directory");
                }
            }
        }

        Ok(Self {
            dir,
            options,
            state: Mutex::new(WalState {
                segments,
                current: None,
                last_tsn: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Highest TSN written or replayed so far.
    pub fn last_tsn(&self) -> Tsn {
        self.state.lock().last_tsn
    }

    /// Appends a committed transaction. TSNs must be strictly increasing.
    pub fn add_committed_transaction(
        &self,
        tsn: Tsn,
        commands_by_store: &BTreeMap<StoreId, Vec<Command>>,
    ) -> Result<()> {
        let record = WalTransaction {
            tsn,
            stores: commands_by_store
                .iter()
                .map(|(store_id, commands)| (store_id.clone(), commands.clone()))
                .collect(),
        };
        let payload = record.encode()?;
        let checksum = CRC32.checksum(&payload);

        let mut state = self.state.lock();
        if tsn <= state.last_tsn {
            return Err(Error::InvalidInput(format!(
                "WAL transaction {} is not after {}",
                tsn, state.last_tsn
            )));
        }

        let roll_over = match &state.current {
            Some(segment) => segment.size >= self.options.max_file_size,
            None => true,
        };
        if roll_over {
            self.open_segment(&mut state, tsn)?;
        }

        let segment = state
            .current
            .as_mut()
            .ok_or_else(|| Error::InvalidState("No open WAL segment".to_string()))?;
        segment.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        segment.writer.write_all(&payload)?;
        segment.writer.write_u32::<BigEndian>(checksum)?;
        segment.writer.flush()?;
        if self.options.sync {
            segment.writer.get_ref().sync_data()?;
        }
        segment.size += payload.len() as u64 + 8;
        state.last_tsn = tsn;
        Ok(())
    }

    /// Continues the newest segment if it has room, otherwise starts a new
    /// segment whose first TSN is `tsn`.
    fn open_segment(&self, state: &mut WalState, tsn: Tsn) -> Result<()> {
        if let Some(mut segment) = state.current.take() {
            segment.writer.flush()?;
            segment.writer.get_ref().sync_all()?;
        } else if let Some((&first_tsn, path)) = state.segments.iter().next_back() {
            let size = fs::metadata(path)?.len();
            if size < self.options.max_file_size {
                let file = OpenOptions::new().append(true).open(path)?;
                state.current = Some(Segment {
                    first_tsn,
                    writer: BufWriter::new(file),
                    size,
                });
                return Ok(());
            }
        }

        let path = self.dir.join(segment_name(tsn));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(&encode_header(tsn))?;
        file.sync_all()?;
        File::open(&self.dir)?.sync_all()?;

        tracing::debug!(path = %path.display(), "Started WAL segment");
        state.segments.insert(tsn, path);
        state.current = Some(Segment {
            first_tsn: tsn,
            writer: BufWriter::new(file),
            size: HEADER_SIZE as u64,
        });
        Ok(())
    }

    /// Replays every transaction in TSN order and returns the highest TSN
    /// seen.
    ///
    /// A torn record at the end of the newest segment is cut off; damage
    /// anywhere else is an error. Must run before the first append.
    pub fn read_wal_streaming<F>(&self, mut on_transaction: F) -> Result<Tsn>
    where
        F: FnMut(WalTransaction) -> Result<()>,
    {
        let mut state = self.state.lock();
        if state.current.is_some() {
            return Err(Error::InvalidState(
                "WAL replay after the first append".to_string(),
            ));
        }

        let segments: Vec<(Tsn, PathBuf)> = state
            .segments
            .iter()
            .map(|(tsn, path)| (*tsn, path.clone()))
            .collect();
        let newest = segments.last().map(|(tsn, _)| *tsn);
        let mut last_tsn = state.last_tsn;
        let mut transactions = 0usize;

        for (first_tsn, path) in segments {
            let is_newest = Some(first_tsn) == newest;
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let file_len = file.metadata()?.len();

            if file_len < HEADER_SIZE as u64 {
                if !is_newest {
                    return Err(Error::InvalidData(format!(
                        "WAL segment {} has no header",
                        path.display()
                    )));
                }
                tracing::warn!(path = %path.display(), "Removing WAL segment with incomplete header");
                drop(file);
                fs::remove_file(&path)?;
                state.segments.remove(&first_tsn);
                continue;
            }

            let mut reader = BufReader::new(file.try_clone()?);
            let mut header = [0u8; HEADER_SIZE];
            reader
                .read_exact(&mut header)
                .map_err(|e| Error::Decode("WAL header", e))?;
            if decode_header(&header, &path)? != first_tsn {
                return Err(Error::InvalidData(format!(
                    "WAL segment {} does not match its header",
                    path.display()
                )));
            }

            let mut offset = HEADER_SIZE as u64;
            while offset < file_len {
                match read_record(&mut reader, offset, file_len) {
                    Ok((payload, end)) => {
                        let txn = WalTransaction::decode(&payload)?;
                        if txn.tsn <= last_tsn {
                            return Err(Error::InvalidData(format!(
                                "WAL transaction {} follows {} in {}",
                                txn.tsn,
                                last_tsn,
                                path.display()
                            )));
                        }
                        last_tsn = txn.tsn;
                        transactions += 1;
                        on_transaction(txn)?;
                        offset = end;
                    }
                    Err(RecordError::Torn) if is_newest => {
                        tracing::warn!(
                            path = %path.display(),
                            offset,
                            "Truncating torn record at the end of the WAL"
                        );
                        file.set_len(offset)?;
                        file.sync_all()?;
                        break;
                    }
                    Err(RecordError::Torn) => {
                        return Err(Error::ChecksumMismatch(format!(
                            "WAL segment {} is damaged at offset {}",
                            path.display(),
                            offset
                        )))
                    }
                    Err(RecordError::Failed(e)) => return Err(e),
                }
            }
        }

        state.last_tsn = last_tsn;
        tracing::info!(transactions, last_tsn, "WAL replayed");
        Ok(last_tsn)
    }

    /// Removes segments that only contain transactions at or below
    /// `low_watermark`, keeping at least the configured minimum number of
    /// segments. Returns the number of removed segments.
    pub fn shorten(&self, low_watermark: Tsn) -> Result<usize> {
        let mut state = self.state.lock();
        let first_tsns: Vec<Tsn> = state.segments.keys().copied().collect();
        let removable = first_tsns.len().saturating_sub(self.options.min_files.max(1));
        let current = state.current.as_ref().map(|segment| segment.first_tsn);

        let mut removed = 0;
        for pair in first_tsns.windows(2).take(removable) {
            let (first_tsn, next_first_tsn) = (pair[0], pair[1]);
            // The segment holds TSNs up to the next segment's first TSN.
            if next_first_tsn > low_watermark + 1 || Some(first_tsn) == current {
                break;
            }
            if let Some(path) = state.segments.remove(&first_tsn) {
                fs::remove_file(&path)?;
                tracing::debug!(path = %path.display(), "Removed WAL segment");
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, low_watermark, "WAL shortened");
        }
        Ok(removed)
    }

    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(segment) = state.current.as_mut() {
            segment.writer.flush()?;
            segment.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

enum RecordError {
    Torn,
    Failed(Error),
}

fn read_record<R: Read>(
    reader: &mut R,
    offset: u64,
    file_len: u64,
) -> std::result::Result<(Vec<u8>, u64), RecordError> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as u64,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(RecordError::Torn),
        Err(e) => return Err(RecordError::Failed(e.into())),
    };
    let end = offset + 4 + len + 4;
    if end > file_len {
        return Err(RecordError::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| RecordError::Failed(Error::Decode("WAL record", e)))?;
    let stored_checksum = reader
        .read_u32::<BigEndian>()
        .map_err(|e| RecordError::Failed(e.into()))?;

    if CRC32.checksum(&payload) != stored_checksum {
        // Only the last record of a file can be a partial write.
        if end == file_len {
            return Err(RecordError::Torn);
        }
        return Err(RecordError::Failed(Error::ChecksumMismatch(format!(
            "WAL record at offset {}",
            offset
        ))));
    }
    Ok((payload, end))
}

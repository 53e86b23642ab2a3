use super::block::Builder;
use super::bloom::{BloomFilter, BITS_PER_KEY};
use super::compression::CompressionType;
use super::index::Index;
use super::metadata::{FileMetadata, Footer, KeyRange};
use super::CRC32;
use crate::error::Result;
use crate::model::{Command, KeyAndTsn, Tsn};
use crate::Error;

use byteorder::{BigEndian, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Uncompressed size at which a data block is closed.
    pub max_block_size: usize,
    pub compression: CompressionType,
    pub merges: u32,
    pub max_completely_written_tsn: Tsn,
}

/// Streams ordered commands into a new store file.
///
/// Data goes to `<path>.tmp`, which is renamed to `path` by [`finish`]. A
/// writer dropped before finishing removes its temporary file.
///
/// [`finish`]: TableWriter::finish
pub struct TableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    options: WriterOptions,
    offset: u64,

    block: Builder,
    block_first: Option<KeyAndTsn>,
    index: Index,
    key_hashes: Vec<(u64, u64)>,

    first: Option<KeyAndTsn>,
    last: Option<KeyAndTsn>,
    min_tsn: Tsn,
    max_tsn: Tsn,
    total_entries: u64,
    distinct_keys: u64,
    blocks: u64,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl TableWriter {
    pub fn create(path: &Path, options: WriterOptions) -> Result<Self> {
        let tmp_path = tmp_path(path);
        let file = File::create(&tmp_path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            file: Some(BufWriter::new(file)),
            options,
            offset: 0,
            block: Builder::new(),
            block_first: None,
            index: Index::new(),
            key_hashes: Vec::new(),
            first: None,
            last: None,
            min_tsn: Tsn::MAX,
            max_tsn: 0,
            total_entries: 0,
            distinct_keys: 0,
            blocks: 0,
        })
    }

    pub fn add(&mut self, command: &Command) -> Result<()> {
        let key = command.key_and_tsn();
        if let Some(last) = &self.last {
            if key == *last {
                return Err(Error::DuplicateEntry(format!(
                    "{} written twice to {}",
                    key,
                    self.path.display()
                )));
            }
            if key < *last {
                return Err(Error::InvalidInput(format!(
                    "{} written after {} to {}",
                    key,
                    last,
                    self.path.display()
                )));
            }
        }

        let new_user_key = self.last.as_ref().map(|l| l.key != key.key).unwrap_or(true);
        if new_user_key {
            self.distinct_keys += 1;
            self.key_hashes.push(BloomFilter::hash(&key.key));
        }

        if self.block_first.is_none() {
            self.block_first = Some(key.clone());
        }
        self.block.add(command)?;

        self.min_tsn = self.min_tsn.min(command.tsn);
        self.max_tsn = self.max_tsn.max(command.tsn);
        self.total_entries += 1;
        if self.first.is_none() {
            self.first = Some(key.clone());
        }
        self.last = Some(key);

        if self.block.len() >= self.options.max_block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    pub fn last_key(&self) -> Option<&KeyAndTsn> {
        self.last.as_ref()
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Table writer already finished".into()))
    }

    fn write_section(&mut self, data: &[u8]) -> Result<()> {
        let checksum = CRC32.checksum(data);
        let writer = self.writer()?;
        writer.write_all(data)?;
        writer.write_u32::<BigEndian>(checksum)?;
        self.offset += data.len() as u64 + 4;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(first_key) = self.block_first.take() else {
            return Ok(());
        };
        let block = std::mem::replace(&mut self.block, Builder::new());
        let data = self.options.compression.compress(&block.finish()?)?;
        let offset = self.offset;
        self.write_section(&data)?;
        self.index.push(first_key, offset, data.len() as u64);
        self.blocks += 1;
        Ok(())
    }

    /// Writes index, bloom filter, metadata and footer, syncs, and moves the
    /// file to its final name.
    pub fn finish(mut self) -> Result<FileMetadata> {
        self.flush_block()?;

        let index_offset = self.offset;
        let index = self.index.encode()?;
        self.write_section(&index)?;

        let bloom_offset = self.offset;
        let mut bloom = BloomFilter::new(self.distinct_keys as usize, BITS_PER_KEY);
        for hash in &self.key_hashes {
            bloom.insert_hash(*hash);
        }
        self.write_section(&bloom.encode()?)?;

        let metadata = FileMetadata {
            key_range: match (self.first.take(), self.last.take()) {
                (Some(first), Some(last)) => Some(KeyRange { first, last }),
                _ => None,
            },
            min_tsn: if self.total_entries == 0 { 0 } else { self.min_tsn },
            max_tsn: self.max_tsn,
            max_completely_written_tsn: self.options.max_completely_written_tsn,
            merges: self.options.merges,
            total_entries: self.total_entries,
            head_entries: self.distinct_keys,
            history_entries: self.total_entries - self.distinct_keys,
            blocks: self.blocks,
            compression: self.options.compression,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        let metadata_offset = self.offset;
        self.write_section(&bincode::serialize(&metadata)?)?;

        let footer = Footer::new(index_offset, bloom_offset, metadata_offset).encode()?;
        let writer = self.writer()?;
        writer.write_all(&footer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        self.file = None;

        fs::rename(&self.tmp_path, &self.path)?;
        Ok(metadata)
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                tracing::warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove aborted file");
            }
        }
    }
}

/// Writes `commands`, which must be ordered by `(key, tsn)`, into a new file.
pub fn write_file(
    path: &Path,
    commands: impl IntoIterator<Item = Command>,
    options: WriterOptions,
) -> Result<FileMetadata> {
    let mut writer = TableWriter::create(path, options)?;
    for command in commands {
        writer.add(&command)?;
    }
    writer.finish()
}

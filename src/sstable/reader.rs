use super::block::Block;
use super::bloom::BloomFilter;
use super::index::{Index, IndexEntry};
use super::metadata::{FileHeader, FileMetadata, Footer, FOOTER_SIZE};
use super::CRC32;
use crate::cursor::{CloseAction, Cursor, CursorLifecycle};
use crate::error::Result;
use crate::model::{Command, KeyAndTsn};
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::FileMissing(path.to_path_buf()),
        _ => Error::IoError(e),
    })
}

/// Reads `len` bytes at `offset` followed by their CRC32.
fn read_section(file: &mut File, offset: u64, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut data)?;
    let stored = file.read_u32::<BigEndian>()?;
    let computed = CRC32.checksum(&data);
    if stored != computed {
        return Err(Error::ChecksumMismatch(format!(
            "{} at offset {}: stored {:#x}, computed {:#x}",
            what, offset, stored, computed
        )));
    }
    Ok(data)
}

fn read_block(file: &mut File, header: &FileHeader, entry: &IndexEntry) -> Result<Block> {
    let stored = read_section(file, entry.offset, entry.size, "block")?;
    Block::new(header.metadata.compression.decompress(&stored)?)
}

/// Loads footer, index, bloom filter and metadata of a file.
pub fn load_header(path: &Path) -> Result<FileHeader> {
    let mut file = open(path)?;
    let file_size = file.metadata()?.len();
    if file_size < FOOTER_SIZE {
        return Err(Error::InvalidData(format!(
            "{} is too short to be a store file",
            path.display()
        )));
    }

    let mut footer = vec![0u8; FOOTER_SIZE as usize];
    file.seek(SeekFrom::Start(file_size - FOOTER_SIZE))?;
    file.read_exact(&mut footer)?;
    let footer = Footer::decode(&footer, file_size)?;

    // Each section is followed by a 4 byte checksum.
    let section = |start: u64, end: u64| -> Result<u64> {
        end.checked_sub(start)
            .and_then(|len| len.checked_sub(4))
            .ok_or_else(|| Error::InvalidData("Section too short".into()))
    };

    let index_len = section(footer.index_offset, footer.bloom_offset)?;
    let index = Index::decode(&read_section(&mut file, footer.index_offset, index_len, "index")?)?;

    let bloom_len = section(footer.bloom_offset, footer.metadata_offset)?;
    let bloom = BloomFilter::decode(&read_section(&mut file, footer.bloom_offset, bloom_len, "bloom filter")?)?;

    let metadata_len = section(footer.metadata_offset, file_size - FOOTER_SIZE)?;
    let metadata: FileMetadata = bincode::deserialize(&read_section(
        &mut file,
        footer.metadata_offset,
        metadata_len,
        "metadata",
    )?)?;

    Ok(FileHeader {
        metadata,
        index,
        bloom,
        file_size,
    })
}

/// Returns the newest version of `key.key` with a TSN at or below `key.tsn`.
pub fn get_latest_version(path: &Path, header: &FileHeader, key: &KeyAndTsn) -> Result<Option<Command>> {
    if !header.bloom.may_contain(&key.key) {
        return Ok(None);
    }
    let Some(block_index) = header.index.floor(key) else {
        return Ok(None);
    };
    let Some(entry) = header.index.get(block_index) else {
        return Ok(None);
    };

    let mut file = open(path)?;
    let block = read_block(&mut file, header, entry)?;
    Ok(block.floor(key)?.filter(|command| command.key == key.key))
}

pub fn open_cursor(path: &Path, header: Arc<FileHeader>) -> Result<FileCursor> {
    Ok(FileCursor {
        lifecycle: CursorLifecycle::new(),
        file: open(path)?,
        header,
        block_index: 0,
        entries: Vec::new(),
        position: None,
    })
}

/// Bidirectional cursor over one file. Holds a single decoded block.
pub struct FileCursor {
    lifecycle: CursorLifecycle,
    file: File,
    header: Arc<FileHeader>,
    block_index: usize,
    entries: Vec<(KeyAndTsn, Command)>,
    position: Option<usize>,
}

impl FileCursor {
    fn load_block(&mut self, block_index: usize) -> Result<bool> {
        let Some(entry) = self.header.index.get(block_index) else {
            return Ok(false);
        };
        let block = read_block(&mut self.file, &self.header, entry)?;
        self.entries = block
            .entries()?
            .into_iter()
            .map(|command| (command.key_and_tsn(), command))
            .collect();
        self.block_index = block_index;
        Ok(!self.entries.is_empty())
    }

    fn block_count(&self) -> usize {
        self.header.index.len()
    }

    fn unposition(&mut self) -> bool {
        self.position = None;
        false
    }
}

impl Cursor<KeyAndTsn, Command> for FileCursor {
    fn first(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        if !self.load_block(0)? {
            return Ok(self.unposition());
        }
        self.position = Some(0);
        Ok(true)
    }

    fn last(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let count = self.block_count();
        if count == 0 || !self.load_block(count - 1)? {
            return Ok(self.unposition());
        }
        self.position = Some(self.entries.len() - 1);
        Ok(true)
    }

    fn next(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let position = self.position.ok_or(Error::CursorNotPositioned)?;
        if position + 1 < self.entries.len() {
            self.position = Some(position + 1);
            return Ok(true);
        }
        if self.block_index + 1 >= self.block_count() {
            return Ok(false);
        }
        if !self.load_block(self.block_index + 1)? {
            return Err(Error::InvalidData("Empty data block".into()));
        }
        self.position = Some(0);
        Ok(true)
    }

    fn previous(&mut self) -> Result<bool> {
        self.lifecycle.check_open()?;
        let position = self.position.ok_or(Error::CursorNotPositioned)?;
        if position > 0 {
            self.position = Some(position - 1);
            return Ok(true);
        }
        if self.block_index == 0 {
            return Ok(false);
        }
        if !self.load_block(self.block_index - 1)? {
            return Err(Error::InvalidData("Empty data block".into()));
        }
        self.position = Some(self.entries.len() - 1);
        Ok(true)
    }

    fn seek_exactly_or_next(&mut self, key: &KeyAndTsn) -> Result<bool> {
        self.lifecycle.check_open()?;
        let block_index = self.header.index.floor(key).unwrap_or(0);
        if !self.load_block(block_index)? {
            return Ok(self.unposition());
        }
        let position = self.entries.partition_point(|(k, _)| k < key);
        if position < self.entries.len() {
            self.position = Some(position);
            return Ok(true);
        }
        // Everything in the floor block is smaller; the next block starts above the key.
        if block_index + 1 < self.block_count() && self.load_block(block_index + 1)? {
            self.position = Some(0);
            return Ok(true);
        }
        Ok(self.unposition())
    }

    fn seek_exactly_or_previous(&mut self, key: &KeyAndTsn) -> Result<bool> {
        self.lifecycle.check_open()?;
        let Some(block_index) = self.header.index.floor(key) else {
            return Ok(self.unposition());
        };
        if !self.load_block(block_index)? {
            return Ok(self.unposition());
        }
        let position = self.entries.partition_point(|(k, _)| k <= key);
        match position.checked_sub(1) {
            Some(position) => {
                self.position = Some(position);
                Ok(true)
            }
            None => Ok(self.unposition()),
        }
    }

    fn invalidate(&mut self) {
        self.position = None;
    }

    fn key(&self) -> Option<&KeyAndTsn> {
        self.position.and_then(|p| self.entries.get(p)).map(|(k, _)| k)
    }

    fn value(&self) -> Option<&Command> {
        self.position.and_then(|p| self.entries.get(p)).map(|(_, v)| v)
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn on_close(&mut self, action: CloseAction) {
        self.lifecycle.on_close(action);
    }

    fn close(&mut self) -> Result<()> {
        self.position = None;
        self.entries = Vec::new();
        self.lifecycle.close(std::iter::empty())
    }
}

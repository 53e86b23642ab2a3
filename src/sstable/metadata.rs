use super::bloom::BloomFilter;
use super::compression::CompressionType;
use super::index::Index;
use crate::error::Result;
use crate::model::{KeyAndTsn, Tsn};
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

pub const FOOTER_SIZE: u64 = 40;
pub const FORMAT_VERSION: u64 = 2;
pub const MAGIC: u64 = 0x5354_5241_5441_4442; // "STRATADB"

/// First and last entry of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub first: KeyAndTsn,
    pub last: KeyAndTsn,
}

/// Statistics and key range of a store file, written once at the end of the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// `None` for a file without entries.
    pub key_range: Option<KeyRange>,
    pub min_tsn: Tsn,
    pub max_tsn: Tsn,
    /// Every transaction up to this TSN is completely contained in the file
    /// set this file belongs to.
    pub max_completely_written_tsn: Tsn,
    /// Number of merges the data went through; 0 for flushed files.
    pub merges: u32,
    pub total_entries: u64,
    /// Entries holding the newest version of their key.
    pub head_entries: u64,
    pub history_entries: u64,
    pub blocks: u64,
    /// Codec of the data blocks.
    pub compression: CompressionType,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl FileMetadata {
    pub fn min_key(&self) -> Option<&[u8]> {
        self.key_range.as_ref().map(|r| r.first.key.as_slice())
    }

    pub fn max_key(&self) -> Option<&[u8]> {
        self.key_range.as_ref().map(|r| r.last.key.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }
}

/// Locations of the trailing sections of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub bloom_offset: u64,
    pub metadata_offset: u64,
    pub format_version: u64,
    pub magic: u64,
}

impl Footer {
    pub fn new(index_offset: u64, bloom_offset: u64, metadata_offset: u64) -> Self {
        Self {
            index_offset,
            bloom_offset,
            metadata_offset,
            format_version: FORMAT_VERSION,
            magic: MAGIC,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(FOOTER_SIZE as usize);
        buffer.write_u64::<BigEndian>(self.index_offset)?;
        buffer.write_u64::<BigEndian>(self.bloom_offset)?;
        buffer.write_u64::<BigEndian>(self.metadata_offset)?;
        buffer.write_u64::<BigEndian>(self.format_version)?;
        buffer.write_u64::<BigEndian>(self.magic)?;
        Ok(buffer)
    }

    pub fn decode(mut buffer: &[u8], file_size: u64) -> Result<Self> {
        let footer = Self {
            index_offset: buffer.read_u64::<BigEndian>()?,
            bloom_offset: buffer.read_u64::<BigEndian>()?,
            metadata_offset: buffer.read_u64::<BigEndian>()?,
            format_version: buffer.read_u64::<BigEndian>()?,
            magic: buffer.read_u64::<BigEndian>()?,
        };
        if footer.magic != MAGIC {
            return Err(Error::InvalidData(format!(
                "Bad magic number {:#x}",
                footer.magic
            )));
        }
        if footer.format_version != FORMAT_VERSION {
            return Err(Error::InvalidData(format!(
                "Unsupported file format version {}",
                footer.format_version
            )));
        }
        if !(footer.index_offset <= footer.bloom_offset
            && footer.bloom_offset <= footer.metadata_offset
            && footer.metadata_offset + FOOTER_SIZE <= file_size)
        {
            return Err(Error::InvalidData("Footer offsets out of order".into()));
        }
        Ok(footer)
    }
}

/// Everything needed to read a file without touching its data blocks.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub metadata: FileMetadata,
    pub index: Index,
    pub bloom: BloomFilter,
    pub file_size: u64,
}

//! Block index: the first `(key, tsn)` of every data block.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::model::KeyAndTsn;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub first_key: KeyAndTsn,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, first_key: KeyAndTsn, offset: u64, size: u64) {
        self.entries.push(IndexEntry {
            first_key,
            offset,
            size,
        });
    }

    /// Position of the block that may contain `key`: the last block whose
    /// first key is at or below it. `None` if `key` precedes every block.
    pub fn floor(&self, key: &KeyAndTsn) -> Option<usize> {
        let count = self.entries.partition_point(|e| e.first_key <= *key);
        count.checked_sub(1)
    }

    pub fn get(&self, index: usize) -> Option<&IndexEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            buffer.write_u32::<BigEndian>(entry.first_key.key.len() as u32)?;
            buffer.write_all(&entry.first_key.key)?;
            buffer.write_u64::<BigEndian>(entry.first_key.tsn)?;
            buffer.write_u64::<BigEndian>(entry.offset)?;
            buffer.write_u64::<BigEndian>(entry.size)?;
        }
        Ok(buffer)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buffer);
        let count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("index entry count", e))? as usize;

        let mut entries = Vec::with_capacity(count.min(buffer.len()));
        for _ in 0..count {
            let key_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("key length in index block", e))?
                as usize;
            if key_len > buffer.len() {
                return Err(Error::InvalidData("Index key length out of bounds".into()));
            }
            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::Decode("key in index block", e))?;
            let tsn = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("tsn in index block", e))?;
            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block offset in index block", e))?;
            let size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block size in index block", e))?;
            entries.push(IndexEntry {
                first_key: KeyAndTsn::new(key, tsn),
                offset,
                size,
            });
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_index() -> Index {
        let mut index = Index::new();
        index.push(KeyAndTsn::new("apple", 3), 0, 100);
        index.push(KeyAndTsn::new("banana", 1), 100, 100);
        index.push(KeyAndTsn::new("banana", 7), 200, 100);
        index.push(KeyAndTsn::new("cherry", 2), 300, 100);
        index
    }

    #[test]
    fn test_floor() {
        let index = create_test_index();
        assert_eq!(index.floor(&KeyAndTsn::new("banana", 1)), Some(1));
        assert_eq!(index.floor(&KeyAndTsn::new("banana", 5)), Some(1));
        assert_eq!(index.floor(&KeyAndTsn::new("banana", 9)), Some(2));
        assert_eq!(index.floor(&KeyAndTsn::new("apricot", 0)), Some(0));
        assert_eq!(index.floor(&KeyAndTsn::new("date", 0)), Some(3));
        assert_eq!(index.floor(&KeyAndTsn::new("apple", 2)), None);
        assert_eq!(Index::new().floor(&KeyAndTsn::new("any", 0)), None);
    }

    #[test]
    fn test_encoding() -> Result<()> {
        let index = create_test_index();
        let decoded = Index::decode(&index.encode()?)?;
        assert_eq!(decoded, index);
        assert_eq!(decoded.get(2).map(|e| e.offset), Some(200));

        assert!(Index::decode(&[0, 0, 0, 1, 0]).is_err());
        Ok(())
    }
}

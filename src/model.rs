//! Core value types shared by every layer of the engine.
//!
//! Every mutation is a [`Command`] stamped with the [`Tsn`] of the transaction
//! that committed it. Inside a store, commands are ordered by [`KeyAndTsn`]:
//! user key first, then TSN ascending, so that all versions of one key are
//! adjacent and the newest version visible at some TSN is found with a floor
//! search on `(key, tsn)`.

use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};

/// Transaction sequence number.
pub type Tsn = u64;

/// Index of an on-disk file within a store, never reused.
pub type FileIndex = u64;

/// Level (leveled compaction) or tier (tiered compaction) of a file.
pub type LevelOrTier = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyAndTsn {
    pub key: Vec<u8>,
    pub tsn: Tsn,
}

impl KeyAndTsn {
    pub fn new(key: impl Into<Vec<u8>>, tsn: Tsn) -> Self {
        Self {
            key: key.into(),
            tsn,
        }
    }
}

impl fmt::Display for KeyAndTsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", String::from_utf8_lossy(&self.key), self.tsn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Put = 1,
    Delete = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Put),
            2 => Ok(OpCode::Delete),
            other => Err(Error::InvalidData(format!("Invalid opcode: {}", other))),
        }
    }
}

/// A persisted mutation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: OpCode,
    pub key: Vec<u8>,
    pub tsn: Tsn,
    pub value: Vec<u8>,
}

impl Command {
    pub fn put(key: impl Into<Vec<u8>>, tsn: Tsn, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: OpCode::Put,
            key: key.into(),
            tsn,
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>, tsn: Tsn) -> Self {
        Self {
            op: OpCode::Delete,
            key: key.into(),
            tsn,
            value: Vec::new(),
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.op == OpCode::Delete
    }

    /// The stored value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        match self.op {
            OpCode::Put => Some(&self.value),
            OpCode::Delete => None,
        }
    }

    pub fn key_and_tsn(&self) -> KeyAndTsn {
        KeyAndTsn::new(self.key.clone(), self.tsn)
    }

    /// Approximate memory footprint, used for flush and backpressure accounting.
    pub fn byte_size(&self) -> usize {
        self.key.len() + self.value.len() + 9
    }

    /// Returns a copy of this command stamped with a different TSN.
    pub fn with_tsn(&self, tsn: Tsn) -> Self {
        Self {
            tsn,
            ..self.clone()
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(self.op as u8)?;
        buf.write_u64::<BigEndian>(self.tsn)?;
        buf.write_u32::<BigEndian>(self.key.len() as u32)?;
        buf.extend_from_slice(&self.key);
        buf.write_u32::<BigEndian>(self.value.len() as u32)?;
        buf.extend_from_slice(&self.value);
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let op = OpCode::try_from(cursor.read_u8()?)?;
        let tsn = cursor.read_u64::<BigEndian>()?;

        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor
            .read_exact(&mut key)
            .map_err(|e| Error::Decode("command key", e))?;

        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        cursor
            .read_exact(&mut value)
            .map_err(|e| Error::Decode("command value", e))?;

        Ok(Self {
            op,
            key,
            tsn,
            value,
        })
    }
}

/// Values an overlay can treat as deletion markers.
pub trait Tombstone {
    fn is_tombstone(&self) -> bool;
}

impl Tombstone for Command {
    fn is_tombstone(&self) -> bool {
        self.is_deletion()
    }
}

impl<T> Tombstone for Option<T> {
    fn is_tombstone(&self) -> bool {
        self.is_none()
    }
}

/// Validated name of a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > 255 {
            return Err(Error::InvalidInput(format!(
                "Store name must have 1 to 255 bytes, got {}",
                name.len()
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(Error::InvalidInput(format!(
                "Store name '{}' contains illegal character '{}'",
                name, c
            )));
        }
        if name == "." || name == ".." {
            return Err(Error::InvalidInput(format!("Illegal store name '{}'", name)));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_and_tsn_ordering() {
        let mut keys = vec![
            KeyAndTsn::new("b", 1),
            KeyAndTsn::new("a", 7),
            KeyAndTsn::new("a", 3),
            KeyAndTsn::new("ab", 0),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                KeyAndTsn::new("a", 3),
                KeyAndTsn::new("a", 7),
                KeyAndTsn::new("ab", 0),
                KeyAndTsn::new("b", 1),
            ]
        );
    }

    #[test]
    fn test_command_encoding() -> Result<()> {
        let put = Command::put("key", 42, "value");
        let delete = Command::delete("gone", 43);

        let mut buf = Vec::new();
        put.encode_into(&mut buf)?;
        delete.encode_into(&mut buf)?;

        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(Command::decode_from(&mut cursor)?, put);
        let decoded = Command::decode_from(&mut cursor)?;
        assert_eq!(decoded, delete);
        assert!(decoded.is_deletion());
        assert_eq!(decoded.value(), None);
        Ok(())
    }

    #[test]
    fn test_invalid_opcode() {
        let buf = [9u8, 0, 0, 0, 0, 0, 0, 0, 1];
        let mut cursor = Cursor::new(&buf[..]);
        assert!(matches!(
            Command::decode_from(&mut cursor),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_store_id_validation() {
        assert!(StoreId::new("users").is_ok());
        assert!(StoreId::new("index_v2.by-name").is_ok());
        assert!(StoreId::new("").is_err());
        assert!(StoreId::new("a/b").is_err());
        assert!(StoreId::new("..").is_err());
        assert!(StoreId::new("x".repeat(256)).is_err());
    }
}

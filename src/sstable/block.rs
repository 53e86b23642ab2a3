//! Data blocks of a store file.
//!
//! ```text
//! +--------+--------+--------+------+----------+-------------+----------+
//! |shared  |unshared|tsn:u64 |op:u8 |value_len |key suffix   | value    |
//! |:u32    |:u32    |        |      |:u32      |             |          |
//! +--------+--------+--------+------+----------+-------------+----------+
//! ... more entries ...
//! +---------------------+----------------+
//! |restart offsets:u32* |restart count:u32|
//! +---------------------+----------------+
//! ```
//!
//! Every 16th entry is a restart point storing its full key, which allows a
//! binary search over restart points followed by a short linear scan.

use crate::error::Result;
use crate::model::{Command, KeyAndTsn, OpCode};
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

const RESTART_INTERVAL: usize = 16;

/// Fixed part of an entry preceding the key suffix.
const ENTRY_HEADER_SIZE: usize = 4 + 4 + 8 + 1 + 4;

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add(&mut self, command: &Command) -> Result<()> {
        let key = command.key.as_slice();
        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = &key[shared_prefix_len..];

        self.buffer.write_u32::<BigEndian>(shared_prefix_len as u32)?;
        self.buffer.write_u32::<BigEndian>(unshared.len() as u32)?;
        self.buffer.write_u64::<BigEndian>(command.tsn)?;
        self.buffer.write_u8(command.op as u8)?;
        self.buffer.write_u32::<BigEndian>(command.value.len() as u32)?;
        self.buffer.extend_from_slice(unshared);
        self.buffer.extend_from_slice(&command.value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos)?;
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)?;
        Ok(self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

fn truncated(what: &str) -> Error {
    Error::Decode(
        "block data",
        io::Error::new(io::ErrorKind::UnexpectedEof, what.to_string()),
    )
}

#[derive(Debug, Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(mut data: Vec<u8>) -> Result<Self> {
        let data_len = data.len();
        if data_len < 4 {
            return Err(truncated("Data too short"));
        }

        let num_restarts_offset = data_len - 4;
        let num_restarts = (&data[num_restarts_offset..]).read_u32::<BigEndian>()? as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(truncated("Data too short for restart positions"));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut restarts = &data[restart_array_offset..num_restarts_offset];
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            let pos = restarts.read_u32::<BigEndian>()?;
            if pos as usize >= restart_array_offset {
                return Err(Error::InvalidData("Restart point out of bounds".into()));
            }
            restart_positions.push(pos);
        }

        data.truncate(restart_array_offset);
        Ok(Self {
            data,
            restart_positions,
        })
    }

    /// Decodes the entry at `pos` given the key of the preceding entry.
    /// Returns the command and the offset of the following entry.
    fn decode_at(&self, pos: usize, last_key: &[u8]) -> Result<(Command, usize)> {
        let data = &self.data;
        if pos + ENTRY_HEADER_SIZE > data.len() {
            return Err(truncated("Entry header out of bounds"));
        }
        let mut header = &data[pos..pos + ENTRY_HEADER_SIZE];
        let shared_len = header
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("shared_len", e))? as usize;
        let unshared_len = header
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("unshared_len", e))? as usize;
        let tsn = header
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("tsn", e))?;
        let op = OpCode::try_from(header.read_u8().map_err(|e| Error::Decode("op", e))?)?;
        let value_len = header
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("value_len", e))? as usize;

        let mut pos = pos + ENTRY_HEADER_SIZE;
        if shared_len > last_key.len() || pos + unshared_len + value_len > data.len() {
            return Err(Error::InvalidData("Block entry out of bounds".into()));
        }

        let mut key = Vec::with_capacity(shared_len + unshared_len);
        key.extend_from_slice(&last_key[..shared_len]);
        key.extend_from_slice(&data[pos..pos + unshared_len]);
        pos += unshared_len;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        Ok((
            Command {
                op,
                key,
                tsn,
                value,
            },
            pos,
        ))
    }

    /// Decodes every entry of the block in order.
    pub fn entries(&self) -> Result<Vec<Command>> {
        let mut entries = Vec::new();
        let mut pos = 0;
        let mut last_key: Vec<u8> = Vec::new();
        while pos < self.data.len() {
            let (command, next) = self.decode_at(pos, &last_key)?;
            last_key.clone_from(&command.key);
            entries.push(command);
            pos = next;
        }
        Ok(entries)
    }

    /// Returns the largest entry at or below `target`.
    pub fn floor(&self, target: &KeyAndTsn) -> Result<Option<Command>> {
        // Last restart point whose full key is <= target.
        let mut left = 0;
        let mut right = self.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let (command, _) = self.decode_at(self.restart_positions[mid] as usize, &[])?;
            if command.key_and_tsn() <= *target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        if left == 0 {
            return Ok(None);
        }

        let mut pos = self.restart_positions[left - 1] as usize;
        let end = self
            .restart_positions
            .get(left)
            .map(|p| *p as usize)
            .unwrap_or(self.data.len());

        let mut found: Option<Command> = None;
        let mut last_key: Vec<u8> = Vec::new();
        while pos < end {
            let (command, next) = self.decode_at(pos, &last_key)?;
            if command.key_and_tsn() > *target {
                break;
            }
            last_key.clone_from(&command.key);
            found = Some(command);
            pos = next;
        }
        Ok(found)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(commands: &[Command]) -> Result<Block> {
        let mut builder = Builder::new();
        for command in commands {
            builder.add(command)?;
        }
        Block::new(builder.finish()?)
    }

    #[test]
    fn test_block_builder_and_reader() -> Result<()> {
        let commands = vec![
            Command::put("apple", 1, "fruit"),
            Command::put("application", 2, "software"),
            Command::delete("banana", 3),
            Command::put("band", 1, "music"),
            Command::put("band", 4, "rock"),
            Command::put("bandana", 2, "clothing"),
        ];
        let block = build(&commands)?;
        assert_eq!(block.entries()?, commands);
        Ok(())
    }

    #[test]
    fn test_floor_across_restart_points() -> Result<()> {
        let commands: Vec<Command> = (0..100)
            .map(|i| Command::put(format!("key_{:03}", i / 2), (i % 2) as u64 * 5 + 1, format!("v{}", i)))
            .collect();
        let block = build(&commands)?;

        let found = block.floor(&KeyAndTsn::new("key_020", 3))?;
        assert_eq!(found.map(|c| c.key_and_tsn()), Some(KeyAndTsn::new("key_020", 1)));

        let found = block.floor(&KeyAndTsn::new("key_020", 9))?;
        assert_eq!(found.map(|c| c.key_and_tsn()), Some(KeyAndTsn::new("key_020", 6)));

        let found = block.floor(&KeyAndTsn::new("key_0205", 0))?;
        assert_eq!(found.map(|c| c.key_and_tsn()), Some(KeyAndTsn::new("key_020", 6)));

        assert!(block.floor(&KeyAndTsn::new("a", 0))?.is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_truncated_block() {
        assert!(Block::new(vec![0, 0]).is_err());
        assert!(Block::new(vec![0, 0, 0, 9]).is_err());
    }
}

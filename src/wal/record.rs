use crate::error::Result;
use crate::model::{Command, StoreId, Tsn};
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// The commands of one committed transaction, grouped by store.
///
/// Payload layout:
///
/// ```text
/// tsn:u64 | stores:u32 | { name_len:u16 | name | commands:u32 | command* }*
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalTransaction {
    pub tsn: Tsn,
    pub stores: Vec<(StoreId, Vec<Command>)>,
}

impl WalTransaction {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u64::<BigEndian>(self.tsn)?;
        buf.write_u32::<BigEndian>(self.stores.len() as u32)?;
        for (store_id, commands) in &self.stores {
            let name = store_id.as_str().as_bytes();
            buf.write_u16::<BigEndian>(name.len() as u16)?;
            buf.extend_from_slice(name);
            buf.write_u32::<BigEndian>(commands.len() as u32)?;
            for command in commands {
                command.encode_into(&mut buf)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let tsn = cursor.read_u64::<BigEndian>()?;
        let store_count = cursor.read_u32::<BigEndian>()?;

        let mut stores = Vec::with_capacity(store_count as usize);
        for _ in 0..store_count {
            let name_len = cursor.read_u16::<BigEndian>()? as usize;
            let mut name = vec![0u8; name_len];
            cursor
                .read_exact(&mut name)
                .map_err(|e| Error::Decode("store name", e))?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::InvalidData("Store name is not UTF-8".to_string()))?;
            let store_id = StoreId::new(name)?;

            let command_count = cursor.read_u32::<BigEndian>()?;
            let mut commands = Vec::with_capacity(command_count as usize);
            for _ in 0..command_count {
                let command = Command::decode_from(&mut cursor)?;
                if command.tsn != tsn {
                    return Err(Error::InvalidData(format!(
                        "Command {} in WAL record of transaction {}",
                        command.key_and_tsn(),
                        tsn
                    )));
                }
                commands.push(command);
            }
            stores.push((store_id, commands));
        }

        if cursor.position() as usize != payload.len() {
            return Err(Error::InvalidData(format!(
                "Trailing bytes in WAL record of transaction {}",
                tsn
            )));
        }
        Ok(Self { tsn, stores })
    }

    pub fn command_count(&self) -> usize {
        self.stores.iter().map(|(_, commands)| commands.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_encoding() -> Result<()> {
        let txn = WalTransaction {
            tsn: 12,
            stores: vec![
                (
                    StoreId::new("users")?,
                    vec![Command::put("alice", 12, "1"), Command::delete("bob", 12)],
                ),
                (StoreId::new("orders")?, vec![Command::put("o-1", 12, "x")]),
            ],
        };
        let decoded = WalTransaction::decode(&txn.encode()?)?;
        assert_eq!(decoded, txn);
        assert_eq!(decoded.command_count(), 3);
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_tsn() -> Result<()> {
        let txn = WalTransaction {
            tsn: 4,
            stores: vec![(StoreId::new("users")?, vec![Command::put("a", 5, "v")])],
        };
        assert!(matches!(
            WalTransaction::decode(&txn.encode()?),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }
}

use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"STRATAMF";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Milliseconds since the Unix epoch at which the manifest was created.
    pub created_at: u64,
}

impl ManifestHeader {
    pub fn new(created_at: u64) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            created_at,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidData(
                "Invalid manifest magic number".to_string(),
            ));
        }
        if self.version != VERSION {
            return Err(Error::InvalidData(format!(
                "Unsupported manifest version: {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.created_at);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let header = Self {
            magic,
            version: BigEndian::read_u32(&buf[8..12]),
            created_at: BigEndian::read_u64(&buf[12..20]),
        };
        header.validate()?;
        Ok(header)
    }
}

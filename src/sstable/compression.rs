//! Block compression of store files.
//!
//! Only data blocks are compressed. The codec is recorded in the file's
//! [`FileMetadata`](super::FileMetadata), so files written with different
//! settings can be read side by side.

use crate::error::Result;
use crate::Error;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
    #[default]
    Snappy = 2,
    Zstd = 3,
}

/// zstd's own default level.
const ZSTD_LEVEL: i32 = 3;

impl CompressionType {
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionType::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::InvalidInput(format!("Snappy compression failed: {}", e))),
            CompressionType::Zstd => Ok(zstd::encode_all(data, ZSTD_LEVEL)?),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::InvalidData(format!("Corrupt lz4 block: {}", e))),
            CompressionType::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::InvalidData(format!("Corrupt snappy block: {}", e))),
            CompressionType::Zstd => {
                zstd::decode_all(data).map_err(|e| Error::InvalidData(format!("Corrupt zstd block: {}", e)))
            }
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Snappy),
            3 => Ok(CompressionType::Zstd),
            other => Err(Error::InvalidData(format!("Unknown compression type {}", other))),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::Snappy => "snappy",
            CompressionType::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionType; 4] = [
        CompressionType::None,
        CompressionType::Lz4,
        CompressionType::Snappy,
        CompressionType::Zstd,
    ];

    fn repetitive_block() -> Vec<u8> {
        (0..200)
            .flat_map(|i| format!("key_{:05}=value_{:05};", i / 4, i).into_bytes())
            .collect()
    }

    #[test]
    fn test_lz4_round_trip() -> Result<()> {
        let data = repetitive_block();
        let compressed = CompressionType::Lz4.compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(CompressionType::Lz4.decompress(&compressed)?, data);
        Ok(())
    }

    #[test]
    fn test_snappy_round_trip() -> Result<()> {
        let data = repetitive_block();
        let compressed = CompressionType::Snappy.compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(CompressionType::Snappy.decompress(&compressed)?, data);
        Ok(())
    }

    #[test]
    fn test_zstd_round_trip() -> Result<()> {
        let data = repetitive_block();
        let compressed = CompressionType::Zstd.compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(CompressionType::Zstd.decompress(&compressed)?, data);
        Ok(())
    }

    #[test]
    fn test_none_stores_data_as_is() -> Result<()> {
        let data = repetitive_block();
        assert_eq!(CompressionType::None.compress(&data)?, data);
        assert_eq!(CompressionType::None.decompress(&data)?, data);
        Ok(())
    }

    #[test]
    fn test_empty_input() -> Result<()> {
        for compression in ALL {
            let compressed = compression.compress(&[])?;
            assert!(compression.decompress(&compressed)?.is_empty(), "{}", compression);
        }
        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() {
        // A small size prefix followed by nonsense.
        let mut garbage = vec![4u8, 0, 0, 0];
        garbage.extend_from_slice(&[0xff; 28]);
        for compression in [CompressionType::Lz4, CompressionType::Snappy, CompressionType::Zstd] {
            assert!(
                matches!(compression.decompress(&garbage), Err(Error::InvalidData(_))),
                "{}",
                compression
            );
        }
    }

    #[test]
    fn test_type_codes() -> Result<()> {
        for compression in ALL {
            assert_eq!(CompressionType::try_from(compression as u8)?, compression);
        }
        assert!(CompressionType::try_from(9).is_err());
        Ok(())
    }
}

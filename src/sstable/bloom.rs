use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_128;

pub const BITS_PER_KEY: usize = 10;

/// Bloom filter over the user keys of one file.
///
/// A miss is definite, a hit is probable. Positions come from double hashing
/// `h1 + i * h2`, with both halves taken from one 128-bit XXH3 hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_keys` keys at `bits_per_key`.
    pub fn new(expected_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (expected_keys.saturating_mul(bits_per_key)).clamp(64, u32::MAX as usize) as u32;
        // k = bits_per_key * ln(2), rounded
        let num_hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).round().clamp(1.0, 30.0) as u32;
        Self {
            bits: vec![0u64; (num_bits as usize).div_ceil(64)],
            num_hashes,
            num_bits,
        }
    }

    pub fn hash(key: &[u8]) -> (u64, u64) {
        let hash = xxh3_128(key);
        (hash as u64, (hash >> 64) as u64)
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(Self::hash(key));
    }

    pub fn insert_hash(&mut self, (h1, h2): (u64, u64)) {
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash(key);
        (0..self.num_hashes).all(|i| {
            let pos = self.position(h1, h2, i);
            (self.bits[pos / 64] >> (pos % 64)) & 1 == 1
        })
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(8 + self.bits.len() * 8);
        buffer.write_u32::<BigEndian>(self.num_hashes)?;
        buffer.write_u32::<BigEndian>(self.num_bits)?;
        for word in &self.bits {
            buffer.write_u64::<BigEndian>(*word)?;
        }
        Ok(buffer)
    }

    pub fn decode(mut buffer: &[u8]) -> Result<Self> {
        let num_hashes = buffer
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("bloom hash count", e))?;
        let num_bits = buffer
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("bloom bit count", e))?;
        let words = (num_bits as usize).div_ceil(64);
        if num_bits == 0 || buffer.len() != words * 8 {
            return Err(Error::InvalidData(format!(
                "Bloom filter of {} bits has {} bytes of data",
                num_bits,
                buffer.len()
            )));
        }
        let mut bits = Vec::with_capacity(words);
        for _ in 0..words {
            bits.push(buffer.read_u64::<BigEndian>()?);
        }
        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }
}

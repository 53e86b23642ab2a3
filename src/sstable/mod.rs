//! On-disk sorted runs of commands ("store files").
//!
//! A store file is immutable once written. It holds the commands of one flush
//! or compaction ordered by `(key, tsn)`.
//!
//! ## File Format
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |  ← prefix-compressed entries, ~max_block_size,
//! | crc32:u32         |    then compressed with the file's codec
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! | crc32:u32         |
//! +-------------------+
//! | Index             |  ← first (key, tsn) of every block
//! | crc32:u32         |
//! +-------------------+
//! | Bloom Filter      |  ← distinct user keys, 10 bits per key
//! | crc32:u32         |
//! +-------------------+
//! | Metadata          |  ← bincode(FileMetadata)
//! | crc32:u32         |
//! +-------------------+
//! | Footer (40 bytes) |  ← index/bloom/metadata offsets, version, magic
//! +-------------------+
//! ```
//!
//! The checksum of a data block covers its compressed bytes, and the index
//! records compressed sizes. All integers are big-endian. Everything except the data blocks is loaded
//! into a [`FileHeader`] when the file is opened; blocks are read on demand,
//! one at a time per cursor.

pub mod block;
pub mod bloom;
pub mod compression;
pub mod index;
pub mod metadata;
pub mod reader;
pub mod writer;

pub use compression::CompressionType;
pub use metadata::{FileHeader, FileMetadata, KeyRange};
pub use reader::{get_latest_version, load_header, open_cursor, FileCursor};
pub use writer::{write_file, TableWriter, WriterOptions};

use crc::{Crc, CRC_32_ISCSI};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

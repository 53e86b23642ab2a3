use crate::cache::Cache;
use crate::error::Result;
use crate::model::{Command, FileIndex, KeyAndTsn};
use crate::sstable::{self, FileCursor, FileHeader, FileMetadata};
use crate::Error;

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const FILE_EXTENSION: &str = "lsm";

pub fn file_name(index: FileIndex) -> String {
    format!("{:010}.{}", index, FILE_EXTENSION)
}

/// Parses `0000000042.lsm` into 42.
pub fn parse_file_name(name: &str) -> Option<FileIndex> {
    let stem = name.strip_suffix(".lsm")?;
    if stem.len() != 10 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

pub type HeaderLoader<'a> = &'a dyn Fn() -> Result<Arc<FileHeader>>;

/// Loading cache for file headers.
pub trait HeaderCache: Send + Sync {
    fn get_or_load(&self, path: &Path, loader: HeaderLoader<'_>) -> Result<Arc<FileHeader>>;

    fn invalidate(&self, path: &Path);
}

/// Loads the header on every request.
pub struct NoHeaderCache;

impl HeaderCache for NoHeaderCache {
    fn get_or_load(&self, _path: &Path, loader: HeaderLoader<'_>) -> Result<Arc<FileHeader>> {
        loader()
    }

    fn invalidate(&self, _path: &Path) {}
}

/// Keeps a bounded number of headers.
pub struct BoundedHeaderCache {
    cache: Mutex<Cache<PathBuf, Arc<FileHeader>>>,
}

impl BoundedHeaderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(Cache::new(capacity)),
        }
    }

    /// Returns `(hits, misses)`.
    pub fn stats(&self) -> (usize, usize) {
        self.cache.lock().stats()
    }
}

impl HeaderCache for BoundedHeaderCache {
    fn get_or_load(&self, path: &Path, loader: HeaderLoader<'_>) -> Result<Arc<FileHeader>> {
        let key = path.to_path_buf();
        if let Some(header) = self.cache.lock().get(&key) {
            return Ok(header.clone());
        }
        // Loaded outside the lock; concurrent misses may load twice.
        let header = loader()?;
        self.cache.lock().insert(key, header.clone());
        Ok(header)
    }

    fn invalidate(&self, path: &Path) {
        self.cache.lock().remove(&path.to_path_buf());
    }
}

/// Builds the header cache configured by `capacity`; 0 disables caching.
pub fn header_cache(capacity: usize) -> Arc<dyn HeaderCache> {
    if capacity == 0 {
        Arc::new(NoHeaderCache)
    } else {
        Arc::new(BoundedHeaderCache::new(capacity))
    }
}

/// One immutable sorted run of a store.
#[derive(Clone)]
pub struct LsmFile {
    index: FileIndex,
    path: PathBuf,
    header_cache: Arc<dyn HeaderCache>,
}

impl std::fmt::Debug for LsmFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmFile")
            .field("index", &self.index)
            .field("path", &self.path)
            .finish()
    }
}

impl LsmFile {
    pub fn new(dir: &Path, index: FileIndex, header_cache: Arc<dyn HeaderCache>) -> Self {
        Self {
            index,
            path: dir.join(file_name(index)),
            header_cache,
        }
    }

    pub fn index(&self) -> FileIndex {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        file_name(self.index)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn header(&self) -> Result<Arc<FileHeader>> {
        let path = self.path.clone();
        self.header_cache
            .get_or_load(&self.path, &|| sstable::load_header(&path).map(Arc::new))
    }

    pub fn metadata(&self) -> Result<FileMetadata> {
        Ok(self.header()?.metadata.clone())
    }

    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.header()?.file_size)
    }

    pub fn get_latest_version(&self, key: &KeyAndTsn) -> Result<Option<Command>> {
        let header = self.header()?;
        if let Some(range) = &header.metadata.key_range {
            if key.key < range.first.key || key.key > range.last.key {
                return Ok(None);
            }
        }
        sstable::get_latest_version(&self.path, &header, key)
    }

    pub fn cursor(&self) -> Result<FileCursor> {
        sstable::open_cursor(&self.path, self.header()?)
    }

    /// Removes the file from disk and from the header cache.
    pub fn delete(&self) -> Result<()> {
        self.header_cache.invalidate(&self.path);
        std::fs::remove_file(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileMissing(self.path.clone()),
            _ => Error::IoError(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Cursor, CursorExt};
    use crate::sstable::{write_file, CompressionType, WriterOptions};
    use crate::tmpfs::TempDir;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options() -> WriterOptions {
        WriterOptions {
            max_block_size: 4096,
            compression: CompressionType::None,
            merges: 0,
            max_completely_written_tsn: 3,
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(file_name(42), "0000000042.lsm");
        assert_eq!(parse_file_name("0000000042.lsm"), Some(42));
        assert_eq!(parse_file_name("42.lsm"), None);
        assert_eq!(parse_file_name("0000000042.lsm.tmp"), None);
    }

    #[test]
    fn test_lookup_and_cursor() -> Result<()> {
        let dir = TempDir::new()?;
        let file = LsmFile::new(dir.path(), 7, header_cache(16));
        write_file(
            file.path(),
            vec![
                Command::put("a", 1, "a1"),
                Command::put("a", 3, "a3"),
                Command::delete("b", 2),
            ],
            options(),
        )?;

        assert_eq!(file.name(), "0000000007.lsm");
        assert_eq!(file.metadata()?.total_entries, 3);
        assert_eq!(
            file.get_latest_version(&KeyAndTsn::new("a", 2))?,
            Some(Command::put("a", 1, "a1"))
        );
        assert_eq!(file.get_latest_version(&KeyAndTsn::new("c", 9))?, None);

        let mut cursor = file.cursor()?;
        let keys: Vec<KeyAndTsn> = cursor
            .ascending_entries()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_>>()?;
        assert_eq!(keys.len(), 3);
        cursor.close()?;

        file.delete()?;
        assert!(!file.exists());
        assert!(matches!(file.header(), Err(Error::FileMissing(_))));
        Ok(())
    }

    #[test]
    fn test_bounded_cache_loads_once() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(file_name(0));
        write_file(&path, vec![Command::put("k", 1, "v")], options())?;

        let cache = BoundedHeaderCache::new(4);
        let loads = AtomicUsize::new(0);
        let loader = || {
            loads.fetch_add(1, Ordering::SeqCst);
            sstable::load_header(&path).map(Arc::new)
        };
        cache.get_or_load(&path, &loader)?;
        cache.get_or_load(&path, &loader)?;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), (1, 1));

        cache.invalidate(&path);
        cache.get_or_load(&path, &loader)?;
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let uncached = NoHeaderCache;
        uncached.get_or_load(&path, &loader)?;
        uncached.get_or_load(&path, &loader)?;
        assert_eq!(loads.load(Ordering::SeqCst), 4);
        Ok(())
    }
}

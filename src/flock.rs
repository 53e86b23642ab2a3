use crate::error::Result;
use crate::Error;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = "stratadb.lock";

/// Exclusive advisory lock on an engine directory, released when dropped.
pub struct DirectoryLock {
    _file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Locks `dir` by taking `flock` on its lock file. The lock file contains
    /// the process ID of the holder for debugging purposes.
    pub fn lock(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(Error::LockError)?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        file.set_len(0).map_err(Error::LockError)?;
        writeln!(file, "{}", std::process::id()).map_err(Error::LockError)?;
        file.flush().map_err(Error::LockError)?;

        Ok(Self { _file: file, path })
    }

    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs;

    #[test]
    fn test_lock_writes_pid() -> Result<()> {
        let dir = TempDir::new()?;
        let lock = DirectoryLock::lock(dir.path())?;
        assert_eq!(lock.path(), dir.path().join(LOCK_FILE_NAME));

        let content = fs::read_to_string(lock.path())?;
        assert!(content.contains(&std::process::id().to_string()));
        Ok(())
    }

    #[test]
    fn test_double_lock() -> Result<()> {
        let dir = TempDir::new()?;
        let _lock = DirectoryLock::lock(dir.path())?;
        assert!(matches!(
            DirectoryLock::lock(dir.path()),
            Err(Error::LockError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_auto_unlock_on_drop() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let _lock = DirectoryLock::lock(dir.path())?;
        }
        let _relocked = DirectoryLock::lock(dir.path())?;
        Ok(())
    }
}

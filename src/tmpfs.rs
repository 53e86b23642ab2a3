use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

/// A fresh engine directory for one test, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let base = std::env::temp_dir().join("stratadb_tests");
        fs::create_dir_all(&base)?;

        let mut rng = rand::thread_rng();
        loop {
            let path = base.join(format!("engine_{}_{:016x}", std::process::id(), rng.gen::<u64>()));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

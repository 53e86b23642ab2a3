use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Files that left the tree but may still be read by open cursors.
#[derive(Default)]
pub struct GarbageFileManager {
    files: Mutex<BTreeSet<String>>,
}

impl GarbageFileManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, names: impl IntoIterator<Item = String>) {
        self.files.lock().extend(names);
    }

    pub fn remove(&self, name: &str) {
        self.files.lock().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().contains(name)
    }

    pub fn files(&self) -> Vec<String> {
        self.files.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_remove() {
        let garbage = GarbageFileManager::new();
        garbage.mark(vec!["0000000001.lsm".to_string(), "0000000002.lsm".to_string()]);
        garbage.mark(vec!["0000000001.lsm".to_string()]);
        assert_eq!(garbage.len(), 2);

        garbage.remove("0000000001.lsm");
        assert!(!garbage.contains("0000000001.lsm"));
        assert_eq!(garbage.files(), vec!["0000000002.lsm".to_string()]);
    }
}

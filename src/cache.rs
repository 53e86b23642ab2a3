//! A bounded S3-FIFO cache.
//!
//! New entries enter a small FIFO queue. Entries read at least twice while
//! in the small queue are promoted to the main queue on eviction, the rest
//! are dropped and remembered in a ghost queue so that a quick re-insert goes
//! straight to the main queue. The main queue gives every entry that was
//! read since its last pass another round before evicting it.

use std::{
    cmp::min,
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Small,
    Main,
}

struct Entry<V> {
    value: V,
    queue: Queue,
    freq: AtomicU8,
}

pub struct Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    capacity: usize,
    max_small_size: usize,
    small: VecDeque<K>,
    main: VecDeque<K>,
    ghost: VecDeque<K>,
    ghost_keys: HashSet<K>,
    entries: HashMap<K, Entry<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Cache {
            capacity,
            max_small_size: (capacity / 10).max(1),
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            stats: Stats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the value of the given key if it is cached.
    pub fn get(&self, key: &K) -> Option<&V> {
        match self.entries.get(key) {
            Some(entry) => {
                let freq = min(entry.freq.load(Ordering::Relaxed) + 1, MAX_FREQUENCY_LIMIT);
                entry.freq.store(freq, Ordering::Relaxed);
                self.stats.hit();
                Some(&entry.value)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            return;
        }

        while self.entries.len() >= self.capacity {
            self.evict();
        }

        let queue = if self.ghost_keys.remove(&key) {
            self.main.push_back(key.clone());
            Queue::Main
        } else {
            self.small.push_back(key.clone());
            Queue::Small
        };
        self.entries.insert(
            key,
            Entry {
                value,
                queue,
                freq: AtomicU8::new(0),
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        // Queue slots of removed keys are skipped lazily during eviction.
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Returns `(hits, misses)`.
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self) {
        if self.small.len() >= self.max_small_size || self.main.is_empty() {
            if self.evict_small() {
                return;
            }
        }
        if !self.evict_main() {
            self.evict_small();
        }
    }

    /// Evicts one entry from the small queue, promoting frequently read ones.
    fn evict_small(&mut self) -> bool {
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.queue != Queue::Small {
                continue;
            }
            if entry.freq.load(Ordering::Relaxed) > 1 {
                entry.queue = Queue::Main;
                entry.freq.store(0, Ordering::Relaxed);
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.remember(key);
                return true;
            }
        }
        false
    }

    fn evict_main(&mut self) -> bool {
        while let Some(key) = self.main.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.queue != Queue::Main {
                continue;
            }
            let freq = entry.freq.load(Ordering::Relaxed);
            if freq > 0 {
                entry.freq.store(freq - 1, Ordering::Relaxed);
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn remember(&mut self, key: K) {
        if self.ghost.len() >= self.capacity {
            if let Some(oldest) = self.ghost.pop_front() {
                self.ghost_keys.remove(&oldest);
            }
        }
        self.ghost_keys.insert(key.clone());
        self.ghost.push_back(key);
    }
}

#[derive(Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn test_push_and_read() {
        let mut cache = Cache::new(2);

        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some(&"red"));
        assert_eq!(cache.get(&"banana"), Some(&"yellow"));
    }

    #[test]
    fn test_push_removes_oldest() {
        let mut cache = Cache::new(2);

        for (fruit, color) in [
            ("apple", "red"),
            ("banana", "yellow"),
            ("orange", "orange"),
            ("pear", "green"),
            ("peach", "pink"),
        ] {
            cache.insert(fruit, color);
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"apple").is_none());
        assert_eq!(cache.get(&"pear"), Some(&"green"));
        assert_eq!(cache.get(&"peach"), Some(&"pink"));
    }

    #[test]
    fn test_frequently_read_entries_survive() {
        let mut cache = Cache::new(10);
        cache.insert(0, 0);
        for _ in 0..3 {
            assert_eq!(cache.get(&0), Some(&0));
        }
        for i in 1..30 {
            cache.insert(i, i);
        }
        assert_eq!(cache.get(&0), Some(&0));
        assert!(cache.len() <= 10);
    }

    #[test]
    fn test_remove() {
        let mut cache = Cache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        assert_eq!(cache.remove(&1), Some("one"));
        assert!(cache.get(&1).is_none());
        for i in 3..10 {
            cache.insert(i, "many");
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_no_memory_leaks() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug, Clone)]
        struct DropCounter;

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, SeqCst);
            }
        }

        let n = 100;
        for _ in 0..n {
            let mut cache = Cache::new(20);
            for i in 0..n {
                cache.insert(i, DropCounter {});
            }
        }
        assert_eq!(DROP_COUNT.load(SeqCst), n * n);
    }

    #[test]
    fn test_hit_ratio() {
        let cap = 10;
        let mut cache = Cache::new(cap);

        for i in 0..cap {
            cache.insert(i, i);
        }
        for i in 0..cap {
            assert_eq!(cache.get(&i), Some(&i));
        }
        assert!(cache.get(&cap).is_none());

        assert_eq!(cache.stats(), (cap, 1));
    }
}

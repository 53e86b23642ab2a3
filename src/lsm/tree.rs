//! The log-structured merge tree of a single store.
//!
//! ```text
//!   put_all ──► active map ──seal──► sealed map ──flush──► level/tier 0 file
//!                                                              │
//!                                        merge_files ◄─────────┘
//!                                             │
//!                                  higher level/tier files
//! ```
//!
//! The file list, both in-memory maps and the TSN watermarks live behind one
//! read-write lock. Readers capture all of them at once, so a reader sees
//! every entry exactly once no matter how flushes and merges interleave with
//! its iteration.

use super::compaction::{
    self, CompactionMerge, CompactionPlan, CompactionTrigger, FileSize, OutputOptions,
};
use super::cursor_manager::{CursorManager, OwnedCursor, OwnerId};
use super::file::{self, HeaderCache, LsmFile};
use super::forest::ForestMemoryManager;
use super::garbage::GarbageFileManager;
use super::task_queue::{TaskHandle, TaskKind, TaskQueue};
use super::Interrupt;
use crate::config::CompactionStrategy;
use crate::cursor::{
    BoundaryCheckingCursor, BoxedCursor, Cursor, FileRange, LevelOrTierCursor, MemtableCursor,
    OverlayCursor, VersioningCursor,
};
use crate::error::Result;
use crate::manifest::{ManifestFile, ManifestOperation, StoreMetadata};
use crate::model::{Command, FileIndex, KeyAndTsn, LevelOrTier, StoreId, Tsn};
use crate::sstable::{self, CompressionType, FileHeader, WriterOptions};
use crate::Error;

use crossbeam_skiplist::SkipMap;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

type Memtable = SkipMap<KeyAndTsn, Command>;

/// Provides the oldest TSN any current or future reader may still read at.
pub type HorizonProvider = Arc<dyn Fn() -> Tsn + Send + Sync>;

/// Everything a tree shares with the other trees of the engine.
#[derive(Clone)]
pub struct TreeContext {
    pub manifest: Arc<ManifestFile>,
    pub forest: Arc<ForestMemoryManager>,
    pub header_cache: Arc<dyn HeaderCache>,
    pub horizon: HorizonProvider,
    pub interrupt: Interrupt,
    pub flush_runtime: Handle,
    pub compaction_runtime: Handle,
    pub max_block_size: usize,
    pub compression: CompressionType,
    pub max_file_size: u64,
}

#[derive(Debug, Clone)]
pub struct FlushResult {
    pub file_index: FileIndex,
    pub path: PathBuf,
    pub bytes_written: u64,
    pub entries_written: u64,
    pub runtime: Duration,
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub trigger: CompactionTrigger,
    pub input_files: Vec<FileIndex>,
    pub output_files: Vec<FileIndex>,
    pub output_level_or_tier: LevelOrTier,
    pub entries_written: u64,
    pub entries_dropped: u64,
    pub bytes_written: u64,
    pub runtime: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    pub file_index: FileIndex,
    pub size_on_disk: u64,
    pub total_entries: u64,
    pub head_entries: u64,
    pub history_entries: u64,
    pub min_tsn: Tsn,
    pub max_tsn: Tsn,
    pub merges: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerReport {
    pub level_or_tier: LevelOrTier,
    pub files: Vec<FileReport>,
}

impl LayerReport {
    pub fn size_on_disk(&self) -> u64 {
        self.files.iter().map(|f| f.size_on_disk).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreReport {
    pub store_id: StoreId,
    pub valid_from: Tsn,
    pub valid_to: Option<Tsn>,
    pub compaction_strategy: CompactionStrategy,
    /// Highest layer first.
    pub layers: Vec<LayerReport>,
    pub in_memory_entries: usize,
    pub in_memory_bytes: usize,
    pub sealed_entries: usize,
    pub highest_written_tsn: Tsn,
    pub persisted_tsn: Tsn,
    pub garbage_files: usize,
}

#[derive(Clone)]
struct TreeFile {
    file: LsmFile,
    level_or_tier: LevelOrTier,
    header: Arc<FileHeader>,
}

impl TreeFile {
    fn order_key(&self) -> (Reverse<LevelOrTier>, FileIndex) {
        (Reverse(self.level_or_tier), self.file.index())
    }

    fn range(&self) -> Option<FileRange> {
        self.header.metadata.key_range.as_ref().map(|range| FileRange {
            min_key: range.first.key.clone(),
            max_key: range.last.key.clone(),
        })
    }
}

struct Sealed {
    map: Arc<Memtable>,
    bytes: usize,
    /// Every transaction up to here is contained in the files plus this map.
    max_completely_written_tsn: Tsn,
}

struct TreeState {
    active: Arc<Memtable>,
    active_bytes: usize,
    sealed: Option<Sealed>,
    /// Oldest data first: level/tier descending, then file index ascending.
    files: Vec<TreeFile>,
    highest_written_tsn: Tsn,
    persisted_tsn: Tsn,
    valid_to: Option<Tsn>,
}

impl TreeState {
    fn in_memory_bytes(&self) -> usize {
        self.active_bytes + self.sealed.as_ref().map_or(0, |s| s.bytes)
    }

    fn has_in_memory_data(&self) -> bool {
        !self.active.is_empty() || self.sealed.is_some()
    }

    fn sort_files(&mut self) {
        self.files.sort_by_key(TreeFile::order_key);
    }
}

fn floor_in(map: &Memtable, key: &KeyAndTsn) -> Option<Command> {
    map.range(..=key.clone())
        .next_back()
        .filter(|entry| entry.key().key == key.key)
        .map(|entry| entry.value().clone())
}

pub struct LsmTree {
    store_id: StoreId,
    dir: PathBuf,
    valid_from: Tsn,
    compaction_strategy: CompactionStrategy,
    context: TreeContext,
    state: RwLock<TreeState>,
    next_file_index: AtomicU64,
    cursor_manager: Arc<CursorManager>,
    garbage: GarbageFileManager,
    flush_lock: Mutex<()>,
    merge_lock: Mutex<()>,
    flush_queue: TaskQueue<Option<FlushResult>>,
    compaction_queue: TaskQueue<Option<CompactionResult>>,
}

impl LsmTree {
    /// Opens the tree described by `metadata` in `dir`, reconciling the
    /// directory with the manifest: files the manifest does not know are
    /// deleted, files it knows but the directory lacks are an error.
    pub fn open(dir: PathBuf, metadata: &StoreMetadata, context: TreeContext) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let store_id = metadata.store_id.clone();

        let mut on_disk: BTreeSet<FileIndex> = BTreeSet::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match file::parse_file_name(&name) {
                Some(index) if metadata.files.contains_key(&index) => {
                    on_disk.insert(index);
                }
                Some(index) => {
                    tracing::warn!(store = %store_id, file = %name, "Deleting file unknown to the manifest");
                    std::fs::remove_file(entry.path())?;
                    on_disk.insert(index);
                }
                None if name.ends_with(".tmp") => {
                    tracing::warn!(store = %store_id, file = %name, "Deleting incomplete file");
                    std::fs::remove_file(entry.path())?;
                }
                None => {
                    tracing::debug!(store = %store_id, file = %name, "Ignoring foreign file");
                }
            }
        }

        let mut files = Vec::with_capacity(metadata.files.len());
        for info in metadata.files.values() {
            let lsm_file = LsmFile::new(&dir, info.file_index, context.header_cache.clone());
            if !on_disk.contains(&info.file_index) {
                return Err(Error::FileMissing(lsm_file.path().to_path_buf()));
            }
            let header = lsm_file.header()?;
            files.push(TreeFile {
                file: lsm_file,
                level_or_tier: info.level_or_tier,
                header,
            });
        }

        let persisted_tsn = files
            .iter()
            .map(|f| f.header.metadata.max_completely_written_tsn)
            .max()
            .unwrap_or(0);
        let next_file_index = on_disk
            .iter()
            .chain(metadata.files.keys())
            .max()
            .map_or(0, |max| max + 1);

        let mut state = TreeState {
            active: Arc::new(SkipMap::new()),
            active_bytes: 0,
            sealed: None,
            files,
            highest_written_tsn: persisted_tsn,
            persisted_tsn,
            valid_to: metadata.valid_to,
        };
        state.sort_files();

        tracing::info!(
            store = %store_id,
            files = state.files.len(),
            persisted_tsn,
            "Opened store"
        );

        let flush_queue = TaskQueue::new(format!("{}/flush", store_id), context.flush_runtime.clone());
        let compaction_queue =
            TaskQueue::new(format!("{}/compaction", store_id), context.compaction_runtime.clone());

        Ok(Self {
            store_id,
            dir,
            valid_from: metadata.valid_from,
            compaction_strategy: metadata.compaction_strategy.clone(),
            context,
            state: RwLock::new(state),
            next_file_index: AtomicU64::new(next_file_index),
            cursor_manager: Arc::new(CursorManager::new()),
            garbage: GarbageFileManager::new(),
            flush_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            flush_queue,
            compaction_queue,
        })
    }

    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn valid_from(&self) -> Tsn {
        self.valid_from
    }

    pub fn valid_to(&self) -> Option<Tsn> {
        self.state.read().valid_to
    }

    pub fn is_terminated(&self) -> bool {
        self.valid_to().is_some()
    }

    pub fn is_visible_at(&self, tsn: Tsn) -> bool {
        self.valid_from <= tsn && self.valid_to().map_or(true, |valid_to| tsn < valid_to)
    }

    pub fn compaction_strategy(&self) -> &CompactionStrategy {
        &self.compaction_strategy
    }

    pub fn cursor_manager(&self) -> &Arc<CursorManager> {
        &self.cursor_manager
    }

    /// Rejects every later write.
    pub fn terminate(&self, valid_to: Tsn) {
        self.state.write().valid_to = Some(valid_to);
    }

    pub fn highest_written_tsn(&self) -> Tsn {
        self.state.read().highest_written_tsn
    }

    /// Highest TSN up to which every transaction is on disk.
    pub fn persisted_tsn(&self) -> Tsn {
        self.state.read().persisted_tsn
    }

    pub fn has_in_memory_data(&self) -> bool {
        self.state.read().has_in_memory_data()
    }

    pub fn in_memory_bytes(&self) -> usize {
        self.state.read().in_memory_bytes()
    }

    pub fn file_indices(&self) -> Vec<FileIndex> {
        self.state.read().files.iter().map(|f| f.file.index()).collect()
    }

    fn allocate_file_index(&self) -> FileIndex {
        self.next_file_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Newest version of `key.key` with a TSN at or below `key.tsn`,
    /// tombstones included.
    pub fn get_latest_version(&self, key: &KeyAndTsn) -> Result<Option<Command>> {
        let state = self.state.read();
        if let Some(command) = floor_in(&state.active, key) {
            return Ok(Some(command));
        }
        if let Some(sealed) = &state.sealed {
            if let Some(command) = floor_in(&sealed.map, key) {
                return Ok(Some(command));
            }
        }
        for file in state.files.iter().rev() {
            if let Some(command) = file.file.get_latest_version(key)? {
                return Ok(Some(command));
            }
        }
        Ok(None)
    }

    /// Opens a cursor over the store as of `tsn`. Tombstones are hidden.
    ///
    /// Files read by the cursor are protected from garbage collection until
    /// the cursor is closed or dropped, or until `owner` ends and the cursor
    /// manager closes its cursors.
    pub fn open_cursor(&self, tsn: Tsn, owner: OwnerId) -> Result<OwnedCursor> {
        let state = self.state.read();

        let mut raw: Vec<BoxedCursor<KeyAndTsn, Command>> = Vec::new();
        for (_, group) in &state.files.iter().chunk_by(|f| f.level_or_tier) {
            let layer: Vec<TreeFile> = group.cloned().collect();
            raw.extend(self.layer_cursors(layer)?);
        }
        if let Some(sealed) = &state.sealed {
            raw.push(Box::new(MemtableCursor::new(sealed.map.clone())));
        }
        raw.push(Box::new(MemtableCursor::new(state.active.clone())));

        // Registered before the read lock is released so that no merge can
        // mark these files as garbage unnoticed.
        let names: Vec<String> = state.files.iter().map(|f| f.file.name()).collect();
        let (release, revocation) = self.cursor_manager.register(names, owner);
        drop(state);

        let versioned: Vec<BoxedCursor<Vec<u8>, Command>> = raw
            .into_iter()
            .map(|cursor| Box::new(VersioningCursor::new(cursor, tsn, true)) as BoxedCursor<Vec<u8>, Command>)
            .collect();
        let mut overlay = OverlayCursor::new(versioned);
        overlay.on_close(release);
        Ok(OwnedCursor::new(Box::new(overlay), revocation))
    }

    /// Cursors over one layer, oldest data first.
    fn layer_cursors(&self, layer: Vec<TreeFile>) -> Result<Vec<BoxedCursor<KeyAndTsn, Command>>> {
        let level_or_tier = layer.first().map_or(0, |f| f.level_or_tier);
        if level_or_tier > 0 && layer.len() > 1 {
            let mut by_range = layer.clone();
            by_range.sort_by(|a, b| a.range().map(|r| r.min_key).cmp(&b.range().map(|r| r.min_key)));
            let disjoint = by_range
                .iter()
                .filter_map(TreeFile::range)
                .tuple_windows()
                .all(|(a, b)| a.max_key < b.min_key);
            if disjoint {
                let ranges = by_range.iter().map(TreeFile::range).collect();
                let files: Vec<TreeFile> = by_range;
                let opener = Box::new(move |position: usize| -> Result<BoxedCursor<KeyAndTsn, Command>> {
                    let file = files
                        .get(position)
                        .ok_or_else(|| Error::InvalidState(format!("No file at position {}", position)))?;
                    Ok(Box::new(file.file.cursor()?))
                });
                return Ok(vec![Box::new(LevelOrTierCursor::new(ranges, opener))]);
            }
        }

        layer
            .into_iter()
            .map(|f| -> Result<BoxedCursor<KeyAndTsn, Command>> {
                let cursor: BoxedCursor<KeyAndTsn, Command> = Box::new(sstable::open_cursor(f.file.path(), f.header)?);
                Ok(Box::new(BoundaryCheckingCursor::new(cursor)))
            })
            .collect()
    }

    /// Adds committed commands to the in-memory data.
    ///
    /// Blocks while the forest is full. Fails if a `(key, tsn)` is already
    /// present, in which case nothing is inserted.
    pub fn put_all(&self, commands: Vec<Command>) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let bytes: usize = commands.iter().map(Command::byte_size).sum();
        self.context
            .forest
            .on_before_in_memory_insert(&self.store_id, bytes)?;

        let outcome = Self::insert(&mut self.state.write(), &self.store_id, commands, bytes);
        if outcome.is_err() {
            self.context.forest.on_in_memory_flush(&self.store_id, bytes);
        }
        outcome
    }

    fn insert(state: &mut TreeState, store_id: &StoreId, commands: Vec<Command>, bytes: usize) -> Result<()> {
        if state.valid_to.is_some() {
            return Err(Error::StoreTerminated(store_id.to_string()));
        }
        let mut batch = HashSet::with_capacity(commands.len());
        for command in &commands {
            let key = command.key_and_tsn();
            let present = state.active.contains_key(&key)
                || state.sealed.as_ref().is_some_and(|s| s.map.contains_key(&key));
            if present || !batch.insert(key.clone()) {
                return Err(Error::DuplicateEntry(format!("{} in store '{}'", key, store_id)));
            }
        }
        for command in commands {
            state.active.insert(command.key_and_tsn(), command);
        }
        state.active_bytes += bytes;
        Ok(())
    }

    /// Records that every command up to `tsn` has been inserted.
    pub fn record_highest_written_tsn(&self, tsn: Tsn) {
        let mut state = self.state.write();
        state.highest_written_tsn = state.highest_written_tsn.max(tsn);
    }

    /// Writes the in-memory data into a new level/tier 0 file.
    ///
    /// Does nothing and returns `None` while the active map holds fewer than
    /// `min_bytes` bytes. A map left behind by a failed flush is always
    /// written.
    pub fn flush_in_memory_data_to_disk(&self, min_bytes: usize) -> Result<Option<FlushResult>> {
        let _flushing = self.flush_lock.lock();
        let started = Instant::now();

        let (map, max_completely_written_tsn) = {
            let mut state = self.state.write();
            if state.sealed.is_none() {
                if state.active.is_empty() || state.active_bytes < min_bytes {
                    return Ok(None);
                }
                let map = std::mem::replace(&mut state.active, Arc::new(SkipMap::new()));
                let bytes = std::mem::take(&mut state.active_bytes);
                state.sealed = Some(Sealed {
                    map,
                    bytes,
                    max_completely_written_tsn: state.highest_written_tsn,
                });
            }
            match &state.sealed {
                Some(sealed) => (sealed.map.clone(), sealed.max_completely_written_tsn),
                None => return Ok(None),
            }
        };

        self.write_sealed(map, max_completely_written_tsn, started)
            .map_err(|e| Error::Flush {
                store: self.store_id.to_string(),
                source: Box::new(e),
            })
    }

    fn write_sealed(
        &self,
        map: Arc<Memtable>,
        max_completely_written_tsn: Tsn,
        started: Instant,
    ) -> Result<Option<FlushResult>> {
        self.context.interrupt.check()?;
        let file_index = self.allocate_file_index();
        let lsm_file = LsmFile::new(&self.dir, file_index, self.context.header_cache.clone());
        let metadata = sstable::write_file(
            lsm_file.path(),
            map.iter().map(|entry| entry.value().clone()),
            WriterOptions {
                max_block_size: self.context.max_block_size,
                compression: self.context.compression,
                merges: 0,
                max_completely_written_tsn,
            },
        )?;

        let header = match self
            .context
            .interrupt
            .check()
            .and_then(|_| self.context.manifest.append_flush_operation(&self.store_id, file_index))
            .and_then(|_| lsm_file.header())
        {
            Ok(header) => header,
            Err(e) => {
                // Unless the manifest took it, the file is not part of the store.
                let recorded = self
                    .context
                    .manifest
                    .get_manifest()
                    .store(&self.store_id)
                    .is_some_and(|s| s.files.contains_key(&file_index));
                if !recorded {
                    if let Err(remove) = lsm_file.delete() {
                        tracing::warn!(store = %self.store_id, file_index, error = %remove, "Failed to remove unrecorded flush output");
                    }
                }
                return Err(e);
            }
        };
        let bytes_written = header.file_size;

        let released = {
            let mut state = self.state.write();
            let released = state.sealed.take().map_or(0, |sealed| sealed.bytes);
            state.files.push(TreeFile {
                file: lsm_file.clone(),
                level_or_tier: 0,
                header,
            });
            state.sort_files();
            state.persisted_tsn = state.persisted_tsn.max(max_completely_written_tsn);
            released
        };
        self.context.forest.on_in_memory_flush(&self.store_id, released);

        let result = FlushResult {
            file_index,
            path: lsm_file.path().to_path_buf(),
            bytes_written,
            entries_written: metadata.total_entries,
            runtime: started.elapsed(),
        };
        tracing::info!(
            store = %self.store_id,
            file_index,
            entries = result.entries_written,
            bytes = result.bytes_written,
            runtime_ms = result.runtime.as_millis() as u64,
            "Flushed in-memory data"
        );
        Ok(Some(result))
    }

    fn file_sizes(&self) -> Vec<FileSize> {
        self.state
            .read()
            .files
            .iter()
            .map(|f| FileSize {
                file_index: f.file.index(),
                level_or_tier: f.level_or_tier,
                size: f.header.file_size,
            })
            .collect()
    }

    fn run_plan(&self, plan: Option<CompactionPlan>, keep_tombstones: impl Fn(&CompactionPlan) -> bool) -> Result<Option<CompactionResult>> {
        let Some(plan) = plan else {
            tracing::debug!(store = %self.store_id, "Nothing to compact");
            return Ok(None);
        };
        let keep = keep_tombstones(&plan);
        self.merge_files(&plan.file_indices(), plan.output_level_or_tier, keep, plan.trigger)
            .map(Some)
    }

    /// Runs the compaction the store's strategy asks for, if any.
    pub fn compact_minor(&self) -> Result<Option<CompactionResult>> {
        let files = self.file_sizes();
        let plan = compaction::select_minor(&files, &self.compaction_strategy);
        self.run_plan(plan, |plan| plan.keeps_tombstones(&files))
    }

    /// Merges every file into the highest level or tier.
    pub fn compact_major(&self) -> Result<Option<CompactionResult>> {
        let files = self.file_sizes();
        let plan = compaction::select_full(&files, &self.compaction_strategy);
        self.run_plan(plan, |_| false)
    }

    /// Merges the given files, which must be adjacent in file order, into
    /// new files at `output_level_or_tier`.
    pub fn merge_files(
        &self,
        file_indices: &BTreeSet<FileIndex>,
        output_level_or_tier: LevelOrTier,
        keep_tombstones: bool,
        trigger: CompactionTrigger,
    ) -> Result<CompactionResult> {
        let _merging = self.merge_lock.lock();
        let started = Instant::now();
        let inputs = self.contiguous_inputs(file_indices)?;

        if output_level_or_tier > self.compaction_strategy.max_level_or_tier() {
            return Err(Error::InvalidInput(format!(
                "Level or tier {} exceeds the maximum of store '{}'",
                output_level_or_tier, self.store_id
            )));
        }
        if let Some(highest) = inputs.iter().map(|f| f.level_or_tier).max() {
            if output_level_or_tier < highest {
                return Err(Error::InvalidInput(format!(
                    "Cannot merge level or tier {} down into {}",
                    highest, output_level_or_tier
                )));
            }
        }

        self.merge_inputs(&inputs, output_level_or_tier, keep_tombstones, trigger, started)
            .map_err(|e| Error::Compaction {
                store: self.store_id.to_string(),
                source: Box::new(e),
            })
    }

    fn contiguous_inputs(&self, file_indices: &BTreeSet<FileIndex>) -> Result<Vec<TreeFile>> {
        if file_indices.is_empty() {
            return Err(Error::InvalidInput("No files to merge".to_string()));
        }
        let state = self.state.read();
        let positions: Vec<usize> = state
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| file_indices.contains(&f.file.index()))
            .map(|(i, _)| i)
            .collect();
        if positions.len() != file_indices.len() {
            let known: BTreeSet<FileIndex> = state.files.iter().map(|f| f.file.index()).collect();
            let missing: Vec<&FileIndex> = file_indices.difference(&known).collect();
            return Err(Error::InvalidInput(format!(
                "Files {:?} are not part of store '{}'",
                missing, self.store_id
            )));
        }
        if positions.windows(2).any(|w| w[1] != w[0] + 1) {
            return Err(Error::NonContiguousMerge(format!(
                "Files {:?} of store '{}' are not adjacent in file order",
                file_indices, self.store_id
            )));
        }
        Ok(positions.into_iter().map(|i| state.files[i].clone()).collect())
    }

    fn merge_inputs(
        &self,
        inputs: &[TreeFile],
        output_level_or_tier: LevelOrTier,
        keep_tombstones: bool,
        trigger: CompactionTrigger,
        started: Instant,
    ) -> Result<CompactionResult> {
        self.context.interrupt.check()?;
        let horizon = (self.context.horizon)();
        let merges = inputs.iter().map(|f| f.header.metadata.merges).max().unwrap_or(0) + 1;
        let max_completely_written_tsn = inputs
            .iter()
            .map(|f| f.header.metadata.max_completely_written_tsn)
            .max()
            .unwrap_or(0);

        tracing::info!(
            store = %self.store_id,
            ?trigger,
            inputs = inputs.len(),
            output_level_or_tier,
            keep_tombstones,
            horizon,
            "Merging files"
        );

        let mut cursors: Vec<BoxedCursor<KeyAndTsn, Command>> = Vec::with_capacity(inputs.len());
        for input in inputs {
            cursors.push(Box::new(sstable::open_cursor(input.file.path(), input.header.clone())?));
        }
        let mut merge = CompactionMerge::new(cursors, horizon, keep_tombstones);
        let interrupt = self.context.interrupt.clone();
        let written = compaction::write_merge_output(
            &mut merge,
            OutputOptions {
                dir: &self.dir,
                max_file_size: self.context.max_file_size,
                writer: WriterOptions {
                    max_block_size: self.context.max_block_size,
                    compression: self.context.compression,
                    merges,
                    max_completely_written_tsn,
                },
            },
            || self.allocate_file_index(),
            &move || interrupt.is_triggered(),
        );
        let entries_dropped = merge.dropped();
        let closed = merge.close();
        let written = written?;
        closed?;

        let outputs: Vec<LsmFile> = written
            .iter()
            .map(|(index, _)| LsmFile::new(&self.dir, *index, self.context.header_cache.clone()))
            .collect();
        let discard_outputs = |outputs: &[LsmFile]| {
            for output in outputs {
                if let Err(e) = output.delete() {
                    tracing::warn!(store = %self.store_id, file = %output.name(), error = %e, "Failed to remove merge output");
                }
            }
        };

        let operation = self.merge_operation(inputs, output_level_or_tier, &outputs, trigger);
        let recorded = self
            .context
            .interrupt
            .check()
            .and_then(|_| self.context.manifest.append_operation(operation));
        if let Err(e) = recorded {
            discard_outputs(&outputs);
            return Err(e);
        }

        let mut headers = Vec::with_capacity(outputs.len());
        for output in &outputs {
            headers.push(output.header()?);
        }
        let bytes_written = headers.iter().map(|h| h.file_size).sum();

        let input_indices: BTreeSet<FileIndex> = inputs.iter().map(|f| f.file.index()).collect();
        {
            let mut state = self.state.write();
            state.files.retain(|f| !input_indices.contains(&f.file.index()));
            for (output, header) in outputs.iter().zip(headers) {
                state.files.push(TreeFile {
                    file: output.clone(),
                    level_or_tier: output_level_or_tier,
                    header,
                });
            }
            state.sort_files();
        }
        self.garbage.mark(inputs.iter().map(|f| f.file.name()));
        self.perform_garbage_collection();

        let result = CompactionResult {
            trigger,
            input_files: input_indices.into_iter().collect(),
            output_files: outputs.iter().map(LsmFile::index).collect(),
            output_level_or_tier,
            entries_written: written.iter().map(|(_, m)| m.total_entries).sum(),
            entries_dropped,
            bytes_written,
            runtime: started.elapsed(),
        };
        tracing::info!(
            store = %self.store_id,
            ?trigger,
            outputs = result.output_files.len(),
            entries = result.entries_written,
            dropped = result.entries_dropped,
            runtime_ms = result.runtime.as_millis() as u64,
            "Merged files"
        );
        Ok(result)
    }

    fn merge_operation(
        &self,
        inputs: &[TreeFile],
        output_level_or_tier: LevelOrTier,
        outputs: &[LsmFile],
        trigger: CompactionTrigger,
    ) -> impl FnOnce(u64) -> ManifestOperation {
        let store_id = self.store_id.clone();
        let mut by_level: BTreeMap<LevelOrTier, BTreeSet<FileIndex>> = BTreeMap::new();
        for input in inputs {
            by_level.entry(input.level_or_tier).or_default().insert(input.file.index());
        }
        let output_file_indices: BTreeSet<FileIndex> = outputs.iter().map(LsmFile::index).collect();

        move |seq| match trigger {
            CompactionTrigger::TierSpaceAmplification
            | CompactionTrigger::TierSizeRatio
            | CompactionTrigger::TierHeightReduction => ManifestOperation::TieredCompaction {
                seq,
                store_id,
                tier_to_file_indices: by_level,
                output_tier: output_level_or_tier,
                output_file_indices,
            },
            CompactionTrigger::LeveledLevel0 | CompactionTrigger::LeveledTargetSizeRatio => {
                let mut levels = by_level.into_iter();
                let (lower_level, lower_level_file_indices) = levels.next().unwrap_or_default();
                let (upper_level, upper_level_file_indices) = levels
                    .next()
                    .unwrap_or((output_level_or_tier, BTreeSet::new()));
                ManifestOperation::LeveledCompaction {
                    seq,
                    store_id,
                    lower_level,
                    lower_level_file_indices,
                    upper_level,
                    upper_level_file_indices,
                    output_level: output_level_or_tier,
                    output_file_indices,
                }
            }
            CompactionTrigger::FullCompaction => ManifestOperation::FullCompaction {
                seq,
                store_id,
                input_file_indices: by_level.into_values().flatten().collect(),
                output_level_or_tier,
                output_file_indices,
            },
        }
    }

    /// Deletes every garbage file no cursor reads anymore. Returns how many
    /// files were deleted; failures are retried on the next call.
    pub fn perform_garbage_collection(&self) -> usize {
        let mut deleted = 0;
        for name in self.garbage.files() {
            if self.cursor_manager.has_open_cursors(&name) {
                tracing::debug!(store = %self.store_id, file = %name, "Garbage file still in use");
                continue;
            }
            let Some(index) = file::parse_file_name(&name) else {
                self.garbage.remove(&name);
                continue;
            };
            let lsm_file = LsmFile::new(&self.dir, index, self.context.header_cache.clone());
            match lsm_file.delete() {
                Ok(()) | Err(Error::FileMissing(_)) => {
                    self.garbage.remove(&name);
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(store = %self.store_id, file = %name, error = %e, "Failed to delete garbage file");
                }
            }
        }
        if deleted > 0 {
            tracing::debug!(store = %self.store_id, deleted, "Collected garbage files");
        }
        deleted
    }

    pub fn garbage_files(&self) -> Vec<String> {
        self.garbage.files()
    }

    pub fn schedule_flush(self: &Arc<Self>, min_bytes: usize) -> TaskHandle<Option<FlushResult>> {
        let tree = Arc::clone(self);
        self.flush_queue
            .schedule(TaskKind::Flush, move || tree.flush_in_memory_data_to_disk(min_bytes))
    }

    pub fn schedule_minor_compaction(self: &Arc<Self>) -> TaskHandle<Option<CompactionResult>> {
        let tree = Arc::clone(self);
        self.compaction_queue
            .schedule(TaskKind::MinorCompaction, move || tree.compact_minor())
    }

    /// Waiting minor compactions become pointless and are cancelled.
    pub fn schedule_major_compaction(self: &Arc<Self>) -> TaskHandle<Option<CompactionResult>> {
        let cancelled = self
            .compaction_queue
            .cancel_waiting_tasks_if(|kind| kind == TaskKind::MinorCompaction);
        if cancelled > 0 {
            tracing::debug!(store = %self.store_id, cancelled, "Superseded minor compactions");
        }
        let tree = Arc::clone(self);
        self.compaction_queue
            .schedule(TaskKind::MajorCompaction, move || tree.compact_major())
    }

    pub fn report(&self) -> StoreReport {
        let state = self.state.read();
        let mut layers: Vec<LayerReport> = Vec::new();
        for (level_or_tier, group) in &state.files.iter().chunk_by(|f| f.level_or_tier) {
            let files = group
                .map(|f| {
                    let metadata = &f.header.metadata;
                    FileReport {
                        file_index: f.file.index(),
                        size_on_disk: f.header.file_size,
                        total_entries: metadata.total_entries,
                        head_entries: metadata.head_entries,
                        history_entries: metadata.history_entries,
                        min_tsn: metadata.min_tsn,
                        max_tsn: metadata.max_tsn,
                        merges: metadata.merges,
                    }
                })
                .collect();
            layers.push(LayerReport { level_or_tier, files });
        }
        StoreReport {
            store_id: self.store_id.clone(),
            valid_from: self.valid_from,
            valid_to: state.valid_to,
            compaction_strategy: self.compaction_strategy.clone(),
            layers,
            in_memory_entries: state.active.len(),
            in_memory_bytes: state.in_memory_bytes(),
            sealed_entries: state.sealed.as_ref().map_or(0, |s| s.map.len()),
            highest_written_tsn: state.highest_written_tsn,
            persisted_tsn: state.persisted_tsn,
            garbage_files: self.garbage.len(),
        }
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("store_id", &self.store_id)
            .field("dir", &self.dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeveledCompaction;
    use crate::cursor::testing::key_str;
    use crate::cursor::CursorExt;
    use crate::lsm::file::header_cache;
    use crate::lsm::task_queue::WorkerPool;
    use crate::tmpfs::TempDir;

    struct Fixture {
        dir: TempDir,
        manifest: Arc<ManifestFile>,
        forest: Arc<ForestMemoryManager>,
        horizon: Arc<AtomicU64>,
        pool: WorkerPool,
        store_id: StoreId,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = TempDir::new()?;
            let manifest = Arc::new(ManifestFile::open(dir.path())?);
            let store_id = StoreId::new("items")?;
            manifest.append_create_store_operation(
                &store_id,
                1,
                CompactionStrategy::Leveled(LeveledCompaction::default()),
            )?;
            Ok(Self {
                dir,
                manifest,
                forest: Arc::new(ForestMemoryManager::new(1 << 30, 1 << 30)),
                horizon: Arc::new(AtomicU64::new(0)),
                pool: WorkerPool::new("tree-test", 2)?,
                store_id,
            })
        }

        fn store_dir(&self) -> PathBuf {
            self.dir.path().join("stores").join(self.store_id.as_str())
        }

        fn open(&self) -> Result<Arc<LsmTree>> {
            let horizon = self.horizon.clone();
            let context = TreeContext {
                manifest: self.manifest.clone(),
                forest: self.forest.clone(),
                header_cache: header_cache(16),
                horizon: Arc::new(move || horizon.load(Ordering::SeqCst)),
                interrupt: Interrupt::new(),
                flush_runtime: self.pool.handle()?,
                compaction_runtime: self.pool.handle()?,
                max_block_size: 256,
                compression: CompressionType::Lz4,
                max_file_size: 1 << 20,
            };
            let manifest = self.manifest.get_manifest();
            let metadata = manifest
                .store(&self.store_id)
                .ok_or_else(|| Error::StoreNotFound(self.store_id.to_string()))?;
            Ok(Arc::new(LsmTree::open(self.store_dir(), metadata, context)?))
        }
    }

    fn write(tree: &LsmTree, tsn: Tsn, commands: Vec<Command>) -> Result<()> {
        tree.put_all(commands)?;
        tree.record_highest_written_tsn(tsn);
        Ok(())
    }

    fn visible(tree: &LsmTree, tsn: Tsn) -> Result<Vec<(String, String)>> {
        let mut cursor = tree.open_cursor(tsn, 1)?;
        let entries = cursor
            .ascending_entries()
            .map(|entry| {
                entry.map(|(key, command)| {
                    (key_str(&key), String::from_utf8_lossy(command.value().unwrap_or_default()).into_owned())
                })
            })
            .collect::<Result<_>>()?;
        cursor.close()?;
        Ok(entries)
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_reads_across_memory_and_files() -> Result<()> {
        let fixture = Fixture::new()?;
        let tree = fixture.open()?;

        write(&tree, 1, vec![Command::put("a", 1, "a1"), Command::put("b", 1, "b1")])?;
        let flushed = tree.flush_in_memory_data_to_disk(0)?.expect("data was flushed");
        assert_eq!(flushed.entries_written, 2);
        assert_eq!(tree.persisted_tsn(), 1);

        write(&tree, 2, vec![Command::put("a", 2, "a2"), Command::delete("b", 2)])?;

        assert_eq!(
            tree.get_latest_version(&KeyAndTsn::new("a", 1))?,
            Some(Command::put("a", 1, "a1"))
        );
        assert_eq!(
            tree.get_latest_version(&KeyAndTsn::new("b", 5))?,
            Some(Command::delete("b", 2))
        );
        assert_eq!(visible(&tree, 1)?, pairs(&[("a", "a1"), ("b", "b1")]));
        assert_eq!(visible(&tree, 2)?, pairs(&[("a", "a2")]));
        Ok(())
    }

    #[test]
    fn test_rejects_duplicates_and_terminated_writes() -> Result<()> {
        let fixture = Fixture::new()?;
        let tree = fixture.open()?;

        write(&tree, 1, vec![Command::put("a", 1, "a1")])?;
        let before = fixture.forest.tree_size(tree.store_id());
        assert!(matches!(
            tree.put_all(vec![Command::put("b", 1, "b1"), Command::put("a", 1, "again")]),
            Err(Error::DuplicateEntry(_))
        ));
        assert_eq!(tree.get_latest_version(&KeyAndTsn::new("b", 1))?, None);
        assert_eq!(fixture.forest.tree_size(tree.store_id()), before);

        tree.terminate(3);
        assert!(!tree.is_visible_at(3));
        assert!(tree.is_visible_at(2));
        assert!(matches!(
            tree.put_all(vec![Command::put("c", 4, "c4")]),
            Err(Error::StoreTerminated(_))
        ));
        Ok(())
    }

    #[test]
    fn test_flush_during_iteration_shows_entries_once() -> Result<()> {
        let fixture = Fixture::new()?;
        let tree = fixture.open()?;
        write(&tree, 1, vec![Command::put("a", 1, "a1"), Command::put("b", 1, "b1")])?;

        let mut cursor = tree.open_cursor(1, 7)?;
        assert!(cursor.first()?);
        assert_eq!(cursor.key().map(key_str), Some("a".to_string()));

        tree.flush_in_memory_data_to_disk(0)?;
        write(&tree, 2, vec![Command::put("c", 2, "c2")])?;

        assert!(cursor.next()?);
        assert_eq!(cursor.key().map(key_str), Some("b".to_string()));
        assert!(!cursor.next()?);
        cursor.close()?;

        assert_eq!(visible(&tree, 2)?, pairs(&[("a", "a1"), ("b", "b1"), ("c", "c2")]));
        Ok(())
    }

    #[test]
    fn test_merge_drops_history_and_defers_deletion() -> Result<()> {
        let fixture = Fixture::new()?;
        let tree = fixture.open()?;
        write(&tree, 1, vec![Command::put("a", 1, "a1"), Command::put("b", 1, "b1")])?;
        tree.flush_in_memory_data_to_disk(0)?;
        write(&tree, 2, vec![Command::put("a", 2, "a2"), Command::delete("b", 2)])?;
        tree.flush_in_memory_data_to_disk(0)?;
        assert_eq!(tree.file_indices(), vec![0, 1]);

        let mut reader = tree.open_cursor(2, 9)?;
        fixture.horizon.store(2, Ordering::SeqCst);
        let result = tree.merge_files(
            &[0, 1].into_iter().collect(),
            1,
            false,
            CompactionTrigger::LeveledLevel0,
        )?;
        assert_eq!(result.input_files, vec![0, 1]);
        assert_eq!(result.entries_written, 1);
        assert_eq!(result.entries_dropped, 3);

        // The open reader still protects both inputs.
        assert_eq!(tree.perform_garbage_collection(), 0);
        assert_eq!(tree.garbage_files().len(), 2);
        reader.close()?;
        assert_eq!(tree.perform_garbage_collection(), 2);
        assert!(!fixture.store_dir().join(file::file_name(0)).exists());

        assert_eq!(visible(&tree, 2)?, pairs(&[("a", "a2")]));
        let stored = fixture.manifest.get_manifest();
        let files = &stored.store(&fixture.store_id).expect("store").files;
        assert_eq!(files.keys().copied().collect::<Vec<_>>(), result.output_files);
        Ok(())
    }

    #[test]
    fn test_merge_requires_adjacent_files() -> Result<()> {
        let fixture = Fixture::new()?;
        let tree = fixture.open()?;
        for tsn in 1..=3 {
            write(&tree, tsn, vec![Command::put("k", tsn, "v")])?;
            tree.flush_in_memory_data_to_disk(0)?;
        }
        assert!(matches!(
            tree.merge_files(&[0, 2].into_iter().collect(), 1, false, CompactionTrigger::LeveledLevel0),
            Err(Error::NonContiguousMerge(_))
        ));
        assert!(matches!(
            tree.merge_files(&[5].into_iter().collect(), 1, false, CompactionTrigger::LeveledLevel0),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_scheduled_flush_and_major_compaction() -> Result<()> {
        let fixture = Fixture::new()?;
        let tree = fixture.open()?;
        write(&tree, 1, vec![Command::put("a", 1, "a1")])?;
        assert!(tree.schedule_flush(0).wait()?.is_some());
        write(&tree, 2, vec![Command::put("b", 2, "b2")])?;
        assert!(tree.schedule_flush(0).wait()?.is_some());
        assert!(tree.schedule_flush(0).wait()?.is_none());

        let result = tree.schedule_major_compaction().wait()?.expect("files were merged");
        assert_eq!(result.trigger, CompactionTrigger::FullCompaction);
        let report = tree.report();
        assert_eq!(report.layers.len(), 1);
        assert_eq!(report.layers[0].level_or_tier, tree.compaction_strategy().max_level_or_tier());
        assert_eq!(visible(&tree, 2)?, pairs(&[("a", "a1"), ("b", "b2")]));
        Ok(())
    }

    #[test]
    fn test_open_reconciles_directory_with_manifest() -> Result<()> {
        let fixture = Fixture::new()?;
        {
            let tree = fixture.open()?;
            write(&tree, 4, vec![Command::put("a", 4, "a4")])?;
            tree.flush_in_memory_data_to_disk(0)?;
        }
        let stray = fixture.store_dir().join(file::file_name(41));
        std::fs::write(&stray, b"not a table")?;
        std::fs::write(fixture.store_dir().join("0000000042.lsm.tmp"), b"partial")?;

        let tree = fixture.open()?;
        assert!(!stray.exists());
        assert_eq!(tree.persisted_tsn(), 4);
        assert_eq!(visible(&tree, 4)?, pairs(&[("a", "a4")]));
        write(&tree, 5, vec![Command::put("b", 5, "b5")])?;
        let flushed = tree.flush_in_memory_data_to_disk(0)?.expect("data was flushed");
        assert_eq!(flushed.file_index, 42);
        drop(tree);

        std::fs::remove_file(fixture.store_dir().join(file::file_name(0)))?;
        assert!(matches!(fixture.open(), Err(Error::FileMissing(_))));
        Ok(())
    }
}

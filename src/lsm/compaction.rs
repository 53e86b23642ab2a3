//! Compaction: choosing which files to merge, and merging them.
//!
//! # Tiered stores
//!
//! Flushed files land in tier 0, merge output lands one tier above the
//! highest merged tier. For trigger evaluation every tier-0 file counts as a
//! sorted run of its own (newest first), followed by one run per higher tier.
//! Triggers are checked in order, the first one selecting more than one file
//! wins:
//!
//! 1. **Space amplification**: everything below the highest tier is larger
//!    than `max_space_amplification_percent` times the highest tier. All
//!    files get merged.
//! 2. **Size ratio**: walking runs from the newest, a run is larger than
//!    `size_ratio` times all newer runs combined, and at least
//!    `min_merge_tiers` runs are involved. That run and all newer ones merge.
//! 3. **Height reduction**: there are more runs than `number_of_tiers`. The
//!    newest runs get merged until two runs of headroom are left.
//!
//! A selection always covers whole tiers; a partial tier 0 would place newer
//! data above older data.
//!
//! # Leveled stores
//!
//! 1. **Level 0**: level 0 holds `level0_file_number_compaction_trigger`
//!    files or more. Levels 0 and 1 merge into level 1.
//! 2. **Target size**: the level exceeding its target size by the largest
//!    factor merges with the level above it. Level 1 targets
//!    `base_level_min_size`, each further level `level_size_multiplier`
//!    times the one below.

use crate::config::{CompactionStrategy, LeveledCompaction, TieredCompaction};
use crate::cursor::BoxedCursor;
use crate::error::Result;
use crate::model::{Command, FileIndex, KeyAndTsn, LevelOrTier, Tsn};
use crate::sstable::{FileMetadata, TableWriter, WriterOptions};
use crate::Error;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionTrigger {
    TierSpaceAmplification,
    TierSizeRatio,
    TierHeightReduction,
    LeveledLevel0,
    LeveledTargetSizeRatio,
    FullCompaction,
}

/// Size and placement of a file, as seen by trigger selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSize {
    pub file_index: FileIndex,
    pub level_or_tier: LevelOrTier,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    pub trigger: CompactionTrigger,
    pub inputs: BTreeMap<LevelOrTier, BTreeSet<FileIndex>>,
    pub output_level_or_tier: LevelOrTier,
}

impl CompactionPlan {
    fn covering(
        trigger: CompactionTrigger,
        files: &[FileSize],
        levels: impl Fn(LevelOrTier) -> bool,
        output_level_or_tier: LevelOrTier,
    ) -> Self {
        let mut inputs: BTreeMap<LevelOrTier, BTreeSet<FileIndex>> = BTreeMap::new();
        for file in files.iter().filter(|f| levels(f.level_or_tier)) {
            inputs.entry(file.level_or_tier).or_default().insert(file.file_index);
        }
        Self {
            trigger,
            inputs,
            output_level_or_tier,
        }
    }

    pub fn file_indices(&self) -> BTreeSet<FileIndex> {
        self.inputs.values().flatten().copied().collect()
    }

    pub fn file_count(&self) -> usize {
        self.inputs.values().map(BTreeSet::len).sum()
    }

    /// Tombstones must survive the merge while older files outside of it
    /// may still hold versions they delete.
    pub fn keeps_tombstones(&self, files: &[FileSize]) -> bool {
        let highest_input = self.inputs.keys().next_back().copied().unwrap_or(0);
        let inputs = self.file_indices();
        files
            .iter()
            .any(|f| !inputs.contains(&f.file_index) && f.level_or_tier > highest_input)
    }
}

fn level_sizes(files: &[FileSize]) -> BTreeMap<LevelOrTier, u64> {
    let mut sizes = BTreeMap::new();
    for file in files {
        *sizes.entry(file.level_or_tier).or_insert(0) += file.size;
    }
    sizes
}

/// Picks the files of a minor compaction, if any are worth merging.
pub fn select_minor(files: &[FileSize], strategy: &CompactionStrategy) -> Option<CompactionPlan> {
    let plan = match strategy {
        CompactionStrategy::Tiered(tiered) => select_tiered(files, tiered),
        CompactionStrategy::Leveled(leveled) => select_leveled(files, leveled),
    }?;
    (plan.file_count() > 1 || plan.trigger == CompactionTrigger::LeveledTargetSizeRatio).then_some(plan)
}

/// Merges everything into the highest level or tier.
pub fn select_full(files: &[FileSize], strategy: &CompactionStrategy) -> Option<CompactionPlan> {
    let output = strategy.max_level_or_tier();
    let settled = files.len() <= 1 && files.iter().all(|f| f.level_or_tier == output);
    if files.is_empty() || settled {
        return None;
    }
    Some(CompactionPlan::covering(
        CompactionTrigger::FullCompaction,
        files,
        |_| true,
        output,
    ))
}

/// One sorted run of a tiered store: a single tier-0 file or a whole tier.
struct Run {
    tier: LevelOrTier,
    size: u64,
}

fn tiered_runs(files: &[FileSize]) -> Vec<Run> {
    let mut tier0: Vec<&FileSize> = files.iter().filter(|f| f.level_or_tier == 0).collect();
    tier0.sort_by_key(|f| Reverse(f.file_index));

    let mut runs: Vec<Run> = tier0
        .into_iter()
        .map(|f| Run { tier: 0, size: f.size })
        .collect();
    runs.extend(
        level_sizes(files)
            .into_iter()
            .filter(|(tier, _)| *tier > 0)
            .map(|(tier, size)| Run { tier, size }),
    );
    runs
}

pub fn select_tiered(files: &[FileSize], options: &TieredCompaction) -> Option<CompactionPlan> {
    let runs = tiered_runs(files);
    if runs.len() < options.number_of_tiers as usize {
        return None;
    }
    let max_tier = options.number_of_tiers.saturating_sub(1);
    let plan_up_to = |trigger, run_count: usize| {
        let highest = runs[..run_count].iter().map(|r| r.tier).max().unwrap_or(0);
        let output = (highest + 1).min(max_tier);
        CompactionPlan::covering(trigger, files, |tier| tier <= highest, output)
    };
    let candidates = [
        select_for_space_amplification(&runs, options)
            .map(|n| plan_up_to(CompactionTrigger::TierSpaceAmplification, n)),
        select_for_size_ratio(&runs, options).map(|n| plan_up_to(CompactionTrigger::TierSizeRatio, n)),
        select_for_height_reduction(&runs, options)
            .map(|n| plan_up_to(CompactionTrigger::TierHeightReduction, n)),
    ];
    candidates.into_iter().flatten().find(|plan| plan.file_count() > 1)
}

/// Returns how many of the newest runs to merge.
fn select_for_space_amplification(runs: &[Run], options: &TieredCompaction) -> Option<usize> {
    let highest = runs.last()?;
    if highest.size == 0 {
        return None;
    }
    let others: u64 = runs.iter().filter(|r| r.tier != highest.tier).map(|r| r.size).sum();
    let ratio = others as f64 / highest.size as f64;
    (ratio >= options.max_space_amplification_percent).then_some(runs.len())
}

fn select_for_size_ratio(runs: &[Run], options: &TieredCompaction) -> Option<usize> {
    let min_merge = options.min_merge_tiers.max(2) as usize;
    let mut newer = 0.0;
    for (i, run) in runs.iter().enumerate() {
        let size = run.size as f64;
        let exceeded = newer > 0.0 && size / newer > options.size_ratio;
        if exceeded && i + 1 >= min_merge {
            return Some(i + 1);
        }
        newer += size;
    }
    None
}

fn select_for_height_reduction(runs: &[Run], options: &TieredCompaction) -> Option<usize> {
    let min_merge = options.min_merge_tiers.max(2) as usize;
    let number_of_tiers = options.number_of_tiers as usize;
    if runs.len() < min_merge || runs.len() < number_of_tiers {
        return None;
    }
    let to_merge = (runs.len() + 2).saturating_sub(number_of_tiers);
    (to_merge >= min_merge).then_some(to_merge.min(runs.len()))
}

/// Target size of every level from 1 to `max_levels`.
fn target_level_sizes(options: &LeveledCompaction) -> BTreeMap<LevelOrTier, f64> {
    let mut target = options.base_level_min_size as f64;
    let mut targets = BTreeMap::new();
    for level in 1..=options.max_levels {
        targets.insert(level, target);
        target *= options.level_size_multiplier;
    }
    targets
}

pub fn select_leveled(files: &[FileSize], options: &LeveledCompaction) -> Option<CompactionPlan> {
    let level0_files = files.iter().filter(|f| f.level_or_tier == 0).count();
    let trigger = options.level0_file_number_compaction_trigger.max(1) as usize;
    if level0_files >= trigger && options.max_levels > 0 {
        return Some(CompactionPlan::covering(
            CompactionTrigger::LeveledLevel0,
            files,
            |level| level <= 1,
            1,
        ));
    }

    let sizes = level_sizes(files);
    let worst = target_level_sizes(options)
        .into_iter()
        .filter(|(level, _)| *level < options.max_levels)
        .filter_map(|(level, target)| {
            let size = *sizes.get(&level)? as f64;
            let ratio = size / target.max(1.0);
            (ratio > 1.0).then_some((level, ratio))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    let lower = worst.0;
    Some(CompactionPlan::covering(
        CompactionTrigger::LeveledTargetSizeRatio,
        files,
        |level| level == lower || level == lower + 1,
        lower + 1,
    ))
}

/// Streams the union of several `(key, tsn)` ordered cursors, dropping what
/// no reader can observe anymore.
///
/// Per user key, versions newer than `horizon` all survive, as does the
/// newest version at or below it. Every older version is shadowed for all
/// open and future readers. The surviving version at or below the horizon
/// is dropped as well if it is a tombstone and tombstones are not kept.
pub struct CompactionMerge {
    cursors: Vec<BoxedCursor<KeyAndTsn, Command>>,
    heap: BinaryHeap<Reverse<(KeyAndTsn, usize)>>,
    horizon: Tsn,
    keep_tombstones: bool,
    pending: VecDeque<Command>,
    started: bool,
    dropped: u64,
}

impl CompactionMerge {
    pub fn new(cursors: Vec<BoxedCursor<KeyAndTsn, Command>>, horizon: Tsn, keep_tombstones: bool) -> Self {
        Self {
            cursors,
            heap: BinaryHeap::new(),
            horizon,
            keep_tombstones,
            pending: VecDeque::new(),
            started: false,
            dropped: 0,
        }
    }

    /// Number of entries dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn start(&mut self) -> Result<()> {
        for (i, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.first()? {
                if let Some(key) = cursor.key() {
                    self.heap.push(Reverse((key.clone(), i)));
                }
            }
        }
        self.started = true;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<Command>> {
        let Some(Reverse((_, source))) = self.heap.pop() else {
            return Ok(None);
        };
        let cursor = &mut self.cursors[source];
        let command = cursor
            .value()
            .cloned()
            .ok_or(Error::CursorNotPositioned)?;
        if cursor.next()? {
            if let Some(key) = cursor.key() {
                self.heap.push(Reverse((key.clone(), source)));
            }
        }
        Ok(Some(command))
    }

    fn peek_key(&self) -> Option<&[u8]> {
        self.heap.peek().map(|Reverse((key, _))| key.key.as_slice())
    }

    /// Reads every version of the next user key, oldest first.
    fn next_key_versions(&mut self) -> Result<Vec<Command>> {
        let Some(first) = self.pop()? else {
            return Ok(Vec::new());
        };
        let mut versions = vec![first];
        while self.peek_key() == Some(versions[0].key.as_slice()) {
            match self.pop()? {
                Some(command) => {
                    if versions.last().map(|c| c.tsn) == Some(command.tsn) {
                        // Same version in several inputs.
                        self.dropped += 1;
                        continue;
                    }
                    versions.push(command);
                }
                None => break,
            }
        }
        Ok(versions)
    }

    fn retain_visible(&mut self, versions: Vec<Command>) -> Vec<Command> {
        let total = versions.len();
        let newest_settled = versions.iter().rposition(|c| c.tsn <= self.horizon);
        let survivors: Vec<Command> = versions
            .into_iter()
            .enumerate()
            .filter(|(i, command)| match newest_settled {
                Some(settled) if *i < settled => false,
                Some(settled) if *i == settled => self.keep_tombstones || !command.is_deletion(),
                _ => true,
            })
            .map(|(_, command)| command)
            .collect();
        self.dropped += (total - survivors.len()) as u64;
        survivors
    }

    fn fill(&mut self) -> Result<bool> {
        if !self.started {
            self.start()?;
        }
        while self.pending.is_empty() {
            let versions = self.next_key_versions()?;
            if versions.is_empty() {
                return Ok(false);
            }
            let survivors = self.retain_visible(versions);
            self.pending.extend(survivors);
        }
        Ok(true)
    }

    /// Next surviving command together with a flag telling whether it
    /// starts a new user key.
    pub fn next_command(&mut self) -> Result<Option<(Command, bool)>> {
        let fresh_key = self.pending.is_empty();
        if !self.fill()? {
            return Ok(None);
        }
        Ok(self.pending.pop_front().map(|command| (command, fresh_key)))
    }

    /// Closes every input cursor.
    pub fn close(mut self) -> Result<()> {
        let errors: Vec<Error> = self
            .cursors
            .iter_mut()
            .filter_map(|cursor| cursor.close().err())
            .collect();
        Error::aggregate(errors)
    }
}

/// Settings for writing merge output.
pub struct OutputOptions<'a> {
    pub dir: &'a Path,
    pub max_file_size: u64,
    pub writer: WriterOptions,
}

/// Writes the merge into as many files as needed, starting a new file only
/// at a user key boundary once the current file has reached
/// `max_file_size`. `next_file_index` hands out fresh indices and
/// `cancelled` is polled between keys.
pub fn write_merge_output(
    merge: &mut CompactionMerge,
    options: OutputOptions<'_>,
    mut next_file_index: impl FnMut() -> FileIndex,
    cancelled: &dyn Fn() -> bool,
) -> Result<Vec<(FileIndex, FileMetadata)>> {
    let mut written: Vec<(FileIndex, FileMetadata)> = Vec::new();
    let result = write_files(merge, &options, &mut next_file_index, cancelled, &mut written);
    if let Err(e) = result {
        for (index, _) in &written {
            let path = options.dir.join(super::file::file_name(*index));
            if let Err(remove) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %remove, "Failed to remove partial merge output");
            }
        }
        return Err(e);
    }
    Ok(written)
}

fn write_files(
    merge: &mut CompactionMerge,
    options: &OutputOptions<'_>,
    next_file_index: &mut dyn FnMut() -> FileIndex,
    cancelled: &dyn Fn() -> bool,
    written: &mut Vec<(FileIndex, FileMetadata)>,
) -> Result<()> {
    let mut current: Option<(FileIndex, TableWriter)> = None;
    while let Some((command, fresh_key)) = merge.next_command()? {
        if fresh_key {
            if cancelled() {
                return Err(Error::Cancelled);
            }
            let full = matches!(&current, Some((_, w)) if w.estimated_size() >= options.max_file_size);
            if full {
                if let Some((index, writer)) = current.take() {
                    written.push((index, writer.finish()?));
                }
            }
        }
        if current.is_none() {
            let index = next_file_index();
            let path = options.dir.join(super::file::file_name(index));
            current = Some((index, TableWriter::create(&path, options.writer)?));
        }
        if let Some((_, writer)) = current.as_mut() {
            writer.add(&command)?;
        }
    }
    if let Some((index, writer)) = current.take() {
        written.push((index, writer.finish()?));
    }
    Ok(())
}

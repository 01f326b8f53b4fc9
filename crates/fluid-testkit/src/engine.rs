//! The in-memory engine double.

use fluid_compactor::engine::{
    CompactionOptions, EngineError, EngineResult, FlushInfo, FlushListener, WriteBatch,
    WriteOptions,
};
use fluid_compactor::levels::{LevelMeta, RunMeta};
use fluid_compactor::{QueryEngine, StorageEngine};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

/// One simulated SSTable: sorted keys mapped to their value lengths.
#[derive(Debug, Clone)]
struct MemFile {
    name: String,
    entries: BTreeMap<String, usize>,
    being_compacted: bool,
}

impl MemFile {
    fn size(&self) -> u64 {
        self.entries
            .iter()
            .map(|(key, value_len)| (key.len() + value_len) as u64)
            .sum()
    }
}

#[derive(Debug)]
struct State {
    memtable: BTreeMap<String, usize>,
    mem_bytes: u64,
    buffer_size: u64,
    levels: Vec<Vec<MemFile>>,
    next_file: u64,
}

impl State {
    fn find_file(&self, name: &str) -> Option<&MemFile> {
        self.levels
            .iter()
            .flat_map(|level| level.iter())
            .find(|file| file.name == name)
    }

    fn claim_file(&mut self, name: &str) {
        for level in &mut self.levels {
            for file in level.iter_mut() {
                if file.name == name {
                    file.being_compacted = true;
                }
            }
        }
    }

    fn remove_files(&mut self, names: &[String]) -> Vec<MemFile> {
        let mut removed = Vec::with_capacity(names.len());
        for level in &mut self.levels {
            let mut kept = Vec::with_capacity(level.len());
            for file in level.drain(..) {
                if names.contains(&file.name) {
                    removed.push(file);
                } else {
                    kept.push(file);
                }
            }
            *level = kept;
        }
        // Zero-padded names sort in creation order, so newest-last holds
        // across levels.
        removed.sort_by(|a, b| a.name.cmp(&b.name));
        removed
    }

    fn alloc_file_name(&mut self) -> String {
        let name = format!("sst-{:06}", self.next_file);
        self.next_file += 1;
        name
    }
}

/// In-memory engine implementing the controller's engine contract.
pub struct MemEngine {
    state: Mutex<State>,
    listener: Mutex<Option<Weak<dyn FlushListener>>>,
    scripted_failures: Mutex<VecDeque<EngineError>>,
    /// Live level-0 file count at which a flush reports a write slowdown.
    slowdown_trigger: AtomicUsize,
    compaction_attempts: AtomicUsize,
}

impl MemEngine {
    /// An engine with `max_levels` levels and the given write buffer size.
    pub fn new(max_levels: usize, buffer_size: u64) -> Self {
        Self {
            state: Mutex::new(State {
                memtable: BTreeMap::new(),
                mem_bytes: 0,
                buffer_size,
                levels: vec![Vec::new(); max_levels],
                next_file: 1,
            }),
            listener: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            slowdown_trigger: AtomicUsize::new(usize::MAX),
            compaction_attempts: AtomicUsize::new(0),
        }
    }

    /// Subscribes a flush-completion listener. The engine holds it weakly;
    /// the controller outlives the writes by construction.
    pub fn set_flush_listener(&self, listener: Weak<dyn FlushListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Flushes report `triggered_writes_slowdown` once the live level-0
    /// file count reaches `count`.
    pub fn set_slowdown_trigger(&self, count: usize) {
        self.slowdown_trigger.store(count, Ordering::Release);
    }

    /// Queues an error returned by the next `compact_files` call, before
    /// any engine state changes.
    pub fn fail_next_compaction(&self, error: EngineError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Indices of levels currently holding files.
    pub fn nonempty_levels(&self) -> Vec<usize> {
        let state = self.state.lock();
        state
            .levels
            .iter()
            .enumerate()
            .filter(|(_, level)| !level.is_empty())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// File count per level.
    pub fn level_file_counts(&self) -> Vec<usize> {
        let state = self.state.lock();
        state.levels.iter().map(|level| level.len()).collect()
    }

    /// Entry count per level.
    pub fn level_entry_counts(&self) -> Vec<usize> {
        let state = self.state.lock();
        state
            .levels
            .iter()
            .map(|level| level.iter().map(|file| file.entries.len()).sum())
            .collect()
    }

    /// Largest file in the tree, in bytes.
    pub fn max_file_size(&self) -> u64 {
        let state = self.state.lock();
        state
            .levels
            .iter()
            .flat_map(|level| level.iter())
            .map(MemFile::size)
            .max()
            .unwrap_or(0)
    }

    /// Entries buffered in the memtable.
    pub fn memtable_len(&self) -> usize {
        self.state.lock().memtable.len()
    }

    /// Total `compact_files` calls, scripted failures included.
    pub fn compaction_attempts(&self) -> usize {
        self.compaction_attempts.load(Ordering::Acquire)
    }

    /// Moves the memtable to a level-0 file; returns the flush event to
    /// deliver, or `None` when there was nothing to flush.
    fn flush_memtable(&self) -> Option<FlushInfo> {
        let mut state = self.state.lock();
        if state.memtable.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut state.memtable);
        state.mem_bytes = 0;
        let name = state.alloc_file_name();
        tracing::trace!(file = %name, entries = entries.len(), "flushing memtable");
        state.levels[0].push(MemFile {
            name,
            entries,
            being_compacted: false,
        });

        let live_level0 = state.levels[0]
            .iter()
            .filter(|file| !file.being_compacted)
            .count();
        Some(FlushInfo {
            cf_name: "default".to_string(),
            triggered_writes_slowdown: live_level0
                >= self.slowdown_trigger.load(Ordering::Acquire),
        })
    }

    /// Delivers a flush event outside any engine lock.
    fn fire_flush_completed(&self, info: FlushInfo) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.on_flush_completed(&info);
        }
    }

    fn write_entries(&self, entries: Vec<(String, String)>) -> Option<FlushInfo> {
        let mut state = self.state.lock();
        for (key, value) in entries {
            state.mem_bytes += (key.len() + value.len()) as u64;
            state.memtable.insert(key, value.len());
        }
        if state.buffer_size > 0 && state.mem_bytes >= state.buffer_size {
            drop(state);
            return self.flush_memtable();
        }
        None
    }
}

impl StorageEngine for MemEngine {
    fn level_metadata(&self) -> Vec<LevelMeta> {
        let state = self.state.lock();
        state
            .levels
            .iter()
            .enumerate()
            .map(|(idx, files)| LevelMeta {
                level: idx,
                runs: files
                    .iter()
                    .map(|file| RunMeta {
                        name: file.name.clone(),
                        size: file.size(),
                        being_compacted: file.being_compacted,
                    })
                    .collect(),
            })
            .collect()
    }

    fn set_buffer_size(&self, bytes: u64) {
        self.state.lock().buffer_size = bytes;
    }

    async fn compact_files(
        &self,
        opts: CompactionOptions,
        input_files: Vec<String>,
        output_level: usize,
    ) -> EngineResult<Vec<String>> {
        self.compaction_attempts.fetch_add(1, Ordering::AcqRel);
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            tracing::trace!(%error, "injecting scripted compaction failure");
            return Err(error);
        }

        {
            let mut state = self.state.lock();
            if input_files.is_empty() {
                return Err(EngineError::InvalidArgument("no input files".to_string()));
            }
            if output_level >= state.levels.len() {
                return Err(EngineError::InvalidArgument(format!(
                    "output level {output_level} out of range"
                )));
            }
            for name in &input_files {
                match state.find_file(name) {
                    None => {
                        return Err(EngineError::InvalidArgument(format!(
                            "unknown input file {name}"
                        )))
                    }
                    Some(file) if file.being_compacted => {
                        return Err(EngineError::Busy(format!(
                            "{name} is already being compacted"
                        )))
                    }
                    Some(_) => {}
                }
            }
            for name in &input_files {
                state.claim_file(name);
            }
        }

        // Let concurrently scheduled work observe the claims.
        tokio::task::yield_now().await;

        let outputs = {
            let mut state = self.state.lock();
            let inputs = state.remove_files(&input_files);

            // Newest file wins on key overlap; inputs are sorted oldest
            // first, so later inserts overwrite.
            let mut merged = BTreeMap::new();
            for file in inputs {
                for (key, value_len) in file.entries {
                    merged.insert(key, value_len);
                }
            }

            let limit = opts.output_file_size_limit.max(1);
            let mut output_entry_sets = Vec::new();
            let mut current = BTreeMap::new();
            let mut current_bytes = 0u64;
            for (key, value_len) in merged {
                let entry_bytes = (key.len() + value_len) as u64;
                if current_bytes > 0 && current_bytes + entry_bytes > limit {
                    output_entry_sets.push(std::mem::take(&mut current));
                    current_bytes = 0;
                }
                current.insert(key, value_len);
                current_bytes += entry_bytes;
            }
            if !current.is_empty() {
                output_entry_sets.push(current);
            }

            let mut names = Vec::with_capacity(output_entry_sets.len());
            for entries in output_entry_sets {
                let name = state.alloc_file_name();
                names.push(name.clone());
                state.levels[output_level].push(MemFile {
                    name,
                    entries,
                    being_compacted: false,
                });
            }
            names
        };

        tracing::trace!(
            inputs = input_files.len(),
            outputs = outputs.len(),
            output_level,
            "compacted files"
        );
        Ok(outputs)
    }

    async fn flush(&self, _wait: bool) -> EngineResult<()> {
        if let Some(info) = self.flush_memtable() {
            self.fire_flush_completed(info);
        }
        Ok(())
    }

    async fn put(&self, _opts: &WriteOptions, key: String, value: String) -> EngineResult<()> {
        if let Some(info) = self.write_entries(vec![(key, value)]) {
            self.fire_flush_completed(info);
        }
        Ok(())
    }

    async fn write_batch(&self, _opts: &WriteOptions, batch: WriteBatch) -> EngineResult<()> {
        if let Some(info) = self.write_entries(batch.into_entries()) {
            self.fire_flush_completed(info);
        }
        Ok(())
    }
}

impl QueryEngine for MemEngine {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let state = self.state.lock();
        if let Some(value_len) = state.memtable.get(key) {
            return Ok(Some("a".repeat(*value_len)));
        }
        // Level 0 newest-first, then down the tree.
        for (idx, level) in state.levels.iter().enumerate() {
            let files: Box<dyn Iterator<Item = &MemFile>> = if idx == 0 {
                Box::new(level.iter().rev())
            } else {
                Box::new(level.iter())
            };
            for file in files {
                if let Some(value_len) = file.entries.get(key) {
                    return Ok(Some("a".repeat(*value_len)));
                }
            }
        }
        Ok(None)
    }

    async fn scan(&self, lower: &str, upper: &str) -> EngineResult<usize> {
        let state = self.state.lock();
        let mut seen = std::collections::BTreeSet::new();
        for key in state
            .memtable
            .range(lower.to_string()..upper.to_string())
            .map(|(key, _)| key)
        {
            seen.insert(key.clone());
        }
        for level in &state.levels {
            for file in level {
                for key in file
                    .entries
                    .range(lower.to_string()..upper.to_string())
                    .map(|(key, _)| key)
                {
                    seen.insert(key.clone());
                }
            }
        }
        Ok(seen.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> WriteOptions {
        WriteOptions::default()
    }

    #[tokio::test]
    async fn put_flush_creates_level0_file() {
        let engine = MemEngine::new(4, 1 << 20);
        engine
            .put(&opts(), "1".to_string(), "a".repeat(31))
            .await
            .unwrap();
        assert_eq!(engine.memtable_len(), 1);

        engine.flush(true).await.unwrap();
        assert_eq!(engine.memtable_len(), 0);
        assert_eq!(engine.level_file_counts()[0], 1);
        assert_eq!(engine.level_entry_counts()[0], 1);
    }

    #[tokio::test]
    async fn buffer_overflow_auto_flushes() {
        let engine = MemEngine::new(4, 64);
        for i in 0..4 {
            engine
                .put(&opts(), format!("{i}"), "a".repeat(31))
                .await
                .unwrap();
        }
        // 32 bytes per entry, 64-byte buffer: a flush every two puts.
        assert_eq!(engine.level_file_counts()[0], 2);
        assert_eq!(engine.memtable_len(), 0);
    }

    #[tokio::test]
    async fn compact_merges_and_dedupes_newest_wins() {
        let engine = MemEngine::new(4, 1 << 20);
        engine
            .put(&opts(), "5".to_string(), "a".repeat(3))
            .await
            .unwrap();
        engine.flush(true).await.unwrap();
        engine
            .put(&opts(), "5".to_string(), "a".repeat(9))
            .await
            .unwrap();
        engine
            .put(&opts(), "7".to_string(), "a".repeat(9))
            .await
            .unwrap();
        engine.flush(true).await.unwrap();

        let inputs = engine.level_metadata()[0].live_run_names();
        let outputs = engine
            .compact_files(
                CompactionOptions {
                    output_file_size_limit: u64::MAX,
                },
                inputs,
                1,
            )
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(engine.level_file_counts(), vec![0, 1, 0, 0]);
        assert_eq!(engine.level_entry_counts()[1], 2);

        // The newer write's value length survived the merge.
        assert_eq!(engine.get("5").await.unwrap().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn compact_splits_output_by_size_limit() {
        let engine = MemEngine::new(4, 1 << 20);
        for i in 0..10 {
            engine
                .put(&opts(), format!("{i}"), "a".repeat(31))
                .await
                .unwrap();
        }
        engine.flush(true).await.unwrap();

        let inputs = engine.level_metadata()[0].live_run_names();
        let outputs = engine
            .compact_files(
                CompactionOptions {
                    output_file_size_limit: 64,
                },
                inputs,
                1,
            )
            .await
            .unwrap();
        // 10 entries of 32 bytes cut at 64 bytes per file.
        assert_eq!(outputs.len(), 5);
        assert!(engine.max_file_size() <= 64);
        assert_eq!(engine.level_entry_counts()[1], 10);
    }

    #[tokio::test]
    async fn compacting_claimed_or_unknown_files_fails() {
        let engine = MemEngine::new(4, 1 << 20);
        engine
            .put(&opts(), "1".to_string(), "a".repeat(7))
            .await
            .unwrap();
        engine.flush(true).await.unwrap();
        let inputs = engine.level_metadata()[0].live_run_names();

        let missing = engine
            .compact_files(
                CompactionOptions {
                    output_file_size_limit: u64::MAX,
                },
                vec!["sst-999999".to_string()],
                1,
            )
            .await;
        assert!(matches!(missing, Err(EngineError::InvalidArgument(_))));

        // Claim the file by hand, then try to compact it again.
        engine.state.lock().claim_file(&inputs[0]);
        let busy = engine
            .compact_files(
                CompactionOptions {
                    output_file_size_limit: u64::MAX,
                },
                inputs,
                1,
            )
            .await;
        assert!(matches!(busy, Err(EngineError::Busy(_))));
    }

    #[tokio::test]
    async fn scripted_failure_fires_once_and_leaves_state_alone() {
        let engine = MemEngine::new(4, 1 << 20);
        engine
            .put(&opts(), "1".to_string(), "a".repeat(7))
            .await
            .unwrap();
        engine.flush(true).await.unwrap();
        engine.fail_next_compaction(EngineError::Other("injected".to_string()));

        let inputs = engine.level_metadata()[0].live_run_names();
        let first = engine
            .compact_files(
                CompactionOptions {
                    output_file_size_limit: u64::MAX,
                },
                inputs.clone(),
                1,
            )
            .await;
        assert!(matches!(first, Err(EngineError::Other(_))));
        // Nothing was claimed by the failed attempt.
        assert_eq!(engine.level_metadata()[0].live_runs(), 1);

        let second = engine
            .compact_files(
                CompactionOptions {
                    output_file_size_limit: u64::MAX,
                },
                inputs,
                1,
            )
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn scan_counts_unique_keys_in_range() {
        let engine = MemEngine::new(4, 1 << 20);
        for key in ["10", "20", "30", "40"] {
            engine
                .put(&opts(), key.to_string(), "a".repeat(3))
                .await
                .unwrap();
        }
        engine.flush(true).await.unwrap();
        // Shadow one key back in the memtable.
        engine
            .put(&opts(), "20".to_string(), "a".repeat(5))
            .await
            .unwrap();

        assert_eq!(engine.scan("10", "40").await.unwrap(), 3);
        assert_eq!(engine.scan("10", "41").await.unwrap(), 4);
    }
}

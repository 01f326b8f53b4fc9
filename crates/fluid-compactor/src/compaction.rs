//! Compaction picking and scheduling.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  FluidCompactor (policy)                                    │
//! │  - snapshot level metadata under the metadata mutex         │
//! │  - due-ness: runs > K below the largest level, > Z on it    │
//! │    (or byte capacity T^i·(T−1)·B under FIXED/BUFFER)        │
//! │  - output file size from the file-size policy               │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ CompactionTask
//!                ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CompactionScheduler (mechanism)                            │
//! │  - in-flight counter, incremented per fresh task            │
//! │  - background worker per task (runtime executor)            │
//! │  - transient failures retried with the original inputs      │
//! │  - wait_idle() for loaders that must drain                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The flush listener re-enters the policy side: every completed flush
//! sweeps levels from the largest occupied one down to 0 and schedules
//! whatever is due. Sweeping top-down lets a compaction out of level i find
//! level i+1 already drained.

use crate::config::{FileSizePolicy, FluidConfig};
use crate::engine::{CompactionOptions, EngineError, FlushInfo, FlushListener, StorageEngine};
use crate::levels::{largest_occupied_level, LevelMeta};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Transient failures on a retryable task are re-submitted at most this many
/// times before the task is declared failed.
pub const MAX_TASK_RETRIES: u32 = 3;

/// One unit of compaction work, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    /// Level the inputs were drawn from.
    pub origin_level: usize,
    /// Level the merged output lands on.
    pub output_level: usize,
    /// Input file names, all live on `origin_level` at pick time.
    pub input_files: Vec<String>,
    pub output_file_size_limit: u64,
    /// Whether a transient failure re-enters the scheduler.
    pub retry_on_fail: bool,
    /// True for re-submissions; retries inherit the original task's
    /// in-flight slot instead of claiming a new one.
    pub is_retry: bool,
    /// How many times this work has been attempted before.
    pub attempt: u32,
}

/// Submitted-but-not-completed task count, with a drain signal.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn launch(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once the count reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// State shared between the scheduler handle and its background workers.
#[derive(Debug, Default)]
struct SchedulerShared {
    in_flight: InFlight,
    failures: AtomicUsize,
    last_error: Mutex<Option<EngineError>>,
}

impl SchedulerShared {
    fn finish(&self, error: Option<EngineError>) {
        if let Some(err) = error {
            self.failures.fetch_add(1, Ordering::AcqRel);
            *self.last_error.lock() = Some(err);
        }
        self.in_flight.finish();
    }
}

/// Submits tasks to the background executor and owns them to completion.
pub struct CompactionScheduler<E> {
    engine: Arc<E>,
    shared: Arc<SchedulerShared>,
}

impl<E> Clone for CompactionScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: StorageEngine> CompactionScheduler<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            shared: Arc::new(SchedulerShared::default()),
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.in_flight.pending()
    }

    pub async fn wait_idle(&self) {
        self.shared.in_flight.wait_idle().await;
    }

    /// Tasks that reached a terminal failure (fatal or retries exhausted).
    pub fn failed_tasks(&self) -> usize {
        self.shared.failures.load(Ordering::Acquire)
    }

    pub fn take_last_error(&self) -> Option<EngineError> {
        self.shared.last_error.lock().take()
    }

    /// Hands the task to a background worker. Fresh tasks claim an in-flight
    /// slot; retries run on the slot of the task they replace.
    pub fn schedule(&self, task: CompactionTask) {
        if !task.is_retry {
            self.shared.in_flight.launch();
        }
        tracing::trace!(
            origin = task.origin_level,
            output = task.output_level,
            files = task.input_files.len(),
            retry = task.is_retry,
            "scheduling compaction"
        );
        spawn_task(Arc::clone(&self.engine), Arc::clone(&self.shared), task);
    }
}

fn spawn_task<E: StorageEngine>(
    engine: Arc<E>,
    shared: Arc<SchedulerShared>,
    task: CompactionTask,
) {
    tokio::spawn(run_task(engine, shared, task));
}

async fn run_task<E: StorageEngine>(
    engine: Arc<E>,
    shared: Arc<SchedulerShared>,
    task: CompactionTask,
) {
    let opts = CompactionOptions {
        output_file_size_limit: task.output_file_size_limit,
    };
    let result = engine
        .compact_files(opts, task.input_files.clone(), task.output_level)
        .await;

    match result {
        Ok(outputs) => {
            tracing::trace!(
                origin = task.origin_level,
                output = task.output_level,
                produced = outputs.len(),
                "compaction finished"
            );
            shared.finish(None);
        }
        Err(err) if err.is_fatal() => {
            tracing::warn!(
                origin = task.origin_level,
                output = task.output_level,
                %err,
                "compaction failed, not retrying"
            );
            shared.finish(Some(err));
        }
        Err(err) if !task.retry_on_fail => {
            tracing::warn!(
                origin = task.origin_level,
                output = task.output_level,
                %err,
                "compaction did not finish"
            );
            shared.finish(Some(err));
        }
        Err(err) if task.attempt >= MAX_TASK_RETRIES => {
            tracing::warn!(
                origin = task.origin_level,
                output = task.output_level,
                attempts = task.attempt + 1,
                %err,
                "compaction retries exhausted"
            );
            shared.finish(Some(err));
        }
        Err(err) => {
            if inputs_absorbed(engine.as_ref(), &task) {
                tracing::trace!(
                    origin = task.origin_level,
                    "inputs absorbed by a newer compaction, dropping retry"
                );
                shared.finish(None);
                return;
            }
            tracing::warn!(
                origin = task.origin_level,
                output = task.output_level,
                files = task.input_files.len(),
                %err,
                "compaction did not finish, retrying"
            );
            let retry = CompactionTask {
                is_retry: true,
                attempt: task.attempt + 1,
                ..task
            };
            spawn_task(engine, shared, retry);
        }
    }
}

/// A retry is pointless once any input has left the origin level: some
/// other compaction already consumed the work.
fn inputs_absorbed<E: StorageEngine>(engine: &E, task: &CompactionTask) -> bool {
    let levels = engine.level_metadata();
    let Some(level) = levels.get(task.origin_level) else {
        return true;
    };
    task.input_files
        .iter()
        .any(|name| !level.runs.iter().any(|run| run.name == *name))
}

/// The Fluid LSM compaction policy bound to one engine.
pub struct FluidCompactor<E> {
    config: FluidConfig,
    engine: Arc<E>,
    scheduler: CompactionScheduler<E>,
    /// Serializes snapshot-and-pick so two pickers cannot both claim the
    /// same live file as input.
    meta_lock: Mutex<()>,
}

impl<E: StorageEngine> FluidCompactor<E> {
    pub fn new(config: FluidConfig, engine: Arc<E>) -> Arc<Self> {
        let scheduler = CompactionScheduler::new(Arc::clone(&engine));
        Arc::new(Self {
            config,
            engine,
            scheduler,
            meta_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &CompactionScheduler<E> {
        &self.scheduler
    }

    pub fn pending_compactions(&self) -> usize {
        self.scheduler.pending()
    }

    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Decides whether `level_idx` is due and builds the task for it.
    pub fn pick_compaction(&self, level_idx: usize) -> Option<CompactionTask> {
        let _meta = self.meta_lock.lock();
        let levels = self.engine.level_metadata();
        pick_from_levels(&self.config, &levels, level_idx)
    }

    /// Sweeps all levels top-down and schedules whatever is due. Returns
    /// whether any task was scheduled; scheduling nothing on a tree with no
    /// level over budget is the expected no-op.
    pub fn requires_compaction(&self) -> bool {
        self.sweep(false)
    }

    fn sweep(&self, retry_on_fail: bool) -> bool {
        let largest = match largest_occupied_level(&self.engine.level_metadata()) {
            Ok(idx) => idx,
            Err(_) => return false,
        };

        let mut scheduled = false;
        for level_idx in (0..=largest).rev() {
            if let Some(mut task) = self.pick_compaction(level_idx) {
                task.retry_on_fail = retry_on_fail;
                self.scheduler.schedule(task);
                scheduled = true;
            }
        }
        scheduled
    }
}

impl<E: StorageEngine> FlushListener for FluidCompactor<E> {
    fn on_flush_completed(&self, info: &FlushInfo) {
        tracing::trace!(
            cf = %info.cf_name,
            slowdown = info.triggered_writes_slowdown,
            "flush completed, sweeping levels"
        );
        // A flush under write-slowdown pressure marks its tasks retryable:
        // the engine is busy and a transient failure is likely recoverable.
        self.sweep(info.triggered_writes_slowdown);
    }
}

/// 5% slack on top of the nominal file size, for table metadata.
fn with_metadata_allowance(bytes: u64) -> u64 {
    (bytes as f64 * 1.05) as u64
}

/// Pure pick over a metadata snapshot; the caller holds the metadata mutex.
pub(crate) fn pick_from_levels(
    config: &FluidConfig,
    levels: &[LevelMeta],
    level_idx: usize,
) -> Option<CompactionTask> {
    let largest = largest_occupied_level(levels).ok()?;
    let level = levels.get(level_idx)?;

    let input_files = level.live_run_names();
    if input_files.is_empty() {
        return None;
    }
    let live_runs = input_files.len() as u64;
    let level_size = level.live_size();

    let due = match config.file_size_policy_opt {
        FileSizePolicy::Increasing => {
            let lower_level_due =
                level_idx < largest && live_runs > config.lower_level_run_max;
            let largest_level_due =
                level_idx == largest && live_runs > config.largest_level_run_max;
            lower_level_due || largest_level_due
        }
        FileSizePolicy::Fixed | FileSizePolicy::Buffer => {
            let capacity = config.level_capacity_bytes(level_idx);
            tracing::debug!(
                level = level_idx,
                capacity_mib = capacity >> 20,
                size = level_size,
                "checking level capacity"
            );
            level_size > capacity
        }
    };
    if !due {
        return None;
    }

    let output_file_size_limit = match config.file_size_policy_opt {
        FileSizePolicy::Increasing => {
            // The output run lives one level down, so files are sized for
            // that level's run size: capacity / Z on the largest level,
            // capacity / K everywhere else.
            let divisor = if level_idx == largest {
                config.largest_level_run_max
            } else {
                config.lower_level_run_max
            };
            with_metadata_allowance(config.level_capacity_bytes(level_idx + 1) / divisor)
        }
        FileSizePolicy::Buffer => config.buffer_size,
        FileSizePolicy::Fixed => config.fixed_file_size,
    };

    tracing::trace!(
        origin = level_idx,
        output = level_idx + 1,
        files = input_files.len(),
        "created compaction task"
    );
    Some(CompactionTask {
        origin_level: level_idx,
        output_level: level_idx + 1,
        input_files,
        output_file_size_limit,
        retry_on_fail: false,
        is_retry: false,
        attempt: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::RunMeta;

    const MIB: u64 = 1 << 20;

    fn run(name: &str, size: u64, being_compacted: bool) -> RunMeta {
        RunMeta {
            name: name.to_string(),
            size,
            being_compacted,
        }
    }

    fn level_of(level: usize, runs: Vec<RunMeta>) -> LevelMeta {
        LevelMeta { level, runs }
    }

    fn increasing_config(size_ratio: u64, k: u64, z: u64) -> FluidConfig {
        FluidConfig {
            size_ratio,
            lower_level_run_max: k,
            largest_level_run_max: z,
            buffer_size: MIB,
            entry_size: 1 << 10,
            ..FluidConfig::default()
        }
    }

    /// Snapshot with `counts[i]` single-byte-sized live runs on level i.
    fn snapshot(counts: &[usize]) -> Vec<LevelMeta> {
        counts
            .iter()
            .enumerate()
            .map(|(idx, &count)| {
                let runs = (0..count)
                    .map(|n| run(&format!("sst-{idx}-{n}"), 1, false))
                    .collect();
                level_of(idx, runs)
            })
            .collect()
    }

    #[test]
    fn under_budget_level_is_not_due() {
        let config = increasing_config(2, 1, 1);
        // One run below the largest level, one on it: nothing due.
        let levels = snapshot(&[0, 1, 1]);
        assert!(pick_from_levels(&config, &levels, 1).is_none());
        assert!(pick_from_levels(&config, &levels, 2).is_none());
    }

    #[test]
    fn run_count_over_k_below_largest_is_due() {
        let config = increasing_config(2, 1, 1);
        let levels = snapshot(&[0, 2, 1]);
        let task = pick_from_levels(&config, &levels, 1).unwrap();
        assert_eq!(task.origin_level, 1);
        assert_eq!(task.output_level, 2);
        assert_eq!(task.input_files.len(), 2);
        assert!(!task.retry_on_fail);
        assert!(!task.is_retry);
    }

    #[test]
    fn largest_level_is_bounded_by_z_not_k() {
        let config = increasing_config(2, 2, 1);
        // Two runs on the largest level: fine for K, over Z.
        let levels = snapshot(&[0, 0, 2]);
        let task = pick_from_levels(&config, &levels, 2).unwrap();
        assert_eq!(task.origin_level, 2);

        // Two runs on a lower level are within K = 2.
        let levels = snapshot(&[0, 2, 1]);
        assert!(pick_from_levels(&config, &levels, 1).is_none());
    }

    #[test]
    fn increasing_output_file_size_matches_next_level_run_size() {
        // T = 4, K = 2, Z = 1; level 2 with 3 live runs, largest at 3.
        let config = increasing_config(4, 2, 1);
        let levels = snapshot(&[0, 0, 3, 1]);
        let task = pick_from_levels(&config, &levels, 2).unwrap();
        // cap(3) = (4 − 1)·4^3·B = 192 B; /K = 96 B; ×1.05.
        assert_eq!(task.output_file_size_limit, 105_696_460);
    }

    #[test]
    fn increasing_output_file_size_divides_by_z_on_largest() {
        let config = increasing_config(2, 2, 4);
        let levels = snapshot(&[0, 5]);
        let task = pick_from_levels(&config, &levels, 1).unwrap();
        // cap(2) = (2 − 1)·2^2·B = 4 MiB; /Z = 1 MiB; ×1.05.
        assert_eq!(
            task.output_file_size_limit,
            with_metadata_allowance(4 * MIB / 4)
        );
    }

    #[test]
    fn buffer_policy_uses_byte_capacity_and_buffer_sized_files() {
        let mut config = increasing_config(2, 1, 1);
        config.file_size_policy_opt = FileSizePolicy::Buffer;

        // Level 1 capacity is 2·(2 − 1)·1 MiB = 2 MiB; one 3 MiB run is due
        // even though run counts are fine.
        let levels = vec![
            level_of(0, vec![]),
            level_of(1, vec![run("sst-1-0", 3 * MIB, false)]),
            level_of(2, vec![run("sst-2-0", MIB, false)]),
        ];
        let task = pick_from_levels(&config, &levels, 1).unwrap();
        assert_eq!(task.output_file_size_limit, MIB);

        // A 1 MiB run is under capacity.
        let levels = vec![
            level_of(0, vec![]),
            level_of(1, vec![run("sst-1-0", MIB, false)]),
            level_of(2, vec![run("sst-2-0", MIB, false)]),
        ];
        assert!(pick_from_levels(&config, &levels, 1).is_none());
    }

    #[test]
    fn fixed_policy_emits_fixed_file_size() {
        let mut config = increasing_config(2, 1, 1);
        config.file_size_policy_opt = FileSizePolicy::Fixed;
        config.fixed_file_size = 123_456;

        let levels = vec![
            level_of(0, vec![run("sst-0-0", 2 * MIB, false)]),
            level_of(1, vec![run("sst-1-0", MIB, false)]),
        ];
        let task = pick_from_levels(&config, &levels, 0).unwrap();
        assert_eq!(task.output_file_size_limit, 123_456);
    }

    #[test]
    fn empty_level_and_claimed_files_yield_no_task() {
        let config = increasing_config(2, 1, 1);

        let levels = snapshot(&[0, 0, 1]);
        assert!(pick_from_levels(&config, &levels, 1).is_none());

        // Every file on the level is already being compacted.
        let levels = vec![
            level_of(0, vec![]),
            level_of(
                1,
                vec![run("sst-1-0", 1, true), run("sst-1-1", 1, true)],
            ),
            level_of(2, vec![run("sst-2-0", 1, false)]),
        ];
        assert!(pick_from_levels(&config, &levels, 1).is_none());
    }

    #[test]
    fn empty_tree_yields_no_task() {
        let config = increasing_config(2, 1, 1);
        let levels = snapshot(&[0, 0, 0]);
        assert!(pick_from_levels(&config, &levels, 1).is_none());
    }

    #[test]
    fn out_of_range_level_yields_no_task() {
        let config = increasing_config(2, 1, 1);
        let levels = snapshot(&[1, 1]);
        assert!(pick_from_levels(&config, &levels, 9).is_none());
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_nothing_pending() {
        let in_flight = InFlight::default();
        in_flight.wait_idle().await;
        assert_eq!(in_flight.pending(), 0);
    }

    #[tokio::test]
    async fn wait_idle_wakes_on_last_finish() {
        let in_flight = Arc::new(InFlight::default());
        in_flight.launch();
        in_flight.launch();

        let waiter = {
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move {
                in_flight.wait_idle().await;
            })
        };

        in_flight.finish();
        assert_eq!(in_flight.pending(), 1);
        assert!(!waiter.is_finished());

        in_flight.finish();
        waiter.await.unwrap();
        assert_eq!(in_flight.pending(), 0);
    }
}

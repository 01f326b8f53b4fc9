//! Bulk loading a fresh tree to a target shape.
//!
//! The loader fills levels bottom-up. Each level gets its run budget (Z on
//! the terminal level, K elsewhere) as separate memtable flushes, sized so
//! that every run lands as a single level-0 file; one explicit compaction
//! then maps the batch of level-0 files onto the destination level. Levels
//! are serialized: the loader drains its scheduler before touching the next
//! level up, so a freshly placed level never competes with its successor's
//! flushes.
//!
//! Automatic compactions must be disabled on the engine for the duration:
//! the loader schedules every compaction itself and expects no flush
//! listener to interfere.

use crate::compaction::{CompactionScheduler, CompactionTask};
use crate::config::{BulkLoadMode, FileSizePolicy, FluidConfig};
use crate::engine::{EngineError, StorageEngine, WriteBatch, WriteOptions};
use crate::error::{Error, Result};
use crate::workload::EXISTING_KEYS_FILE;
use fluid_datagen::KeySource;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Entries per write batch during loading.
const BATCH_SIZE: u64 = 100;

/// Fills an empty tree to a target entry count or level count.
pub struct BulkLoader<E, S> {
    engine: Arc<E>,
    scheduler: CompactionScheduler<E>,
    config: FluidConfig,
    source: S,
    /// Stop as soon as cumulative entries reach the target, even if upper
    /// levels are still unfilled.
    stop_after_level_filled: bool,
    /// Every key written, in write order.
    keys: Vec<String>,
    writes_planned: usize,
    writes_failed: usize,
}

impl<E: StorageEngine, S: KeySource> BulkLoader<E, S> {
    pub fn new(config: FluidConfig, engine: Arc<E>, source: S) -> Self {
        let scheduler = CompactionScheduler::new(Arc::clone(&engine));
        Self {
            engine,
            scheduler,
            config,
            source,
            stop_after_level_filled: false,
            keys: Vec::new(),
            writes_planned: 0,
            writes_failed: 0,
        }
    }

    pub fn stop_after_level_filled(mut self, stop: bool) -> Self {
        self.stop_after_level_filled = stop;
        self
    }

    /// The tuning config, with `num_entries`/`levels` updated after a
    /// successful load; persist it next to the DB.
    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Loads approximately `num_entries` entries, distributed across the
    /// levels the way a tree grown to that size would hold them.
    pub async fn bulk_load_entries(&mut self, num_entries: u64) -> Result<()> {
        tracing::info!(num_entries, "bulk loading DB by entry count");

        let levels = self.config.estimated_levels(num_entries);
        tracing::debug!(levels, "estimated levels");

        let mut capacities = capacity_plan(&self.config, levels);
        let full_tree = self.config.full_tree_entries(levels);
        let percent_full = num_entries as f64 / full_tree as f64;
        tracing::debug!(percent_full, "tree fill fraction");
        for capacity in &mut capacities {
            *capacity = (*capacity as f64 * percent_full) as u64;
        }
        tracing::debug!(?capacities, "entries per level");

        self.bulk_load(&capacities, levels, num_entries).await?;

        self.config.bulk_load_opt = BulkLoadMode::Entries;
        self.config.num_entries = num_entries;
        self.config.levels = levels;
        Ok(())
    }

    /// Fills exactly `num_levels` levels to capacity.
    pub async fn bulk_load_levels(&mut self, num_levels: u64) -> Result<()> {
        tracing::info!(num_levels, "bulk loading DB by level count");

        let capacities = capacity_plan(&self.config, num_levels);
        tracing::debug!(?capacities, "entries per level");

        self.bulk_load(&capacities, num_levels, u64::MAX).await?;

        self.config.bulk_load_opt = BulkLoadMode::Levels;
        self.config.levels = num_levels;
        self.config.num_entries = self.config.full_tree_entries(num_levels);
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        capacities: &[u64],
        num_levels: u64,
        max_entries: u64,
    ) -> Result<()> {
        self.writes_planned = capacities.iter().sum::<u64>() as usize;
        self.writes_failed = 0;

        let mut entries_loaded = 0u64;
        for level in (1..=num_levels).rev() {
            let capacity = capacities[level as usize - 1];
            if capacity == 0 {
                continue;
            }
            tracing::debug!(level, entries = capacity, "bulk loading level");

            let num_runs = if level == num_levels {
                self.config.largest_level_run_max
            } else {
                self.config.lower_level_run_max
            };
            self.load_level(level, capacity, num_runs).await?;

            entries_loaded += capacity;
            if self.stop_after_level_filled && entries_loaded >= max_entries {
                tracing::debug!(entries_loaded, "reached max entries, stopping bulk load");
                break;
            }
        }
        Ok(())
    }

    /// Writes one level as `num_runs` flushed runs, then maps the batch of
    /// level-0 files onto the destination level with a single explicit
    /// compaction.
    async fn load_level(&mut self, level: u64, capacity: u64, num_runs: u64) -> Result<()> {
        let entries_per_run = capacity / num_runs;
        if entries_per_run == 0 {
            tracing::debug!(level, "level capacity rounds to empty runs, skipping");
            return Ok(());
        }

        for run_idx in 0..num_runs {
            tracing::trace!(
                run = run_idx,
                level,
                entries = entries_per_run,
                run_mib = (entries_per_run * self.config.entry_size) as f64 / (1 << 20) as f64,
                "loading run"
            );
            self.load_run(entries_per_run).await?;
        }

        let output_file_size_limit = match self.config.file_size_policy_opt {
            FileSizePolicy::Increasing => {
                if level == 1 {
                    // A one-level tree keeps its runs on level 0; nothing to
                    // move.
                    return Ok(());
                }
                // 5% slack on the nominal run footprint, for table metadata.
                (1.05 * (entries_per_run * self.config.entry_size) as f64) as u64
            }
            FileSizePolicy::Buffer => {
                if level == 1 {
                    return Ok(());
                }
                self.config.buffer_size
            }
            FileSizePolicy::Fixed => self.config.fixed_file_size,
        };

        let snapshot = self.engine.level_metadata();
        let input_files = snapshot
            .first()
            .map(|level0| level0.live_run_names())
            .unwrap_or_default();
        if input_files.is_empty() {
            return Err(Error::EmptyDatabase);
        }

        let failed_before = self.scheduler.failed_tasks();
        self.scheduler.schedule(CompactionTask {
            origin_level: 0,
            output_level: level as usize - 1,
            input_files,
            output_file_size_limit,
            retry_on_fail: true,
            is_retry: false,
            attempt: 0,
        });
        self.scheduler.wait_idle().await;

        if self.scheduler.failed_tasks() > failed_before {
            let err = self
                .scheduler
                .take_last_error()
                .unwrap_or_else(|| EngineError::Other("compaction failed".to_string()));
            return Err(if err.is_fatal() {
                Error::CompactionFatal(err)
            } else {
                Error::CompactionTransient(err)
            });
        }
        Ok(())
    }

    /// Writes one run and flushes it as a single level-0 file.
    async fn load_run(&mut self, entries: u64) -> Result<()> {
        // Headroom so the engine never flushes mid-run on its own.
        self.engine
            .set_buffer_size(8 * self.config.entry_size * entries);

        let opts = WriteOptions::bulk_load();
        let mut remaining = entries;
        while remaining > 0 {
            let batch_len = remaining.min(BATCH_SIZE);
            let mut batch = WriteBatch::new();
            for _ in 0..batch_len {
                let (key, value) = self.source.kv_pair(self.config.entry_size as usize);
                self.keys.push(key.clone());
                batch.put(key, value);
            }

            if let Err(err) = self.engine.write_batch(&opts, batch).await {
                tracing::error!(%err, "bulk write failed");
                self.writes_failed += batch_len as usize;
                if self.writes_failed * 10 > self.writes_planned {
                    return Err(Error::WriteFailure {
                        failed: self.writes_failed,
                        planned: self.writes_planned,
                    });
                }
            }
            remaining -= batch_len;
        }

        tracing::trace!("flushing after run");
        if let Err(err) = self.engine.flush(true).await {
            tracing::warn!(%err, "flush after run reported failure");
        }
        Ok(())
    }

    /// Rewrites `existing_keys.data` at the DB path with every key written
    /// by this loader, one per line.
    pub fn write_existing_keys(&self, db_path: impl AsRef<Path>) -> Result<()> {
        let path = db_path.as_ref().join(EXISTING_KEYS_FILE);
        tracing::info!(keys = self.keys.len(), path = %path.display(), "writing out existing keys");
        let mut writer = BufWriter::new(File::create(path)?);
        for key in &self.keys {
            writeln!(writer, "{key}")?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Entry capacity per level for a tree of `levels` levels:
/// `cap[0] = (B/E)·(T−1)`, `cap[i] = cap[i−1]·T`.
fn capacity_plan(config: &FluidConfig, levels: u64) -> Vec<u64> {
    let entries_in_buffer = config.buffer_size / config.entry_size;
    tracing::debug!(entries_in_buffer, "entries that fit in the buffer");

    let mut capacities = Vec::with_capacity(levels as usize);
    let mut capacity = entries_in_buffer * (config.size_ratio - 1);
    for _ in 0..levels {
        capacities.push(capacity);
        capacity *= config.size_ratio;
    }
    capacities
}

//! Timed workload phases and the metrics they produce.
//!
//! Four phases run against an already-built tree: point reads that are
//! guaranteed to miss, point reads over known-present keys, short range
//! scans, and writes. The write phase finishes by flushing and draining
//! every background compaction so that the measured tree is quiescent and
//! the run-count summary is meaningful.
//!
//! Known-present keys live in `existing_keys.data` at the DB path, one
//! decimal key per line, appended after every write phase.

use crate::compaction::FluidCompactor;
use crate::engine::{QueryEngine, StorageEngine, WriteOptions};
use crate::error::{Error, Result};
use crate::levels::LevelMeta;
use fluid_datagen::KeySource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// File holding every key known to be present, relative to the DB path.
pub const EXISTING_KEYS_FILE: &str = "existing_keys.data";

/// Nominal page size used to size short range scans.
pub const PAGE_SIZE: u64 = 4096;

/// Phase durations and the tree shape at quiescence.
#[derive(Debug, Clone, Default)]
pub struct WorkloadSummary {
    pub empty_read: Duration,
    pub non_empty_read: Duration,
    pub range_read: Duration,
    pub write: Duration,
    pub remaining_compactions: Duration,
    pub runs_per_level: Vec<usize>,
}

impl WorkloadSummary {
    /// Logs the summary in the `(z0, z1, q, w)` shape.
    pub fn log(&self) {
        tracing::info!(
            "(z0, z1, q, w) : ({}, {}, {}, {})",
            self.empty_read.as_millis(),
            self.non_empty_read.as_millis(),
            self.range_read.as_millis(),
            self.write.as_millis()
        );
        tracing::info!(
            "(remaining_compactions_duration) : ({})",
            self.remaining_compactions.as_millis()
        );
        tracing::info!("runs_per_level : {:?}", self.runs_per_level);
    }
}

/// File count per level, including files claimed by compactions (the tree
/// should be quiescent when this is read).
pub fn runs_per_level(levels: &[LevelMeta]) -> Vec<usize> {
    levels.iter().map(|level| level.runs.len()).collect()
}

/// Loads and sorts `existing_keys.data`.
pub fn read_existing_keys(db_path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = db_path.as_ref().join(EXISTING_KEYS_FILE);
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut keys = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.is_empty() {
            keys.push(line);
        }
    }
    keys.sort();
    Ok(keys)
}

/// Appends keys written by a finished write phase.
pub fn append_existing_keys(db_path: impl AsRef<Path>, keys: &[String]) -> Result<()> {
    let path = db_path.as_ref().join(EXISTING_KEYS_FILE);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for key in keys {
        writeln!(writer, "{key}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Point reads guaranteed to miss the tree.
pub async fn run_empty_reads<Q, S>(engine: &Q, source: &mut S, count: usize) -> Duration
where
    Q: QueryEngine,
    S: KeySource,
{
    tracing::info!(count, "empty reads");
    let start = Instant::now();
    for _ in 0..count {
        let key = source.empty_point_key();
        if let Err(err) = engine.get(&key).await {
            tracing::warn!(%err, "empty read failed");
        }
    }
    let elapsed = start.elapsed();
    tracing::info!("empty read time elapsed : {} ms", elapsed.as_millis());
    elapsed
}

/// Uniform point reads over the known-present keys.
pub async fn run_non_empty_reads<Q>(
    engine: &Q,
    existing_keys: &[String],
    count: usize,
    seed: u64,
) -> Duration
where
    Q: QueryEngine,
{
    tracing::info!(count, "non-empty reads");
    if existing_keys.is_empty() {
        tracing::warn!("no existing keys, skipping non-empty reads");
        return Duration::ZERO;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let start = Instant::now();
    for _ in 0..count {
        let key = &existing_keys[rng.gen_range(0..existing_keys.len())];
        if let Err(err) = engine.get(key).await {
            tracing::warn!(%err, "non-empty read failed");
        }
    }
    let elapsed = start.elapsed();
    tracing::info!("non-empty read time elapsed : {} ms", elapsed.as_millis());
    elapsed
}

/// Short range scans spanning roughly one page of entries each.
///
/// Bounds come from consecutive existing keys, so every scan is a
/// guaranteed-short range over live data.
pub async fn run_range_reads<Q>(
    engine: &Q,
    existing_keys: &[String],
    entry_size: u64,
    count: usize,
    seed: u64,
) -> Duration
where
    Q: QueryEngine,
{
    tracing::info!(count, "range reads");
    let key_hop = (PAGE_SIZE / entry_size).max(1) as usize;
    tracing::debug!(key_hop, "keys per range query");
    if existing_keys.len() <= key_hop {
        tracing::warn!("not enough existing keys for range reads, skipping");
        return Duration::ZERO;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut valid_keys = 0usize;
    let start = Instant::now();
    for _ in 0..count {
        let idx = rng.gen_range(0..existing_keys.len() - key_hop);
        let lower = &existing_keys[idx];
        let upper = &existing_keys[idx + key_hop];
        match engine.scan(lower, upper).await {
            Ok(found) => valid_keys += found,
            Err(err) => tracing::warn!(%err, "range read failed"),
        }
    }
    let elapsed = start.elapsed();
    tracing::info!("range read time elapsed : {} ms", elapsed.as_millis());
    tracing::trace!(valid_keys, "range read hits");
    elapsed
}

/// Result of a write phase.
#[derive(Debug)]
pub struct WritePhase {
    pub new_keys: Vec<String>,
    pub write: Duration,
    pub remaining_compactions: Duration,
}

/// Writes `count` fresh entries, then flushes and drains the tree back to
/// quiescence. Aborts when more than 10% of the writes fail.
pub async fn run_writes<E, S>(
    engine: &E,
    compactor: &FluidCompactor<E>,
    source: &mut S,
    count: usize,
) -> Result<WritePhase>
where
    E: StorageEngine,
    S: KeySource,
{
    tracing::info!(count, "write queries");
    let opts = WriteOptions::bulk_load();
    let entry_size = compactor.config().entry_size as usize;
    let max_failed = count / 10;

    let mut new_keys = Vec::with_capacity(count);
    let mut failed = 0usize;

    let start = Instant::now();
    for _ in 0..count {
        let (key, value) = source.kv_pair(entry_size);
        new_keys.push(key.clone());
        if let Err(err) = engine.put(&opts, key, value).await {
            tracing::warn!(%err, "unable to put key");
            failed += 1;
            if failed > max_failed {
                tracing::error!("10% of total writes have failed, aborting");
                return Err(Error::WriteFailure {
                    failed,
                    planned: count,
                });
            }
        }
    }
    let write = start.elapsed();

    // One last flush, then drain every remaining background compaction so
    // the tree settles before anything measures it.
    let drain_start = Instant::now();
    tracing::debug!("flushing DB");
    if let Err(err) = engine.flush(true).await {
        tracing::warn!(%err, "final flush reported failure");
    }
    compactor.wait_idle().await;

    tracing::debug!("checking final tree state for leftover compactions");
    while compactor.requires_compaction() {
        compactor.wait_idle().await;
    }
    let remaining_compactions = drain_start.elapsed();

    tracing::info!("write time elapsed : {} ms", write.as_millis());
    Ok(WritePhase {
        new_keys,
        write,
        remaining_compactions,
    })
}

//! Fluid LSM tuning configuration.
//!
//! The tuple (T, K, Z) spans the Fluid LSM design space: K bounds the sorted
//! runs tolerated on every level below the largest, Z bounds the largest
//! level, and T is the capacity ratio between adjacent levels. K = Z = 1 is
//! pure leveling, K = Z = T − 1 is pure tiering; everything between is fair
//! game for a tuner.
//!
//! The config is persisted as `fluid_config.json` next to the database so a
//! reopened tree keeps the shape it was built with. Field names and the
//! integer encodings of the two mode enums are part of that on-disk format.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// File name of the persisted tuning config, relative to the DB path.
pub const CONFIG_FILE_NAME: &str = "fluid_config.json";

/// Target of a bulk load: a total entry count or a number of filled levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BulkLoadMode {
    Entries = 0,
    Levels = 1,
}

impl From<BulkLoadMode> for u8 {
    fn from(mode: BulkLoadMode) -> u8 {
        mode as u8
    }
}

impl TryFrom<u8> for BulkLoadMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(BulkLoadMode::Entries),
            1 => Ok(BulkLoadMode::Levels),
            other => Err(format!("invalid bulk_load_opt: {other}")),
        }
    }
}

/// How output file sizes are chosen for compactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileSizePolicy {
    /// File size tracks the run size of the destination level.
    Increasing = 0,
    /// Every file is capped at `fixed_file_size`.
    Fixed = 1,
    /// Every file is capped at the buffer size.
    Buffer = 2,
}

impl From<FileSizePolicy> for u8 {
    fn from(policy: FileSizePolicy) -> u8 {
        policy as u8
    }
}

impl TryFrom<u8> for FileSizePolicy {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(FileSizePolicy::Increasing),
            1 => Ok(FileSizePolicy::Fixed),
            2 => Ok(FileSizePolicy::Buffer),
            other => Err(format!("invalid file_size_policy_opt: {other}")),
        }
    }
}

/// Tuning parameters of one Fluid LSM tree.
///
/// Immutable after construction except for `num_entries` and `levels`,
/// which grow as the bulk loader and the write path add data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidConfig {
    /// Size ratio between adjacent levels (T).
    pub size_ratio: u64,
    /// Max sorted runs on any level below the largest (K).
    pub lower_level_run_max: u64,
    /// Max sorted runs on the largest occupied level (Z).
    pub largest_level_run_max: u64,
    /// In-memory write buffer size in bytes (B).
    pub buffer_size: u64,
    /// Nominal entry size in bytes (E).
    pub entry_size: u64,
    /// Bloom filter bits per element at every level (h).
    pub bits_per_element: f64,
    pub bulk_load_opt: BulkLoadMode,
    /// Current entry count estimate.
    pub num_entries: u64,
    /// Current filled-level estimate.
    pub levels: u64,
    /// File size cap under [`FileSizePolicy::Fixed`].
    pub fixed_file_size: u64,
    pub file_size_policy_opt: FileSizePolicy,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            size_ratio: 2,
            lower_level_run_max: 1,
            largest_level_run_max: 1,
            buffer_size: 1 << 20,
            entry_size: 8 << 10,
            bits_per_element: 5.0,
            bulk_load_opt: BulkLoadMode::Entries,
            num_entries: 0,
            levels: 0,
            fixed_file_size: u64::MAX,
            file_size_policy_opt: FileSizePolicy::Increasing,
        }
    }
}

/// Smallest entry size the key codec can carry (keys are decimal strings of
/// up to ten digits plus filler).
pub const MIN_ENTRY_SIZE: u64 = 32;

impl FluidConfig {
    /// Reads the config at `path`; a missing or unreadable file falls back
    /// to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unable to read config: {e}");
                tracing::warn!("using default fluid tuning");
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unable to parse config: {e}");
                tracing::warn!("using default fluid tuning");
                Self::default()
            }
        }
    }

    /// Convenience for `load(db_path/fluid_config.json)`.
    pub fn load_from_db_path(db_path: impl AsRef<Path>) -> Self {
        Self::load(db_path.as_ref().join(CONFIG_FILE_NAME))
    }

    /// Writes the config, pretty-printed with a 4-space indent.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        self.serialize(&mut serializer)
            .map_err(|e| Error::Config(e.to_string()))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        tracing::info!(path = %path.display(), "wrote fluid tuning config");
        Ok(())
    }

    /// Convenience for `save(db_path/fluid_config.json)`.
    pub fn save_to_db_path(&self, db_path: impl AsRef<Path>) -> Result<()> {
        self.save(db_path.as_ref().join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        if self.size_ratio < 2 {
            return Err(Error::Config(format!(
                "size_ratio must be >= 2, got {}",
                self.size_ratio
            )));
        }
        if self.lower_level_run_max == 0 || self.largest_level_run_max == 0 {
            return Err(Error::Config(
                "run maxima (K, Z) must both be >= 1".to_string(),
            ));
        }
        if self.entry_size < MIN_ENTRY_SIZE {
            return Err(Error::Config(format!(
                "entry_size must be >= {MIN_ENTRY_SIZE} bytes, got {}",
                self.entry_size
            )));
        }
        if self.buffer_size < self.entry_size {
            return Err(Error::Config(format!(
                "buffer_size ({}) must hold at least one entry ({})",
                self.buffer_size, self.entry_size
            )));
        }
        if self.bits_per_element <= 0.0 {
            return Err(Error::Config(format!(
                "bits_per_element must be positive, got {}",
                self.bits_per_element
            )));
        }
        Ok(())
    }

    /// Number of levels a tree of `num_entries` entries needs:
    /// ⌈log_T(N·E/B + 1)⌉, and 1 when everything fits in the buffer.
    ///
    /// Computed as the smallest L with (T^L − 1)·B ≥ N·E, which is the same
    /// quantity in exact integer arithmetic.
    pub fn estimate_levels(num_entries: u64, size_ratio: u64, entry_size: u64, buffer_size: u64) -> u64 {
        debug_assert!(size_ratio >= 2);
        let data = num_entries as u128 * entry_size as u128;
        if data < buffer_size as u128 {
            tracing::warn!(
                num_entries,
                "entry count fits in the in-memory buffer, defaulting to 1 level"
            );
            return 1;
        }

        let mut levels = 1u64;
        let mut capacity = size_ratio as u128;
        while (capacity - 1) * (buffer_size as u128) < data {
            capacity *= size_ratio as u128;
            levels += 1;
        }
        levels
    }

    /// Entry count of a completely full tree of `levels` levels:
    /// Σ_{ℓ=1..L} (B/E)·(T−1)·T^(ℓ−1).
    pub fn calculate_full_tree(size_ratio: u64, entry_size: u64, buffer_size: u64, levels: u64) -> u64 {
        let entries_in_buffer = (buffer_size / entry_size) as u128;
        let mut total = 0u128;
        let mut level_capacity = entries_in_buffer * (size_ratio as u128 - 1);
        for _ in 0..levels {
            total += level_capacity;
            level_capacity *= size_ratio as u128;
        }
        total as u64
    }

    /// [`FluidConfig::estimate_levels`] with this config's parameters.
    pub fn estimated_levels(&self, num_entries: u64) -> u64 {
        Self::estimate_levels(num_entries, self.size_ratio, self.entry_size, self.buffer_size)
    }

    /// [`FluidConfig::calculate_full_tree`] with this config's parameters.
    pub fn full_tree_entries(&self, levels: u64) -> u64 {
        Self::calculate_full_tree(self.size_ratio, self.entry_size, self.buffer_size, levels)
    }

    /// Byte capacity of level `level_idx` (0-indexed): T^idx · (T−1) · B.
    pub fn level_capacity_bytes(&self, level_idx: usize) -> u64 {
        let t = self.size_ratio as u128;
        let capacity = t.pow(level_idx as u32) * (t - 1) * self.buffer_size as u128;
        capacity.min(u64::MAX as u128) as u64
    }
}

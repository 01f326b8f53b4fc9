//! Synthetic key/value sources for LSM load generation.
//!
//! Keys are decimal strings drawn from a fixed integer domain so that the
//! same key space can be produced by a seeded random source, a Zipf source,
//! or a pre-generated key file. Values are filler bytes padded so that one
//! key/value pair occupies a configurable entry size on disk.
//!
//! # Sources
//!
//! - [`RandomKeySource`] draws uniformly over the domain, with a guard gap
//!   in the middle: keys only ever come from the two flanks, so the gap
//!   yields in-domain keys that are guaranteed to miss (empty point reads).
//! - [`ZipfKeySource`] draws Zipf-distributed ranks over the domain, for
//!   skewed workloads.
//! - [`KeyFileSource`] replays a window of a flat little-endian `i32`
//!   stream produced by [`keyfile::write_key_file`].
//!
//! # Example
//!
//! ```
//! use fluid_datagen::{KeySource, RandomKeySource};
//!
//! let mut source = RandomKeySource::new(42);
//! let (key, value) = source.kv_pair(64);
//! assert_eq!(key.len() + value.len(), 64);
//! ```

pub mod distribution;
pub mod keyfile;
pub mod random;

pub use distribution::{Distribution, Uniform, Zipf, ZipfKeySource};
pub use keyfile::KeyFileSource;
pub use random::RandomKeySource;

use thiserror::Error;

/// Upper bound (inclusive) of the integer key domain.
pub const KEY_DOMAIN: u64 = 1_000_000_000;

/// Left edge of the guard gap; uniform keys below this bound are legal.
pub const KEY_MIDDLE_LEFT: u64 = 450_000_000;

/// Right edge of the guard gap; uniform keys above this bound are legal.
pub const KEY_MIDDLE_RIGHT: u64 = 550_000_000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key file error: {0}")]
    KeyFile(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A stream of keys plus the value filler that pads each pair to a fixed
/// entry size.
pub trait KeySource {
    /// Next key to write.
    fn key(&mut self) -> String;

    /// A key that is inside the domain but guaranteed absent from anything
    /// this source has produced or will produce via [`KeySource::key`].
    fn empty_point_key(&mut self) -> String;

    /// Filler value of exactly `size` bytes.
    fn value(&self, size: usize) -> String {
        "a".repeat(size)
    }

    /// One key/value pair occupying exactly `entry_size` bytes.
    fn kv_pair(&mut self, entry_size: usize) -> (String, String) {
        let key = self.key();
        assert!(
            key.len() < entry_size,
            "entry size {} cannot hold key of {} bytes",
            entry_size,
            key.len()
        );
        let value = self.value(entry_size - key.len());
        (key, value)
    }
}

//! Flat little-endian `i32` key files.
//!
//! A key file is nothing but `i32` values back to back, so any window of it
//! is addressable as `[offset, offset + count)` without framing. Builders
//! read the first `N` keys; runners read a window past the loaded prefix to
//! obtain keys that are absent from the tree.

use crate::{Error, KeySource, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;

/// Reads `count` keys starting at key index `offset`.
pub fn read_key_window(path: impl AsRef<Path>, offset: u64, count: usize) -> Result<Vec<i32>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        tracing::warn!(path = %path.display(), "error opening key file: {e}");
        Error::KeyFile(format!("{}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset * std::mem::size_of::<i32>() as u64))?;

    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        match reader.read_i32::<LittleEndian>() {
            Ok(key) => keys.push(key),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }

    if keys.len() < count {
        tracing::warn!(
            path = %path.display(),
            wanted = count,
            got = keys.len(),
            "key file window ran short"
        );
    }
    Ok(keys)
}

/// Writes keys as a flat little-endian stream, replacing any existing file.
pub fn write_key_file(path: impl AsRef<Path>, keys: &[i32]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &key in keys {
        writer.write_i32::<LittleEndian>(key)?;
    }
    Ok(())
}

/// Replays a window of a key file.
///
/// The cursor wraps around when the window is exhausted, so the source never
/// runs dry mid-load.
#[derive(Debug)]
pub struct KeyFileSource {
    keys: Vec<i32>,
    cursor: usize,
}

impl KeyFileSource {
    /// Loads the first `count` keys.
    pub fn new(path: impl AsRef<Path>, count: usize) -> Result<Self> {
        Self::with_offset(path, 0, count)
    }

    /// Loads the window `[offset, offset + count)`.
    pub fn with_offset(path: impl AsRef<Path>, offset: u64, count: usize) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), offset, count, "loading key file window");
        let keys = read_key_window(path, offset, count)?;
        if keys.is_empty() {
            return Err(Error::KeyFile(format!("{}: empty window", path.display())));
        }
        Ok(Self { keys, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeySource for KeyFileSource {
    fn key(&mut self) -> String {
        let key = self.keys[self.cursor % self.keys.len()];
        self.cursor += 1;
        key.to_string()
    }

    fn empty_point_key(&mut self) -> String {
        // The caller picks a window disjoint from the loaded prefix, so the
        // stream itself is the supply of guaranteed-absent keys.
        self.key()
    }
}

//! # Memtable
//!
//! An in-memory, sorted, mutable write buffer for the Breakwater storage
//! engine.
//!
//! The memtable is the first point of contact for every write operation. It
//! buffers recent `PUT` and `DELETE` operations in a sorted structure
//! (`BTreeMap`) until the accounted byte size crosses the flush threshold,
//! at which point the engine streams it into an immutable on-disk SSTable.
//!
//! ## Key properties
//! - **Sorted order**: entries are always in ascending key order (required
//!   for SSTable flush).
//! - **Last write wins**: a later `put` or `delete` replaces the existing
//!   entry in place; the map never holds two records for one key.
//! - **Tombstone support**: deletes are recorded as `None` markers and must
//!   shadow older values in lower layers during reads.
//! - **Deterministic size tracking**: the accounted size is a pure function
//!   of the insertion history, so flush triggering is reproducible.
//!
//! ## Example
//! ```rust
//! use memtable::{Lookup, Memtable};
//!
//! let mut m = Memtable::new();
//! m.put(b"hello".to_vec(), b"world".to_vec());
//! assert_eq!(m.get(b"hello"), Lookup::Present(b"world".to_vec()));
//!
//! m.delete(b"hello".to_vec());
//! assert_eq!(m.get(b"hello"), Lookup::Deleted);
//! assert_eq!(m.get(b"absent"), Lookup::Absent);
//! ```

use std::collections::BTreeMap;

/// Default flush threshold: 4 MiB of accounted key + value bytes.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

/// Accounted cost of a tombstone's missing value: the width of the on-disk
/// sentinel that will encode it.
pub const TOMBSTONE_COST: usize = 4;

/// Result of a point lookup.
///
/// `Deleted` and `Absent` are distinct on purpose: a tombstone must stop
/// the caller from descending into older SSTables, while a plain miss lets
/// the search continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The key holds this value.
    Present(Vec<u8>),
    /// The key was deleted; older layers must not be consulted.
    Deleted,
    /// The key is unknown to this layer.
    Absent,
}

impl Lookup {
    pub fn is_present(&self) -> bool {
        matches!(self, Lookup::Present(_))
    }
}

/// An ordered, in-memory write buffer backed by a `BTreeMap`.
///
/// Values are `Option<Vec<u8>>`: `Some(bytes)` for live entries, `None` for
/// tombstones. The accounted byte size (keys + values, tombstones costing
/// [`TOMBSTONE_COST`]) drives [`is_full`](Memtable::is_full); map node
/// overhead is deliberately not counted.
#[derive(Debug)]
pub struct Memtable {
    map: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    size_bytes: usize,
    flush_threshold: usize,
}

impl Memtable {
    /// Creates an empty memtable with the default 4 MiB flush threshold.
    pub fn new() -> Self {
        Self::with_flush_threshold(DEFAULT_FLUSH_THRESHOLD)
    }

    /// Creates an empty memtable that reports full at `threshold` accounted
    /// bytes.
    pub fn with_flush_threshold(threshold: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            size_bytes: 0,
            flush_threshold: threshold,
        }
    }

    fn entry_cost(key: &[u8], value: &Option<Vec<u8>>) -> usize {
        match value {
            Some(v) => key.len() + v.len(),
            None => key.len() + TOMBSTONE_COST,
        }
    }

    /// Inserts or replaces a key-value pair. The later write always wins.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.insert(key, Some(value));
    }

    /// Records a tombstone for the given key, replacing any existing entry.
    ///
    /// The tombstone is retained (and later flushed) even if the key was
    /// never written here, so that older values in lower layers stay
    /// shadowed.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.insert(key, None);
    }

    fn insert(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let new_cost = Self::entry_cost(&key, &value);
        match self.map.get_mut(&key) {
            Some(slot) => {
                let old_cost = Self::entry_cost(&key, slot);
                *slot = value;
                self.size_bytes = self.size_bytes - old_cost + new_cost;
            }
            None => {
                self.map.insert(key, value);
                self.size_bytes += new_cost;
            }
        }
    }

    /// Three-valued point lookup.
    pub fn get(&self, key: &[u8]) -> Lookup {
        match self.map.get(key) {
            Some(Some(v)) => Lookup::Present(v.clone()),
            Some(None) => Lookup::Deleted,
            None => Lookup::Absent,
        }
    }

    /// Accounted byte size of the current entries.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// True once the accounted size has reached the flush threshold.
    pub fn is_full(&self) -> bool {
        self.size_bytes >= self.flush_threshold
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates all entries in ascending key order, tombstones included.
    ///
    /// The iterator is lazy and restartable; the ordering guarantee comes
    /// from the underlying `BTreeMap` and is what makes SSTable flush
    /// correct.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.map.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    /// Removes all entries and resets the accounted size to zero.
    pub fn clear(&mut self) {
        self.map.clear();
        self.size_bytes = 0;
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

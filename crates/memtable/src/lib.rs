//! # Memtable
//!
//! Sorted in-memory buffer holding the most recent mutations of the engine.
//! Writes land here after they are logged to the WAL; once the table grows
//! past the configured limit it is sealed and handed to the flusher, which
//! turns it into an immutable segment.
//!
//! A `Memtable` is shared between the writer and any number of readers, so
//! all methods take `&self`. Mutations are serialized by the engine's write
//! lock; the internal `RwLock` only protects readers from the writer.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// ValueEntry stores the sequence number and the optional value.
/// `value == None` signifies a tombstone (delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub seq: u64,
    pub value: Option<Vec<u8>>,
}

impl ValueEntry {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Default)]
pub struct Memtable {
    map: RwLock<BTreeMap<Vec<u8>, ValueEntry>>,
    approx_size: AtomicUsize,
    max_seq: AtomicU64,
    sealed: AtomicBool,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key = value` at `seq`.
    ///
    /// Returns `false` when the table is sealed or already holds a newer (or
    /// equal) sequence number for `key`; the entry is left untouched.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> bool {
        self.apply(key, Some(value), seq)
    }

    /// Records a tombstone for `key` at `seq`. Same rules as [`put`](Self::put).
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> bool {
        self.apply(key, None, seq)
    }

    fn apply(&self, key: Vec<u8>, value: Option<Vec<u8>>, seq: u64) -> bool {
        if self.is_sealed() {
            return false;
        }
        let mut map = self.map.write();
        let added = entry_size(&key, value.as_deref());
        match map.get(&key) {
            Some(old) if old.seq >= seq => return false,
            Some(old) => {
                let removed = entry_size(&key, old.value.as_deref());
                self.approx_size.fetch_sub(removed, Ordering::Relaxed);
            }
            None => {}
        }
        self.approx_size.fetch_add(added, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::Relaxed);
        map.insert(key, ValueEntry { seq, value });
        true
    }

    /// Latest live value for `key`. Tombstones read as `None`; use
    /// [`get_entry`](Self::get_entry) to tell them apart from absent keys.
    pub fn get(&self, key: &[u8]) -> Option<(u64, Vec<u8>)> {
        self.map
            .read()
            .get(key)
            .and_then(|e| e.value.as_ref().map(|v| (e.seq, v.clone())))
    }

    /// Latest entry for `key`, tombstones included.
    pub fn get_entry(&self, key: &[u8]) -> Option<ValueEntry> {
        self.map.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.map.read().contains_key(key)
    }

    /// Copies the entries inside `(start, end)` in key order, tombstones
    /// included. Inverted or empty bounds yield nothing.
    pub fn range(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Vec<(Vec<u8>, ValueEntry)> {
        if bounds_are_empty(start, end) {
            return Vec::new();
        }
        self.map
            .read()
            .range::<[u8], _>((start, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Runs `f` over all entries in key order while holding the read lock.
    ///
    /// Used by the flusher on sealed tables, where no writer can contend.
    pub fn with_entries<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut dyn Iterator<Item = (&Vec<u8>, &ValueEntry)>) -> R,
    {
        let map = self.map.read();
        let mut iter = map.iter();
        f(&mut iter)
    }

    /// Marks the table immutable. Further puts and deletes are rejected.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Approximate memory footprint: key bytes plus live value bytes.
    pub fn approx_size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    /// Highest sequence number applied, `0` when empty.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Relaxed)
    }
}

fn entry_size(key: &[u8], value: Option<&[u8]>) -> usize {
    key.len() + value.map_or(0, <[u8]>::len)
}

/// True when no key can satisfy both bounds. `BTreeMap::range` panics on
/// such input instead of returning an empty iterator.
fn bounds_are_empty(start: Bound<&[u8]>, end: Bound<&[u8]>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        _ => false,
    }
}

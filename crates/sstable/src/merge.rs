//! K-way merge over sorted `(key, ValueEntry)` sources.
//!
//! Produces entries in ascending key order. When the same key appears in
//! several sources only the entry with the **highest sequence number** is
//! emitted (newest wins). Tombstones are passed through; dropping them is
//! the caller's decision.
//!
//! This is the core primitive of compaction and of engine range scans.

use memtable::ValueEntry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::SstError;

/// Item type of every merge source.
pub type EntryResult = Result<(Vec<u8>, ValueEntry), SstError>;

/// Head entry of one source, ordered for the heap.
struct HeapEntry {
    key: Vec<u8>,
    entry: ValueEntry,
    /// Index into `sources`.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smallest key first, then highest seq,
        // then the lowest source index.
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted sources into a single deduplicated stream.
///
/// Each source must yield strictly ascending keys. The first error from any
/// source is returned once and ends the merge.
pub struct MergeIterator<I: Iterator<Item = EntryResult>> {
    sources: Vec<I>,
    heap: BinaryHeap<HeapEntry>,
    /// Sources whose head was consumed by the last step.
    pending: Vec<usize>,
    primed: bool,
    failed: bool,
}

impl<I: Iterator<Item = EntryResult>> MergeIterator<I> {
    pub fn new(sources: Vec<I>) -> Self {
        let heap = BinaryHeap::with_capacity(sources.len());
        Self {
            sources,
            heap,
            pending: Vec::new(),
            primed: false,
            failed: false,
        }
    }

    /// Pulls the next entry of `source` onto the heap.
    fn advance(&mut self, source: usize) -> Result<(), SstError> {
        if let Some(item) = self.sources[source].next() {
            let (key, entry) = item?;
            self.heap.push(HeapEntry { key, entry, source });
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, ValueEntry)>, SstError> {
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                self.advance(source)?;
            }
        }

        // Refill lazily so an entry already popped is never lost to a read
        // error from its successor.
        for source in std::mem::take(&mut self.pending) {
            self.advance(source)?;
        }

        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.pending.push(top.source);

        // Older versions of the same key sit right below the winner.
        while self.heap.peek().map_or(false, |p| p.key == top.key) {
            if let Some(dup) = self.heap.pop() {
                self.pending.push(dup.source);
            }
        }
        Ok(Some((top.key, top.entry)))
    }
}

impl<I: Iterator<Item = EntryResult>> Iterator for MergeIterator<I> {
    type Item = EntryResult;

    fn next(&mut self) -> Option<EntryResult> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

//! Read path: point lookups and range scans over a view snapshot.

use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use memtable::{Memtable, ValueEntry};
use sstable::{EntryResult, MergeIterator, SSTableIter, SstError};

use crate::write::validate_key;
use crate::{Engine, EngineError, Segment, SegmentRef, View};

/// One sorted input of a scan.
type Source = Box<dyn Iterator<Item = EntryResult> + Send>;

/// Newest entry for `key` in `view`, tombstones included.
pub(crate) fn lookup(view: &View, key: &[u8]) -> Result<Option<ValueEntry>, EngineError> {
    match lookup_memtables(view, key) {
        Some(entry) => Ok(Some(entry)),
        None => lookup_segments(&view.segments, key),
    }
}

/// Newest entry for `key` in the active and sealed memtables.
pub(crate) fn lookup_memtables(view: &View, key: &[u8]) -> Option<ValueEntry> {
    if let Some(entry) = view.active.get_entry(key) {
        return Some(entry);
    }
    view.sealed.iter().find_map(|sealed| sealed.mem.get_entry(key))
}

/// Newest entry for `key` in `segments`, searched newest first.
pub(crate) fn lookup_segments(
    segments: &[Arc<Segment>],
    key: &[u8],
) -> Result<Option<ValueEntry>, EngineError> {
    for segment in segments.iter().rev() {
        if let Some(entry) = segment.reader.get(key)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Merged, deduplicated entries of `view` inside `(start, end)`.
fn merged(view: &View, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> MergeIterator<Source> {
    let snapshot = |mem: &Memtable| -> Source {
        let entries = mem.range(as_slice_bound(&start), as_slice_bound(&end));
        Box::new(entries.into_iter().map(Ok::<_, SstError>))
    };

    let mut sources = Vec::with_capacity(1 + view.sealed.len() + view.segments.len());
    sources.push(snapshot(&view.active));
    for sealed in &view.sealed {
        sources.push(snapshot(&sealed.mem));
    }
    for segment in view.segments.iter().rev() {
        let iter = SSTableIter::new(SegmentRef(Arc::clone(segment)), start.clone(), end.clone());
        sources.push(Box::new(iter));
    }
    MergeIterator::new(sources)
}

/// Live key count and live key+value bytes of a whole view.
pub(crate) fn live_totals(view: &View) -> Result<(u64, u64), EngineError> {
    let mut keys = 0u64;
    let mut bytes = 0u64;
    for item in merged(view, Bound::Unbounded, Bound::Unbounded) {
        let (key, entry) = item?;
        if let Some(value) = entry.value {
            keys += 1;
            bytes += (key.len() + value.len()) as u64;
        }
    }
    Ok((keys, bytes))
}

/// Lazy iterator over the live key/value pairs of a range, in key order.
///
/// Holds its own snapshot: memtable contents were copied when the scan
/// started and segments stay alive (even if compacted away) until the
/// iterator is dropped. Tombstoned keys are skipped.
pub struct ScanIter {
    merge: MergeIterator<Source>,
    last_key: Option<Vec<u8>>,
}

impl ScanIter {
    /// The last key returned so far.
    ///
    /// A follow-up scan starting at `Bound::Excluded(key)` continues exactly
    /// where this one stopped.
    #[must_use]
    pub fn resume_after(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }
}

impl Iterator for ScanIter {
    type Item = Result<(Vec<u8>, Vec<u8>), EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.merge.next()? {
                Ok((key, entry)) => {
                    if let Some(value) = entry.value {
                        self.last_key = Some(key.clone());
                        return Some(Ok((key, value)));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

impl Engine {
    /// Looks up the current value of `key`. `Ok(None)` means not found,
    /// including keys whose newest record is a tombstone.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidArgument`] for an empty or oversize key.
    /// - [`EngineError::Unavailable`] outside `Serving`.
    /// - [`EngineError::Sst`] if a segment block fails its checksum.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        validate_key(key)?;
        self.ensure_serving()?;
        let view = self.view();
        Ok(lookup(&view, key)?.and_then(|e| e.value))
    }

    /// Scans the live pairs inside `range` in ascending key order.
    ///
    /// ```rust,no_run
    /// # fn demo(engine: &engine::Engine) -> Result<(), engine::EngineError> {
    /// for item in engine.scan(b"user:".to_vec()..b"user;".to_vec())? {
    ///     let (key, value) = item?;
    ///     println!("{:?} = {:?}", key, value);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// [`EngineError::Unavailable`] outside `Serving`. Read errors surface
    /// through the iterator.
    pub fn scan<R: RangeBounds<Vec<u8>>>(&self, range: R) -> Result<ScanIter, EngineError> {
        self.ensure_serving()?;
        let view = self.view();
        Ok(ScanIter {
            merge: merged(&view, range.start_bound().cloned(), range.end_bound().cloned()),
            last_key: None,
        })
    }
}

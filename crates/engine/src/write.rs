//! Write path: `put`, `delete`, memtable rotation and flush.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use memtable::Memtable;
use sstable::{segment_file_name, SSTableWriter, WriterOptions};
use tracing::{debug, info, warn};
use wal::{log_file_name, WalRecord, WalWriter};

use crate::read::{lookup_memtables, lookup_segments};
use crate::{
    Engine, EngineError, SealedMemtable, Segment, View, WriteState, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};

pub(crate) fn validate_key(key: &[u8]) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(EngineError::InvalidArgument(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<(), EngineError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(EngineError::InvalidArgument(format!(
            "value is {} bytes, limit is {}",
            value.len(),
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

/// `true` if both views hold the same segment list.
fn same_segments(a: &View, b: &View) -> bool {
    a.segments.len() == b.segments.len()
        && a.segments.iter().zip(&b.segments).all(|(x, y)| Arc::ptr_eq(x, y))
}

impl Engine {
    /// Stores `value` under `key` and returns the sequence number assigned.
    ///
    /// The write is in the WAL (and fsynced when `wal_sync` is on) before
    /// this returns.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidArgument`] for an empty or oversize key, or an
    ///   oversize value.
    /// - [`EngineError::Unavailable`] outside the `Serving` state.
    /// - [`EngineError::Wal`] if the WAL append fails.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<u64, EngineError> {
        validate_key(&key)?;
        validate_value(&value)?;
        self.apply(key, Some(value))
    }

    /// Deletes `key` by writing a tombstone. Deleting an absent key is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn delete(&self, key: Vec<u8>) -> Result<u64, EngineError> {
        validate_key(&key)?;
        self.apply(key, None)
    }

    fn apply(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<u64, EngineError> {
        let (seq, rotated) = loop {
            // Segment reads hit the disk; keep them out of the write lock.
            let snapshot = self.view();
            let on_disk = match lookup_memtables(&snapshot, &key) {
                Some(_) => None,
                None => self.previous_on_disk(&snapshot, &key),
            };

            let mut w = self.writer.lock();
            self.ensure_serving()?;
            if w.wal.is_poisoned() {
                // the log may end in a partial frame; continue in a new one
                self.rotate(&mut w)?;
            }

            let view = self.view();
            if !same_segments(&snapshot, &view) {
                continue;
            }
            let previous = match lookup_memtables(&view, &key) {
                Some(entry) => entry.value,
                None => on_disk,
            };
            let seq = w.seq.checked_add(1).ok_or(EngineError::SeqOverflow)?;

            let record = WalRecord { seq, key, value };
            w.wal.append(&record)?;
            w.seq = seq;

            let WalRecord { key, value, .. } = record;
            self.account(&key, previous.as_deref(), value.as_deref());
            match value {
                Some(v) => view.active.put(key, v, seq),
                None => view.active.delete(key, seq),
            };

            let rotated = view.active.approx_size() >= self.config.memtable_size_limit;
            if rotated {
                // The write itself is durable; a failed rotation is retried
                // on the next write.
                if let Err(e) = self.rotate(&mut w) {
                    warn!(error = %e, "memtable rotation failed");
                }
            }
            break (seq, rotated);
        };

        if rotated {
            self.schedule_maintenance();
        }
        Ok(seq)
    }

    /// Live value of `key` in the segments of `view`.
    ///
    /// A damaged segment does not block the write: the previous value is
    /// treated as absent, so the live counters may drift, and the engine is
    /// marked degraded.
    fn previous_on_disk(&self, view: &View, key: &[u8]) -> Option<Vec<u8>> {
        match lookup_segments(&view.segments, key) {
            Ok(entry) => entry.and_then(|e| e.value),
            Err(e) => {
                warn!(error = %e, "cannot read previous value, live counters may drift");
                self.mark_degraded();
                None
            }
        }
    }

    /// Adjusts the live key and byte counters for one mutation.
    fn account(&self, key: &[u8], previous: Option<&[u8]>, next: Option<&[u8]>) {
        let c = &self.counters;
        let key_len = key.len() as u64;
        if let Some(old) = previous {
            c.live_bytes.fetch_sub(key_len + old.len() as u64, Ordering::Relaxed);
            if next.is_none() {
                c.key_count.fetch_sub(1, Ordering::Relaxed);
            }
        } else if next.is_some() {
            c.key_count.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(new) = next {
            c.live_bytes.fetch_add(key_len + new.len() as u64, Ordering::Relaxed);
        }
    }

    /// Seals the active memtable and starts a new one backed by a new WAL
    /// file. Must be called with the write lock held.
    pub(crate) fn rotate(&self, w: &mut WriteState) -> Result<(), EngineError> {
        let number = self.next_file.fetch_add(1, Ordering::SeqCst);
        let wal = WalWriter::create(
            self.config.data_dir.join(log_file_name(number)),
            self.config.wal_sync,
        )?;
        if !self.config.wal_sync {
            w.wal.sync_to_disk()?;
        }
        w.wal = wal;

        self.update_view(|v| {
            v.active.seal();
            v.sealed.insert(
                0,
                SealedMemtable {
                    mem: Arc::clone(&v.active),
                    wal_number: v.active_wal,
                },
            );
            v.active = Arc::new(Memtable::new());
            v.active_wal = number;
        });
        debug!(wal = number, "rotated memtable");
        Ok(())
    }

    /// Seals the active memtable (if it holds anything) and writes every
    /// sealed memtable to a segment, then compacts if the segment count has
    /// reached the trigger.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unavailable`] outside `Serving`; I/O and segment errors
    /// that persisted through `max_retries` attempts.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.ensure_serving()?;
        self.flush_all()?;
        self.maybe_compact()?;
        Ok(())
    }

    pub(crate) fn flush_all(&self) -> Result<(), EngineError> {
        {
            let mut w = self.writer.lock();
            if !self.view().active.is_empty() {
                self.rotate(&mut w)?;
            }
        }
        while self.with_retries("flush", || self.flush_oldest_sealed())? {}
        Ok(())
    }

    pub(crate) fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            block_size: self.config.block_size,
            bloom_fpr: self.config.bloom_fpr,
        }
    }

    /// Writes the oldest sealed memtable to a segment and commits it.
    ///
    /// Returns `false` if there was nothing to flush.
    pub(crate) fn flush_oldest_sealed(&self) -> Result<bool, EngineError> {
        let mut manifest = self.manifest.lock();
        let view = self.view();
        let Some(sealed) = view.sealed.last().cloned() else {
            return Ok(false);
        };
        let started = Instant::now();

        let segment = if sealed.mem.is_empty() {
            None
        } else {
            let number = self.next_file.fetch_add(1, Ordering::SeqCst);
            let path = self.config.data_dir.join(segment_file_name(number));
            let written = SSTableWriter::write_from_memtable(&path, &sealed.mem, self.writer_options())
                .and_then(|_| Segment::open(&self.config.data_dir, number, false));
            match written {
                Ok(segment) => Some(Arc::new(segment)),
                Err(e) => {
                    // never committed; a leftover is also removed at next open
                    let _ = fs::remove_file(&path);
                    return Err(e.into());
                }
            }
        };

        let mut next = manifest.clone();
        if let Some(segment) = &segment {
            next.segments.push(segment.number);
            next.checkpoint_seq = next.checkpoint_seq.max(segment.reader.max_seq());
        }
        next.next_file_number = self.next_file.load(Ordering::SeqCst);
        if let Err(e) = next.save() {
            if let Some(segment) = &segment {
                segment.retire();
            }
            return Err(e);
        }
        *manifest = next;
        self.checkpoint.store(manifest.checkpoint_seq, Ordering::Release);

        self.update_view(|v| {
            v.sealed.retain(|s| !Arc::ptr_eq(&s.mem, &sealed.mem));
            if let Some(segment) = &segment {
                v.segments.push(Arc::clone(segment));
            }
        });
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.remove_logs_through(sealed.wal_number);

        info!(
            segment = segment.as_ref().map(|s| s.number),
            entries = sealed.mem.len(),
            checkpoint = manifest.checkpoint_seq,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed memtable"
        );
        Ok(true)
    }

    /// Deletes WAL files numbered `<= wal_number`; their records are all in
    /// committed segments now.
    fn remove_logs_through(&self, wal_number: u64) {
        let logs = match wal::list_logs(&self.config.data_dir) {
            Ok(logs) => logs,
            Err(e) => {
                warn!(error = %e, "cannot list WAL files");
                return;
            }
        };
        for (number, path) in logs.into_iter().filter(|(n, _)| *n <= wal_number) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(log = number, error = %e, "failed to remove flushed WAL file");
            }
        }
    }
}

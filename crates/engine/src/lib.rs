//! # Engine - ShoalKV Storage Engine
//!
//! The orchestrator that ties the [`memtable`], [`wal`] and [`sstable`]
//! crates together into a crash-consistent LSM-tree key-value store.
//!
//! ## Architecture
//!
//! ```text
//! put/delete
//!   |
//!   v
//! ┌───────────────────────────────────────────────────────┐
//! │                        ENGINE                         │
//! │                                                       │
//! │ write.rs → WAL append → active memtable insert        │
//! │              |                                        │
//! │              |  (memtable over limit?)                │
//! │              v                                        │
//! │           rotate: seal + new WAL + new memtable       │
//! │              |                                        │
//! │ worker.rs    v                                        │
//! │           flush oldest sealed → new segment           │
//! │              |                                        │
//! │              |  (segments >= trigger?)                │
//! │              v                                        │
//! │           compaction.rs → merged segments             │
//! │                                                       │
//! │ read.rs → active → sealed (newest first)              │
//! │           → segments (newest first), first match wins │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                 |
//! |----------------|---------------------------------------------------------|
//! | `lib.rs`       | `Engine`, `View`, `Segment`, lifecycle, stats, `Drop`   |
//! | [`recovery`]   | `Engine::open`: lock, manifest, segments, WAL replay    |
//! | `write`        | `put()`, `delete()`, memtable rotation, `flush()`       |
//! | `read`         | `get()`, `scan()`, [`ScanIter`]                         |
//! | `compaction`   | `compact()`: streaming merge, tombstone GC, commit      |
//! | `worker`       | background thread, transient-failure retries            |
//! | [`manifest`]   | durable segment list and checkpoint                     |
//!
//! ## Snapshots
//!
//! Readers never lock the memtables or segment list for the duration of a
//! read. They clone an `Arc<View>` under a short read lock; writers that
//! change the shape of the store (rotation, flush, compaction) build a new
//! `View` and swap the pointer. A retired segment file is removed when the
//! last view referencing it is dropped.
//!
//! ## Crash Safety
//!
//! Every write is appended to the WAL of the active memtable **before** it
//! becomes visible. A WAL file is deleted only after its memtable has been
//! written to a segment and the manifest checkpoint covers it. Segments and
//! the manifest are written to temp files and renamed into place.

mod compaction;
mod error;
pub mod manifest;
mod read;
pub mod recovery;
mod worker;
mod write;

use std::fmt;
use std::fs::{self, File};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fs2::FileExt;
use memtable::Memtable;
use parking_lot::{Mutex, RwLock};
use sstable::{segment_file_name, SSTableReader, SstError};
use tracing::{info, warn};
use wal::WalWriter;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind};
pub use manifest::Manifest;
pub use read::ScanIter;

use worker::Signal;

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = sstable::MAX_KEY_BYTES;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = sstable::MAX_VALUE_BYTES;

/// Lock file guarding the data directory against a second process.
pub const LOCK_FILENAME: &str = "LOCK";

/// Lifecycle of an engine instance.
///
/// ```text
/// Starting → Recovering → Serving → ShuttingDown → Stopped
/// ```
///
/// Only `Serving` accepts requests; every other state answers with
/// [`EngineError::Unavailable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Starting = 0,
    Recovering = 1,
    Serving = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Recovering,
            2 => Self::Serving,
            3 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Recovering => "recovering",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        })
    }
}

/// A live segment file shared between views.
///
/// Compaction marks its inputs as retired; the file itself is removed only
/// when the last `Arc<Segment>` goes away, so in-flight scans keep reading
/// a consistent file.
pub(crate) struct Segment {
    pub(crate) number: u64,
    pub(crate) reader: SSTableReader,
    retired: AtomicBool,
}

impl Segment {
    pub(crate) fn open(dir: &Path, number: u64, verify: bool) -> Result<Self, SstError> {
        let reader = SSTableReader::open(dir.join(segment_file_name(number)), verify)?;
        Ok(Self {
            number,
            reader,
            retired: AtomicBool::new(false),
        })
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(self.reader.path()) {
                warn!(segment = self.number, error = %e, "failed to remove retired segment");
            }
        }
    }
}

/// Owning handle that lets a segment iterator keep its segment alive.
#[derive(Clone)]
pub(crate) struct SegmentRef(pub(crate) Arc<Segment>);

impl Deref for SegmentRef {
    type Target = SSTableReader;

    fn deref(&self) -> &SSTableReader {
        &self.0.reader
    }
}

/// A sealed memtable waiting for flush, with the WAL file that backs it.
#[derive(Clone)]
pub(crate) struct SealedMemtable {
    pub(crate) mem: Arc<Memtable>,
    pub(crate) wal_number: u64,
}

/// Immutable snapshot of everything a read has to consult.
#[derive(Clone)]
pub(crate) struct View {
    pub(crate) active: Arc<Memtable>,
    pub(crate) active_wal: u64,
    /// Newest first.
    pub(crate) sealed: Vec<SealedMemtable>,
    /// Oldest first, in manifest order.
    pub(crate) segments: Vec<Arc<Segment>>,
}

/// State guarded by the write lock.
pub(crate) struct WriteState {
    pub(crate) wal: WalWriter,
    /// Last sequence number handed out.
    pub(crate) seq: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) key_count: AtomicU64,
    pub(crate) live_bytes: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) compactions: AtomicU64,
    pub(crate) background_errors: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,
    /// A corrupt segment was quarantined during recovery.
    pub degraded: bool,
    /// Number of live (non-deleted) keys.
    pub key_count: u64,
    /// Sum of key and value bytes over all live keys.
    pub live_bytes: u64,
    pub last_seq: u64,
    pub checkpoint_seq: u64,
    pub memtable_bytes: usize,
    pub sealed_memtables: usize,
    pub segment_count: usize,
    /// Total size of the live segment files.
    pub segment_bytes: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub background_errors: u64,
    pub uptime: Duration,
}

/// The storage engine.
///
/// Opened with [`Engine::open`] and shared as `Arc<Engine>`; every method
/// takes `&self`.
///
/// # Write Path
///
/// 1. Read the key's previous value from the segments, outside any lock.
/// 2. Take the write lock and assign the next sequence number. If a flush
///    or compaction swapped the segments meanwhile, go back to step 1.
/// 3. Append the record to the active WAL file.
/// 4. Apply it to the active memtable.
/// 5. If the memtable is over `memtable_size_limit`, seal it, start a new
///    WAL file and memtable, and wake the background worker.
///
/// # Read Path
///
/// Active memtable, then sealed memtables newest first, then segments
/// newest first. The first entry found wins; a tombstone means not found.
pub struct Engine {
    pub(crate) config: EngineConfig,
    state: AtomicU8,
    degraded: AtomicBool,
    pub(crate) writer: Mutex<WriteState>,
    view: RwLock<Arc<View>>,
    /// Doubles as the maintenance lock: flush and compaction hold it for
    /// their whole run.
    pub(crate) manifest: Mutex<Manifest>,
    /// Next WAL or segment file number.
    pub(crate) next_file: AtomicU64,
    /// Copy of the committed manifest checkpoint, readable without waiting
    /// for maintenance.
    pub(crate) checkpoint: AtomicU64,
    pub(crate) counters: Counters,
    pub(crate) signal: Arc<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lock_file: Mutex<Option<File>>,
    started: Instant,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.view();
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("state", &self.state())
            .field("degraded", &self.is_degraded())
            .field("memtable_size", &view.active.approx_size())
            .field("memtable_entries", &view.active.len())
            .field("sealed_memtables", &view.sealed.len())
            .field("segments", &view.segments.len())
            .finish()
    }
}

impl Engine {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `true` if recovery had to quarantine a corrupt segment or stop at a
    /// corrupt WAL record, or a write could not read a damaged segment.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn ensure_serving(&self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Serving => Ok(()),
            other => Err(EngineError::Unavailable(other)),
        }
    }

    /// Snapshot of the current view.
    pub(crate) fn view(&self) -> Arc<View> {
        Arc::clone(&self.view.read())
    }

    /// Publishes a new view built from the current one.
    pub(crate) fn update_view<F: FnOnce(&mut View)>(&self, f: F) {
        let mut guard = self.view.write();
        let mut next = View::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Liveness probe: the engine is serving and its manifest still loads.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unavailable`] outside `Serving`, or the error raised
    /// while reading the manifest.
    pub fn health(&self) -> Result<(), EngineError> {
        self.ensure_serving()?;
        Manifest::load(&self.config.data_dir)?;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let view = self.view();
        let last_seq = self.writer.lock().seq;
        let checkpoint_seq = self.checkpoint.load(Ordering::Acquire);
        EngineStats {
            state: self.state(),
            degraded: self.is_degraded(),
            key_count: self.counters.key_count.load(Ordering::Relaxed),
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
            last_seq,
            checkpoint_seq,
            memtable_bytes: view.active.approx_size()
                + view.sealed.iter().map(|s| s.mem.approx_size()).sum::<usize>(),
            sealed_memtables: view.sealed.len(),
            segment_count: view.segments.len(),
            segment_bytes: view.segments.iter().map(|s| s.reader.file_size()).sum(),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
            background_errors: self.counters.background_errors.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }

    /// Stops the background worker, flushes every memtable and releases the
    /// directory lock.
    ///
    /// Idempotent; after it returns every request fails with
    /// [`EngineError::Unavailable`].
    pub fn shutdown(&self) -> Result<(), EngineError> {
        let previous = self.state.swap(EngineState::ShuttingDown as u8, Ordering::AcqRel);
        if EngineState::from_u8(previous) == EngineState::Stopped {
            self.set_state(EngineState::Stopped);
            return Ok(());
        }
        info!(dir = %self.config.data_dir.display(), "shutting down");

        self.stop_worker();
        let result = self.flush_all();
        if let Err(e) = &result {
            warn!(error = %e, "final flush failed, data remains in the WAL");
        }

        if let Some(file) = self.lock_file.lock().take() {
            let _ = file.unlock();
        }
        self.set_state(EngineState::Stopped);
        result
    }

    fn stop_worker(&self) {
        self.signal.stop();
        if let Some(handle) = self.worker.lock().take() {
            // The worker may hold the last strong reference and end up
            // running this from its own thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state() != EngineState::Stopped {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests;

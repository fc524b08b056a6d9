//! Cold-start path: directory lock, manifest, segments and WAL replay.
//!
//! Recovery order:
//!
//! 1. Validate the configuration and take the `LOCK` file.
//! 2. Remove `*.tmp` leftovers from interrupted segment or manifest writes.
//! 3. Load the manifest and open every listed segment. A segment that fails
//!    its checks is renamed to `*.corrupt`, dropped from the manifest and the
//!    engine comes up degraded.
//! 4. Delete segment files the manifest does not know about (written but
//!    never committed; their records are still in the WAL).
//! 5. Replay every surviving WAL file, oldest first, into the active
//!    memtable. Only records newer than the checkpoint are applied, so a
//!    second replay of the same files changes nothing.
//! 6. Start a fresh WAL file, persist the manifest, compute the running
//!    counters and start the background worker.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use memtable::Memtable;
use parking_lot::{Mutex, RwLock};
use sstable::{parse_segment_number, SstError};
use tracing::{debug, error, info, warn};
use wal::{log_file_name, ReplayStats, WalError, WalReader, WalWriter};

use crate::manifest::Manifest;
use crate::worker::{self, Signal};
use crate::{
    read, Counters, Engine, EngineConfig, EngineError, EngineState, Segment, View, WriteState,
    LOCK_FILENAME,
};

/// Replays the WAL file at `path` into `mem`, skipping records with
/// `seq <= after_seq`.
///
/// Records before a corrupt frame have already been applied when the error
/// is returned.
///
/// # Errors
///
/// Propagates any I/O or corruption error from [`WalReader::replay`].
pub fn replay_wal_into(path: &Path, mem: &Memtable, after_seq: u64) -> Result<ReplayStats, WalError> {
    let mut reader = WalReader::open(path)?;
    reader.replay(|record| {
        if record.seq <= after_seq {
            return;
        }
        match record.value {
            Some(value) => mem.put(record.key, value, record.seq),
            None => mem.delete(record.key, record.seq),
        };
    })
}

impl Engine {
    /// Opens (or creates) the store in `config.data_dir` and recovers it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] if `config` does not validate.
    /// - [`EngineError::Locked`] if another engine holds the directory.
    /// - I/O, manifest or WAL errors that make recovery impossible.
    pub fn open(config: EngineConfig) -> Result<Arc<Engine>, EngineError> {
        config.validate()?;
        let started = Instant::now();
        let dir = config.data_dir.clone();
        debug!(dir = %dir.display(), state = %EngineState::Starting, "opening engine");

        fs::create_dir_all(&dir)?;
        let lock_file = acquire_lock(&dir)?;

        debug!(state = %EngineState::Recovering, "recovering");
        remove_temp_files(&dir)?;
        let mut manifest = Manifest::load_or_create(&dir)?;

        let mut degraded = false;
        let mut quarantined = false;
        let loaded_checkpoint = manifest.checkpoint_seq;
        let logs = wal::list_logs(&dir)?;

        // Without verification a damaged block only shows up when the live
        // totals read it; quarantine the segment and recover again.
        let (view, segment_max_seq, key_count, live_bytes) = loop {
            let segments = open_segments(&dir, &mut manifest, &config, &mut quarantined)?;
            let segment_max_seq = segments.iter().map(|s| s.reader.max_seq()).max().unwrap_or(0);
            // Without the quarantined data the checkpoint overstates what the
            // segments hold; replay whatever the logs still have above the
            // surviving segments.
            let replay_after = if quarantined {
                segment_max_seq
            } else {
                manifest.checkpoint_seq
            };
            let mem = replay_logs(&logs, replay_after, &mut degraded)?;

            let view = View {
                active: Arc::new(mem),
                active_wal: 0,
                sealed: Vec::new(),
                segments,
            };
            match read::live_totals(&view) {
                Ok((keys, bytes)) => break (view, segment_max_seq, keys, bytes),
                Err(EngineError::Sst(e)) if e.is_corruption() => {
                    let number = corrupt_segment_number(&e, &view)
                        .ok_or(EngineError::Sst(e))?;
                    error!(segment = number, "quarantining segment with a corrupt block");
                    drop(view);
                    quarantine(&dir, number)?;
                    manifest.remove_segment(number);
                    quarantined = true;
                }
                Err(e) => return Err(e),
            }
        };
        remove_orphan_segments(&dir, &manifest)?;

        let seq = loaded_checkpoint
            .max(segment_max_seq)
            .max(view.active.max_seq());
        if quarantined {
            degraded = true;
            // Records between the surviving segments and the old checkpoint
            // now live only in the WAL; the next open must replay them too.
            manifest.checkpoint_seq = manifest.checkpoint_seq.min(segment_max_seq);
        }
        let max_log = logs.last().map_or(0, |(n, _)| *n);
        let max_segment = manifest.segments.iter().copied().max().unwrap_or(0);
        manifest.next_file_number = manifest
            .next_file_number
            .max(max_log + 1)
            .max(max_segment + 1);

        let wal_number = manifest.allocate_file_number();
        let wal = WalWriter::create(dir.join(log_file_name(wal_number)), config.wal_sync)?;
        manifest.save()?;

        if view.active.is_empty() {
            for (_, path) in &logs {
                fs::remove_file(path)?;
            }
        }
        let view = View {
            active_wal: wal_number,
            ..view
        };

        let counters = Counters::default();
        counters.key_count.store(key_count, Ordering::Relaxed);
        counters.live_bytes.store(live_bytes, Ordering::Relaxed);

        let segment_count = view.segments.len();
        let recovered_entries = view.active.len();
        let engine = Arc::new(Engine {
            config,
            state: AtomicU8::new(EngineState::Recovering as u8),
            degraded: AtomicBool::new(degraded),
            writer: Mutex::new(WriteState { wal, seq }),
            view: RwLock::new(Arc::new(view)),
            next_file: AtomicU64::new(manifest.next_file_number),
            checkpoint: AtomicU64::new(manifest.checkpoint_seq),
            manifest: Mutex::new(manifest),
            counters,
            signal: Arc::new(Signal::default()),
            worker: Mutex::new(None),
            lock_file: Mutex::new(Some(lock_file)),
            started,
        });

        if engine.config.background_work {
            let handle = worker::spawn(
                Arc::downgrade(&engine),
                Arc::clone(&engine.signal),
                engine.config.background_interval,
            )?;
            *engine.worker.lock() = Some(handle);
        }

        engine.set_state(EngineState::Serving);
        info!(
            dir = %dir.display(),
            seq,
            segments = segment_count,
            recovered_entries,
            key_count,
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine ready"
        );
        Ok(engine)
    }
}

/// Opens every segment listed in `manifest`. Unreadable ones are moved
/// aside and dropped from the manifest.
fn open_segments(
    dir: &Path,
    manifest: &mut Manifest,
    config: &EngineConfig,
    quarantined: &mut bool,
) -> Result<Vec<Arc<Segment>>, EngineError> {
    let mut segments = Vec::with_capacity(manifest.segments.len());
    for number in manifest.segments.clone() {
        match Segment::open(dir, number, config.verify_segments_on_open) {
            Ok(segment) => segments.push(Arc::new(segment)),
            Err(e) if e.is_corruption() || is_not_found(&e) => {
                error!(segment = number, error = %e, "quarantining unreadable segment");
                quarantine(dir, number)?;
                manifest.remove_segment(number);
                *quarantined = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(segments)
}

/// Replays `logs` oldest first into a fresh memtable.
fn replay_logs(
    logs: &[(u64, PathBuf)],
    after_seq: u64,
    degraded: &mut bool,
) -> Result<Memtable, EngineError> {
    let mem = Memtable::new();
    for (i, (number, path)) in logs.iter().enumerate() {
        match replay_wal_into(path, &mem, after_seq) {
            Ok(stats) => {
                if stats.truncated_tail {
                    warn!(log = number, "ignored partial record at end of WAL");
                }
                debug!(log = number, records = stats.records, "replayed WAL");
            }
            // a torn final write can only damage the newest log
            Err(e @ WalError::Corrupt { .. }) if i + 1 == logs.len() => {
                error!(log = number, error = %e, "stopping replay at corrupt WAL record");
                *degraded = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(mem)
}

/// Number of the segment in `view` that `e` was raised for.
fn corrupt_segment_number(e: &SstError, view: &View) -> Option<u64> {
    let SstError::Corrupt { path, .. } = e else {
        return None;
    };
    view.segments
        .iter()
        .find(|s| s.reader.path() == path.as_path())
        .map(|s| s.number)
}

fn acquire_lock(dir: &Path) -> Result<File, EngineError> {
    let lock_path = dir.join(LOCK_FILENAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(EngineError::Locked(dir.to_path_buf()));
    }
    Ok(file)
}

/// Removes leftovers of interrupted writes (`*.sst.tmp`, `MANIFEST.tmp`).
fn remove_temp_files(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "tmp") {
            debug!(file = %path.display(), "removing temp file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Deletes segment files that are not listed in `manifest`.
fn remove_orphan_segments(dir: &Path, manifest: &Manifest) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(number) = entry.file_name().to_str().and_then(parse_segment_number) else {
            continue;
        };
        if !manifest.segments.contains(&number) {
            warn!(segment = number, "removing segment missing from the manifest");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Moves a damaged segment out of the way as `NNNNNN.sst.corrupt`.
fn quarantine(dir: &Path, number: u64) -> io::Result<()> {
    let name = sstable::segment_file_name(number);
    match fs::rename(dir.join(&name), dir.join(format!("{}.corrupt", name))) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn is_not_found(e: &SstError) -> bool {
    matches!(e, SstError::Io(io) if io.kind() == io::ErrorKind::NotFound)
}

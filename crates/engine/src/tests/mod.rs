use crate::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;

mod compaction_tests;
mod manifest_tests;
mod write_tests;

/// Deterministic settings: no worker thread, no fsync, tiny blocks, and
/// no automatic compaction unless a test asks for it.
pub(super) fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        memtable_size_limit: 1024 * 1024,
        wal_sync: false,
        block_size: 128,
        compaction_trigger: 0,
        background_work: false,
        retry_backoff: std::time::Duration::from_millis(1),
        ..EngineConfig::new(dir)
    }
}

pub(super) fn open(dir: &Path) -> Result<Arc<Engine>, EngineError> {
    Engine::open(test_config(dir))
}

/// Opens with a memtable limit small enough that every few writes rotate.
pub(super) fn open_small(dir: &Path, memtable_size_limit: usize) -> Result<Arc<Engine>, EngineError> {
    Engine::open(EngineConfig {
        memtable_size_limit,
        ..test_config(dir)
    })
}

pub(super) fn key(i: u64) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

/// Number of files in `dir` whose name ends with `suffix`.
pub(super) fn count_files(dir: &Path, suffix: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .count()
}

/// Collects a whole scan, panicking on read errors.
pub(super) fn scan_all<R: std::ops::RangeBounds<Vec<u8>>>(
    engine: &Engine,
    range: R,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine
        .scan(range)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

impl Engine {
    /// Drops the engine the way a killed process would: no final flush, no
    /// manifest update. Whatever reached the WAL file is all that survives.
    pub(super) fn simulate_crash(self: Arc<Self>) {
        self.signal.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.set_state(EngineState::Stopped);
        self.lock_file.lock().take();
    }
}

use super::*;
use anyhow::Result;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::tempdir;

// --------------------- Basic writes ---------------------

#[test]
fn sequence_numbers_strictly_increase() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let s1 = engine.put(b"a".to_vec(), b"1".to_vec())?;
    let s2 = engine.put(b"b".to_vec(), b"2".to_vec())?;
    let s3 = engine.delete(b"a".to_vec())?;
    let s4 = engine.delete(b"never-written".to_vec())?;
    assert_eq!((s1, s2, s3, s4), (1, 2, 3, 4));
    assert_eq!(engine.stats().last_seq, 4);
    Ok(())
}

#[test]
fn overwrite_returns_latest_value() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"k".to_vec(), b"v1".to_vec())?;
    engine.put(b"k".to_vec(), b"v2".to_vec())?;
    assert_eq!(engine.get(b"k")?, Some(b"v2".to_vec()));
    Ok(())
}

#[test]
fn empty_value_is_a_value_not_a_delete() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"k".to_vec(), Vec::new())?;
    assert_eq!(engine.get(b"k")?, Some(Vec::new()));
    engine.flush()?;
    assert_eq!(engine.get(b"k")?, Some(Vec::new()));
    Ok(())
}

// --------------------- Validation ---------------------

#[test]
fn invalid_keys_and_values_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let err = engine.put(Vec::new(), b"v".to_vec()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = engine.put(vec![b'k'; MAX_KEY_SIZE + 1], b"v".to_vec()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = engine.put(b"k".to_vec(), vec![0; MAX_VALUE_SIZE + 1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = engine.delete(Vec::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    // rejected writes consume no sequence numbers
    assert_eq!(engine.put(b"k".to_vec(), b"v".to_vec())?, 1);
    Ok(())
}

#[test]
fn largest_allowed_key_is_accepted() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let key = vec![b'k'; MAX_KEY_SIZE];
    engine.put(key.clone(), b"v".to_vec())?;
    engine.flush()?;
    assert_eq!(engine.get(&key)?, Some(b"v".to_vec()));
    Ok(())
}

// --------------------- Rotation & flush ---------------------

#[test]
fn full_memtable_is_flushed_to_segments() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_small(dir.path(), 256)?;

    for i in 0..100 {
        engine.put(key(i), vec![b'v'; 20])?;
    }

    let stats = engine.stats();
    assert!(stats.segment_count > 1, "{:?}", stats);
    assert_eq!(stats.sealed_memtables, 0);
    assert_eq!(stats.flushes, stats.segment_count as u64);
    assert_eq!(count_files(dir.path(), ".sst"), stats.segment_count);
    for i in 0..100 {
        assert_eq!(engine.get(&key(i))?, Some(vec![b'v'; 20]));
    }
    Ok(())
}

#[test]
fn flush_moves_memtable_to_segment_and_drops_its_wal() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"a".to_vec(), b"1".to_vec())?;
    engine.put(b"b".to_vec(), b"2".to_vec())?;
    assert_eq!(count_files(dir.path(), ".sst"), 0);

    engine.flush()?;
    let stats = engine.stats();
    assert_eq!(stats.segment_count, 1);
    assert_eq!(stats.memtable_bytes, 0);
    assert_eq!(stats.checkpoint_seq, 2);
    assert_eq!(count_files(dir.path(), ".sst"), 1);
    // only the fresh WAL of the new active memtable is left
    assert_eq!(count_files(dir.path(), ".log"), 1);

    assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn flush_of_empty_memtable_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.flush()?;
    engine.flush()?;
    assert_eq!(engine.stats().segment_count, 0);
    assert_eq!(engine.stats().flushes, 0);
    Ok(())
}

#[test]
fn failed_flush_leaves_manifest_and_data_in_place() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put(b"a".to_vec(), b"1".to_vec())?;
    let before = Manifest::load(dir.path())?;

    // every file number the flush and its retries can pick is blocked by a
    // directory where the segment's temp file would go
    let first = engine.next_file.load(Ordering::SeqCst);
    let blockers: Vec<PathBuf> = (first..first + 16)
        .map(|n| dir.path().join(format!("{}.tmp", sstable::segment_file_name(n))))
        .collect();
    for path in &blockers {
        fs::create_dir(path)?;
    }

    let err = engine.flush().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(Manifest::load(dir.path())?, before);
    let stats = engine.stats();
    assert_eq!(stats.segment_count, 0);
    assert_eq!(stats.sealed_memtables, 1);
    assert_eq!(stats.checkpoint_seq, 0);
    assert_eq!(count_files(dir.path(), ".sst"), 0);
    // the sealed memtable's WAL and the new active one
    assert_eq!(count_files(dir.path(), ".log"), 2);
    assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));

    for path in &blockers {
        fs::remove_dir(path)?;
    }
    engine.flush()?;
    assert_eq!(engine.stats().segment_count, 1);
    assert_eq!(engine.stats().checkpoint_seq, 1);
    assert_eq!(count_files(dir.path(), ".log"), 1);
    assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn damaged_segment_does_not_block_overwrites() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put(b"a".to_vec(), b"1".to_vec())?;
    engine.flush()?;

    let number = Manifest::load(dir.path())?.segments[0];
    let path = dir.path().join(sstable::segment_file_name(number));
    let mut data = fs::read(&path)?;
    data[3] ^= 0xFF;
    fs::write(&path, &data)?;

    // the old value cannot be read, the new one is still accepted
    engine.put(b"a".to_vec(), b"2".to_vec())?;
    assert!(engine.is_degraded());
    assert_eq!(engine.get(b"a")?, Some(b"2".to_vec()));
    Ok(())
}

// --------------------- Retries ---------------------

#[test]
fn transient_failures_are_retried_with_backoff() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(EngineConfig {
        max_retries: 3,
        retry_backoff: Duration::from_millis(5),
        ..test_config(dir.path())
    })?;

    let mut calls = 0;
    let started = Instant::now();
    let result: Result<(), EngineError> = engine.with_retries("test", || {
        calls += 1;
        Err(io::Error::new(io::ErrorKind::Other, "disk hiccup").into())
    });
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Io);
    assert_eq!(calls, 4);
    // 5 + 10 + 20 ms between the attempts
    assert!(started.elapsed() >= Duration::from_millis(35));

    let mut calls = 0;
    let value = engine.with_retries("test", || {
        calls += 1;
        if calls < 3 {
            Err(io::Error::new(io::ErrorKind::Other, "disk hiccup").into())
        } else {
            Ok(calls)
        }
    })?;
    assert_eq!(value, 3);
    Ok(())
}

#[test]
fn permanent_failures_are_not_retried() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let mut calls = 0;
    let result: Result<(), EngineError> = engine.with_retries("test", || {
        calls += 1;
        Err(EngineError::Manifest("unparseable".into()))
    });
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
    assert_eq!(calls, 1);
    Ok(())
}

// --------------------- Counters ---------------------

#[test]
fn counters_track_live_keys_and_bytes() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"a".to_vec(), b"1".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (1, 2));

    engine.put(b"a".to_vec(), b"22".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (1, 3));

    engine.put(b"bb".to_vec(), b"x".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (2, 6));

    engine.delete(b"a".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (1, 3));

    engine.delete(b"missing".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (1, 3));
    Ok(())
}

#[test]
fn counters_see_through_flushed_data() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"a".to_vec(), b"1".to_vec())?;
    engine.flush()?;
    // previous value comes from the segment
    engine.put(b"a".to_vec(), b"123".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (1, 4));
    engine.delete(b"a".to_vec())?;
    assert_eq!((engine.stats().key_count, engine.stats().live_bytes), (0, 0));
    Ok(())
}

// --------------------- Lifecycle ---------------------

#[test]
fn requests_fail_after_shutdown() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put(b"a".to_vec(), b"1".to_vec())?;

    engine.shutdown()?;
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.put(b"b".to_vec(), b"2".to_vec()).unwrap_err().kind(), ErrorKind::Unavailable);
    assert_eq!(engine.get(b"a").unwrap_err().kind(), ErrorKind::Unavailable);
    assert!(engine.scan(..).is_err());
    assert!(engine.health().is_err());

    // shutting down twice is fine
    engine.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_flushes_everything() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put(b"a".to_vec(), b"1".to_vec())?;
    engine.shutdown()?;

    assert_eq!(count_files(dir.path(), ".sst"), 1);
    let manifest = Manifest::load(dir.path())?;
    assert_eq!(manifest.checkpoint_seq, 1);
    assert_eq!(manifest.segments.len(), 1);
    Ok(())
}

#[test]
fn sequence_continues_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        engine.put(b"a".to_vec(), b"1".to_vec())?;
        engine.put(b"b".to_vec(), b"2".to_vec())?;
        engine.delete(b"a".to_vec())?;
    }

    let engine = open(dir.path())?;
    assert_eq!(engine.put(b"c".to_vec(), b"3".to_vec())?, 4);
    Ok(())
}

#[test]
fn health_reports_serving_engine() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.health()?;

    std::fs::remove_file(dir.path().join(manifest::MANIFEST_FILENAME))?;
    assert!(engine.health().is_err());
    Ok(())
}

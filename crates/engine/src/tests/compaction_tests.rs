use super::*;
use anyhow::Result;
use sstable::SSTableReader;
use std::path::PathBuf;
use tempfile::tempdir;

fn segment_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(Manifest::load(dir)?
        .segments
        .iter()
        .map(|&n| dir.join(sstable::segment_file_name(n)))
        .collect())
}

/// Every record stored for `key` across all live segment files.
fn records_for(dir: &Path, key: &[u8]) -> Result<usize> {
    let mut found = 0;
    for path in segment_paths(dir)? {
        let reader = SSTableReader::open(&path, true)?;
        for item in reader.iter() {
            if item?.0 == key {
                found += 1;
            }
        }
    }
    Ok(found)
}

// --------------------- Tombstone removal ---------------------

#[test]
fn deleted_key_leaves_no_record_after_flush_and_compaction() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    assert_eq!(engine.put(b"a".to_vec(), b"1".to_vec())?, 1);
    assert_eq!(engine.put(b"a".to_vec(), b"2".to_vec())?, 2);
    assert_eq!(engine.delete(b"a".to_vec())?, 3);
    assert_eq!(engine.get(b"a")?, None);

    engine.flush()?;
    assert_eq!(records_for(dir.path(), b"a")?, 1, "tombstone is flushed");

    engine.compact()?;
    assert_eq!(engine.get(b"a")?, None);
    assert_eq!(records_for(dir.path(), b"a")?, 0);
    assert_eq!(engine.stats().segment_count, 0);
    assert_eq!(count_files(dir.path(), ".sst"), 0);
    Ok(())
}

#[test]
fn tombstones_are_dropped_but_live_keys_kept() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"a".to_vec(), b"1".to_vec())?;
    engine.put(b"b".to_vec(), b"2".to_vec())?;
    engine.flush()?;
    engine.delete(b"a".to_vec())?;
    engine.flush()?;
    engine.compact()?;

    assert_eq!(engine.stats().segment_count, 1);
    assert_eq!(records_for(dir.path(), b"a")?, 0);
    assert_eq!(records_for(dir.path(), b"b")?, 1);
    assert_eq!(engine.get(b"b")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn memtable_tombstone_still_hides_compacted_value() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"k".to_vec(), b"v".to_vec())?;
    engine.flush()?;
    engine.delete(b"k".to_vec())?;
    engine.compact()?;

    assert_eq!(engine.get(b"k")?, None);
    assert!(scan_all(&engine, ..).is_empty());
    Ok(())
}

// --------------------- Merge results ---------------------

#[test]
fn compaction_keeps_newest_values() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    for round in 0..3u64 {
        for i in 0..30 {
            engine.put(key(i * (round + 1)), format!("r{}", round).into_bytes())?;
        }
        engine.flush()?;
    }
    let before = scan_all(&engine, ..);
    assert_eq!(engine.stats().segment_count, 3);

    engine.compact()?;
    assert_eq!(engine.stats().segment_count, 1);
    assert_eq!(engine.stats().compactions, 1);
    assert_eq!(scan_all(&engine, ..), before);
    assert_eq!(engine.get(&key(0))?, Some(b"r2".to_vec()));
    assert_eq!(engine.get(&key(29))?, Some(b"r0".to_vec()));
    assert_eq!(count_files(dir.path(), ".sst"), 1);
    Ok(())
}

#[test]
fn output_is_split_at_target_size() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(EngineConfig {
        target_segment_bytes: 1024,
        ..test_config(dir.path())
    })?;

    for i in 0..100 {
        engine.put(key(i), vec![b'x'; 40])?;
    }
    engine.flush()?;
    for i in 100..200 {
        engine.put(key(i), vec![b'y'; 40])?;
    }
    engine.flush()?;

    engine.compact()?;
    let segments = segment_paths(dir.path())?;
    assert!(segments.len() > 2, "expected a split, got {}", segments.len());

    // outputs cover disjoint, ascending key ranges
    let readers = segments
        .iter()
        .map(|p| SSTableReader::open(p, true))
        .collect::<Result<Vec<_>, _>>()?;
    for pair in readers.windows(2) {
        assert!(pair[0].last_key() < pair[1].first_key());
    }
    assert_eq!(scan_all(&engine, ..).len(), 200);
    Ok(())
}

#[test]
fn compaction_takes_at_most_max_inputs() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(EngineConfig {
        max_compaction_inputs: 2,
        ..test_config(dir.path())
    })?;

    for i in 0..4 {
        engine.put(key(i), b"v".to_vec())?;
        engine.flush()?;
    }
    let before = Manifest::load(dir.path())?.segments;
    assert_eq!(before.len(), 4);

    engine.compact()?;
    let after = Manifest::load(dir.path())?.segments;
    assert_eq!(after.len(), 3);
    // the two newest segments keep their place behind the output
    assert_eq!(&after[1..], &before[2..]);
    for i in 0..4 {
        assert_eq!(engine.get(&key(i))?, Some(b"v".to_vec()));
    }
    Ok(())
}

#[test]
fn trigger_compacts_after_flush() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(EngineConfig {
        compaction_trigger: 3,
        ..test_config(dir.path())
    })?;

    for i in 0..2 {
        engine.put(key(i), b"v".to_vec())?;
        engine.flush()?;
    }
    assert_eq!(engine.stats().segment_count, 2);

    engine.put(key(2), b"v".to_vec())?;
    engine.flush()?;
    let stats = engine.stats();
    assert_eq!(stats.compactions, 1);
    assert_eq!(stats.segment_count, 1);
    Ok(())
}

#[test]
fn compacted_store_recovers() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        for i in 0..40 {
            engine.put(key(i), b"v".to_vec())?;
            if i % 10 == 9 {
                engine.flush()?;
            }
        }
        engine.delete(key(0))?;
        engine.flush()?;
        engine.compact()?;
        engine.shutdown()?;
    }

    let engine = open(dir.path())?;
    assert!(!engine.is_degraded());
    assert_eq!(engine.get(&key(0))?, None);
    assert_eq!(engine.get(&key(39))?, Some(b"v".to_vec()));
    assert_eq!(engine.stats().key_count, 39);
    Ok(())
}

#[test]
fn failed_compaction_leaves_inputs_and_manifest_untouched() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put(b"a".to_vec(), b"1".to_vec())?;
    engine.flush()?;
    engine.put(b"b".to_vec(), b"2".to_vec())?;
    engine.flush()?;

    let before = Manifest::load(dir.path())?;
    let inputs = segment_paths(dir.path())?;
    let mut data = fs::read(&inputs[1])?;
    data[3] ^= 0xFF;
    fs::write(&inputs[1], &data)?;

    let err = engine.compact().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptSegment);
    assert_eq!(Manifest::load(dir.path())?, before);
    assert!(inputs.iter().all(|p| p.exists()));
    assert_eq!(count_files(dir.path(), ".sst"), 2);
    assert_eq!(count_files(dir.path(), ".tmp"), 0);
    let stats = engine.stats();
    assert_eq!(stats.segment_count, 2);
    assert_eq!(stats.compactions, 0);
    assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn compacting_nothing_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.compact()?;
    assert_eq!(engine.stats().compactions, 0);
    Ok(())
}

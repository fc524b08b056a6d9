use super::*;
use anyhow::Result;
use std::fs;
use std::ops::Bound;
use std::sync::Arc;
use tempfile::tempdir;

fn keys(iter: impl Iterator<Item = EntryResult>) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for item in iter {
        out.push(item?.0);
    }
    Ok(out)
}

fn k(i: u64) -> Vec<u8> {
    format!("key{:04}", i).into_bytes()
}

// -------------------- Basic open & get --------------------

#[test]
fn open_and_get_entries() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("sample.sst"), &sample_memtable(), WriterOptions::default())?;

    let a = reader.get(b"a")?.expect("a must exist");
    assert_eq!((a.seq, a.value), (1, Some(b"apple".to_vec())));

    let c = reader.get(b"c")?.expect("c must exist");
    assert_eq!(c.value, Some(Vec::new()));

    let d = reader.get(b"d")?.expect("tombstone must be stored");
    assert_eq!(d.seq, 4);
    assert!(d.is_tombstone());

    assert!(reader.get(b"nope")?.is_none());
    assert!(reader.get(b"")?.is_none());
    assert!(reader.get(b"zzz")?.is_none());

    assert_eq!(reader.entry_count(), 4);
    assert_eq!((reader.min_seq(), reader.max_seq()), (1, 4));
    assert_eq!(reader.first_key(), b"a");
    assert_eq!(reader.last_key(), b"d");
    Ok(())
}

#[test]
fn every_key_found_across_many_blocks() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("many.sst"), &numbered_memtable(500), SMALL_BLOCKS)?;
    assert!(reader.block_count() > 50);

    for i in 0..500u64 {
        let entry = reader.get(&k(i))?.unwrap_or_else(|| panic!("key{:04} missing", i));
        assert_eq!(entry.seq, i + 1);
        assert_eq!(entry.value, Some(i.to_string().into_bytes()));
    }
    Ok(())
}

#[test]
fn missing_keys_between_blocks_are_absent() -> Result<()> {
    let dir = tempdir()?;
    let mem = memtable_of(&[(b"b", Some(b"1"), 1), (b"d", Some(b"2"), 2), (b"f", Some(b"3"), 3)]);
    let reader = write_and_open(&dir.path().join("gaps.sst"), &mem, WriterOptions { block_size: 1, bloom_fpr: 0.01 })?;
    assert_eq!(reader.block_count(), 3);

    for missing in [b"a", b"c", b"e", b"g"] {
        assert!(reader.get(missing)?.is_none());
    }
    Ok(())
}

#[test]
fn large_value_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let big = vec![b'x'; 500_000];
    let mem = memtable_of(&[(b"big", Some(big.as_slice()), 1), (b"small", Some(b"s"), 2)]);
    let reader = write_and_open(&dir.path().join("big.sst"), &mem, WriterOptions::default())?;

    assert_eq!(reader.get(b"big")?.and_then(|e| e.value).map(|v| v.len()), Some(500_000));
    assert_eq!(reader.get(b"small")?.and_then(|e| e.value), Some(b"s".to_vec()));
    Ok(())
}

#[test]
fn bloom_filter_rejects_most_missing_keys() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("bloom.sst"), &numbered_memtable(1_000), WriterOptions::default())?;

    // Missing keys that fall inside the index range only return early
    // through the bloom filter; a false positive still reads a block and
    // comes back empty.
    for i in 0..1_000u64 {
        let key = format!("key{:04}x", i).into_bytes();
        assert!(reader.get(&key)?.is_none());
    }
    Ok(())
}

// -------------------- Iteration --------------------

#[test]
fn iter_yields_everything_in_order() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("iter.sst"), &numbered_memtable(300), SMALL_BLOCKS)?;

    let all = keys(reader.iter())?;
    assert_eq!(all.len(), 300);
    assert_eq!(all, (0..300).map(k).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn iter_includes_tombstones() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("t.sst"), &sample_memtable(), WriterOptions::default())?;
    let entries: Vec<_> = reader.iter().collect::<Result<_, _>>()?;
    assert_eq!(entries.len(), 4);
    assert!(entries[3].1.is_tombstone());
    Ok(())
}

#[test]
fn iter_range_respects_bounds() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("range.sst"), &numbered_memtable(100), SMALL_BLOCKS)?;

    let r = keys(reader.iter_range(Bound::Included(k(10)), Bound::Excluded(k(20))))?;
    assert_eq!(r, (10..20).map(k).collect::<Vec<_>>());

    let r = keys(reader.iter_range(Bound::Excluded(k(10)), Bound::Included(k(20))))?;
    assert_eq!(r, (11..=20).map(k).collect::<Vec<_>>());

    let r = keys(reader.iter_range(Bound::Included(k(95)), Bound::Unbounded))?;
    assert_eq!(r, (95..100).map(k).collect::<Vec<_>>());

    let r = keys(reader.iter_range(Bound::Unbounded, Bound::Excluded(k(3))))?;
    assert_eq!(r, (0..3).map(k).collect::<Vec<_>>());

    // bounds that fall between stored keys
    let r = keys(reader.iter_range(
        Bound::Included(b"key0049z".to_vec()),
        Bound::Included(b"key0052a".to_vec()),
    ))?;
    assert_eq!(r, (50..=52).map(k).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn iter_range_outside_contents_is_empty() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(&dir.path().join("out.sst"), &numbered_memtable(20), SMALL_BLOCKS)?;

    assert!(keys(reader.iter_range(Bound::Included(b"zzz".to_vec()), Bound::Unbounded))?.is_empty());
    assert!(keys(reader.iter_range(Bound::Unbounded, Bound::Excluded(b"a".to_vec())))?.is_empty());
    assert!(keys(reader.iter_range(Bound::Included(k(5)), Bound::Excluded(k(5))))?.is_empty());
    Ok(())
}

#[test]
fn owned_iterator_outlives_borrow() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("arc.sst");
    let reader = Arc::new(write_and_open(&path, &numbered_memtable(40), SMALL_BLOCKS)?);

    let iter = SSTableIter::new(Arc::clone(&reader), Bound::Included(k(30)), Bound::Unbounded);
    drop(reader);
    assert_eq!(keys(iter)?, (30..40).map(k).collect::<Vec<_>>());
    Ok(())
}

// -------------------- Validation errors --------------------

#[test]
fn open_file_too_small() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tiny.sst");
    fs::write(&path, b"short").unwrap();

    let err = SSTableReader::open(&path, false).unwrap_err();
    assert!(err.is_corruption(), "{}", err);
}

#[test]
fn open_bad_magic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("badmagic.sst");
    SSTableWriter::write_from_memtable(&path, &sample_memtable(), WriterOptions::default()).unwrap();

    let mut data = fs::read(&path).unwrap();
    let n = data.len();
    data[n - 1] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let err = SSTableReader::open(&path, false).unwrap_err();
    assert!(err.to_string().contains("magic"), "{}", err);
}

#[test]
fn open_nonexistent_file_is_io_error() {
    let dir = tempdir().unwrap();
    let result = SSTableReader::open(dir.path().join("absent.sst"), false);
    assert!(matches!(result, Err(SstError::Io(_))));
}

#[test]
fn damaged_metadata_is_detected_without_verify() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.sst");
    SSTableWriter::write_from_memtable(&path, &numbered_memtable(50), SMALL_BLOCKS).unwrap();

    // first byte of the footer (min_seq)
    let mut data = fs::read(&path).unwrap();
    let n = data.len();
    data[n - FOOTER_BYTES as usize] ^= 0x01;
    fs::write(&path, &data).unwrap();

    let err = SSTableReader::open(&path, false).unwrap_err();
    assert!(err.to_string().contains("metadata checksum"), "{}", err);
}

#[test]
fn damaged_block_is_caught_by_verify_and_by_reads() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("block.sst");
    SSTableWriter::write_from_memtable(&path, &numbered_memtable(50), SMALL_BLOCKS).unwrap();

    // byte 10 sits inside the first record of the first block
    let mut data = fs::read(&path).unwrap();
    data[10] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let err = SSTableReader::open(&path, true).unwrap_err();
    assert!(err.is_corruption());

    let reader = SSTableReader::open(&path, false).unwrap();
    assert!(reader.get(&k(0)).unwrap_err().is_corruption());
    // blocks further along are still readable
    assert_eq!(reader.get(&k(49)).unwrap().unwrap().seq, 50);

    let results: Vec<_> = reader.iter().collect();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_err());
}

#[test]
fn concurrent_gets_share_one_reader() -> Result<()> {
    let dir = tempdir()?;
    let reader = Arc::new(write_and_open(&dir.path().join("mt.sst"), &numbered_memtable(200), SMALL_BLOCKS)?);

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let reader = Arc::clone(&reader);
            std::thread::spawn(move || {
                for i in (t..200).step_by(4) {
                    let entry = reader.get(&k(i)).unwrap().unwrap();
                    assert_eq!(entry.seq, i + 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    Ok(())
}

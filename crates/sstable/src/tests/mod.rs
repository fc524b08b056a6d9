use crate::*;
use memtable::Memtable;
use std::path::Path;

mod reader_tests;

/// Small blocks so that modest test tables span many of them.
pub(super) const SMALL_BLOCKS: WriterOptions = WriterOptions {
    block_size: 64,
    bloom_fpr: 0.01,
};

/// Builds a memtable from `(key, value-or-tombstone, seq)` triples.
pub(super) fn memtable_of(entries: &[(&[u8], Option<&[u8]>, u64)]) -> Memtable {
    let m = Memtable::new();
    for &(key, val, seq) in entries {
        match val {
            Some(v) => m.put(key.to_vec(), v.to_vec(), seq),
            None => m.delete(key.to_vec(), seq),
        };
    }
    m
}

pub(super) fn sample_memtable() -> Memtable {
    memtable_of(&[
        (b"a", Some(b"apple"), 1),
        (b"b", Some(b"banana"), 2),
        (b"c", Some(b""), 3),
        (b"d", None, 4),
    ])
}

/// Memtable with `n` keys `key0000..` whose value is the decimal index.
pub(super) fn numbered_memtable(n: u64) -> Memtable {
    let m = Memtable::new();
    for i in 0..n {
        m.put(
            format!("key{:04}", i).into_bytes(),
            i.to_string().into_bytes(),
            i + 1,
        );
    }
    m
}

pub(super) fn write_and_open(
    path: &Path,
    mem: &Memtable,
    options: WriterOptions,
) -> anyhow::Result<SSTableReader> {
    SSTableWriter::write_from_memtable(path, mem, options)?;
    Ok(SSTableReader::open(path, true)?)
}

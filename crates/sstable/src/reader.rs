use bloom::BloomFilter;
use memtable::ValueEntry;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::{Bound, Deref};
use std::path::{Path, PathBuf};

use crate::format::{decode_block, decode_index, BlockHandle, Footer, FOOTER_BYTES, SEGMENT_MAGIC};
use crate::SstError;

/// Reads a segment file.
///
/// On [`open`](SSTableReader::open) the footer, bloom filter and sparse block
/// index are loaded and checked against `meta_crc`. Data blocks are read on
/// demand through a persistent file handle guarded by a mutex, so lookups and
/// iterators work through a shared `&self`.
pub struct SSTableReader {
    path: PathBuf,
    footer: Footer,
    bloom: BloomFilter,
    blocks: Vec<BlockHandle>,
    file: Mutex<File>,
    file_size: u64,
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("path", &self.path)
            .field("entries", &self.footer.entry_count)
            .field("blocks", &self.blocks.len())
            .field("max_seq", &self.footer.max_seq)
            .finish()
    }
}

impl SSTableReader {
    /// Opens a segment and validates its metadata.
    ///
    /// With `verify` set every data block is also read, checksummed and
    /// checked for key order and entry count, which costs one full pass over
    /// the file.
    ///
    /// # Errors
    ///
    /// [`SstError::Corrupt`] for any structural or checksum failure,
    /// [`SstError::Io`] if the file cannot be read.
    pub fn open<P: AsRef<Path>>(path: P, verify: bool) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)?;
        let file_size = f.metadata()?.len();

        if file_size < FOOTER_BYTES {
            return Err(SstError::corrupt(&path, "file too small for footer"));
        }
        let footer_start = file_size - FOOTER_BYTES;

        let mut footer_buf = [0u8; FOOTER_BYTES as usize];
        f.seek(SeekFrom::Start(footer_start))?;
        f.read_exact(&mut footer_buf)?;
        let (footer, stored_crc, magic) = Footer::decode(&footer_buf)?;
        if magic != SEGMENT_MAGIC {
            return Err(SstError::corrupt(
                &path,
                format!("unknown segment magic: {:#x}", magic),
            ));
        }
        if footer.bloom_offset > footer.index_offset || footer.index_offset > footer_start {
            return Err(SstError::corrupt(&path, "section offsets out of range"));
        }

        let mut meta = vec![0u8; (footer_start - footer.bloom_offset) as usize];
        f.seek(SeekFrom::Start(footer.bloom_offset))?;
        f.read_exact(&mut meta)?;
        if footer.meta_crc(&meta) != stored_crc {
            return Err(SstError::corrupt(&path, "metadata checksum mismatch"));
        }

        let split = (footer.index_offset - footer.bloom_offset) as usize;
        let bloom = BloomFilter::decode(&meta[..split])
            .map_err(|e| SstError::corrupt(&path, format!("bad bloom filter: {}", e)))?;
        let blocks = decode_index(&meta[split..]).map_err(|r| SstError::corrupt(&path, r))?;
        check_block_layout(&blocks, footer.bloom_offset).map_err(|r| SstError::corrupt(&path, r))?;
        if footer.min_seq > footer.max_seq {
            return Err(SstError::corrupt(&path, "min_seq above max_seq"));
        }

        let reader = Self {
            path,
            footer,
            bloom,
            blocks,
            file: Mutex::new(f),
            file_size,
        };
        if verify {
            reader.verify()?;
        }
        Ok(reader)
    }

    /// Reads every block and checks checksums, key order, sequence bounds
    /// and the footer entry count.
    pub fn verify(&self) -> Result<(), SstError> {
        let mut count = 0u64;
        let mut prev: Option<Vec<u8>> = None;
        for (i, handle) in self.blocks.iter().enumerate() {
            let entries = self.read_block(i)?;
            if entries.first().map(|(k, _)| k) != Some(&handle.first_key)
                || entries.last().map(|(k, _)| k) != Some(&handle.last_key)
            {
                return Err(SstError::corrupt(&self.path, "block keys disagree with index"));
            }
            for (key, entry) in entries {
                if prev.as_ref().map_or(false, |p| key <= *p) {
                    return Err(SstError::corrupt(&self.path, "keys out of order"));
                }
                if entry.seq < self.footer.min_seq || entry.seq > self.footer.max_seq {
                    return Err(SstError::corrupt(&self.path, "sequence outside footer range"));
                }
                count += 1;
                prev = Some(key);
            }
        }
        if count != self.footer.entry_count {
            return Err(SstError::corrupt(&self.path, "entry count mismatch"));
        }
        Ok(())
    }

    /// Point lookup for a single key.
    ///
    /// Returns `Ok(Some(entry))` if the key is stored in this segment (the
    /// entry may be a tombstone) and `Ok(None)` otherwise.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueEntry>, SstError> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let idx = self.blocks.partition_point(|b| b.last_key.as_slice() < key);
        match self.blocks.get(idx) {
            Some(b) if b.first_key.as_slice() <= key => {}
            _ => return Ok(None),
        }
        let entries = self.read_block(idx)?;
        Ok(entries
            .into_iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, e)| e))
    }

    /// Reads, checksums and decodes block `idx`.
    pub(crate) fn read_block(&self, idx: usize) -> Result<Vec<(Vec<u8>, ValueEntry)>, SstError> {
        let handle = &self.blocks[idx];
        let mut buf = vec![0u8; handle.len as usize];
        {
            let mut f = self.file.lock();
            f.seek(SeekFrom::Start(handle.offset))?;
            f.read_exact(&mut buf)?;
        }
        decode_block(&buf).map_err(|r| {
            SstError::corrupt(&self.path, format!("block at offset {}: {}", handle.offset, r))
        })
    }

    /// Index of the first block that may hold keys satisfying `start`.
    pub(crate) fn seek_block(&self, start: Bound<&[u8]>) -> usize {
        match start {
            Bound::Unbounded => 0,
            Bound::Included(s) => self.blocks.partition_point(|b| b.last_key.as_slice() < s),
            Bound::Excluded(s) => self.blocks.partition_point(|b| b.last_key.as_slice() <= s),
        }
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Lazily iterates every entry in key order, tombstones included.
    pub fn iter(&self) -> SSTableIter<&Self> {
        SSTableIter::new(self, Bound::Unbounded, Bound::Unbounded)
    }

    /// Lazily iterates entries inside `(start, end)`.
    pub fn iter_range(&self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> SSTableIter<&Self> {
        SSTableIter::new(self, start, end)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.footer.entry_count
    }

    #[must_use]
    pub fn min_seq(&self) -> u64 {
        self.footer.min_seq
    }

    #[must_use]
    pub fn max_seq(&self) -> u64 {
        self.footer.max_seq
    }

    #[must_use]
    pub fn first_key(&self) -> &[u8] {
        self.blocks.first().map_or(&[][..], |b| b.first_key.as_slice())
    }

    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        self.blocks.last().map_or(&[][..], |b| b.last_key.as_slice())
    }
}

/// Blocks must be non-empty, sorted and tile the data section exactly.
fn check_block_layout(blocks: &[BlockHandle], data_end: u64) -> Result<(), &'static str> {
    if blocks.is_empty() {
        return Err("no data blocks");
    }
    let mut expected_offset = 0u64;
    let mut prev_last: Option<&[u8]> = None;
    for b in blocks {
        if b.offset != expected_offset {
            return Err("block offsets not contiguous");
        }
        if b.first_key > b.last_key || prev_last.map_or(false, |p| b.first_key.as_slice() <= p) {
            return Err("index keys out of order");
        }
        expected_offset += u64::from(b.len);
        prev_last = Some(b.last_key.as_slice());
    }
    if expected_offset != data_end {
        return Err("data section length mismatch");
    }
    Ok(())
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Lazy, block-at-a-time iterator over a key range of one segment.
///
/// Generic over the handle type so it can borrow a reader (`&SSTableReader`)
/// or keep a shared one alive (`Arc<SSTableReader>` or any other
/// `Deref<Target = SSTableReader>`).
pub struct SSTableIter<R: Deref<Target = SSTableReader>> {
    reader: R,
    next_block: usize,
    buffered: std::vec::IntoIter<(Vec<u8>, ValueEntry)>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    done: bool,
}

impl<R: Deref<Target = SSTableReader>> SSTableIter<R> {
    pub fn new(reader: R, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        let next_block = reader.seek_block(as_slice_bound(&start));
        Self {
            reader,
            next_block,
            buffered: Vec::new().into_iter(),
            start,
            end,
            done: false,
        }
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Unbounded => false,
            Bound::Included(s) => key < s.as_slice(),
            Bound::Excluded(s) => key <= s.as_slice(),
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(e) => key > e.as_slice(),
            Bound::Excluded(e) => key >= e.as_slice(),
        }
    }
}

impl<R: Deref<Target = SSTableReader>> Iterator for SSTableIter<R> {
    type Item = Result<(Vec<u8>, ValueEntry), SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((key, entry)) = self.buffered.next() {
                if self.before_start(&key) {
                    continue;
                }
                if self.past_end(&key) {
                    self.done = true;
                    return None;
                }
                return Some(Ok((key, entry)));
            }
            if self.next_block >= self.reader.block_count() {
                self.done = true;
                return None;
            }
            match self.reader.read_block(self.next_block) {
                Ok(entries) => {
                    self.next_block += 1;
                    self.buffered = entries.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

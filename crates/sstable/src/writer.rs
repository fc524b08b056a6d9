use bloom::BloomFilter;
use memtable::{Memtable, ValueEntry};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{encode_index, encode_record, seal_block, BlockHandle, Footer, FOOTER_BYTES};
use crate::SstError;

/// Tunables for segment layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriterOptions {
    /// Target uncompressed size of a data block. A block is cut as soon as it
    /// reaches this size, so blocks may exceed it by one record.
    pub block_size: usize,
    /// Bloom filter false positive rate.
    pub bloom_fpr: f64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            bloom_fpr: 0.01,
        }
    }
}

/// Summary of a segment that was written and renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub entry_count: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub file_size: u64,
}

/// Streams sorted records into a new segment file.
///
/// Records are appended with [`add`](Self::add) in strictly ascending key
/// order and the file is completed with [`finish`](Self::finish). The write
/// is crash-safe: everything goes to `<path>.tmp`, which is fsynced and then
/// atomically renamed. A writer dropped before `finish` removes its temp
/// file.
pub struct SSTableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    options: WriterOptions,
    bloom: BloomFilter,
    blocks: Vec<BlockHandle>,
    block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    offset: u64,
    entry_count: u64,
    min_seq: u64,
    max_seq: u64,
    finished: bool,
}

impl SSTableWriter {
    /// Starts a segment at `path`. `expected_count` sizes the bloom filter;
    /// over-estimating is safe, under-estimating raises the false positive
    /// rate.
    pub fn create(path: &Path, expected_count: usize, options: WriterOptions) -> Result<Self, SstError> {
        let tmp_path = tmp_path_for(path);
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            file: BufWriter::new(raw),
            options,
            bloom: BloomFilter::with_rate(expected_count, options.bloom_fpr),
            blocks: Vec::new(),
            block: Vec::with_capacity(options.block_size + 256),
            block_first_key: None,
            last_key: None,
            offset: 0,
            entry_count: 0,
            min_seq: u64::MAX,
            max_seq: 0,
            finished: false,
        })
    }

    /// Appends one record. Keys must be strictly ascending.
    pub fn add(&mut self, key: &[u8], entry: &ValueEntry) -> Result<(), SstError> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(SstError::OutOfOrder);
            }
        }

        encode_record(&mut self.block, key, entry)?;
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }
        self.bloom.insert(key);
        self.last_key = Some(key.to_vec());
        self.entry_count += 1;
        self.min_seq = self.min_seq.min(entry.seq);
        self.max_seq = self.max_seq.max(entry.seq);

        if self.block.len() >= self.options.block_size {
            self.finish_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the open block. Used to split compaction
    /// output at a target size.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn finish_block(&mut self) -> Result<(), SstError> {
        let Some(first_key) = self.block_first_key.take() else {
            return Ok(());
        };
        let last_key = self.last_key.clone().unwrap_or_default();
        seal_block(&mut self.block);
        self.file.write_all(&self.block)?;
        self.blocks.push(BlockHandle {
            first_key,
            last_key,
            offset: self.offset,
            len: self.block.len() as u32,
        });
        self.offset += self.block.len() as u64;
        self.block.clear();
        Ok(())
    }

    /// Writes bloom, index and footer, fsyncs and renames the segment into
    /// place.
    ///
    /// # Errors
    ///
    /// [`SstError::Empty`] if no record was added; the temp file is removed.
    pub fn finish(mut self) -> Result<SegmentInfo, SstError> {
        self.finish_block()?;
        if self.entry_count == 0 {
            return Err(SstError::Empty);
        }

        let bloom_offset = self.offset;
        let mut meta = Vec::with_capacity(self.bloom.encoded_len() + self.blocks.len() * 64);
        self.bloom.encode_into(&mut meta);
        let index_offset = bloom_offset + meta.len() as u64;
        encode_index(&self.blocks, &mut meta)?;

        let footer = Footer {
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            entry_count: self.entry_count,
            bloom_offset,
            index_offset,
        };
        let meta_crc = footer.meta_crc(&meta);
        self.file.write_all(&meta)?;
        footer.write_to(&mut self.file, meta_crc)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;

        // A crash after rename but before the directory sync can lose the
        // entry on ext4/XFS.
        if let Some(parent) = self.path.parent() {
            sync_dir(parent)?;
        }

        Ok(SegmentInfo {
            path: self.path.clone(),
            entry_count: self.entry_count,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            file_size: bloom_offset + meta.len() as u64 + FOOTER_BYTES,
        })
    }

    /// Writes a whole memtable as one segment.
    pub fn write_from_memtable(
        path: &Path,
        mem: &Memtable,
        options: WriterOptions,
    ) -> Result<SegmentInfo, SstError> {
        if mem.is_empty() {
            return Err(SstError::Empty);
        }
        let mut writer = Self::create(path, mem.len(), options)?;
        mem.with_entries(|entries| {
            for (key, entry) in entries {
                writer.add(key, entry)?;
            }
            Ok::<(), SstError>(())
        })?;
        writer.finish()
    }

    /// Writes a segment from `(key, ValueEntry)` pairs in ascending key order.
    pub fn write_from_iterator<I>(
        path: &Path,
        expected_count: usize,
        iter: I,
        options: WriterOptions,
    ) -> Result<SegmentInfo, SstError>
    where
        I: IntoIterator<Item = (Vec<u8>, ValueEntry)>,
    {
        let mut writer = Self::create(path, expected_count, options)?;
        for (key, entry) in iter {
            writer.add(&key, &entry)?;
        }
        writer.finish()
    }
}

impl Drop for SSTableWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// `000007.sst` -> `000007.sst.tmp`
/// fsyncs a directory so that a rename into it survives a crash.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

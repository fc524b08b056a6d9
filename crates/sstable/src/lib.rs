//! # SSTable - Sorted String Table
//!
//! Immutable on-disk segments of the ShoalKV storage engine.
//!
//! When a sealed [`memtable::Memtable`] is flushed, or when compaction merges
//! several segments, the result is written as a segment file. Segments are
//! *write-once, read-many*: once renamed into place they are never modified,
//! only replaced by compaction.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA BLOCKS                                                   │
//! │   record: key_len (u32) | key | seq (u64) | kind (u8)         │
//! │           [val_len (u32) | val]        (puts only)            │
//! │   ... records up to ~block_size, then crc32 (u32) of the block│
//! ├───────────────────────────────────────────────────────────────┤
//! │ BLOOM   serialized BloomFilter over every key                 │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX   block_count (u32), then per block:                    │
//! │   first_key_len (u32) | first_key | last_key_len (u32)        │
//! │   last_key | offset (u64) | len (u32)                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 48 bytes)                                 │
//! │   min_seq | max_seq | entry_count | bloom_offset              │
//! │   index_offset (u64 LE each) | meta_crc (u32) | magic "SHL1"  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. `meta_crc` covers the bloom and index
//! sections plus the five footer fields before it, so a reader can trust the
//! metadata after a single check and verify data blocks lazily.

mod format;
mod merge;
mod reader;
mod writer;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use format::{FOOTER_BYTES, MAX_KEY_BYTES, MAX_VALUE_BYTES, SEGMENT_MAGIC};
pub use merge::{EntryResult, MergeIterator};
pub use reader::{SSTableIter, SSTableReader};
pub use writer::{SSTableWriter, SegmentInfo, WriterOptions};

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "sst";

/// Errors raised while writing or reading segments.
#[derive(Debug, Error)]
pub enum SstError {
    #[error("sstable io error: {0}")]
    Io(#[from] io::Error),

    /// The file failed structural or checksum validation.
    #[error("corrupt segment {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("refusing to write an empty segment")]
    Empty,

    /// Keys handed to the writer were not strictly ascending.
    #[error("keys must be added in strictly ascending order")]
    OutOfOrder,
}

impl SstError {
    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        SstError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, SstError::Corrupt { .. })
    }
}

/// File name of segment number `number`, e.g. `000042.sst`.
#[must_use]
pub fn segment_file_name(number: u64) -> String {
    format!("{:06}.{}", number, SEGMENT_EXTENSION)
}

/// Parses the number out of a segment file name produced by
/// [`segment_file_name`].
#[must_use]
pub fn parse_segment_number(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

#[cfg(test)]
mod tests;

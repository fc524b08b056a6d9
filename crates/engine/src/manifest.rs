//! # Manifest - live segment set
//!
//! Records which segment files make up the store, the next file number to
//! hand out, and the checkpoint: the highest sequence number durably held in
//! segments. WAL records at or below the checkpoint are never replayed.
//!
//! ## File Format
//!
//! ```text
//! # ShoalKV manifest
//! next_file_number: 12
//! checkpoint_seq: 3481
//! segment: 000003.sst
//! segment: 000009.sst
//! ```
//!
//! Segments are listed oldest first. Lines starting with `#` are comments and
//! blank lines are ignored.
//!
//! ## Crash Safety
//!
//! The file is rewritten as a whole: write `MANIFEST.tmp`, fsync, rename over
//! `MANIFEST`, fsync the directory. A reader therefore sees either the old or
//! the new manifest, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use sstable::{parse_segment_number, segment_file_name};

use crate::error::EngineError;

/// Name of the manifest file within the data directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    path: PathBuf,
    /// Next number for a WAL or segment file.
    pub next_file_number: u64,
    /// Highest sequence number contained in the listed segments.
    pub checkpoint_seq: u64,
    /// Live segment numbers, oldest first.
    pub segments: Vec<u64>,
}

impl Manifest {
    /// Loads `dir/MANIFEST`, or returns an empty manifest if there is none.
    ///
    /// # Errors
    ///
    /// [`EngineError::Manifest`] if the file exists but cannot be parsed.
    pub fn load_or_create(dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join(MANIFEST_FILENAME);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    next_file_number: 1,
                    checkpoint_seq: 0,
                    segments: Vec::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(path, BufReader::new(file))
    }

    /// Loads an existing manifest; a missing file is an error.
    pub fn load(dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join(MANIFEST_FILENAME);
        let file = File::open(&path)?;
        Self::parse(path, BufReader::new(file))
    }

    fn parse<R: BufRead>(path: PathBuf, reader: R) -> Result<Self, EngineError> {
        let mut next_file_number = None;
        let mut checkpoint_seq = None;
        let mut segments = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let bad_line = || {
                EngineError::Manifest(format!("line {}: cannot parse {:?}", line_num + 1, trimmed))
            };

            let (field, value) = trimmed.split_once(':').ok_or_else(bad_line)?;
            let value = value.trim();
            match field.trim() {
                "next_file_number" => {
                    next_file_number = Some(value.parse().map_err(|_| bad_line())?);
                }
                "checkpoint_seq" => {
                    checkpoint_seq = Some(value.parse().map_err(|_| bad_line())?);
                }
                "segment" => segments.push(parse_segment_number(value).ok_or_else(bad_line)?),
                _ => return Err(bad_line()),
            }
        }

        let (Some(next_file_number), Some(checkpoint_seq)) = (next_file_number, checkpoint_seq)
        else {
            return Err(EngineError::Manifest("missing header fields".into()));
        };
        if segments.iter().any(|&n| n >= next_file_number) {
            return Err(EngineError::Manifest(
                "segment number at or above next_file_number".into(),
            ));
        }

        Ok(Self {
            path,
            next_file_number,
            checkpoint_seq,
            segments,
        })
    }

    /// Atomically replaces the manifest on disk with the current state.
    pub fn save(&self) -> Result<(), EngineError> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }

    fn render(&self) -> String {
        let mut out = String::from("# ShoalKV manifest\n");
        out.push_str(&format!("next_file_number: {}\n", self.next_file_number));
        out.push_str(&format!("checkpoint_seq: {}\n", self.checkpoint_seq));
        for &n in &self.segments {
            out.push_str(&format!("segment: {}\n", segment_file_name(n)));
        }
        out
    }

    /// Hands out the next file number.
    pub fn allocate_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Replaces the contiguous run `inputs` by `outputs` at the same position.
    ///
    /// Returns `false` and leaves the list untouched if `inputs` is not a
    /// contiguous run of the current segment list.
    pub fn replace_segments(&mut self, inputs: &[u64], outputs: &[u64]) -> bool {
        if inputs.is_empty() {
            return false;
        }
        let Some(start) = self.segments.iter().position(|&n| n == inputs[0]) else {
            return false;
        };
        let end = start + inputs.len();
        if self.segments.get(start..end) != Some(inputs) {
            return false;
        }
        self.segments.splice(start..end, outputs.iter().copied());
        true
    }

    /// Drops `number` from the segment list.
    pub fn remove_segment(&mut self, number: u64) {
        self.segments.retain(|&n| n != number);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fsyncs a directory so that renames and creations inside it are durable.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

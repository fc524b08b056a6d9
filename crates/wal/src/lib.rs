//! # WAL - Write-Ahead Log
//!
//! Durability boundary of the ShoalKV engine. Every mutation is framed,
//! checksummed and appended to the current log file **before** it becomes
//! visible in the memtable. After a crash the surviving log files are
//! replayed in order to rebuild the memtables that had not been flushed.
//!
//! Each memtable owns one numbered log file (`000007.log`). A log file is
//! deleted once every record in it is covered by a flushed segment.
//!
//! ## Frame format
//!
//! ```text
//! [body_len: u32 LE][crc32(body): u32 LE][body ...]
//! ```
//!
//! Body: `[seq: u64][op: u8][key_len: u32][key]` followed, for puts only, by
//! `[val_len: u32][value]`. `op` is `0` for put and `1` for delete.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wal::{WalReader, WalRecord, WalWriter};
//!
//! let mut w = WalWriter::create("000001.log", true).unwrap();
//! w.append(&WalRecord::put(1, b"hello".to_vec(), b"world".to_vec())).unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("000001.log").unwrap();
//! let stats = r.replay(|rec| println!("{:?}", rec)).unwrap();
//! assert_eq!(stats.records, 1);
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// File extension of log files.
pub const LOG_EXTENSION: &str = "log";

/// Largest body accepted on replay. Anything bigger is treated as corruption.
const MAX_BODY_BYTES: u32 = 64 * 1024 * 1024;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// One logged mutation. `value == None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl WalRecord {
    pub fn put(seq: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            seq,
            key,
            value: Some(value),
        }
    }

    pub fn delete(seq: u64, key: Vec<u8>) -> Self {
        Self {
            seq,
            key,
            value: None,
        }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed validation. `offset` is the frame's byte position.
    #[error("corrupt wal record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: &'static str },

    #[error("wal record too large: {0} bytes")]
    TooLarge(usize),

    /// A failed append could not be rolled back; the file may end in a torn
    /// frame and must not grow further.
    #[error("wal {} is unusable after a failed append", .0.display())]
    Poisoned(PathBuf),
}

/// Outcome of a [`WalReader::replay`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records handed to the callback.
    pub records: u64,
    /// Bytes consumed by those records, frames included.
    pub bytes: u64,
    /// A partial frame was found at the end of the log and ignored.
    pub truncated_tail: bool,
}

/// Append-only log writer.
///
/// Every append is encoded into a reusable buffer and issued as a single
/// `write_all`. With `sync` enabled the file is fsynced before `append`
/// returns, so an acknowledged write survives power loss.
///
/// The writer owns the file position. A failed append is rolled back by
/// truncating to the end of the last good frame, so a later frame never
/// lands behind a torn one. If the rollback itself fails the writer is
/// poisoned and refuses further appends.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    sync: bool,
    buf: Vec<u8>,
    bytes_written: u64,
    poisoned: bool,
}

impl WalWriter {
    /// Opens (or creates) the log at `path`, positioned at its end.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let bytes_written = file.seek(SeekFrom::End(0))?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
        Ok(Self {
            file,
            path,
            sync,
            buf: Vec::with_capacity(256),
            bytes_written,
            poisoned: false,
        })
    }

    /// Appends `record`, returning the size of the frame written.
    ///
    /// # Errors
    ///
    /// [`WalError::Poisoned`] once an earlier failure could not be rolled
    /// back; otherwise the encoding or I/O error of this append.
    pub fn append(&mut self, record: &WalRecord) -> Result<usize, WalError> {
        if self.poisoned {
            return Err(WalError::Poisoned(self.path.clone()));
        }
        encode_frame(record, &mut self.buf)?;
        if let Err(e) = self.write_frame() {
            self.rollback();
            return Err(e.into());
        }
        self.bytes_written += self.buf.len() as u64;
        Ok(self.buf.len())
    }

    fn write_frame(&mut self) -> io::Result<()> {
        self.file.write_all(&self.buf)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cuts the file back to the last complete frame.
    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.bytes_written)
            .and_then(|()| self.file.seek(SeekFrom::Start(self.bytes_written)));
        if restored.is_err() {
            self.poisoned = true;
        }
    }

    /// `true` once a failed append could not be rolled back.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Forces appended data to stable storage. Used when `sync` is off.
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the log up to the end of the last good frame.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Encodes one frame of `record` into `buf`, replacing its contents.
fn encode_frame(record: &WalRecord, buf: &mut Vec<u8>) -> Result<(), WalError> {
    buf.clear();
    // header placeholder: body_len + crc
    buf.extend_from_slice(&[0u8; 8]);

    buf.write_u64::<LittleEndian>(record.seq)?;
    let op = if record.value.is_some() { OP_PUT } else { OP_DELETE };
    buf.write_u8(op)?;
    write_bytes(buf, &record.key)?;
    if let Some(value) = &record.value {
        write_bytes(buf, value)?;
    }

    let body_len = buf.len() - 8;
    if body_len > MAX_BODY_BYTES as usize {
        return Err(WalError::TooLarge(body_len));
    }
    let mut hasher = Crc32::new();
    hasher.update(&buf[8..]);
    let crc = hasher.finalize();

    buf[0..4].copy_from_slice(&(body_len as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field exceeds u32::MAX"))?;
    buf.write_u32::<LittleEndian>(len)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Sequential log reader.
///
/// Generic over [`Read`] so tests can replay in-memory buffers. A partial
/// frame at the very end of the input (crash mid-append) ends the replay
/// cleanly; a complete frame that fails its checksum is corruption.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
    offset: u64,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        Ok(Self::from_reader(File::open(path)?))
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
            offset: 0,
        }
    }

    /// Calls `apply` for every valid record in log order.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<ReplayStats, WalError>
    where
        F: FnMut(WalRecord),
    {
        let mut stats = ReplayStats::default();
        let mut body = Vec::with_capacity(256);

        loop {
            let frame_start = self.offset;
            let mut header = [0u8; 8];
            match read_full(&mut self.rdr, &mut header)? {
                0 => return Ok(stats),
                n if n < header.len() => {
                    stats.truncated_tail = true;
                    return Ok(stats);
                }
                _ => {}
            }

            let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if body_len < MIN_BODY_BYTES || body_len > MAX_BODY_BYTES {
                return Err(WalError::Corrupt {
                    offset: frame_start,
                    reason: "frame length out of range",
                });
            }

            body.clear();
            body.resize(body_len as usize, 0);
            if read_full(&mut self.rdr, &mut body)? < body.len() {
                stats.truncated_tail = true;
                return Ok(stats);
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt {
                    offset: frame_start,
                    reason: "checksum mismatch",
                });
            }

            let record = decode_body(&body).ok_or(WalError::Corrupt {
                offset: frame_start,
                reason: "malformed body",
            })?;

            let frame_len = 8 + body_len as u64;
            self.offset += frame_len;
            stats.records += 1;
            stats.bytes += frame_len;
            apply(record);
        }
    }
}

/// seq + op + key_len
const MIN_BODY_BYTES: u32 = 8 + 1 + 4;

fn decode_body(body: &[u8]) -> Option<WalRecord> {
    let mut br = body;
    let seq = br.read_u64::<LittleEndian>().ok()?;
    let op = br.read_u8().ok()?;
    let key = take_bytes(&mut br)?;
    let value = match op {
        OP_PUT => Some(take_bytes(&mut br)?),
        OP_DELETE => None,
        _ => return None,
    };
    if !br.is_empty() {
        return None;
    }
    Some(WalRecord { seq, key, value })
}

fn take_bytes(br: &mut &[u8]) -> Option<Vec<u8>> {
    let len = br.read_u32::<LittleEndian>().ok()? as usize;
    if len > br.len() {
        return None;
    }
    let (head, tail) = br.split_at(len);
    *br = tail;
    Some(head.to_vec())
}

/// Reads until `buf` is full or EOF, returning the bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// File name of log number `number`, e.g. `000042.log`.
#[must_use]
pub fn log_file_name(number: u64) -> String {
    format!("{:06}.{}", number, LOG_EXTENSION)
}

/// Parses the number out of a log file name produced by [`log_file_name`].
#[must_use]
pub fn parse_log_number(name: &str) -> Option<u64> {
    name.strip_suffix(".log")?.parse().ok()
}

/// Lists the log files in `dir`, sorted by ascending number.
pub fn list_logs(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(number) = entry.file_name().to_str().and_then(parse_log_number) {
            logs.push((number, entry.path()));
        }
    }
    logs.sort_by_key(|(n, _)| *n);
    Ok(logs)
}

/// fsyncs a directory so that file creation survives a crash.
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

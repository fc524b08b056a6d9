//! Segment binary format: footer, index and data block encoding.
//!
//! ## Footer (48 bytes) - magic `SHL1`
//!
//! ```text
//! [min_seq: u64][max_seq: u64][entry_count: u64]
//! [bloom_offset: u64][index_offset: u64][meta_crc: u32][magic: u32]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::ValueEntry;
use std::io::{self, Write};

/// Magic number identifying segment files (ASCII "SHL1").
pub const SEGMENT_MAGIC: u32 = 0x5348_4C31;

/// Size of the footer: five u64 fields, meta crc and magic.
pub const FOOTER_BYTES: u64 = 5 * 8 + 4 + 4;

/// Largest key accepted on read (64 KiB). Prevents OOM on corrupt files.
pub const MAX_KEY_BYTES: usize = 64 * 1024;

/// Largest value accepted on read (10 MiB). Prevents OOM on corrupt files.
pub const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;

/// Footer bytes covered by `meta_crc`.
const FOOTER_FIELDS_BYTES: usize = 5 * 8;

const KIND_DELETE: u8 = 0;
const KIND_PUT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Footer {
    pub min_seq: u64,
    pub max_seq: u64,
    pub entry_count: u64,
    pub bloom_offset: u64,
    pub index_offset: u64,
}

impl Footer {
    fn fields(&self) -> [u8; FOOTER_FIELDS_BYTES] {
        let mut out = [0u8; FOOTER_FIELDS_BYTES];
        for (i, v) in [
            self.min_seq,
            self.max_seq,
            self.entry_count,
            self.bloom_offset,
            self.index_offset,
        ]
        .iter()
        .enumerate()
        {
            out[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// CRC over the metadata sections followed by the footer fields.
    pub fn meta_crc(&self, meta: &[u8]) -> u32 {
        let mut hasher = Crc32::new();
        hasher.update(meta);
        hasher.update(&self.fields());
        hasher.finalize()
    }

    pub fn write_to<W: Write>(&self, w: &mut W, meta_crc: u32) -> io::Result<()> {
        w.write_all(&self.fields())?;
        w.write_u32::<LittleEndian>(meta_crc)?;
        w.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        Ok(())
    }

    /// Decodes the last [`FOOTER_BYTES`] of a file. Returns the footer, the
    /// stored meta crc and the magic.
    pub fn decode(mut buf: &[u8]) -> io::Result<(Footer, u32, u32)> {
        let footer = Footer {
            min_seq: buf.read_u64::<LittleEndian>()?,
            max_seq: buf.read_u64::<LittleEndian>()?,
            entry_count: buf.read_u64::<LittleEndian>()?,
            bloom_offset: buf.read_u64::<LittleEndian>()?,
            index_offset: buf.read_u64::<LittleEndian>()?,
        };
        let meta_crc = buf.read_u32::<LittleEndian>()?;
        let magic = buf.read_u32::<LittleEndian>()?;
        Ok((footer, meta_crc, magic))
    }
}

/// Location and key range of one data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    pub offset: u64,
    /// Block length in bytes, trailing crc included.
    pub len: u32,
}

pub(crate) fn encode_index(blocks: &[BlockHandle], buf: &mut Vec<u8>) -> io::Result<()> {
    buf.write_u32::<LittleEndian>(blocks.len() as u32)?;
    for b in blocks {
        write_len_prefixed(buf, &b.first_key)?;
        write_len_prefixed(buf, &b.last_key)?;
        buf.write_u64::<LittleEndian>(b.offset)?;
        buf.write_u32::<LittleEndian>(b.len)?;
    }
    Ok(())
}

pub(crate) fn decode_index(mut buf: &[u8]) -> Result<Vec<BlockHandle>, &'static str> {
    let count = buf.read_u32::<LittleEndian>().map_err(|_| "truncated index")? as usize;
    let mut blocks = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let first_key = read_len_prefixed(&mut buf, MAX_KEY_BYTES).ok_or("truncated index entry")?;
        let last_key = read_len_prefixed(&mut buf, MAX_KEY_BYTES).ok_or("truncated index entry")?;
        let offset = buf.read_u64::<LittleEndian>().map_err(|_| "truncated index entry")?;
        let len = buf.read_u32::<LittleEndian>().map_err(|_| "truncated index entry")?;
        blocks.push(BlockHandle {
            first_key,
            last_key,
            offset,
            len,
        });
    }
    if !buf.is_empty() {
        return Err("trailing bytes after index");
    }
    Ok(blocks)
}

/// Appends one record to an open block buffer.
pub(crate) fn encode_record(buf: &mut Vec<u8>, key: &[u8], entry: &ValueEntry) -> io::Result<()> {
    write_len_prefixed(buf, key)?;
    buf.write_u64::<LittleEndian>(entry.seq)?;
    match &entry.value {
        Some(v) => {
            buf.write_u8(KIND_PUT)?;
            write_len_prefixed(buf, v)?;
        }
        None => buf.write_u8(KIND_DELETE)?,
    }
    Ok(())
}

/// Seals a block buffer by appending the crc32 of its contents.
pub(crate) fn seal_block(buf: &mut Vec<u8>) {
    let mut hasher = Crc32::new();
    hasher.update(buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Verifies the trailing crc of `block` and decodes its records.
pub(crate) fn decode_block(block: &[u8]) -> Result<Vec<(Vec<u8>, ValueEntry)>, &'static str> {
    if block.len() < 4 {
        return Err("block too small");
    }
    let (body, crc_bytes) = block.split_at(block.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored {
        return Err("block checksum mismatch");
    }

    let mut entries = Vec::new();
    let mut br = body;
    while !br.is_empty() {
        let key = read_len_prefixed(&mut br, MAX_KEY_BYTES).ok_or("malformed record key")?;
        let seq = br.read_u64::<LittleEndian>().map_err(|_| "malformed record seq")?;
        let kind = br.read_u8().map_err(|_| "malformed record kind")?;
        let value = match kind {
            KIND_PUT => Some(read_len_prefixed(&mut br, MAX_VALUE_BYTES).ok_or("malformed record value")?),
            KIND_DELETE => None,
            _ => return Err("unknown record kind"),
        };
        entries.push((key, ValueEntry { seq, value }));
    }
    if entries.is_empty() {
        return Err("empty block");
    }
    Ok(entries)
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field exceeds u32::MAX"))?;
    buf.write_u32::<LittleEndian>(len)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_len_prefixed(br: &mut &[u8], max: usize) -> Option<Vec<u8>> {
    let len = br.read_u32::<LittleEndian>().ok()? as usize;
    if len > max || len > br.len() {
        return None;
    }
    let (head, tail) = br.split_at(len);
    *br = tail;
    Some(head.to_vec())
}

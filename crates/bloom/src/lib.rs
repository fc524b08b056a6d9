//! # Bloom Filter
//!
//! Probabilistic set membership used by segment files to skip point lookups
//! for keys they cannot contain. A negative answer is exact; a positive answer
//! is wrong with roughly the configured false positive rate.
//!
//! Probe positions come from one 64-bit hash split into two halves and
//! combined with double hashing: `pos(i) = h_lo + i * h_hi (mod m)`.
//!
//! ## Example
//!
//! ```rust
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::with_rate(1000, 0.01);
//! bf.insert(b"hello");
//! assert!(bf.may_contain(b"hello"));
//!
//! let mut buf = Vec::new();
//! bf.encode_into(&mut buf);
//! let back = BloomFilter::decode(&buf).unwrap();
//! assert!(back.may_contain(b"hello"));
//! ```
use std::io;

/// Smallest filter we ever allocate, in bits.
const MIN_BITS: u64 = 64;

/// Upper bound accepted by [`BloomFilter::decode`] (128 MiB of bits).
const MAX_ENCODED_BYTES: usize = 128 * 1024 * 1024;

/// Encoded header: `num_bits(u64) + num_probes(u32)`.
const HEADER_BYTES: usize = 8 + 4;

/// A bloom filter over byte-string keys.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_probes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` keys at `false_positive_rate`.
    ///
    /// Out-of-range inputs are clamped: zero items is treated as one, and the
    /// rate is clamped into `[1e-6, 0.5]`.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = if false_positive_rate.is_finite() {
            false_positive_rate.clamp(1e-6, 0.5)
        } else {
            0.01
        };

        // m = -n ln(p) / ln(2)^2, k = (m / n) ln(2)
        let ln2 = std::f64::consts::LN_2;
        let m = ((-n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let m = m.max(MIN_BITS);
        let k = ((m as f64 / n) * ln2).round().clamp(1.0, 30.0) as u32;

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            num_bits: m,
            num_probes: k,
        }
    }

    /// Adds `key` to the set.
    pub fn insert(&mut self, key: &[u8]) {
        let (lo, hi) = split_hash(key);
        for i in 0..self.num_probes {
            let bit = probe(lo, hi, i, self.num_bits);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// `false` means `key` was definitely never inserted.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (lo, hi) = split_hash(key);
        (0..self.num_probes).all(|i| {
            let bit = probe(lo, hi, i, self.num_bits);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_probes(&self) -> u32 {
        self.num_probes
    }

    /// Size of [`encode_into`](Self::encode_into) output in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_BYTES + self.bits.len()
    }

    /// Appends the encoded filter to `buf`.
    ///
    /// Layout (little-endian): `[num_bits: u64][num_probes: u32][bits...]`.
    /// The bit array length is implied by `num_bits`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&self.num_probes.to_le_bytes());
        buf.extend_from_slice(&self.bits);
    }

    /// Decodes a filter previously produced by [`encode_into`](Self::encode_into).
    ///
    /// `data` must contain exactly one encoded filter.
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < HEADER_BYTES {
            return Err(invalid("bloom filter header truncated"));
        }
        let mut num_bits = [0u8; 8];
        num_bits.copy_from_slice(&data[0..8]);
        let num_bits = u64::from_le_bytes(num_bits);
        let mut num_probes = [0u8; 4];
        num_probes.copy_from_slice(&data[8..12]);
        let num_probes = u32::from_le_bytes(num_probes);

        if num_bits < MIN_BITS || num_probes == 0 {
            return Err(invalid("bloom filter parameters out of range"));
        }
        let byte_len = num_bits.div_ceil(8) as usize;
        if byte_len > MAX_ENCODED_BYTES {
            return Err(invalid("bloom filter too large"));
        }
        let bits = &data[HEADER_BYTES..];
        if bits.len() != byte_len {
            return Err(invalid("bloom filter length mismatch"));
        }

        Ok(Self {
            bits: bits.to_vec(),
            num_bits,
            num_probes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_probes", &self.num_probes)
            .finish()
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn probe(lo: u32, hi: u32, i: u32, num_bits: u64) -> u64 {
    (lo as u64).wrapping_add((i as u64).wrapping_mul(hi as u64 | 1)) % num_bits
}

/// FNV-1a followed by a splitmix64 finalizer, split into two 32-bit halves.
fn split_hash(key: &[u8]) -> (u32, u32) {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^= h >> 31;
    (h as u32, (h >> 32) as u32)
}

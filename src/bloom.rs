//! Bloom filter for SSTable point-lookup short-circuiting.
//!
//! Every SSTable carries one filter built over its full key set. A negative
//! answer is authoritative — the key is definitely absent and the data block
//! is never touched. A positive answer means "maybe"; the false-positive
//! rate is tuned at build time from the expected key count.
//!
//! Probing uses double hashing: bit `i` is `(h1 + i·h2) mod m`, where `h1`
//! and `h2` are two independent 64-bit hashes of the key. The hash pair is
//! supplied by a free function so the probe sequence is fixed by this module
//! and not by a hasher type.
//!
//! # Wire format (little-endian)
//!
//! ```text
//! [bit_len: u64][num_hashes: u32][byte_len: u32][packed bits]
//! ```

use std::io::{self, Read, Write};

/// Hard cap on a deserialized filter (64 MiB of bits). Rejects allocation
/// bombs from corrupted SSTable bloom blocks.
const MAX_BLOOM_BYTES: usize = 64 * 1024 * 1024;

/// Bit-array bloom filter with `k` double-hashed probes per key.
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_len: u64,
    num_hashes: u32,
}

/// Sizing parameters derived from a target false-positive rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomParams {
    /// Bits per inserted element (`m/n`).
    pub bits_per_key: u64,
    /// Total bit-array length for the expected element count.
    pub bit_len: u64,
    /// Number of probes per key (`k`).
    pub num_hashes: u32,
}

/// Computes optimal sizing for `expected_n` keys at `target_fp` false
/// positives: `m/n = ⌈−ln(p) / (ln 2)²⌉` and `k = round((m/n)·ln 2)`.
pub fn optimize(expected_n: usize, target_fp: f64) -> BloomParams {
    debug_assert!(target_fp > 0.0 && target_fp < 1.0);
    let bits_per_key = (-target_fp.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
    let bits_per_key = bits_per_key.max(1);
    let num_hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as u32;
    BloomParams {
        bits_per_key,
        bit_len: (expected_n.max(1) as u64).saturating_mul(bits_per_key).max(8),
        num_hashes: num_hashes.max(1),
    }
}

/// Two independent 64-bit hashes of `key` (FNV-1a under two bases).
///
/// This is the default hash pair for [`BloomFilter`]; the filter itself is
/// agnostic to how the pair was produced.
pub fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a_64(key, 0xcbf2_9ce4_8422_2325),
        fnv1a_64(key, 0x517c_c1b7_2722_0a95),
    )
}

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl BloomFilter {
    /// Creates a filter sized for `expected_n` keys at `target_fp`.
    pub fn new(expected_n: usize, target_fp: f64) -> Self {
        let params = optimize(expected_n, target_fp);
        Self {
            bits: vec![0u8; params.bit_len.div_ceil(8) as usize],
            bit_len: params.bit_len,
            num_hashes: params.num_hashes,
        }
    }

    fn from_raw(bits: Vec<u8>, bit_len: u64, num_hashes: u32) -> Self {
        Self {
            bits,
            bit_len,
            num_hashes,
        }
    }

    /// Sets every probe bit for `key`.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.probe(h1, h2, i);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// Returns `false` only when `key` was definitely never inserted.
    #[must_use]
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.probe(h1, h2, i);
            if (self.bits[(idx / 8) as usize] >> (idx % 8)) & 1 == 0 {
                return false;
            }
        }
        true
    }

    fn probe(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.bit_len
    }

    /// Number of bits in the array.
    #[must_use]
    pub fn bit_len(&self) -> u64 {
        self.bit_len
    }

    /// Number of probes per key.
    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Size of [`write_to`](Self::write_to) output in bytes.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        8 + 4 + 4 + self.bits.len()
    }

    /// Serializes the filter: `[bit_len u64][num_hashes u32][byte_len u32][bits]`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.bit_len.to_le_bytes())?;
        w.write_all(&self.num_hashes.to_le_bytes())?;
        w.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    /// Deserializes a filter previously produced by [`write_to`](Self::write_to).
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        r.read_exact(&mut buf8)?;
        let bit_len = u64::from_le_bytes(buf8);

        r.read_exact(&mut buf4)?;
        let num_hashes = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let byte_len = u32::from_le_bytes(buf4) as usize;

        if byte_len > MAX_BLOOM_BYTES || (byte_len as u64) < bit_len.div_ceil(8) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible bloom filter length: {byte_len} bytes for {bit_len} bits"),
            ));
        }
        if bit_len == 0 || num_hashes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bloom filter with zero bits or zero hashes",
            ));
        }

        let mut bits = vec![0u8; byte_len];
        r.read_exact(&mut bits)?;

        Ok(Self::from_raw(bits, bit_len, num_hashes))
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bit_len", &self.bit_len)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

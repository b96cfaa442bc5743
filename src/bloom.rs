//! Per-shard bloom filters for the immutable index files.
//!
//! A filter can say with certainty that a key is **not** in its shard (no
//! false negatives) but may report false positives. Lookups consult the
//! filter before issuing any pread against shard data; a rejection is counted
//! in `IoStat::filtered_kv_cnt`.
//!
//! Wire format (little-endian):
//!
//! ```text
//! [num_bits:u64][num_hashes:u32][bits_len:u32][bits][crc32:u32]
//! ```
//!
//! The trailing crc covers everything before it. A filter that fails its crc
//! is treated as absent rather than failing the file load.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use xxhash_rust::xxh64::xxh64;

use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Canonical false-positive target used for all shard filters.
pub const BLOOM_FPP: f64 = 0.01;

/// A bloom filter backed by a bit vector with `k` double-hashed probes:
/// `h(i) = h1 + i * h2`, with `h1`/`h2` from xxh64 under two seeds.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` at [`BLOOM_FPP`].
    pub fn with_expected_items(expected_items: usize) -> Self {
        Self::new(expected_items.max(1), BLOOM_FPP)
    }

    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        // m = -n * ln(p) / ln(2)^2, k = (m/n) * ln(2)
        let n = expected_items as f64;
        let m = (-n * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.max(1);

        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `true` means the key *might* be in the shard, `false` means it is
    /// definitely not.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            if self.bits[(idx / 8) as usize] >> (idx % 8) & 1 == 0 {
                return false;
            }
        }
        true
    }

    pub fn memory_usage(&self) -> usize {
        self.bits.len()
    }

    pub fn serialized_size(&self) -> usize {
        8 + 4 + 4 + self.bits.len() + 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.write_u64::<LittleEndian>(self.num_bits).unwrap();
        buf.write_u32::<LittleEndian>(self.num_hashes).unwrap();
        buf.write_u32::<LittleEndian>(self.bits.len() as u32).unwrap();
        buf.extend_from_slice(&self.bits);
        let crc = CRC32.checksum(&buf);
        buf.write_u32::<LittleEndian>(crc).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(crate::errcorrupt!("bloom filter region truncated"));
        }
        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if CRC32.checksum(payload) != stored {
            return Err(crate::errcorrupt!("bloom filter checksum mismatch"));
        }

        let mut cursor = payload;
        let num_bits = cursor.read_u64::<LittleEndian>()?;
        let num_hashes = cursor.read_u32::<LittleEndian>()?;
        let bits_len = cursor.read_u32::<LittleEndian>()? as usize;
        if cursor.len() < bits_len {
            return Err(crate::errcorrupt!("bloom filter bits truncated"));
        }
        Ok(Self {
            bits: cursor[..bits_len].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (xxh64(key, 0), xxh64(key, 1))
}

fn bit_index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

//! Key hashing and hash bit-slicing.
//!
//! A single 64-bit hash services every layer: the mutable index shards by its
//! top bits, the immutable file addresses shard, page and bucket with
//! progressively lower bit ranges, and the low byte is the in-bucket tag.
//!
//! ```text
//!   63 ......... shard ... page ... bucket ... tag 0
//!   [ top log2(nshard) | log2(npage) | log2(nbucket) | 8 ]
//! ```
//!
//! The hash must be identical across processes and platforms since it is
//! baked into the on-disk layout; xxh64 with a zero seed is used everywhere.

use xxhash_rust::xxh64::xxh64;

/// Stable 64-bit hash of a key. All layers use this and nothing else.
pub fn key_index_hash(key: &[u8]) -> u64 {
    xxh64(key, 0)
}

/// Low 8 bits: the tag compared before full keys inside a bucket.
pub fn hash_tag(hash: u64) -> u8 {
    (hash & 0xff) as u8
}

/// Bucket index within a page. `nbucket` must be a power of two.
pub fn bucket_index(hash: u64, nbucket: u32) -> u32 {
    debug_assert!(nbucket.is_power_of_two());
    ((hash >> 8) & (nbucket as u64 - 1)) as u32
}

/// Page index within a shard. `nbucket` and `npage` must be powers of two.
pub fn page_index(hash: u64, nbucket: u32, npage: u32) -> u32 {
    debug_assert!(nbucket.is_power_of_two() && npage.is_power_of_two());
    let shift = 8 + nbucket.trailing_zeros();
    ((hash >> shift) & (npage as u64 - 1)) as u32
}

/// Shard index from the top bits. `nshard` must be a power of two.
pub fn shard_index(hash: u64, nshard: u32) -> u32 {
    debug_assert!(nshard.is_power_of_two());
    if nshard <= 1 {
        0
    } else {
        (hash >> (64 - nshard.trailing_zeros())) as u32
    }
}

/// Smallest power of two >= `v`, with `pow2_ceil(0) == 1`.
pub fn pow2_ceil(v: u64) -> u64 {
    v.max(1).next_power_of_two()
}

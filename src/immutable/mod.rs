//! Immutable index files (L1/L2): a sharded, paged, hash-addressed format.
//!
//! ## File layout
//!
//! ```text
//! +--------------------------------------------------+
//! | shard 0: [directory][page]...                    |
//! +--------------------------------------------------+
//! | ... shard S-1                                    |
//! +--------------------------------------------------+
//! | per-shard bloom filters (optional)               |
//! +--------------------------------------------------+
//! | ShardInfo[S]                                     |
//! +--------------------------------------------------+
//! | Footer                                           |
//! +--------------------------------------------------+
//! | footer_len:u32 | magic:u32                       |
//! +--------------------------------------------------+
//! ```
//!
//! A key's 64-bit hash addresses a *logical* bucket (shard, page, bucket
//! bits). The per-shard directory maps each logical bucket to the physical
//! page and slot that actually holds its records, which lets the writer shed
//! buckets from overflowing pages without breaking hash addressing. Lookups
//! cost one directory probe plus one page read.
//!
//! All integers are little-endian. The footer checksum covers every byte of
//! the file before the checksum field itself.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{Footer, ShardInfo, FORMAT_VERSION, INDEX_MAGIC, PAGE_SIZE};
pub use reader::ImmutableIndex;
pub use writer::{get_move_buckets, ImmutableIndexWriter, WriterResult};

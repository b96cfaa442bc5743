//! On-disk structures shared by the immutable reader and writer.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::types::IndexValue;

/// "PIDX" little-endian.
pub const INDEX_MAGIC: u32 = 0x5844_4950;
pub const FORMAT_VERSION: u32 = 5;
pub const PAGE_SIZE: usize = 4096;

/// Bytes per slot-table entry inside a page.
pub const SLOT_BYTES: usize = 6;
/// Bytes per directory entry (`page:u16, slot:u8, flags:u8`).
pub const DIR_ENTRY_BYTES: usize = 4;
/// Directory page id meaning "this logical bucket has no records".
pub const EMPTY_BUCKET_PAGE: u16 = u16::MAX;

/// Per-shard placement recorded before the footer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShardInfo {
    /// File offset of the shard's directory.
    pub offset: u64,
    /// Directory plus page bytes.
    pub size: u64,
    /// Physical page count (may differ from the logical page count).
    pub npage: u32,
    /// Records stored in this shard, tombstones included.
    pub nkeys: u64,
    pub bloom_offset: u64,
    pub bloom_size: u64,
}

impl ShardInfo {
    pub const ENCODED_LEN: usize = 8 + 8 + 4 + 8 + 8 + 8;

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u64::<LittleEndian>(self.size)?;
        w.write_u32::<LittleEndian>(self.npage)?;
        w.write_u64::<LittleEndian>(self.nkeys)?;
        w.write_u64::<LittleEndian>(self.bloom_offset)?;
        w.write_u64::<LittleEndian>(self.bloom_size)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            offset: r.read_u64::<LittleEndian>()?,
            size: r.read_u64::<LittleEndian>()?,
            npage: r.read_u32::<LittleEndian>()?,
            nkeys: r.read_u64::<LittleEndian>()?,
            bloom_offset: r.read_u64::<LittleEndian>()?,
            bloom_size: r.read_u64::<LittleEndian>()?,
        })
    }
}

/// Fixed trailer describing the whole file.
#[derive(Clone, Debug, PartialEq)]
pub struct Footer {
    pub format_version: u32,
    pub nshard: u32,
    /// Logical (hash-addressed) pages per shard.
    pub npage_per_shard: u32,
    pub page_size: u32,
    /// 0 means variable-length keys.
    pub key_size: u32,
    pub nbucket_per_page: u32,
    pub has_bloom: bool,
    /// crc32 of every file byte before this field.
    pub checksum: u32,
}

impl Footer {
    /// Encoded bytes including the checksum field.
    pub const ENCODED_LEN: usize = 4 * 6 + 1 + 4;

    /// Writes every field up to but excluding the checksum, which the writer
    /// appends after folding these bytes into the running crc.
    pub fn write_prefix<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.format_version)?;
        w.write_u32::<LittleEndian>(self.nshard)?;
        w.write_u32::<LittleEndian>(self.npage_per_shard)?;
        w.write_u32::<LittleEndian>(self.page_size)?;
        w.write_u32::<LittleEndian>(self.key_size)?;
        w.write_u32::<LittleEndian>(self.nbucket_per_page)?;
        w.write_u8(self.has_bloom as u8)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            format_version: r.read_u32::<LittleEndian>()?,
            nshard: r.read_u32::<LittleEndian>()?,
            npage_per_shard: r.read_u32::<LittleEndian>()?,
            page_size: r.read_u32::<LittleEndian>()?,
            key_size: r.read_u32::<LittleEndian>()?,
            nbucket_per_page: r.read_u32::<LittleEndian>()?,
            has_bloom: r.read_u8()? != 0,
            checksum: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Encoded length of one record in a page payload.
pub fn record_len(key_len: usize, key_size: usize) -> usize {
    if key_size > 0 {
        key_size + 8
    } else {
        1 + key_len + 8
    }
}

/// Appends one record to a payload buffer. Null values are stored as-is:
/// a retained tombstone masks older layers.
pub fn write_record(buf: &mut Vec<u8>, key: &[u8], value: IndexValue, key_size: usize) {
    if key_size == 0 {
        buf.push(key.len() as u8);
    }
    buf.extend_from_slice(key);
    buf.extend_from_slice(&value.get_value().to_le_bytes());
}

/// Walks `count` records of a bucket payload, yielding `(key, value)` pairs.
/// Returns an error on truncation.
pub fn scan_records<'a>(
    mut payload: &'a [u8],
    count: usize,
    key_size: usize,
    f: &mut dyn FnMut(&'a [u8], IndexValue) -> bool,
) -> Result<()> {
    for _ in 0..count {
        let key_len = if key_size > 0 {
            key_size
        } else {
            if payload.is_empty() {
                return Err(crate::errcorrupt!("record truncated"));
            }
            let len = payload[0] as usize;
            payload = &payload[1..];
            len
        };
        if payload.len() < key_len + 8 {
            return Err(crate::errcorrupt!("record truncated"));
        }
        let key = &payload[..key_len];
        let value = IndexValue(u64::from_le_bytes(
            payload[key_len..key_len + 8].try_into().unwrap(),
        ));
        payload = &payload[key_len + 8..];
        if !f(key, value) {
            break;
        }
    }
    Ok(())
}

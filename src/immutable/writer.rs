//! Builds an immutable index file from a set of entries.
//!
//! The writer buffers entries, then sizes the file (shard count, logical
//! pages, buckets per page) from the totals, packs each shard's pages in
//! hash order, and writes shard data, bloom filters, shard infos and the
//! footer with a running crc. Output is deterministic for a given input set
//! and sizing parameters.
//!
//! The file is written to `<path>.tmp` and fsynced; the caller renames it
//! into place when the owning version commits.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use itertools::Itertools;

use crate::bloom::BloomFilter;
use crate::error::Result;
use crate::failpoint;
use crate::hash::{bucket_index, hash_tag, key_index_hash, page_index, pow2_ceil, shard_index};
use crate::types::IndexValue;

use super::format::{
    record_len, write_record, Footer, ShardInfo, DIR_ENTRY_BYTES, EMPTY_BUCKET_PAGE,
    FORMAT_VERSION, INDEX_MAGIC, PAGE_SIZE, SLOT_BYTES,
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Target shard data size; the shard count is the smallest power of two that
/// keeps shards under this.
const SHARD_TARGET_BYTES: u64 = 4 * 1024 * 1024;
const MAX_SHARDS: u64 = 1024;
/// Pages are sized for ~75% expected occupancy.
const PAGE_FILL_NUM: usize = 3;
const PAGE_FILL_DEN: usize = 4;

/// Returns the smallest set of bucket indices whose record counts sum to at
/// least `target`, preferring fuller buckets and, among equals, lower
/// indices. Used to shed buckets from an overflowing page.
pub fn get_move_buckets(target: usize, bucket_packs_in_page: &[u8]) -> Vec<u8> {
    let mut order: Vec<usize> = (0..bucket_packs_in_page.len()).collect();
    order.sort_by(|&a, &b| {
        bucket_packs_in_page[b]
            .cmp(&bucket_packs_in_page[a])
            .then(a.cmp(&b))
    });
    let mut picked = Vec::new();
    let mut sum = 0usize;
    for i in order {
        if sum >= target {
            break;
        }
        sum += bucket_packs_in_page[i] as usize;
        picked.push(i as u8);
    }
    picked
}

/// Result handed back to the coordinator for installation at commit time.
#[derive(Debug)]
pub struct WriterResult {
    pub tmp_path: PathBuf,
    pub final_path: PathBuf,
    pub file_size: u64,
    pub nkeys: u64,
}

pub struct ImmutableIndexWriter {
    final_path: PathBuf,
    key_size: usize,
    entries: Vec<(Vec<u8>, IndexValue)>,
    total_kv_bytes: u64,
}

/// One logical bucket's records, staged for packing.
struct BucketData {
    /// Logical bucket id within the shard (`page * nbucket + bucket`).
    lb: u32,
    tags: Vec<u8>,
    payload: Vec<u8>,
}

impl BucketData {
    fn cost(&self) -> usize {
        self.tags.len() + self.payload.len()
    }
}

#[derive(Default)]
struct PageBuild {
    buckets: Vec<BucketData>,
    bytes: usize,
}

impl ImmutableIndexWriter {
    pub fn new(final_path: impl Into<PathBuf>, key_size: usize) -> Self {
        Self {
            final_path: final_path.into(),
            key_size,
            entries: Vec::new(),
            total_kv_bytes: 0,
        }
    }

    /// Stages one entry. Keys must be unique; null values are legitimate
    /// retained tombstones.
    pub fn add(&mut self, key: Vec<u8>, value: IndexValue) {
        self.total_kv_bytes += key.len() as u64 + 8;
        self.entries.push((key, value));
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_kv_bytes
    }

    /// Writes, checksums and fsyncs the file at `<final_path>.tmp`.
    pub fn finish(self) -> Result<WriterResult> {
        let tmp_path = tmp_path_for(&self.final_path);
        let key_size = self.key_size;
        let nkeys = self.entries.len() as u64;

        let nshard = pow2_ceil(self.total_kv_bytes / SHARD_TARGET_BYTES).min(MAX_SHARDS) as u32;
        let (nbucket, npage_logical) = size_pages(
            self.entries.len(),
            self.total_kv_bytes,
            nshard,
            key_size,
        );

        // Partition entries by shard.
        let mut shard_entries: Vec<Vec<(u64, Vec<u8>, IndexValue)>> =
            (0..nshard).map(|_| Vec::new()).collect();
        for (key, value) in self.entries {
            let hash = key_index_hash(&key);
            shard_entries[shard_index(hash, nshard) as usize].push((hash, key, value));
        }

        let write_bf = failpoint::write_index_bf();
        let file = File::create(&tmp_path)?;
        let mut out = CountingCrcWriter::new(BufWriter::new(file));

        // Shard data.
        let mut infos = Vec::with_capacity(nshard as usize);
        let mut blooms = Vec::with_capacity(nshard as usize);
        for entries in shard_entries {
            if write_bf {
                let mut bf = BloomFilter::with_expected_items(entries.len());
                for (_, key, _) in &entries {
                    bf.insert(key);
                }
                blooms.push(bf);
            }
            let info = write_shard(&mut out, entries, key_size, nbucket, npage_logical)?;
            infos.push(info);
        }

        // Bloom sections.
        if write_bf {
            for (info, bf) in infos.iter_mut().zip(blooms.iter()) {
                info.bloom_offset = out.offset();
                let encoded = bf.encode();
                out.write_all(&encoded)?;
                info.bloom_size = encoded.len() as u64;
            }
        }

        // Shard infos, then the footer with its trailing crc.
        for info in &infos {
            info.write_to(&mut out)?;
        }
        let footer = Footer {
            format_version: FORMAT_VERSION,
            nshard,
            npage_per_shard: npage_logical,
            page_size: PAGE_SIZE as u32,
            key_size: key_size as u32,
            nbucket_per_page: nbucket,
            has_bloom: write_bf,
            checksum: 0,
        };
        footer.write_prefix(&mut out)?;

        let (checksum, mut inner) = out.finish();
        inner.write_all(&checksum.to_le_bytes())?;
        let footer_len =
            (infos.len() * ShardInfo::ENCODED_LEN + Footer::ENCODED_LEN) as u32;
        inner.write_all(&footer_len.to_le_bytes())?;
        inner.write_all(&INDEX_MAGIC.to_le_bytes())?;
        inner.flush()?;
        let file = inner.into_inner().map_err(|e| crate::error::Error::IO(e.to_string()))?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();

        tracing::info!(
            path = %self.final_path.display(),
            nkeys,
            nshard,
            npage_per_shard = npage_logical,
            nbucket_per_page = nbucket,
            file_size,
            has_bloom = write_bf,
            "built immutable index file"
        );

        Ok(WriterResult {
            tmp_path,
            final_path: self.final_path,
            file_size,
            nkeys,
        })
    }
}

pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Chooses buckets-per-page from {16, 32, 64, 128} and the logical page
/// count so that expected page fill stays at or under 75%.
fn size_pages(nentry: usize, total_kv_bytes: u64, nshard: u32, key_size: usize) -> (u32, u32) {
    let avg_record = if nentry == 0 {
        record_len(key_size.max(8), key_size)
    } else {
        (total_kv_bytes as usize / nentry) + usize::from(key_size == 0)
    };
    // Records that fit a page at the target fill, net of a mid-sized slot
    // table; refined below once nbucket is known.
    let rough_per_page = (PAGE_SIZE * PAGE_FILL_NUM / PAGE_FILL_DEN) / avg_record.max(1);
    let nbucket = (pow2_ceil((rough_per_page / 4) as u64) as u32).clamp(16, 128);

    let usable = PAGE_SIZE - SLOT_BYTES * nbucket as usize;
    // Tag byte plus record per entry.
    let per_page = (usable * PAGE_FILL_NUM / PAGE_FILL_DEN) / (avg_record + 1).max(1);
    let per_shard = nentry.div_ceil(nshard as usize).max(1);
    let npage = pow2_ceil(per_shard.div_ceil(per_page.max(1)) as u64) as u32;
    (nbucket, npage)
}

/// Packs one shard's entries into pages and writes `[directory][pages...]`.
fn write_shard<W: Write>(
    out: &mut CountingCrcWriter<W>,
    mut entries: Vec<(u64, Vec<u8>, IndexValue)>,
    key_size: usize,
    nbucket: u32,
    npage_logical: u32,
) -> Result<ShardInfo> {
    let offset = out.offset();
    let nkeys = entries.len() as u64;

    // Hash order: logical page, bucket, then key for determinism.
    entries.sort_unstable_by(|a, b| {
        let ka = (
            page_index(a.0, nbucket, npage_logical),
            bucket_index(a.0, nbucket),
            &a.1,
        );
        let kb = (
            page_index(b.0, nbucket, npage_logical),
            bucket_index(b.0, nbucket),
            &b.1,
        );
        ka.cmp(&kb)
    });

    // Stage logical buckets.
    let mut buckets: Vec<BucketData> = Vec::new();
    for (lb, group) in &entries.iter().chunk_by(|(hash, _, _)| {
        page_index(*hash, nbucket, npage_logical) * nbucket + bucket_index(*hash, nbucket)
    }) {
        let mut data = BucketData {
            lb,
            tags: Vec::new(),
            payload: Vec::new(),
        };
        for (hash, key, value) in group {
            data.tags.push(hash_tag(*hash));
            write_record(&mut data.payload, key, *value, key_size);
        }
        if data.tags.len() > u8::MAX as usize {
            return Err(crate::error::Error::Internal(format!(
                "bucket holds {} records, exceeds format limit",
                data.tags.len()
            )));
        }
        buckets.push(data);
    }

    // Greedy packing with bucket shedding on overflow.
    let capacity = PAGE_SIZE - SLOT_BYTES * nbucket as usize;
    let mut pages: Vec<PageBuild> = Vec::new();
    let mut cur = PageBuild::default();
    for bucket in buckets {
        let cost = bucket.cost();
        if cost > capacity {
            return Err(crate::error::Error::Internal(
                "bucket larger than a page; sizing failed".to_string(),
            ));
        }
        if cur.buckets.len() < nbucket as usize && cur.bytes + cost <= capacity {
            cur.bytes += cost;
            cur.buckets.push(bucket);
            continue;
        }

        // Page overflow: shed the smallest set of buckets covering the
        // shortfall, measured in records at the page's mean record size.
        let mut carry: Vec<BucketData> = Vec::new();
        if !cur.buckets.is_empty() && cur.bytes + cost > capacity {
            let shortfall = cur.bytes + cost - capacity;
            let total_records: usize = cur.buckets.iter().map(|b| b.tags.len()).sum();
            let bytes_per_record = cur.bytes.div_ceil(total_records.max(1)).max(1);
            let target = shortfall.div_ceil(bytes_per_record);
            let packs: Vec<u8> = cur
                .buckets
                .iter()
                .map(|b| b.tags.len().min(u8::MAX as usize) as u8)
                .collect();
            let moved = get_move_buckets(target, &packs);
            let moved: std::collections::HashSet<usize> =
                moved.into_iter().map(|i| i as usize).collect();
            let mut kept = Vec::new();
            for (i, b) in cur.buckets.drain(..).enumerate() {
                if moved.contains(&i) {
                    carry.push(b);
                } else {
                    kept.push(b);
                }
            }
            cur.buckets = kept;
            cur.bytes = cur.buckets.iter().map(BucketData::cost).sum();
        }
        pages.push(std::mem::take(&mut cur));

        for b in carry.into_iter().chain(std::iter::once(bucket)) {
            let c = b.cost();
            if cur.buckets.len() >= nbucket as usize || cur.bytes + c > capacity {
                pages.push(std::mem::take(&mut cur));
            }
            cur.bytes += c;
            cur.buckets.push(b);
        }
    }
    if !cur.buckets.is_empty() {
        pages.push(cur);
    }
    if pages.len() >= EMPTY_BUCKET_PAGE as usize {
        return Err(crate::error::Error::Internal(format!(
            "shard needs {} pages, exceeds format limit",
            pages.len()
        )));
    }

    // Directory: logical bucket -> (physical page, slot).
    let nlb = (npage_logical * nbucket) as usize;
    let mut directory = vec![0u8; nlb * DIR_ENTRY_BYTES];
    for chunk in directory.chunks_exact_mut(DIR_ENTRY_BYTES) {
        chunk[..2].copy_from_slice(&EMPTY_BUCKET_PAGE.to_le_bytes());
    }
    for (page_idx, page) in pages.iter().enumerate() {
        for (slot_idx, bucket) in page.buckets.iter().enumerate() {
            let at = bucket.lb as usize * DIR_ENTRY_BYTES;
            directory[at..at + 2].copy_from_slice(&(page_idx as u16).to_le_bytes());
            directory[at + 2] = slot_idx as u8;
            directory[at + 3] = 0;
        }
    }
    out.write_all(&directory)?;

    // Pages: slot table up front, tags growing forward, payload packed
    // back-to-front.
    for page in &pages {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut tag_cursor = SLOT_BYTES * nbucket as usize;
        let mut payload_cursor = PAGE_SIZE;
        for (slot_idx, bucket) in page.buckets.iter().enumerate() {
            let slot_at = slot_idx * SLOT_BYTES;
            buf[slot_at..slot_at + 2].copy_from_slice(&(tag_cursor as u16).to_le_bytes());
            buf[tag_cursor..tag_cursor + bucket.tags.len()].copy_from_slice(&bucket.tags);
            tag_cursor += bucket.tags.len();

            payload_cursor -= bucket.payload.len();
            buf[slot_at + 2..slot_at + 4]
                .copy_from_slice(&(payload_cursor as u16).to_le_bytes());
            buf[payload_cursor..payload_cursor + bucket.payload.len()]
                .copy_from_slice(&bucket.payload);
            buf[slot_at + 4] = bucket.tags.len() as u8;
        }
        debug_assert!(tag_cursor <= payload_cursor);
        out.write_all(&buf)?;
    }

    Ok(ShardInfo {
        offset,
        size: out.offset() - offset,
        npage: pages.len() as u32,
        nkeys,
        bloom_offset: 0,
        bloom_size: 0,
    })
}

/// Writer adapter tracking the byte offset and a running crc32.
struct CountingCrcWriter<W: Write> {
    inner: W,
    digest: crc::Digest<'static, u32>,
    offset: u64,
}

impl<W: Write> CountingCrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
            offset: 0,
        }
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn finish(self) -> (u32, W) {
        (self.digest.finalize(), self.inner)
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Deduplicates newest-wins across layers before a rewrite: `layers` is
/// ordered oldest to newest.
pub fn merge_layers(
    layers: Vec<Vec<(Vec<u8>, IndexValue)>>,
    keep_tombstones: bool,
) -> Vec<(Vec<u8>, IndexValue)> {
    let mut merged: HashMap<Vec<u8>, IndexValue> = HashMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key, value);
        }
    }
    merged
        .into_iter()
        .filter(|(_, v)| keep_tombstones || !v.is_null())
        .collect()
}

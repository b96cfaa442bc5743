//! Read path for immutable index files.
//!
//! A loaded file is effectively read-only: lookups issue positioned reads
//! against the shared file handle and need no synchronization. Bloom filters
//! are held in memory and may be dropped under pressure; a filter that fails
//! its own checksum degrades to "no filter" with a warning instead of
//! failing the load.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crc::{Crc, CRC_32_ISCSI};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::hash::{bucket_index, hash_tag, page_index, shard_index};
use crate::types::{EditVersion, IndexValue, IoStat, KeysInfo};

use super::format::{
    scan_records, Footer, ShardInfo, DIR_ENTRY_BYTES, EMPTY_BUCKET_PAGE, FORMAT_VERSION,
    INDEX_MAGIC, PAGE_SIZE, SLOT_BYTES,
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct ImmutableIndex {
    file: File,
    path: PathBuf,
    version: EditVersion,
    file_len: u64,
    footer: Footer,
    shards: Vec<ShardInfo>,
    /// One optional filter per shard; empty when none are loaded.
    blooms: RwLock<Vec<Option<BloomFilter>>>,
    read_by_page: bool,
}

impl std::fmt::Debug for ImmutableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableIndex")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("nshard", &self.footer.nshard)
            .finish()
    }
}

impl ImmutableIndex {
    /// Opens and validates a file: magic, format version, full checksum.
    /// `load_bf` controls whether bloom sections are brought into memory.
    pub fn load(
        path: impl Into<PathBuf>,
        version: EditVersion,
        read_by_page: bool,
        load_bf: bool,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < 8 {
            return Err(crate::errcorrupt!(
                "immutable file {} too short",
                path.display()
            ));
        }

        let mut tail = [0u8; 8];
        file.read_exact_at(&mut tail, file_len - 8)?;
        let footer_len = u32::from_le_bytes(tail[..4].try_into().unwrap()) as u64;
        let magic = u32::from_le_bytes(tail[4..].try_into().unwrap());
        if magic != INDEX_MAGIC {
            return Err(crate::errcorrupt!(
                "bad magic {magic:#x} in {}",
                path.display()
            ));
        }
        if footer_len + 8 > file_len {
            return Err(crate::errcorrupt!(
                "footer length {footer_len} exceeds file size"
            ));
        }

        let section_start = file_len - 8 - footer_len;
        let mut section = vec![0u8; footer_len as usize];
        file.read_exact_at(&mut section, section_start)?;
        if footer_len < Footer::ENCODED_LEN as u64 {
            return Err(crate::errcorrupt!("footer truncated"));
        }
        let nshard_area = footer_len as usize - Footer::ENCODED_LEN;
        if nshard_area % ShardInfo::ENCODED_LEN != 0 {
            return Err(crate::errcorrupt!("misaligned shard info table"));
        }
        let mut cursor = &section[..];
        let mut shards = Vec::with_capacity(nshard_area / ShardInfo::ENCODED_LEN);
        for _ in 0..nshard_area / ShardInfo::ENCODED_LEN {
            shards.push(ShardInfo::read_from(&mut cursor)?);
        }
        let footer = Footer::read_from(&mut cursor)?;

        if footer.format_version != FORMAT_VERSION {
            return Err(crate::errcorrupt!(
                "unsupported format version {}",
                footer.format_version
            ));
        }
        if footer.page_size as usize != PAGE_SIZE {
            return Err(crate::errcorrupt!("unexpected page size {}", footer.page_size));
        }
        if footer.nshard as usize != shards.len() {
            return Err(crate::errcorrupt!(
                "shard count mismatch: footer {} vs table {}",
                footer.nshard,
                shards.len()
            ));
        }

        verify_checksum(&mut file, file_len, footer.checksum)?;

        let blooms = if footer.has_bloom && load_bf {
            let mut loaded = Vec::with_capacity(shards.len());
            let mut intact = true;
            for info in &shards {
                let mut buf = vec![0u8; info.bloom_size as usize];
                file.read_exact_at(&mut buf, info.bloom_offset)?;
                match BloomFilter::decode(&buf) {
                    Ok(bf) => loaded.push(Some(bf)),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "dropping unreadable bloom filter"
                        );
                        intact = false;
                        break;
                    }
                }
            }
            if intact {
                loaded
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            file,
            path,
            version,
            file_len,
            footer,
            shards,
            blooms: RwLock::new(blooms),
            read_by_page,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> EditVersion {
        self.version
    }

    pub fn file_size(&self) -> u64 {
        self.file_len
    }

    /// Shard data bytes, excluding blooms and trailers.
    pub fn data_size(&self) -> u64 {
        self.shards.iter().map(|s| s.size).sum::<u64>()
    }

    /// Records stored, tombstones included.
    pub fn total_keys(&self) -> u64 {
        self.shards.iter().map(|s| s.nkeys).sum()
    }

    pub fn has_bf(&self) -> bool {
        !self.blooms.read().unwrap().is_empty()
    }

    /// Releases bloom filters under memory pressure.
    pub fn drop_bf(&self) {
        self.blooms.write().unwrap().clear();
    }

    pub fn bf_memory_usage(&self) -> usize {
        self.blooms
            .read()
            .unwrap()
            .iter()
            .flatten()
            .map(|b| b.memory_usage())
            .sum()
    }

    /// Probes the positions in `keys_info`. Hits (including retained
    /// tombstones) are written to `values` and reported in `found`; misses
    /// leave `values` untouched.
    pub fn get(
        &self,
        keys: &[Vec<u8>],
        keys_info: &KeysInfo,
        values: &mut [IndexValue],
        found: &mut KeysInfo,
        mut stat: Option<&mut IoStat>,
    ) -> Result<()> {
        let nshard = self.footer.nshard;
        // Partition the probe set by shard so each shard's data is visited
        // once.
        let mut by_shard: Vec<Vec<(u32, u64)>> = vec![Vec::new(); nshard as usize];
        for &(idx, hash) in &keys_info.key_infos {
            by_shard[shard_index(hash, nshard) as usize].push((idx, hash));
        }

        let blooms = self.blooms.read().unwrap();
        for (shard_idx, probes) in by_shard.iter().enumerate() {
            if probes.is_empty() {
                continue;
            }
            let info = &self.shards[shard_idx];
            let mut remaining: Vec<(u32, u64)> = Vec::with_capacity(probes.len());
            if let Some(Some(bf)) = blooms.get(shard_idx) {
                for &(idx, hash) in probes {
                    if bf.may_contain(&keys[idx as usize]) {
                        remaining.push((idx, hash));
                    } else if let Some(stat) = stat.as_deref_mut() {
                        stat.filtered_kv_cnt += 1;
                    }
                }
            } else {
                remaining.extend_from_slice(probes);
            }
            if remaining.is_empty() {
                continue;
            }

            if self.read_by_page {
                self.get_in_shard_by_page(info, &remaining, keys, values, found, &mut stat)?;
            } else {
                self.get_in_shard_buffered(info, &remaining, keys, values, found, &mut stat)?;
            }
        }
        Ok(())
    }

    /// Returns `AlreadyExists` if any probed key has a live record here.
    pub fn check_not_exist(&self, keys: &[Vec<u8>]) -> Result<()> {
        let mut keys_info = KeysInfo::default();
        for (i, key) in keys.iter().enumerate() {
            keys_info.push(i as u32, crate::hash::key_index_hash(key));
        }
        let mut values = vec![crate::types::NULL_INDEX_VALUE; keys.len()];
        let mut found = KeysInfo::default();
        self.get(keys, &keys_info, &mut values, &mut found, None)?;
        for &(idx, _) in &found.key_infos {
            if !values[idx as usize].is_null() {
                return Err(Error::AlreadyExists(format!(
                    "key at position {idx} already exists"
                )));
            }
        }
        Ok(())
    }

    fn dir_len(&self) -> u64 {
        (self.footer.npage_per_shard * self.footer.nbucket_per_page) as u64
            * DIR_ENTRY_BYTES as u64
    }

    fn get_in_shard_by_page(
        &self,
        info: &ShardInfo,
        probes: &[(u32, u64)],
        keys: &[Vec<u8>],
        values: &mut [IndexValue],
        found: &mut KeysInfo,
        stat: &mut Option<&mut IoStat>,
    ) -> Result<()> {
        let nbucket = self.footer.nbucket_per_page;
        let npage = self.footer.npage_per_shard;
        let pages_base = info.offset + self.dir_len();
        for &(idx, hash) in probes {
            let lb = page_index(hash, nbucket, npage) * nbucket + bucket_index(hash, nbucket);
            let mut entry = [0u8; DIR_ENTRY_BYTES];
            self.file
                .read_exact_at(&mut entry, info.offset + lb as u64 * DIR_ENTRY_BYTES as u64)?;
            if let Some(stat) = stat.as_deref_mut() {
                stat.read_io_cnt += 1;
            }
            let page = u16::from_le_bytes(entry[..2].try_into().unwrap());
            if page == EMPTY_BUCKET_PAGE {
                continue;
            }
            let slot = entry[2];
            let mut page_buf = vec![0u8; PAGE_SIZE];
            self.file
                .read_exact_at(&mut page_buf, pages_base + page as u64 * PAGE_SIZE as u64)?;
            if let Some(stat) = stat.as_deref_mut() {
                stat.read_io_cnt += 1;
            }
            if let Some(value) =
                search_page(&page_buf, slot, hash, &keys[idx as usize], self.footer.key_size)?
            {
                values[idx as usize] = value;
                found.push(idx, hash);
            }
        }
        Ok(())
    }

    fn get_in_shard_buffered(
        &self,
        info: &ShardInfo,
        probes: &[(u32, u64)],
        keys: &[Vec<u8>],
        values: &mut [IndexValue],
        found: &mut KeysInfo,
        stat: &mut Option<&mut IoStat>,
    ) -> Result<()> {
        let nbucket = self.footer.nbucket_per_page;
        let npage = self.footer.npage_per_shard;
        let mut shard_buf = vec![0u8; info.size as usize];
        self.file.read_exact_at(&mut shard_buf, info.offset)?;
        if let Some(stat) = stat.as_deref_mut() {
            stat.read_io_cnt += 1;
        }
        let dir_len = self.dir_len() as usize;
        for &(idx, hash) in probes {
            let lb =
                (page_index(hash, nbucket, npage) * nbucket + bucket_index(hash, nbucket)) as usize;
            let at = lb * DIR_ENTRY_BYTES;
            let page = u16::from_le_bytes(shard_buf[at..at + 2].try_into().unwrap());
            if page == EMPTY_BUCKET_PAGE {
                continue;
            }
            let slot = shard_buf[at + 2];
            let page_at = dir_len + page as usize * PAGE_SIZE;
            let page_buf = &shard_buf[page_at..page_at + PAGE_SIZE];
            if let Some(value) =
                search_page(page_buf, slot, hash, &keys[idx as usize], self.footer.key_size)?
            {
                values[idx as usize] = value;
                found.push(idx, hash);
            }
        }
        Ok(())
    }

    /// Visits every record in the file, shard by shard. Used by merges and
    /// compactions; the visit order is the writer's packing order.
    pub fn each_entry(&self, f: &mut dyn FnMut(&[u8], IndexValue)) -> Result<()> {
        let nbucket = self.footer.nbucket_per_page as usize;
        let key_size = self.footer.key_size as usize;
        let dir_len = self.dir_len() as usize;
        for info in &self.shards {
            let mut shard_buf = vec![0u8; info.size as usize];
            self.file.read_exact_at(&mut shard_buf, info.offset)?;
            let pages = &shard_buf[dir_len..];
            for page_idx in 0..info.npage as usize {
                let page = &pages[page_idx * PAGE_SIZE..(page_idx + 1) * PAGE_SIZE];
                for slot_idx in 0..nbucket {
                    let slot_at = slot_idx * SLOT_BYTES;
                    let count = page[slot_at + 4] as usize;
                    if count == 0 {
                        continue;
                    }
                    let payload_off =
                        u16::from_le_bytes(page[slot_at + 2..slot_at + 4].try_into().unwrap())
                            as usize;
                    scan_records(&page[payload_off..], count, key_size, &mut |key, value| {
                        f(key, value);
                        true
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Collects every record into memory; rewrites go through this.
    pub fn load_entries(&self) -> Result<Vec<(Vec<u8>, IndexValue)>> {
        let mut out = Vec::with_capacity(self.total_keys() as usize);
        self.each_entry(&mut |key, value| out.push((key.to_vec(), value)))?;
        Ok(out)
    }
}

/// Scans one bucket of a page for `key`, comparing tags before full keys.
fn search_page(
    page: &[u8],
    slot: u8,
    hash: u64,
    key: &[u8],
    key_size: u32,
) -> Result<Option<IndexValue>> {
    let slot_at = slot as usize * SLOT_BYTES;
    if slot_at + SLOT_BYTES > page.len() {
        return Err(crate::errcorrupt!("slot index out of page bounds"));
    }
    let tag_off = u16::from_le_bytes(page[slot_at..slot_at + 2].try_into().unwrap()) as usize;
    let payload_off =
        u16::from_le_bytes(page[slot_at + 2..slot_at + 4].try_into().unwrap()) as usize;
    let count = page[slot_at + 4] as usize;
    if tag_off + count > page.len() || payload_off > page.len() {
        return Err(crate::errcorrupt!("bucket offsets out of page bounds"));
    }
    let tag = hash_tag(hash);
    let tags = &page[tag_off..tag_off + count];

    let mut result = None;
    let mut record_idx = 0usize;
    scan_records(
        &page[payload_off..],
        count,
        key_size as usize,
        &mut |record_key, value| {
            if tags[record_idx] == tag && record_key == key {
                result = Some(value);
                record_idx += 1;
                false
            } else {
                record_idx += 1;
                true
            }
        },
    )?;
    Ok(result)
}

fn verify_checksum(file: &mut File, file_len: u64, expected: u32) -> Result<()> {
    // The checksum covers everything before its own field: the last 12 bytes
    // are checksum, footer_len and magic.
    let covered = file_len - 12;
    let mut digest = CRC32.digest();
    let mut remaining = covered;
    let mut buf = vec![0u8; 64 * 1024];
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(0))?;
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..chunk])?;
        digest.update(&buf[..chunk]);
        remaining -= chunk as u64;
    }
    let computed = digest.finalize();
    if computed != expected {
        return Err(crate::errcorrupt!(
            "immutable file checksum mismatch: computed {computed:#x}, stored {expected:#x}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::writer::ImmutableIndexWriter;
    use super::*;
    use crate::tmpfs::TempDir;
    use crate::types::NULL_INDEX_VALUE;

    fn build_file(
        dir: &TempDir,
        name: &str,
        key_size: usize,
        entries: &[(Vec<u8>, IndexValue)],
    ) -> PathBuf {
        let path = dir.path().join(name);
        let mut writer = ImmutableIndexWriter::new(&path, key_size);
        for (key, value) in entries {
            writer.add(key.clone(), *value);
        }
        let result = writer.finish().expect("writer finish");
        std::fs::rename(&result.tmp_path, &result.final_path).expect("rename");
        path
    }

    fn probe_all(
        index: &ImmutableIndex,
        keys: &[Vec<u8>],
        stat: Option<&mut IoStat>,
    ) -> (Vec<IndexValue>, KeysInfo) {
        let mut keys_info = KeysInfo::default();
        for (i, key) in keys.iter().enumerate() {
            keys_info.push(i as u32, crate::hash::key_index_hash(key));
        }
        let mut values = vec![NULL_INDEX_VALUE; keys.len()];
        let mut found = KeysInfo::default();
        index
            .get(keys, &keys_info, &mut values, &mut found, stat)
            .expect("get");
        (values, found)
    }

    #[test]
    fn test_write_and_read_fixlen() {
        const N: u64 = 10000;
        let dir = TempDir::new().expect("temp dir");
        let entries: Vec<(Vec<u8>, IndexValue)> = (0..N)
            .map(|i| (i.to_le_bytes().to_vec(), IndexValue(i * 2)))
            .collect();
        let path = build_file(&dir, "index.l1.1.0", 8, &entries);

        for read_by_page in [true, false] {
            let index = ImmutableIndex::load(&path, EditVersion::new(1, 0), read_by_page, true)
                .expect("load");
            assert_eq!(index.total_keys(), N);
            let keys: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.clone()).collect();
            let (values, found) = probe_all(&index, &keys, None);
            assert_eq!(found.size(), N as usize);
            for (i, value) in values.iter().enumerate() {
                assert_eq!(*value, IndexValue(i as u64 * 2));
            }

            // Missing keys resolve to the null sentinel and are not found.
            let missing: Vec<Vec<u8>> = (N..N + 100).map(|i| i.to_le_bytes().to_vec()).collect();
            let (values, found) = probe_all(&index, &missing, None);
            assert!(found.is_empty());
            assert!(values.iter().all(|v| v.is_null()));
        }
    }

    #[test]
    fn test_write_and_read_varlen() {
        const N: usize = 5000;
        let dir = TempDir::new().expect("temp dir");
        let entries: Vec<(Vec<u8>, IndexValue)> = (0..N)
            .map(|i| {
                (
                    format!("test_varlen_{i}").into_bytes(),
                    IndexValue(i as u64),
                )
            })
            .collect();
        let path = build_file(&dir, "index.l1.2.0", 0, &entries);
        let index =
            ImmutableIndex::load(&path, EditVersion::new(2, 0), true, true).expect("load");
        let keys: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.clone()).collect();
        let (values, found) = probe_all(&index, &keys, None);
        assert_eq!(found.size(), N);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(*value, IndexValue(i as u64));
        }
    }

    #[test]
    fn test_retained_tombstone_is_found() {
        let dir = TempDir::new().expect("temp dir");
        let entries = vec![
            (b"live_key".to_vec(), IndexValue(7)),
            (b"dead_key".to_vec(), NULL_INDEX_VALUE),
        ];
        let path = build_file(&dir, "index.l1.3.0", 0, &entries);
        let index =
            ImmutableIndex::load(&path, EditVersion::new(3, 0), true, true).expect("load");
        let keys = vec![b"live_key".to_vec(), b"dead_key".to_vec()];
        let (values, found) = probe_all(&index, &keys, None);
        // The tombstone is found (it must mask older layers) but carries the
        // null value, so it does not count as existing.
        assert_eq!(found.size(), 2);
        assert_eq!(values[0], IndexValue(7));
        assert!(values[1].is_null());
        assert!(index.check_not_exist(&[b"dead_key".to_vec()]).is_ok());
        assert!(index.check_not_exist(&keys).is_err());
    }

    #[test]
    fn test_bloom_filters_reject_absent_keys() {
        const N: usize = 100;
        let dir = TempDir::new().expect("temp dir");
        let entries: Vec<(Vec<u8>, IndexValue)> = (0..N)
            .map(|i| (format!("present_{i}").into_bytes(), IndexValue(i as u64)))
            .collect();
        let path = build_file(&dir, "index.l1.4.0", 0, &entries);
        let index =
            ImmutableIndex::load(&path, EditVersion::new(4, 0), true, true).expect("load");
        assert!(index.has_bf());

        let absent: Vec<Vec<u8>> = (0..N).map(|i| format!("absent_{i}").into_bytes()).collect();
        let mut stat = IoStat::default();
        let (_, found) = probe_all(&index, &absent, Some(&mut stat));
        assert!(found.is_empty());
        assert!(stat.filtered_kv_cnt > 0, "bloom filtered nothing");

        // No false negatives: probing present keys filters nothing.
        let present: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut stat = IoStat::default();
        let (_, found) = probe_all(&index, &present, Some(&mut stat));
        assert_eq!(found.size(), N);
        assert_eq!(stat.filtered_kv_cnt, 0);

        index.drop_bf();
        assert!(!index.has_bf());
        let (_, found) = probe_all(&index, &present, None);
        assert_eq!(found.size(), N);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = TempDir::new().expect("temp dir");
        let entries: Vec<(Vec<u8>, IndexValue)> = (0..100u64)
            .map(|i| (i.to_le_bytes().to_vec(), IndexValue(i)))
            .collect();
        let path = build_file(&dir, "index.l1.5.0", 8, &entries);

        let mut raw = std::fs::read(&path).expect("read");
        let mid = raw.len() / 3;
        raw[mid] ^= 0x40;
        std::fs::write(&path, &raw).expect("write");

        let err =
            ImmutableIndex::load(&path, EditVersion::new(5, 0), true, true).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)), "got {err:?}");
    }

    #[test]
    fn test_each_entry_visits_everything() {
        const N: u64 = 3000;
        let dir = TempDir::new().expect("temp dir");
        let entries: Vec<(Vec<u8>, IndexValue)> = (0..N)
            .map(|i| (i.to_le_bytes().to_vec(), IndexValue(i + 1)))
            .collect();
        let path = build_file(&dir, "index.l1.6.0", 8, &entries);
        let index =
            ImmutableIndex::load(&path, EditVersion::new(6, 0), true, true).expect("load");

        let mut collected = index.load_entries().expect("load entries");
        collected.sort();
        let mut expected = entries.clone();
        expected.sort();
        assert_eq!(collected, expected);
    }
}

//! The index coordinator: one mutable L0 over a stack of immutable layers.
//!
//! ## Write protocol
//!
//! A write batch runs `prepare(version)` → mutations → `commit(&mut meta)` →
//! `on_commited()`. Mutations land in L0 immediately and are recorded for
//! the version's WAL group. `commit` decides durability for the version:
//! append a WAL group, rewrite the snapshot, or flush L0 into an immutable
//! layer; it builds any new files (fsynced, at temporary names) and fills the
//! caller's descriptor. `on_commited` renames the new files into place and
//! installs the new layer stack. Files replaced by a commit are left on disk
//! and reclaimed on the next `load`, so a crash at any point leaves the last
//! persisted descriptor loadable.
//!
//! ## Read path
//!
//! `get` consults L0 first; unresolved positions fall through the immutable
//! layers newest-first (tmp-L1s, then L1, then L2s), with per-shard bloom
//! filters skipping layers that cannot contain a key. A found record stops
//! the descent even when it is a retained tombstone.
//!
//! ## Flush policy
//!
//! On commit, with `m = l0.memory_usage()`:
//! - `m < l0_min_mem_usage`: keep L0, rewriting the snapshot if the WAL has
//!   outgrown `l0_snapshot_size`.
//! - no L1 yet: flush L0 into a fresh L1.
//! - `m * l0_l1_merge_ratio > size(L1-like layers)`: merge L0 with L1 and
//!   the tmp-L1s into a replacement L1 (or directly into a new L2 when the
//!   result would exceed `l0_max_file_size`).
//! - otherwise: flush L0 into a tmp-L1; once more than `max_tmp_l1_num`
//!   would accumulate, merge L1 + tmp-L1s + L0 into a new L2 instead
//!   ("flush advance").
//!
//! Writers are serialized by exclusive access to the index (`&mut self`);
//! reads share `&self` and synchronize only on the L0 shard locks.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::immutable::writer::merge_layers;
use crate::immutable::{ImmutableIndex, ImmutableIndexWriter, FORMAT_VERSION};
use crate::memory::MemTracker;
use crate::meta::{IndexMeta, L0Meta, WalMeta};
use crate::mutable::MutableIndex;
use crate::types::{
    EditVersion, EditVersionWithMerge, IndexValue, IoStat, KeysInfo, NULL_INDEX_VALUE,
};
use crate::wal::{IndexFile, LogRecord};

const LOCK_FILE: &str = "index.lock";

pub fn l0_file_path(dir: &Path, version: EditVersion) -> PathBuf {
    dir.join(format!("index.l0.{}.{}", version.major, version.minor))
}

pub fn l1_file_path(dir: &Path, version: EditVersion) -> PathBuf {
    dir.join(format!("index.l1.{}.{}", version.major, version.minor))
}

pub fn l2_file_path(dir: &Path, version: EditVersion, merged: bool) -> PathBuf {
    let suffix = if merged { ".merged" } else { "" };
    dir.join(format!(
        "index.l2.{}.{}{}",
        version.major, version.minor, suffix
    ))
}

/// In-flight write batch between `prepare` and `commit`.
struct Batch {
    version: EditVersion,
    records: Vec<LogRecord>,
}

enum CommitAction {
    /// WAL group already appended (buffered); fsync on `on_commited`.
    AppendWal,
    /// Full L0 dump written to a new file; swap handles on `on_commited`.
    RewriteSnapshot { new_file: IndexFile },
    /// L0 (possibly merged with L1-like layers) written as an immutable
    /// file; install on `on_commited`.
    Flush {
        kind: FlushKind,
        tmp_path: PathBuf,
        final_path: PathBuf,
        new_l0: IndexFile,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FlushKind {
    /// First flush: L0 becomes the L1.
    NewL1,
    /// L0 + L1 + tmp-L1s rewritten into a replacement L1.
    ReplaceL1,
    /// L0 alone becomes another tmp-L1.
    TmpL1,
    /// L0 + L1 + tmp-L1s promoted into a new L2.
    AdvanceL2,
}

struct PendingCommit {
    version: EditVersion,
    l0_meta: L0Meta,
    action: CommitAction,
}

/// Layer counts and sizes for monitoring.
#[derive(Clone, Debug)]
pub struct IndexMetrics {
    pub version: EditVersion,
    pub size: u64,
    pub usage: u64,
    pub l0_memory: usize,
    pub tmp_l1_count: usize,
    pub has_l1: bool,
    pub l2_count: usize,
    pub bf_memory: usize,
}

pub struct PersistentIndex {
    config: IndexConfig,
    tracker: Arc<MemTracker>,
    _lock: FileLock,
    key_size: usize,
    version: EditVersion,
    size: u64,
    usage: u64,
    l0: MutableIndex,
    l0_meta: L0Meta,
    index_file: Option<IndexFile>,
    l1: Option<Arc<ImmutableIndex>>,
    /// Oldest first.
    tmp_l1: Vec<Arc<ImmutableIndex>>,
    /// Oldest first, parallel to `l2_versions`.
    l2: Vec<Arc<ImmutableIndex>>,
    l2_versions: Vec<EditVersionWithMerge>,
    batch: Option<Batch>,
    pending: Option<PendingCommit>,
}

impl std::fmt::Debug for PersistentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentIndex")
            .field("dir", &self.config.dir)
            .field("version", &self.version)
            .field("size", &self.size)
            .finish()
    }
}

impl PersistentIndex {
    /// Binds an index to its directory with an unlimited memory budget.
    pub fn new(config: IndexConfig) -> Result<Self> {
        let label = format!("pindex:{}", config.dir.display());
        Self::new_with_tracker(config, Arc::new(MemTracker::unlimited(label)))
    }

    /// Binds an index to its directory under an engine-supplied tracker.
    pub fn new_with_tracker(config: IndexConfig, tracker: Arc<MemTracker>) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        let l0 = MutableIndex::create(0, 0, tracker.clone())?;
        Ok(Self {
            config,
            tracker,
            _lock: lock,
            key_size: 0,
            version: EditVersion::default(),
            size: 0,
            usage: 0,
            l0,
            l0_meta: L0Meta::default(),
            index_file: None,
            l1: None,
            tmp_l1: Vec::new(),
            l2: Vec::new(),
            l2_versions: Vec::new(),
            batch: None,
            pending: None,
        })
    }

    /// Creates the on-disk state of a fresh, empty index and returns its
    /// descriptor. The engine persists the descriptor and then `load`s it.
    pub fn init_empty(dir: &Path, key_size: usize, version: EditVersion) -> Result<IndexMeta> {
        fs::create_dir_all(dir)?;
        let mut meta = IndexMeta::init(key_size, version);
        let mut file = IndexFile::create(l0_file_path(dir, version))?;
        meta.l0_meta.snapshot_size = file.dump_snapshot(version, key_size, &[])?;
        file.sync()?;
        Ok(meta)
    }

    /// Reconstructs the layer stack from a descriptor and replays the WAL.
    /// A failed load leaves the instance unusable; callers construct a new
    /// one.
    pub fn load(&mut self, meta: &IndexMeta) -> Result<()> {
        if meta.l0_meta.format_version != FORMAT_VERSION {
            return Err(crate::errcorrupt!(
                "unsupported index format version {}",
                meta.l0_meta.format_version
            ));
        }
        self.key_size = meta.key_size as usize;
        self.version = meta.version;
        self.size = meta.size;
        self.usage = meta.usage;
        self.batch = None;
        self.pending = None;

        // L0: snapshot plus WAL groups named by the descriptor.
        let l0_path = l0_file_path(&self.config.dir, meta.l0_meta.snapshot_version);
        let mut file = IndexFile::open(&l0_path)?;
        let (snap_version, records, consumed) = file.load_snapshot(self.key_size)?;
        if snap_version != meta.l0_meta.snapshot_version {
            return Err(crate::errcorrupt!(
                "snapshot version {snap_version} does not match descriptor {}",
                meta.l0_meta.snapshot_version
            ));
        }
        if consumed != meta.l0_meta.snapshot_size {
            return Err(crate::errcorrupt!(
                "snapshot length {consumed} does not match descriptor {}",
                meta.l0_meta.snapshot_size
            ));
        }
        self.l0 = MutableIndex::create(self.key_size, consumed as usize, self.tracker.clone())?;
        for record in records {
            self.l0.replay_op(&record.key, record.value)?;
        }
        for wal in &meta.l0_meta.wals {
            let (group_version, records) =
                file.read_group(wal.offset, wal.size, self.key_size)?;
            if group_version != wal.version || group_version > meta.version {
                return Err(crate::errcorrupt!(
                    "wal group version {group_version} out of range"
                ));
            }
            for record in records {
                self.l0.replay_op(&record.key, record.value)?;
            }
        }
        self.l0_meta = meta.l0_meta.clone();
        self.index_file = Some(file);

        // Immutable layers.
        let read_by_page = self.config.enable_read_by_page;
        self.l1 = match meta.l1_version {
            Some(version) => Some(Arc::new(ImmutableIndex::load(
                l1_file_path(&self.config.dir, version),
                version,
                read_by_page,
                true,
            )?)),
            None => None,
        };
        self.tmp_l1 = meta
            .tmp_l1_versions
            .iter()
            .map(|&version| {
                Ok(Arc::new(ImmutableIndex::load(
                    l1_file_path(&self.config.dir, version),
                    version,
                    read_by_page,
                    true,
                )?))
            })
            .collect::<Result<_>>()?;
        if meta.l2_versions.len() != meta.l2_version_merged.len() {
            return Err(crate::errcorrupt!("descriptor l2 lists out of sync"));
        }
        self.l2 = meta
            .l2_versions
            .iter()
            .zip(meta.l2_version_merged.iter())
            .map(|(&version, &merged)| {
                Ok(Arc::new(ImmutableIndex::load(
                    l2_file_path(&self.config.dir, version, merged),
                    version,
                    read_by_page,
                    true,
                )?))
            })
            .collect::<Result<_>>()?;
        self.l2_versions = meta
            .l2_versions
            .iter()
            .zip(meta.l2_version_merged.iter())
            .map(|(&version, &merged)| EditVersionWithMerge { version, merged })
            .collect();

        self.reclaim_garbage(meta);

        tracing::info!(
            dir = %self.config.dir.display(),
            version = %self.version,
            size = self.size,
            l0_entries = self.l0.entry_count(),
            has_l1 = self.l1.is_some(),
            tmp_l1 = self.tmp_l1.len(),
            l2 = self.l2.len(),
            "loaded persistent index"
        );
        Ok(())
    }

    /// Removes index files in the directory that the descriptor no longer
    /// references: artifacts replaced by earlier commits or compactions.
    fn reclaim_garbage(&self, meta: &IndexMeta) {
        let mut referenced: HashSet<PathBuf> = HashSet::new();
        referenced.insert(l0_file_path(
            &self.config.dir,
            meta.l0_meta.snapshot_version,
        ));
        if let Some(version) = meta.l1_version {
            referenced.insert(l1_file_path(&self.config.dir, version));
        }
        for &version in &meta.tmp_l1_versions {
            referenced.insert(l1_file_path(&self.config.dir, version));
        }
        for (&version, &merged) in meta.l2_versions.iter().zip(meta.l2_version_merged.iter()) {
            referenced.insert(l2_file_path(&self.config.dir, version, merged));
        }

        let entries = match fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with("index.l") || name == LOCK_FILE || referenced.contains(&path) {
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to reclaim index file");
            } else {
                tracing::info!(path = %path.display(), "reclaimed unreferenced index file");
            }
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn version(&self) -> EditVersion {
        self.version
    }

    /// Live key count.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Approximate live key+value bytes.
    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn memory_usage(&self) -> usize {
        self.l0.memory_usage() + self.bf_memory_usage()
    }

    fn bf_memory_usage(&self) -> usize {
        self.layers_newest_first()
            .iter()
            .map(|l| l.bf_memory_usage())
            .sum()
    }

    pub fn has_bf(&self) -> bool {
        self.layers_newest_first().iter().any(|l| l.has_bf())
    }

    /// Drops bloom filters when the engine asks for memory back and the
    /// config does not pin them.
    pub fn evict_bf_under_pressure(&self) {
        if self.config.keep_index_bf {
            return;
        }
        for layer in self.layers_newest_first() {
            layer.drop_bf();
        }
    }

    pub fn metrics(&self) -> IndexMetrics {
        IndexMetrics {
            version: self.version,
            size: self.size,
            usage: self.usage,
            l0_memory: self.l0.memory_usage(),
            tmp_l1_count: self.tmp_l1.len(),
            has_l1: self.l1.is_some(),
            l2_count: self.l2.len(),
            bf_memory: self.bf_memory_usage(),
        }
    }

    pub fn need_major_compaction(&self) -> bool {
        self.l2.len() > self.config.max_allow_l2_num
    }

    fn layers_newest_first(&self) -> Vec<&ImmutableIndex> {
        let mut layers: Vec<&ImmutableIndex> = Vec::new();
        for tmp in self.tmp_l1.iter().rev() {
            layers.push(tmp.as_ref());
        }
        if let Some(l1) = self.l1.as_deref() {
            layers.push(l1);
        }
        for l2 in self.l2.iter().rev() {
            layers.push(l2.as_ref());
        }
        layers
    }

    /// Fills `values` for positions still unresolved after L0. A hit in a
    /// layer (including a retained tombstone) stops that key's descent.
    fn get_from_layers(
        &self,
        keys: &[Vec<u8>],
        values: &mut [IndexValue],
        mut remaining: KeysInfo,
        stat: &mut Option<&mut IoStat>,
    ) -> Result<()> {
        for layer in self.layers_newest_first() {
            if remaining.is_empty() {
                break;
            }
            let mut found = KeysInfo::default();
            layer.get(keys, &remaining, values, &mut found, stat.as_deref_mut())?;
            if !found.is_empty() {
                let hit: HashSet<u32> = found.key_infos.iter().map(|&(idx, _)| idx).collect();
                remaining.key_infos.retain(|&(idx, _)| !hit.contains(&idx));
            }
        }
        Ok(())
    }

    /// Opens a write batch at a strictly increasing version. `n_hint`
    /// reserves WAL capacity for the batch.
    pub fn prepare(&mut self, version: EditVersion, n_hint: usize) -> Result<()> {
        if version <= self.version {
            return Err(crate::errinput!(
                "prepare version {version} not greater than current {}",
                self.version
            ));
        }
        if self.batch.is_some() || self.pending.is_some() {
            return Err(Error::Internal(
                "previous batch has not finished committing".to_string(),
            ));
        }
        if self.index_file.is_none() {
            return Err(Error::Internal("index not loaded".to_string()));
        }
        self.batch = Some(Batch {
            version,
            records: Vec::with_capacity(n_hint),
        });
        self.version = version;
        Ok(())
    }

    fn batch_mut(&mut self) -> Result<&mut Batch> {
        self.batch
            .as_mut()
            .ok_or_else(|| Error::Internal("no prepared write batch".to_string()))
    }

    /// Point lookup across the whole stack.
    pub fn get(&self, keys: &[Vec<u8>], values: &mut [IndexValue]) -> Result<()> {
        self.get_with_stat(keys, values, None)
    }

    pub fn get_with_stat(
        &self,
        keys: &[Vec<u8>],
        values: &mut [IndexValue],
        mut stat: Option<&mut IoStat>,
    ) -> Result<()> {
        let idxes: Vec<usize> = (0..keys.len()).collect();
        let mut not_found = KeysInfo::default();
        let mut num_found = 0;
        self.l0
            .get(keys, values, &mut not_found, &mut num_found, &idxes)?;
        self.get_from_layers(keys, values, not_found, &mut stat)
    }

    /// Inserts new keys. With `check_l1`, the immutable layers are probed
    /// first and any live duplicate fails the whole batch.
    pub fn insert(
        &mut self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        check_l1: bool,
    ) -> Result<()> {
        self.batch_mut()?;
        if check_l1 {
            let mut current = vec![NULL_INDEX_VALUE; keys.len()];
            let mut probe = KeysInfo::default();
            for (i, key) in keys.iter().enumerate() {
                probe.push(i as u32, crate::hash::key_index_hash(key));
            }
            self.get_from_layers(keys, &mut current, probe, &mut None)?;
            if let Some(idx) = current.iter().position(|v| !v.is_null()) {
                return Err(Error::AlreadyExists(format!(
                    "key at position {idx} already exists in immutable layers"
                )));
            }
        }
        let idxes: Vec<usize> = (0..keys.len()).collect();
        self.l0.insert(keys, values, &idxes)?;
        let batch = self.batch_mut()?;
        for (key, value) in keys.iter().zip(values.iter()) {
            batch.records.push(LogRecord::upsert(key.clone(), *value));
        }
        self.size += keys.len() as u64;
        self.usage += keys.iter().map(|k| k.len() as u64 + 8).sum::<u64>();
        Ok(())
    }

    /// Writes values and reports each position's displaced value, consulting
    /// the full stack for keys L0 had never seen.
    pub fn upsert(
        &mut self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        old_values: &mut [IndexValue],
    ) -> Result<()> {
        self.upsert_with_stat(keys, values, old_values, None)
    }

    pub fn upsert_with_stat(
        &mut self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        old_values: &mut [IndexValue],
        mut stat: Option<&mut IoStat>,
    ) -> Result<()> {
        self.batch_mut()?;
        let idxes: Vec<usize> = (0..keys.len()).collect();
        let mut not_found = KeysInfo::default();
        let mut num_found = 0;
        self.l0
            .upsert(keys, values, old_values, &mut not_found, &mut num_found, &idxes)?;
        self.get_from_layers(keys, old_values, not_found, &mut stat)?;

        let batch = self.batch_mut()?;
        for (key, value) in keys.iter().zip(values.iter()) {
            batch.records.push(LogRecord::upsert(key.clone(), *value));
        }
        for (key, old) in keys.iter().zip(old_values.iter()) {
            if old.is_null() {
                self.size += 1;
                self.usage += key.len() as u64 + 8;
            }
        }
        Ok(())
    }

    /// Writes tombstones; `old_values` receives the displaced values.
    pub fn erase(
        &mut self,
        keys: &[Vec<u8>],
        old_values: &mut [IndexValue],
    ) -> Result<()> {
        self.batch_mut()?;
        let idxes: Vec<usize> = (0..keys.len()).collect();
        let mut not_found = KeysInfo::default();
        let mut num_found = 0;
        self.l0
            .erase(keys, old_values, &mut not_found, &mut num_found, &idxes)?;
        self.get_from_layers(keys, old_values, not_found, &mut None)?;

        let batch = self.batch_mut()?;
        for key in keys {
            batch.records.push(LogRecord::erase(key.clone()));
        }
        for (key, old) in keys.iter().zip(old_values.iter()) {
            if !old.is_null() {
                self.size = self.size.saturating_sub(1);
                self.usage = self.usage.saturating_sub(key.len() as u64 + 8);
            }
        }
        Ok(())
    }

    /// Unconditionally replaces the selected positions.
    pub fn replace(
        &mut self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        replace_idxes: &[usize],
    ) -> Result<()> {
        self.batch_mut()?;
        // Resolve prior presence for live-count accounting.
        let mut old_values = vec![NULL_INDEX_VALUE; keys.len()];
        let mut not_found = KeysInfo::default();
        let mut num_found = 0;
        self.l0.get(
            keys,
            &mut old_values,
            &mut not_found,
            &mut num_found,
            replace_idxes,
        )?;
        self.get_from_layers(keys, &mut old_values, not_found, &mut None)?;

        self.l0.replace(keys, values, replace_idxes)?;
        let batch = self.batch_mut()?;
        for &i in replace_idxes {
            batch.records.push(LogRecord::upsert(keys[i].clone(), values[i]));
        }
        for &i in replace_idxes {
            if old_values[i].is_null() {
                self.size += 1;
                self.usage += keys[i].len() as u64 + 8;
            }
        }
        Ok(())
    }

    /// Replaces only positions whose current value (from the full stack)
    /// still belongs to `src_rssid[i]`; the rest are reported in `failed`.
    pub fn try_replace(
        &mut self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        src_rssid: &[u32],
        failed: &mut Vec<usize>,
    ) -> Result<()> {
        self.batch_mut()?;
        let mut current = vec![NULL_INDEX_VALUE; keys.len()];
        self.get(keys, &mut current)?;
        let mut replace_idxes = Vec::new();
        for i in 0..keys.len() {
            if !current[i].is_null() && current[i].rssid() == src_rssid[i] {
                replace_idxes.push(i);
            } else {
                failed.push(i);
            }
        }
        self.l0.replace(keys, values, &replace_idxes)?;
        let batch = self.batch_mut()?;
        for &i in &replace_idxes {
            batch.records.push(LogRecord::upsert(keys[i].clone(), values[i]));
        }
        Ok(())
    }

    /// Seals the prepared version: decides between WAL append, snapshot
    /// rewrite and flush, builds any new files, and fills `meta`. Visible
    /// state is unchanged until `on_commited`. On error the caller discards
    /// the batch by re-`load`ing.
    pub fn commit(&mut self, meta: &mut IndexMeta) -> Result<()> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| Error::Internal("no prepared write batch".to_string()))?;
        let version = batch.version;

        let l0_mem = self.l0.memory_usage();
        let file_size = self.index_file.as_ref().map_or(0, |f| f.size());
        let need_flush = l0_mem >= self.config.l0_max_mem_usage
            || (l0_mem >= self.config.l0_min_mem_usage && self.tracker.limit_exceeded())
            || file_size > self.config.l0_max_file_size;

        let (l0_meta, action) = if need_flush {
            self.build_flush(version)?
        } else {
            let group_len: u64 = 24
                + batch
                    .records
                    .iter()
                    .map(|r| (r.key.len() + 16) as u64)
                    .sum::<u64>();
            if file_size + group_len > self.config.l0_snapshot_size {
                self.build_snapshot_rewrite(version)?
            } else {
                let key_size = self.key_size;
                let mut l0_meta = self.l0_meta.clone();
                let file = self
                    .index_file
                    .as_mut()
                    .ok_or_else(|| Error::Internal("index not loaded".to_string()))?;
                if !batch.records.is_empty() {
                    let (offset, size) = file.append_group(version, key_size, &batch.records)?;
                    l0_meta.wals.push(WalMeta {
                        version,
                        offset,
                        size,
                    });
                }
                (l0_meta, CommitAction::AppendWal)
            }
        };

        *meta = self.compose_meta(version, &l0_meta, &action);
        self.pending = Some(PendingCommit {
            version,
            l0_meta,
            action,
        });
        Ok(())
    }

    /// Builds the immutable artifact for a flushing commit plus the fresh
    /// (empty) L0 file for the new version.
    fn build_flush(&mut self, version: EditVersion) -> Result<(L0Meta, CommitAction)> {
        let have_l1_like = self.l1.is_some() || !self.tmp_l1.is_empty();
        let l0_mem = self.l0.memory_usage();
        let l1_like_bytes: u64 = self.l1.iter().map(|l| l.file_size()).sum::<u64>()
            + self.tmp_l1.iter().map(|l| l.file_size()).sum::<u64>();

        let kind = if !have_l1_like {
            FlushKind::NewL1
        } else if l0_mem * self.config.l0_l1_merge_ratio > l1_like_bytes as usize {
            if l0_mem as u64 + l1_like_bytes > self.config.l0_max_file_size {
                FlushKind::AdvanceL2
            } else {
                FlushKind::ReplaceL1
            }
        } else if self.tmp_l1.len() + 1 > self.config.max_tmp_l1_num {
            FlushKind::AdvanceL2
        } else {
            FlushKind::TmpL1
        };

        // A rewrite may drop tombstones only when no older layer survives
        // beneath the output.
        let (include_l1_like, keep_tombstones) = match kind {
            FlushKind::NewL1 => (false, !self.l2.is_empty()),
            FlushKind::ReplaceL1 => (true, !self.l2.is_empty()),
            FlushKind::TmpL1 => (false, true),
            FlushKind::AdvanceL2 => (true, !self.l2.is_empty()),
        };

        let mut layers: Vec<Vec<(Vec<u8>, IndexValue)>> = Vec::new();
        if include_l1_like {
            if let Some(l1) = &self.l1 {
                layers.push(l1.load_entries()?);
            }
            for tmp in &self.tmp_l1 {
                layers.push(tmp.load_entries()?);
            }
        }
        layers.push(self.l0.sorted_entries());
        let entries = merge_layers(layers, keep_tombstones);

        let final_path = match kind {
            FlushKind::AdvanceL2 => l2_file_path(&self.config.dir, version, false),
            _ => l1_file_path(&self.config.dir, version),
        };
        let mut writer = ImmutableIndexWriter::new(&final_path, self.key_size);
        for (key, value) in entries {
            writer.add(key, value);
        }
        let result = writer.finish()?;

        let mut new_l0 = IndexFile::create(l0_file_path(&self.config.dir, version))?;
        let snapshot_size = new_l0.dump_snapshot(version, self.key_size, &[])?;
        let l0_meta = L0Meta {
            format_version: FORMAT_VERSION,
            snapshot_version: version,
            snapshot_size,
            wals: Vec::new(),
        };

        tracing::info!(
            dir = %self.config.dir.display(),
            version = %version,
            kind = ?kind,
            l0_bytes = l0_mem,
            file_size = result.file_size,
            "flushing mutable index"
        );

        Ok((
            l0_meta,
            CommitAction::Flush {
                kind,
                tmp_path: result.tmp_path,
                final_path: result.final_path,
                new_l0,
            },
        ))
    }

    /// Dumps the whole of L0 into a fresh file at the new version, clearing
    /// the WAL list.
    fn build_snapshot_rewrite(&mut self, version: EditVersion) -> Result<(L0Meta, CommitAction)> {
        let entries = self.l0.sorted_entries();
        let mut new_file = IndexFile::create(l0_file_path(&self.config.dir, version))?;
        let snapshot_size = new_file.dump_snapshot(version, self.key_size, &entries)?;
        let l0_meta = L0Meta {
            format_version: FORMAT_VERSION,
            snapshot_version: version,
            snapshot_size,
            wals: Vec::new(),
        };
        tracing::info!(
            dir = %self.config.dir.display(),
            version = %version,
            entries = entries.len(),
            snapshot_size,
            "rewrote L0 snapshot"
        );
        Ok((l0_meta, CommitAction::RewriteSnapshot { new_file }))
    }

    /// Projects the post-commit descriptor without touching visible state.
    fn compose_meta(
        &self,
        version: EditVersion,
        l0_meta: &L0Meta,
        action: &CommitAction,
    ) -> IndexMeta {
        let mut meta = IndexMeta {
            key_size: self.key_size as u32,
            size: self.size,
            usage: self.usage,
            version,
            l0_meta: l0_meta.clone(),
            l1_version: self.l1.as_ref().map(|l| l.version()),
            tmp_l1_versions: self.tmp_l1.iter().map(|l| l.version()).collect(),
            l2_versions: self.l2_versions.iter().map(|v| v.version).collect(),
            l2_version_merged: self.l2_versions.iter().map(|v| v.merged).collect(),
        };
        if let CommitAction::Flush { kind, .. } = action {
            match kind {
                FlushKind::NewL1 | FlushKind::ReplaceL1 => {
                    meta.l1_version = Some(version);
                    meta.tmp_l1_versions.clear();
                }
                FlushKind::TmpL1 => meta.tmp_l1_versions.push(version),
                FlushKind::AdvanceL2 => {
                    meta.l1_version = None;
                    meta.tmp_l1_versions.clear();
                    meta.l2_versions.push(version);
                    meta.l2_version_merged.push(false);
                }
            }
        }
        meta
    }

    /// Makes the committed version durable and visible: fsync, rename new
    /// files into place, install the new layer stack. Files replaced here
    /// stay on disk until the next `load` reclaims them.
    pub fn on_commited(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::Internal("no committed batch pending".to_string()))?;

        match pending.action {
            CommitAction::AppendWal => {
                if let Some(file) = &self.index_file {
                    file.sync()?;
                }
            }
            CommitAction::RewriteSnapshot { new_file } => {
                new_file.sync()?;
                self.index_file = Some(new_file);
            }
            CommitAction::Flush {
                kind,
                tmp_path,
                final_path,
                new_l0,
            } => {
                new_l0.sync()?;
                fs::rename(&tmp_path, &final_path)?;
                let layer = Arc::new(ImmutableIndex::load(
                    &final_path,
                    pending.version,
                    self.config.enable_read_by_page,
                    true,
                )?);
                match kind {
                    FlushKind::NewL1 | FlushKind::ReplaceL1 => {
                        self.l1 = Some(layer);
                        self.tmp_l1.clear();
                    }
                    FlushKind::TmpL1 => self.tmp_l1.push(layer),
                    FlushKind::AdvanceL2 => {
                        self.l1 = None;
                        self.tmp_l1.clear();
                        self.l2.push(layer);
                        self.l2_versions.push(EditVersionWithMerge {
                            version: pending.version,
                            merged: false,
                        });
                    }
                }
                self.l0.clear();
                self.index_file = Some(new_l0);
            }
        }
        self.l0_meta = pending.l0_meta;
        Ok(())
    }

    /// Descriptor edit for a major compaction: the compacted input must be a
    /// contiguous prefix of the recorded L2 list; it is replaced by the
    /// merged version flagged as merged. Invalid input leaves the descriptor
    /// untouched.
    pub fn modify_l2_versions(
        input_versions: &[EditVersion],
        merged_version: EditVersion,
        meta: &mut IndexMeta,
    ) -> Result<()> {
        if input_versions.is_empty()
            || meta.l2_versions.is_empty()
            || input_versions.len() > meta.l2_versions.len()
        {
            return Err(crate::errinput!(
                "compaction input does not match descriptor l2 list"
            ));
        }
        for (input, recorded) in input_versions.iter().zip(meta.l2_versions.iter()) {
            if input != recorded {
                return Err(crate::errinput!(
                    "compaction input {input} is not a prefix of the l2 list"
                ));
            }
        }
        meta.l2_versions.drain(..input_versions.len());
        meta.l2_version_merged.drain(..input_versions.len());
        meta.l2_versions.insert(0, merged_version);
        meta.l2_version_merged.insert(0, true);
        Ok(())
    }

    /// Rewrites the oldest-prefix of L2 files (currently: all of them) into
    /// one merged L2 and edits the descriptor accordingly. Replaced files
    /// are reclaimed on the next `load`.
    pub fn major_compaction(&mut self, meta: &mut IndexMeta) -> Result<()> {
        if self.l2.len() < 2 {
            return Ok(());
        }
        let input_versions: Vec<EditVersion> =
            self.l2_versions.iter().map(|v| v.version).collect();
        let merged_version = *input_versions.last().expect("non-empty input");

        // Oldest to newest so the newest record for a key wins; nothing
        // older survives beneath the output, so tombstones drop out.
        let mut layers = Vec::with_capacity(self.l2.len());
        for l2 in &self.l2 {
            layers.push(l2.load_entries()?);
        }
        let entries = merge_layers(layers, false);

        let final_path = l2_file_path(&self.config.dir, merged_version, true);
        let mut writer = ImmutableIndexWriter::new(&final_path, self.key_size);
        for (key, value) in entries {
            writer.add(key, value);
        }
        let result = writer.finish()?;
        fs::rename(&result.tmp_path, &result.final_path)?;

        Self::modify_l2_versions(&input_versions, merged_version, meta)?;

        let layer = Arc::new(ImmutableIndex::load(
            &result.final_path,
            merged_version,
            self.config.enable_read_by_page,
            true,
        )?);
        self.l2 = vec![layer];
        self.l2_versions = vec![EditVersionWithMerge {
            version: merged_version,
            merged: true,
        }];

        tracing::info!(
            dir = %self.config.dir.display(),
            inputs = input_versions.len(),
            merged_version = %merged_version,
            file_size = result.file_size,
            "major compaction rewrote l2 files"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn varlen_keys(range: std::ops::Range<u64>) -> Vec<Vec<u8>> {
        range.map(|i| format!("test_varlen_{i}").into_bytes()).collect()
    }

    fn values(range: std::ops::Range<u64>) -> Vec<IndexValue> {
        range.map(IndexValue).collect()
    }

    fn open(dir: &Path, key_size: usize, tune: impl FnOnce(IndexConfig) -> IndexConfig) -> (PersistentIndex, IndexMeta) {
        let meta = PersistentIndex::init_empty(dir, key_size, EditVersion::new(0, 0)).expect("init");
        let mut index = PersistentIndex::new(tune(IndexConfig::new(dir))).expect("new");
        index.load(&meta).expect("load");
        (index, meta)
    }

    fn reopen(dir: &Path, meta: &IndexMeta, tune: impl FnOnce(IndexConfig) -> IndexConfig) -> PersistentIndex {
        let mut index = PersistentIndex::new(tune(IndexConfig::new(dir))).expect("new");
        index.load(meta).expect("reload");
        index
    }

    fn commit_batch(index: &mut PersistentIndex, meta: &mut IndexMeta) {
        index.commit(meta).expect("commit");
        index.on_commited().expect("on_commited");
    }

    #[test]
    fn test_insert_commit_reload() {
        const N: u64 = 10000;
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 0, |c| c);

        let keys = varlen_keys(0..N);
        let vals = values(0..N);
        index.prepare(EditVersion::new(1, 0), N as usize).expect("prepare");
        index.insert(&keys, &vals, false).expect("insert");
        commit_batch(&mut index, &mut meta);
        assert_eq!(index.size(), N);

        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        index.get(&keys, &mut got).expect("get");
        assert_eq!(got, vals);

        // A fresh process sees the committed state.
        drop(index);
        let reopened = reopen(dir.path(), &meta, |c| c);
        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        reopened.get(&keys, &mut got).expect("get after reload");
        assert_eq!(got, vals);
        assert_eq!(reopened.size(), N);
    }

    #[test]
    fn test_upsert_erase_across_commits() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 8, |c| c);
        let keys: Vec<Vec<u8>> = (0..100u64).map(|i| i.to_le_bytes().to_vec()).collect();

        index.prepare(EditVersion::new(1, 0), 100).expect("prepare");
        let mut old = vec![NULL_INDEX_VALUE; 100];
        index.upsert(&keys, &values(0..100), &mut old).expect("upsert");
        assert!(old.iter().all(|v| v.is_null()));
        commit_batch(&mut index, &mut meta);

        // Upsert over existing keys reports the displaced values.
        index.prepare(EditVersion::new(2, 0), 100).expect("prepare");
        let mut old = vec![NULL_INDEX_VALUE; 100];
        index.upsert(&keys, &values(100..200), &mut old).expect("upsert");
        for (i, v) in old.iter().enumerate() {
            assert_eq!(*v, IndexValue(i as u64));
        }
        commit_batch(&mut index, &mut meta);
        assert_eq!(index.size(), 100);

        // Erase half; reads return the sentinel until re-inserted.
        index.prepare(EditVersion::new(3, 0), 50).expect("prepare");
        let erase_keys: Vec<Vec<u8>> = keys[..50].to_vec();
        let mut old = vec![NULL_INDEX_VALUE; 50];
        index.erase(&erase_keys, &mut old).expect("erase");
        for (i, v) in old.iter().enumerate() {
            assert_eq!(*v, IndexValue(100 + i as u64));
        }
        commit_batch(&mut index, &mut meta);
        assert_eq!(index.size(), 50);

        let mut got = vec![NULL_INDEX_VALUE; 100];
        index.get(&keys, &mut got).expect("get");
        for (i, v) in got.iter().enumerate() {
            if i < 50 {
                assert!(v.is_null());
            } else {
                assert_eq!(*v, IndexValue(100 + i as u64));
            }
        }

        // WAL replay reproduces the same state.
        drop(index);
        let reopened = reopen(dir.path(), &meta, |c| c);
        let mut got = vec![NULL_INDEX_VALUE; 100];
        reopened.get(&keys, &mut got).expect("get");
        for (i, v) in got.iter().enumerate() {
            if i < 50 {
                assert!(v.is_null());
            } else {
                assert_eq!(*v, IndexValue(100 + i as u64));
            }
        }
    }

    #[test]
    fn test_snapshot_rewrite_when_wal_grows() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 8, |c| c.l0_snapshot_size(512));

        let mut version = 0;
        for batch in 0..20u64 {
            version += 1;
            let keys: Vec<Vec<u8>> = (batch * 10..(batch + 1) * 10)
                .map(|i| i.to_le_bytes().to_vec())
                .collect();
            index.prepare(EditVersion::new(version, 0), 10).expect("prepare");
            index.insert(&keys, &values(batch * 10..(batch + 1) * 10), false).expect("insert");
            commit_batch(&mut index, &mut meta);
        }
        // The tiny snapshot budget forces rewrites instead of an ever-growing
        // WAL list.
        assert!(meta.l0_meta.wals.len() <= 1);

        drop(index);
        let reopened = reopen(dir.path(), &meta, |c| c.l0_snapshot_size(512));
        let keys: Vec<Vec<u8>> = (0..200u64).map(|i| i.to_le_bytes().to_vec()).collect();
        let mut got = vec![NULL_INDEX_VALUE; 200];
        reopened.get(&keys, &mut got).expect("get");
        for (i, v) in got.iter().enumerate() {
            assert_eq!(*v, IndexValue(i as u64));
        }
    }

    #[test]
    fn test_flush_to_l1_and_reopen() {
        const N: u64 = 10000;
        let dir = TempDir::new().expect("temp dir");
        let tune = |c: IndexConfig| c.l0_max_mem_usage(10240);
        let (mut index, mut meta) = open(dir.path(), 0, tune);

        let keys = varlen_keys(0..N);
        let vals = values(0..N);
        let mut version = 0;
        for chunk in 0..10 {
            version += 1;
            let lo = chunk * 1000;
            let hi = lo + 1000;
            index.prepare(EditVersion::new(version, 0), 1000).expect("prepare");
            let mut old = vec![NULL_INDEX_VALUE; 1000];
            index.upsert(&keys[lo..hi], &vals[lo..hi], &mut old).expect("upsert");
            commit_batch(&mut index, &mut meta);
        }
        let metrics = index.metrics();
        assert!(metrics.has_l1 || metrics.tmp_l1_count > 0 || metrics.l2_count > 0);
        assert!(metrics.l0_memory < 10240 * 2);

        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        index.get(&keys, &mut got).expect("get");
        assert_eq!(got, vals);

        drop(index);
        let reopened = reopen(dir.path(), &meta, tune);
        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        reopened.get(&keys, &mut got).expect("get");
        assert_eq!(got, vals);
    }

    #[test]
    fn test_flush_advance_and_major_compaction() {
        const N: u64 = 10000;
        let dir = TempDir::new().expect("temp dir");
        let tune = |c: IndexConfig| {
            c.l0_max_mem_usage(2048)
                .l0_l1_merge_ratio(0)
                .max_tmp_l1_num(1)
        };
        let (mut index, mut meta) = open(dir.path(), 0, tune);

        let keys = varlen_keys(0..N);
        let vals = values(0..N);
        let mut version = 0;
        for chunk in 0..20 {
            version += 1;
            let lo = chunk * 500;
            let hi = lo + 500;
            index.prepare(EditVersion::new(version, 0), 500).expect("prepare");
            let mut old = vec![NULL_INDEX_VALUE; 500];
            index.upsert(&keys[lo..hi], &vals[lo..hi], &mut old).expect("upsert");
            commit_batch(&mut index, &mut meta);
        }
        assert!(index.metrics().l2_count >= 2, "wanted multiple l2 files, got {:?}", index.metrics());
        assert_eq!(meta.l2_versions.len(), index.metrics().l2_count);

        index.major_compaction(&mut meta).expect("major compaction");
        assert_eq!(meta.l2_versions.len(), 1);
        assert!(meta.l2_version_merged[0]);

        // Values are unchanged after compaction, in-process and after reload.
        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        index.get(&keys, &mut got).expect("get");
        assert_eq!(got, vals);

        drop(index);
        let reopened = reopen(dir.path(), &meta, tune);
        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        reopened.get(&keys, &mut got).expect("get");
        assert_eq!(got, vals);
    }

    #[test]
    fn test_erase_stays_masked_across_flushes() {
        let dir = TempDir::new().expect("temp dir");
        let tune = |c: IndexConfig| {
            c.l0_max_mem_usage(1024)
                .l0_l1_merge_ratio(0)
                .max_tmp_l1_num(1)
        };
        let (mut index, mut meta) = open(dir.path(), 0, tune);
        let keys = varlen_keys(0..200);

        index.prepare(EditVersion::new(1, 0), 200).expect("prepare");
        let mut old = vec![NULL_INDEX_VALUE; 200];
        index.upsert(&keys, &values(0..200), &mut old).expect("upsert");
        commit_batch(&mut index, &mut meta);

        // Erase the first half, then keep writing other keys so the
        // tombstones travel through several flushes.
        index.prepare(EditVersion::new(2, 0), 100).expect("prepare");
        let mut old = vec![NULL_INDEX_VALUE; 100];
        index.erase(&keys[..100], &mut old).expect("erase");
        commit_batch(&mut index, &mut meta);

        let more = varlen_keys(1000..1600);
        let mut version = 2;
        for chunk in 0..3 {
            version += 1;
            let lo = chunk * 200;
            let hi = lo + 200;
            index.prepare(EditVersion::new(version, 0), 200).expect("prepare");
            let mut old = vec![NULL_INDEX_VALUE; 200];
            index.upsert(&more[lo..hi], &values(0..200), &mut old).expect("upsert");
            commit_batch(&mut index, &mut meta);
        }

        let mut got = vec![NULL_INDEX_VALUE; 200];
        index.get(&keys, &mut got).expect("get");
        for (i, v) in got.iter().enumerate() {
            if i < 100 {
                assert!(v.is_null(), "erased key {i} resurfaced");
            } else {
                assert_eq!(*v, IndexValue(i as u64));
            }
        }

        drop(index);
        let reopened = reopen(dir.path(), &meta, tune);
        let mut got = vec![NULL_INDEX_VALUE; 200];
        reopened.get(&keys, &mut got).expect("get");
        for (i, v) in got.iter().enumerate() {
            if i < 100 {
                assert!(v.is_null(), "erased key {i} resurfaced after reload");
            } else {
                assert_eq!(*v, IndexValue(i as u64));
            }
        }
    }

    #[test]
    fn test_bloom_filter_filters_disjoint_probes() {
        const N: u64 = 100;
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 0, |c| c.l0_max_mem_usage(1));

        let keys = varlen_keys(0..N);
        index.prepare(EditVersion::new(1, 0), N as usize).expect("prepare");
        index.insert(&keys, &values(0..N), false).expect("insert");
        commit_batch(&mut index, &mut meta);
        assert!(index.has_bf());

        let disjoint = varlen_keys(100000..100000 + N);
        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        let mut stat = IoStat::default();
        index.get_with_stat(&disjoint, &mut got, Some(&mut stat)).expect("get");
        assert!(got.iter().all(|v| v.is_null()));
        assert!(stat.filtered_kv_cnt > 0, "bloom filtered nothing");

        let mut got = vec![NULL_INDEX_VALUE; N as usize];
        let mut stat = IoStat::default();
        index.get_with_stat(&keys, &mut got, Some(&mut stat)).expect("get");
        assert_eq!(got, values(0..N));
        assert_eq!(stat.filtered_kv_cnt, 0, "bloom produced a false negative");
    }

    #[test]
    fn test_prepare_version_monotonic() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 8, |c| c);

        index.prepare(EditVersion::new(1, 0), 1).expect("prepare");
        let keys = vec![1u64.to_le_bytes().to_vec()];
        index.insert(&keys, &[IndexValue(1)], false).expect("insert");
        commit_batch(&mut index, &mut meta);

        assert!(matches!(
            index.prepare(EditVersion::new(1, 0), 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(index.prepare(EditVersion::new(0, 5), 1).is_err());
        index.prepare(EditVersion::new(1, 1), 1).expect("prepare higher minor");
    }

    #[test]
    fn test_insert_checks_immutable_layers() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 0, |c| c.l0_max_mem_usage(1));
        let keys = varlen_keys(0..10);

        index.prepare(EditVersion::new(1, 0), 10).expect("prepare");
        index.insert(&keys, &values(0..10), false).expect("insert");
        commit_batch(&mut index, &mut meta);

        // The keys now live in an immutable layer; a checked insert fails.
        index.prepare(EditVersion::new(2, 0), 10).expect("prepare");
        assert!(matches!(
            index.insert(&keys, &values(10..20), true),
            Err(Error::AlreadyExists(_))
        ));
        commit_batch(&mut index, &mut meta);

        // After an erase flushes through, the tombstones mask the old values
        // and a checked insert succeeds again.
        index.prepare(EditVersion::new(3, 0), 10).expect("prepare");
        let mut old = vec![NULL_INDEX_VALUE; 10];
        index.erase(&keys, &mut old).expect("erase");
        commit_batch(&mut index, &mut meta);

        index.prepare(EditVersion::new(4, 0), 10).expect("prepare");
        index.insert(&keys, &values(20..30), true).expect("insert after erase");
        commit_batch(&mut index, &mut meta);

        let mut got = vec![NULL_INDEX_VALUE; 10];
        index.get(&keys, &mut got).expect("get");
        assert_eq!(got, values(20..30));
    }

    #[test]
    fn test_try_replace_conditional() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 8, |c| c.l0_max_mem_usage(1));
        let keys: Vec<Vec<u8>> = (0..10u64).map(|i| i.to_le_bytes().to_vec()).collect();
        let vals: Vec<IndexValue> = (0..10).map(|i| IndexValue::new(1, i)).collect();

        index.prepare(EditVersion::new(1, 0), 10).expect("prepare");
        index.insert(&keys, &vals, false).expect("insert");
        commit_batch(&mut index, &mut meta);

        // Current values live in an immutable layer now; the conditional
        // read must consult the full stack.
        index.prepare(EditVersion::new(2, 0), 10).expect("prepare");
        let new_vals: Vec<IndexValue> = (0..10).map(|i| IndexValue::new(2, i)).collect();
        let src_rssid: Vec<u32> = (0..10).map(|i| if i % 2 == 0 { 1 } else { 7 }).collect();
        let mut failed = Vec::new();
        index.try_replace(&keys, &new_vals, &src_rssid, &mut failed).expect("try_replace");
        assert_eq!(failed, vec![1, 3, 5, 7, 9]);
        commit_batch(&mut index, &mut meta);

        let mut got = vec![NULL_INDEX_VALUE; 10];
        index.get(&keys, &mut got).expect("get");
        for i in 0..10u32 {
            if i % 2 == 0 {
                assert_eq!(got[i as usize], IndexValue::new(2, i));
            } else {
                assert_eq!(got[i as usize], IndexValue::new(1, i));
            }
        }
    }

    #[test]
    fn test_modify_l2_versions_rules() {
        // (1,0) (1,1) (3,0) (4,1) (5,0); merge the first three into (3,0).
        let mut meta = IndexMeta {
            l2_versions: vec![
                EditVersion::new(1, 0),
                EditVersion::new(1, 1),
                EditVersion::new(3, 0),
                EditVersion::new(4, 1),
                EditVersion::new(5, 0),
            ],
            l2_version_merged: vec![false; 5],
            ..Default::default()
        };
        let input = vec![
            EditVersion::new(1, 0),
            EditVersion::new(1, 1),
            EditVersion::new(3, 0),
        ];
        PersistentIndex::modify_l2_versions(&input, *input.last().unwrap(), &mut meta)
            .expect("modify");
        assert_eq!(meta.l2_versions.len(), meta.l2_version_merged.len());
        assert_eq!(meta.l2_versions.len(), 3);
        assert_eq!(
            meta.l2_versions,
            vec![EditVersion::new(3, 0), EditVersion::new(4, 1), EditVersion::new(5, 0)]
        );
        assert!(meta.l2_version_merged[0]);
        assert!(!meta.l2_version_merged[1]);
        assert!(!meta.l2_version_merged[2]);

        // An emptied descriptor rejects the edit and stays untouched.
        meta.l2_versions.clear();
        meta.l2_version_merged.clear();
        assert!(
            PersistentIndex::modify_l2_versions(&input, *input.last().unwrap(), &mut meta)
                .is_err()
        );
        assert!(meta.l2_versions.is_empty());

        // A non-prefix input is rejected.
        let mut meta2 = IndexMeta {
            l2_versions: vec![EditVersion::new(2, 0), EditVersion::new(3, 0)],
            l2_version_merged: vec![false, false],
            ..Default::default()
        };
        let bad = vec![EditVersion::new(3, 0)];
        assert!(
            PersistentIndex::modify_l2_versions(&bad, EditVersion::new(3, 0), &mut meta2).is_err()
        );
        assert_eq!(meta2.l2_versions.len(), 2);
    }

    #[test]
    fn test_corrupt_l0_file_fails_load() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 8, |c| c);
        let keys: Vec<Vec<u8>> = (0..100u64).map(|i| i.to_le_bytes().to_vec()).collect();
        index.prepare(EditVersion::new(1, 0), 100).expect("prepare");
        index.insert(&keys, &values(0..100), false).expect("insert");
        commit_batch(&mut index, &mut meta);
        drop(index);

        let path = l0_file_path(dir.path(), meta.l0_meta.snapshot_version);
        let mut raw = std::fs::read(&path).expect("read");
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        std::fs::write(&path, &raw).expect("write");

        let mut broken = PersistentIndex::new(IndexConfig::new(dir.path())).expect("new");
        let err = broken.load(&meta).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)), "got {err:?}");
    }

    #[test]
    fn test_load_reports_memory_limit() {
        let dir = TempDir::new().expect("temp dir");
        let (mut index, mut meta) = open(dir.path(), 8, |c| c);
        let keys: Vec<Vec<u8>> = (0..1000u64).map(|i| i.to_le_bytes().to_vec()).collect();
        index.prepare(EditVersion::new(1, 0), 1000).expect("prepare");
        index.insert(&keys, &values(0..1000), false).expect("insert");
        commit_batch(&mut index, &mut meta);
        drop(index);

        let tracker = Arc::new(MemTracker::new("load_limit_test", 512));
        let mut limited =
            PersistentIndex::new_with_tracker(IndexConfig::new(dir.path()), tracker)
                .expect("new");
        let err = limited.load(&meta).unwrap_err();
        assert!(matches!(err, Error::MemLimitExceeded(_)), "got {err:?}");
    }

    #[test]
    fn test_double_open_refused() {
        let dir = TempDir::new().expect("temp dir");
        let (index, _meta) = open(dir.path(), 8, |c| c);
        assert!(PersistentIndex::new(IndexConfig::new(dir.path())).is_err());
        drop(index);
        assert!(PersistentIndex::new(IndexConfig::new(dir.path())).is_ok());
    }
}

//! The mutable index (L0): an in-memory sharded hash table of recent writes.
//!
//! L0 is authoritative for the most recent observed state of every key it
//! contains. An erase is stored as a tombstone entry carrying the null value
//! so that it masks live records in older immutable layers; a key with no
//! entry at all falls through to those layers.
//!
//! All operations are batched: callers pass parallel key/value arrays plus an
//! `idxes` list selecting the positions to touch, so a coordinator can route
//! subsets of a batch without copying.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::hash::{key_index_hash, pow2_ceil, shard_index};
use crate::memory::MemTracker;
use crate::types::{IndexValue, KeysInfo, NULL_INDEX_VALUE};

/// Target resident bytes per shard; the shard count is fixed at creation.
const SHARD_TARGET_BYTES: usize = 4 * 1024 * 1024;
const MAX_SHARDS: u64 = 256;

/// Fixed per-entry bookkeeping cost charged to the memory tracker on top of
/// the key bytes and the 8-byte value.
const ENTRY_OVERHEAD: usize = 16;

struct Shard {
    map: HashMap<Vec<u8>, IndexValue>,
    /// Key bytes resident in this shard.
    key_bytes: usize,
}

impl Shard {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            key_bytes: 0,
        }
    }

    fn entry_cost(key: &[u8]) -> usize {
        key.len() + 8 + ENTRY_OVERHEAD
    }
}

/// L0: sharded hash table of `key -> IndexValue`, tombstones included.
pub struct MutableIndex {
    key_size: usize,
    shards: Vec<RwLock<Shard>>,
    nshard: u32,
    tracker: Arc<MemTracker>,
}

impl MutableIndex {
    /// Creates an L0 sized for `expected_bytes` of resident data. `key_size`
    /// of zero selects variable-length keys.
    pub fn create(
        key_size: usize,
        expected_bytes: usize,
        tracker: Arc<MemTracker>,
    ) -> Result<Self> {
        if key_size > 255 {
            return Err(crate::errinput!("key size {key_size} out of range"));
        }
        let nshard =
            pow2_ceil((expected_bytes / SHARD_TARGET_BYTES) as u64).min(MAX_SHARDS) as u32;
        let shards = (0..nshard).map(|_| RwLock::new(Shard::new())).collect();
        Ok(Self {
            key_size,
            shards,
            nshard,
            tracker,
        })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    fn shard_for(&self, hash: u64) -> &RwLock<Shard> {
        &self.shards[shard_index(hash, self.nshard) as usize]
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if self.key_size > 0 && key.len() != self.key_size {
            return Err(crate::errinput!(
                "key length {} != fixed key size {}",
                key.len(),
                self.key_size
            ));
        }
        if self.key_size == 0 && key.len() > 128 {
            return Err(crate::errinput!("variable key length {} > 128", key.len()));
        }
        Ok(())
    }

    /// Inserts new keys. Fails with `AlreadyExists` on the first duplicate;
    /// positions handled before the duplicate stay inserted, which callers
    /// treat as fatal during bulk load.
    pub fn insert(
        &self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        idxes: &[usize],
    ) -> Result<()> {
        for &i in idxes {
            let key = &keys[i];
            self.check_key(key)?;
            let hash = key_index_hash(key);
            let mut guard = self.shard_for(hash).write()?;
            let shard = &mut *guard;
            match shard.map.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::AlreadyExists(format!(
                        "key at position {i} already exists"
                    )));
                }
                Entry::Vacant(e) => {
                    self.tracker.try_consume(Shard::entry_cost(key))?;
                    shard.key_bytes += key.len();
                    e.insert(values[i]);
                }
            }
        }
        Ok(())
    }

    /// Writes new values, reporting each position's prior value (or the null
    /// sentinel). `num_found` counts positions whose prior value was live.
    pub fn upsert(
        &self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        old_values: &mut [IndexValue],
        not_found: &mut KeysInfo,
        num_found: &mut usize,
        idxes: &[usize],
    ) -> Result<()> {
        for &i in idxes {
            let key = &keys[i];
            self.check_key(key)?;
            let hash = key_index_hash(key);
            let mut guard = self.shard_for(hash).write()?;
            let shard = &mut *guard;
            match shard.map.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    old_values[i] = *e.get();
                    if !e.get().is_null() {
                        *num_found += 1;
                    }
                    e.insert(values[i]);
                }
                Entry::Vacant(e) => {
                    self.tracker.try_consume(Shard::entry_cost(key))?;
                    shard.key_bytes += key.len();
                    e.insert(values[i]);
                    old_values[i] = NULL_INDEX_VALUE;
                    not_found.push(i as u32, hash);
                }
            }
        }
        Ok(())
    }

    /// Replaces existing entries with tombstones. Positions with no L0 entry
    /// are recorded in `not_found` so the coordinator can consult older
    /// layers for the displaced value.
    pub fn erase(
        &self,
        keys: &[Vec<u8>],
        old_values: &mut [IndexValue],
        not_found: &mut KeysInfo,
        num_found: &mut usize,
        idxes: &[usize],
    ) -> Result<()> {
        for &i in idxes {
            let key = &keys[i];
            self.check_key(key)?;
            let hash = key_index_hash(key);
            let mut guard = self.shard_for(hash).write()?;
            let shard = &mut *guard;
            match shard.map.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    old_values[i] = *e.get();
                    if !e.get().is_null() {
                        *num_found += 1;
                    }
                    e.insert(NULL_INDEX_VALUE);
                }
                Entry::Vacant(e) => {
                    self.tracker.try_consume(Shard::entry_cost(key))?;
                    shard.key_bytes += key.len();
                    e.insert(NULL_INDEX_VALUE);
                    old_values[i] = NULL_INDEX_VALUE;
                    not_found.push(i as u32, hash);
                }
            }
        }
        Ok(())
    }

    /// Point lookup. Tombstones are reported as found-with-null; only
    /// positions with no entry at all go to `not_found`.
    pub fn get(
        &self,
        keys: &[Vec<u8>],
        values: &mut [IndexValue],
        not_found: &mut KeysInfo,
        num_found: &mut usize,
        idxes: &[usize],
    ) -> Result<()> {
        for &i in idxes {
            let key = &keys[i];
            self.check_key(key)?;
            let hash = key_index_hash(key);
            let shard = self.shard_for(hash).read()?;
            match shard.map.get(key.as_slice()) {
                Some(v) => {
                    values[i] = *v;
                    if !v.is_null() {
                        *num_found += 1;
                    }
                }
                None => {
                    values[i] = NULL_INDEX_VALUE;
                    not_found.push(i as u32, hash);
                }
            }
        }
        Ok(())
    }

    /// Unconditional replace of the selected positions.
    pub fn replace(
        &self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        idxes: &[usize],
    ) -> Result<()> {
        for &i in idxes {
            let key = &keys[i];
            self.check_key(key)?;
            let hash = key_index_hash(key);
            let mut guard = self.shard_for(hash).write()?;
            let shard = &mut *guard;
            match shard.map.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    e.insert(values[i]);
                }
                Entry::Vacant(e) => {
                    self.tracker.try_consume(Shard::entry_cost(key))?;
                    shard.key_bytes += key.len();
                    e.insert(values[i]);
                }
            }
        }
        Ok(())
    }

    /// Replaces position `i` only if the current value's rowset id matches
    /// `src_rssid[i]`; mismatches (including absent keys) are recorded in
    /// `failed` and left unchanged.
    pub fn try_replace(
        &self,
        keys: &[Vec<u8>],
        values: &[IndexValue],
        src_rssid: &[u32],
        failed: &mut Vec<usize>,
    ) -> Result<()> {
        for i in 0..keys.len() {
            let key = &keys[i];
            self.check_key(key)?;
            let hash = key_index_hash(key);
            let mut shard = self.shard_for(hash).write()?;
            match shard.map.get_mut(key.as_slice()) {
                Some(v) if !v.is_null() && v.rssid() == src_rssid[i] => {
                    *v = values[i];
                }
                _ => failed.push(i),
            }
        }
        Ok(())
    }

    /// Applies one replayed log record: an upsert value or a tombstone.
    pub fn replay_op(&self, key: &[u8], value: IndexValue) -> Result<()> {
        self.check_key(key)?;
        let hash = key_index_hash(key);
        let mut guard = self.shard_for(hash).write()?;
        let shard = &mut *guard;
        match shard.map.entry(key.to_vec()) {
            Entry::Occupied(mut e) => {
                e.insert(value);
            }
            Entry::Vacant(e) => {
                self.tracker.try_consume(Shard::entry_cost(key))?;
                shard.key_bytes += key.len();
                e.insert(value);
            }
        }
        Ok(())
    }

    /// Resident bytes, as charged to the memory tracker.
    pub fn memory_usage(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let s = s.read().unwrap();
                s.key_bytes + s.map.len() * (8 + ENTRY_OVERHEAD)
            })
            .sum()
    }

    /// Number of entries, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().map.len()).sum()
    }

    /// Number of live (non-tombstone) entries.
    pub fn live_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .unwrap()
                    .map
                    .values()
                    .filter(|v| !v.is_null())
                    .count()
            })
            .sum()
    }

    /// Every entry, tombstones included, ordered by hash then key so that
    /// snapshot and flush output is deterministic.
    pub fn sorted_entries(&self) -> Vec<(Vec<u8>, IndexValue)> {
        let mut out = Vec::with_capacity(self.entry_count());
        for shard in &self.shards {
            let shard = shard.read().unwrap();
            out.extend(shard.map.iter().map(|(k, v)| (k.clone(), *v)));
        }
        out.sort_unstable_by(|a, b| {
            (key_index_hash(&a.0), a.0.as_slice()).cmp(&(key_index_hash(&b.0), b.0.as_slice()))
        });
        out
    }

    /// Drops every entry and releases the tracked memory.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.write().unwrap();
            let released = shard.key_bytes + shard.map.len() * (8 + ENTRY_OVERHEAD);
            self.tracker.release(released);
            shard.map.clear();
            shard.key_bytes = 0;
        }
    }
}

impl Drop for MutableIndex {
    fn drop(&mut self) {
        self.clear();
    }
}

//! Core value and version types shared by every layer of the index.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 64-bit handle owned by the surrounding storage engine. The high 32 bits
/// carry the rowset/segment id, the low 32 bits the row offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct IndexValue(pub u64);

/// Sentinel meaning "not present / tombstone".
pub const NULL_INDEX_VALUE: IndexValue = IndexValue(u64::MAX);

impl IndexValue {
    pub fn new(rssid: u32, rowid: u32) -> Self {
        IndexValue(((rssid as u64) << 32) | rowid as u64)
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_INDEX_VALUE
    }

    /// Rowset/segment id portion of the handle.
    pub fn rssid(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn get_value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for IndexValue {
    fn from(v: u64) -> Self {
        IndexValue(v)
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A `(major, minor)` version stamp, ordered lexicographically. Each commit
/// against the index carries a strictly increasing `EditVersion`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct EditVersion {
    pub major: i64,
    pub minor: i64,
}

impl EditVersion {
    pub fn new(major: i64, minor: i64) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for EditVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An `EditVersion` plus a flag recording whether the artifact it tags was
/// produced by a merge. Versions compare lexicographically; at equal version
/// the merged artifact sorts greater, which is what the layer retention logic
/// relies on when both a pre-merge and a post-merge file exist for the same
/// version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct EditVersionWithMerge {
    pub version: EditVersion,
    pub merged: bool,
}

impl EditVersionWithMerge {
    pub fn new(major: i64, minor: i64, merged: bool) -> Self {
        Self {
            version: EditVersion::new(major, minor),
            merged,
        }
    }
}

/// Key positions (index into the caller's batch plus the key's 64-bit hash)
/// that a layer could not resolve and that must be probed in older layers.
#[derive(Clone, Debug, Default)]
pub struct KeysInfo {
    /// `(position, hash)` pairs, in batch order.
    pub key_infos: Vec<(u32, u64)>,
}

impl KeysInfo {
    pub fn size(&self) -> usize {
        self.key_infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_infos.is_empty()
    }

    pub fn push(&mut self, idx: u32, hash: u64) {
        self.key_infos.push((idx, hash));
    }

    pub fn clear(&mut self) {
        self.key_infos.clear();
    }
}

/// IO counters accumulated by a read batch, used by callers to observe bloom
/// filter efficacy and read amplification.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoStat {
    /// Number of preads issued against immutable files.
    pub read_io_cnt: u64,
    /// Number of key positions rejected by a bloom filter without touching
    /// the shard data.
    pub filtered_kv_cnt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_version_ordering() {
        assert!(EditVersion::new(1, 0) < EditVersion::new(1, 1));
        assert!(EditVersion::new(1, 9) < EditVersion::new(2, 0));
        assert_eq!(EditVersion::new(3, 4), EditVersion::new(3, 4));
    }

    #[test]
    fn test_merged_version_ordering() {
        let m1 = EditVersionWithMerge::new(i64::MAX, i64::MAX, true);
        let m2 = EditVersionWithMerge::new(i64::MAX, i64::MAX, false);
        let m3 = EditVersionWithMerge::new(10, 0, true);
        let m4 = EditVersionWithMerge::new(10, 0, false);
        let m5 = EditVersionWithMerge::new(11, 0, true);
        let m6 = EditVersionWithMerge::new(11, 0, false);
        let m7 = EditVersionWithMerge::new(11, 1, true);
        let m8 = EditVersionWithMerge::new(11, 1, false);
        let m9 = EditVersionWithMerge::new(11, 2, true);
        let m10 = EditVersionWithMerge::new(11, 2, false);
        assert!(m2 < m1);
        assert!(!(m1 < m2));
        assert!(m3 < m2);
        assert!(!(m2 < m3));
        assert!(m4 < m3);
        assert!(!(m3 < m4));
        assert!(m3 < m6);
        assert!(!(m6 < m3));
        assert!(m6 < m5);
        assert!(!(m5 < m6));
        assert!(m5 < m7);
        assert!(m8 < m9);
        assert!(m10 < m9);
    }

    #[test]
    fn test_index_value_parts() {
        let v = IndexValue::new(7, 42);
        assert_eq!(v.rssid(), 7);
        assert_eq!(v.get_value() & 0xffff_ffff, 42);
        assert!(!v.is_null());
        assert!(NULL_INDEX_VALUE.is_null());
    }
}

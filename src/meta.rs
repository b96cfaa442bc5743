//! The persisted index descriptor.
//!
//! The surrounding engine stores this record next to the tablet metadata and
//! publishes it atomically; the index only fills it in during `commit` and
//! reads it back in `load`. Encoding must round-trip byte-identical, so the
//! descriptor is a plain serde struct serialized with bincode.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::immutable::FORMAT_VERSION;
use crate::types::EditVersion;

/// Placement of one WAL group inside the L0 file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalMeta {
    pub version: EditVersion,
    pub offset: u64,
    pub size: u64,
}

/// State needed to rebuild L0: the snapshot section plus the WAL groups
/// appended after it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct L0Meta {
    pub format_version: u32,
    /// Version naming the L0 file and its snapshot section.
    pub snapshot_version: EditVersion,
    /// Snapshot section length in bytes.
    pub snapshot_size: u64,
    pub wals: Vec<WalMeta>,
}

/// The full descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// 0 means variable-length keys.
    pub key_size: u32,
    /// Live key count.
    pub size: u64,
    /// Approximate live key+value bytes.
    pub usage: u64,
    /// Top committed version.
    pub version: EditVersion,
    pub l0_meta: L0Meta,
    pub l1_version: Option<EditVersion>,
    /// Flushed-but-unpromoted L1-format files, oldest first.
    pub tmp_l1_versions: Vec<EditVersion>,
    /// L2 files, oldest first; `l2_version_merged` runs parallel to it.
    pub l2_versions: Vec<EditVersion>,
    pub l2_version_merged: Vec<bool>,
}

impl IndexMeta {
    /// Fresh descriptor for an empty index starting at `version`.
    pub fn init(key_size: usize, version: EditVersion) -> Self {
        Self {
            key_size: key_size as u32,
            version,
            l0_meta: L0Meta {
                format_version: FORMAT_VERSION,
                snapshot_version: version,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip_byte_identical() {
        let meta = IndexMeta {
            key_size: 8,
            size: 12345,
            usage: 98765,
            version: EditVersion::new(7, 2),
            l0_meta: L0Meta {
                format_version: FORMAT_VERSION,
                snapshot_version: EditVersion::new(6, 0),
                snapshot_size: 4096,
                wals: vec![
                    WalMeta {
                        version: EditVersion::new(7, 0),
                        offset: 4096,
                        size: 100,
                    },
                    WalMeta {
                        version: EditVersion::new(7, 2),
                        offset: 4196,
                        size: 60,
                    },
                ],
            },
            l1_version: Some(EditVersion::new(5, 0)),
            tmp_l1_versions: vec![EditVersion::new(6, 0)],
            l2_versions: vec![EditVersion::new(1, 0), EditVersion::new(3, 0)],
            l2_version_merged: vec![true, false],
        };

        let encoded = meta.encode().expect("encode");
        let decoded = IndexMeta::decode(&encoded).expect("decode");
        assert_eq!(decoded, meta);
        let reencoded = decoded.encode().expect("re-encode");
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn test_meta_init() {
        let meta = IndexMeta::init(0, EditVersion::new(1, 0));
        assert_eq!(meta.key_size, 0);
        assert_eq!(meta.l0_meta.format_version, FORMAT_VERSION);
        assert_eq!(meta.l0_meta.snapshot_version, EditVersion::new(1, 0));
        assert!(meta.l0_meta.wals.is_empty());
        assert!(meta.l1_version.is_none());
    }
}

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one persistent index instance.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Directory holding the index files.
    pub dir: PathBuf,

    /// L0 resident size above which a flush happens when the memory tracker
    /// reports pressure (default: 8MB).
    pub l0_min_mem_usage: usize,

    /// L0 resident size above which a flush happens unconditionally
    /// (default: 100MB).
    pub l0_max_mem_usage: usize,

    /// Maximum size of the L0 snapshot+WAL artifact before a flush is forced
    /// (default: 200MB).
    pub l0_max_file_size: u64,

    /// WAL length at which the snapshot is rewritten instead of appending
    /// more groups (default: 16MB).
    pub l0_snapshot_size: u64,

    /// Flushing replaces L1 outright when `l0_size * ratio > l1_size`,
    /// otherwise a tmp-L1 is produced (default: 10).
    pub l0_l1_merge_ratio: usize,

    /// Number of tmp-L1 files that may accumulate before they are merged
    /// into a new L2 (default: 10).
    pub max_tmp_l1_num: usize,

    /// Number of L2 files above which a major compaction is requested
    /// (default: 5).
    pub max_allow_l2_num: usize,

    /// Recognized for descriptor compatibility; the current format stores
    /// pages uncompressed (default: false).
    pub enable_compression: bool,

    /// Serve immutable lookups with one pread per page instead of buffering
    /// the whole shard (default: true).
    pub enable_read_by_page: bool,

    /// Retain loaded bloom filters under memory pressure (default: true).
    pub keep_index_bf: bool,

    /// Overlap the bloom probe with the page read instead of short-circuiting
    /// on rejection; recognized for descriptor compatibility, the current
    /// read path always short-circuits (default: false).
    pub enable_parallel_get_and_bf: bool,

    /// Compaction manager settings.
    pub compaction: CompactionConfig,

    /// Publish-version reporting cadence (default: 1s).
    pub max_update_tablet_version_internal_ms: u64,
}

/// Settings consumed by the background compaction manager.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Concurrent major compactions allowed per data directory (default: 1).
    pub major_compaction_limit_per_disk: usize,

    /// How often candidate tablets are scheduled (default: 15s).
    pub major_compaction_schedule_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            l0_min_mem_usage: 8 * 1024 * 1024,
            l0_max_mem_usage: 100 * 1024 * 1024,
            l0_max_file_size: 200 * 1024 * 1024,
            l0_snapshot_size: 16 * 1024 * 1024,
            l0_l1_merge_ratio: 10,
            max_tmp_l1_num: 10,
            max_allow_l2_num: 5,
            enable_compression: false,
            enable_read_by_page: true,
            keep_index_bf: true,
            enable_parallel_get_and_bf: false,
            compaction: CompactionConfig::default(),
            max_update_tablet_version_internal_ms: 1000,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            major_compaction_limit_per_disk: 1,
            major_compaction_schedule_interval: Duration::from_secs(15),
        }
    }
}

impl IndexConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn l0_min_mem_usage(mut self, v: usize) -> Self {
        self.l0_min_mem_usage = v;
        self
    }

    pub fn l0_max_mem_usage(mut self, v: usize) -> Self {
        self.l0_max_mem_usage = v;
        self
    }

    pub fn l0_max_file_size(mut self, v: u64) -> Self {
        self.l0_max_file_size = v;
        self
    }

    pub fn l0_snapshot_size(mut self, v: u64) -> Self {
        self.l0_snapshot_size = v;
        self
    }

    pub fn l0_l1_merge_ratio(mut self, v: usize) -> Self {
        self.l0_l1_merge_ratio = v;
        self
    }

    pub fn max_tmp_l1_num(mut self, v: usize) -> Self {
        self.max_tmp_l1_num = v;
        self
    }

    pub fn max_allow_l2_num(mut self, v: usize) -> Self {
        self.max_allow_l2_num = v;
        self
    }

    pub fn enable_read_by_page(mut self, v: bool) -> Self {
        self.enable_read_by_page = v;
        self
    }

    pub fn keep_index_bf(mut self, v: bool) -> Self {
        self.keep_index_bf = v;
        self
    }

    pub fn compaction(mut self, v: CompactionConfig) -> Self {
        self.compaction = v;
        self
    }
}

impl CompactionConfig {
    pub fn major_compaction_limit_per_disk(mut self, v: usize) -> Self {
        self.major_compaction_limit_per_disk = v;
        self
    }

    pub fn major_compaction_schedule_interval(mut self, v: Duration) -> Self {
        self.major_compaction_schedule_interval = v;
        self
    }
}

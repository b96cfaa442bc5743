//! Background major-compaction scheduling.
//!
//! One manager per node tracks which tablets currently have a major
//! compaction running and how many run per data directory. A timer task
//! asks the engine for scored candidates, skips tablets that are already
//! running, migrating, or whose disk is at its concurrency cap, and submits
//! the rest to the worker pool. Completion (success or failure) releases the
//! tablet's slot.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CompactionConfig;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context, Scheduler};

/// A compaction candidate, ordered by descending score by the provider.
#[derive(Clone, Debug, PartialEq)]
pub struct TabletAndScore {
    pub tablet_id: u64,
    pub score: f64,
}

impl TabletAndScore {
    pub fn new(tablet_id: u64, score: f64) -> Self {
        Self { tablet_id, score }
    }
}

/// Engine-side knowledge the manager needs about tablets: where they live,
/// whether they are migrating, which are worth compacting, and how to run
/// one compaction.
#[async_trait::async_trait]
pub trait CompactionClient: Send + Sync {
    /// Scored candidates, sorted by descending score.
    fn pick_tablets(&self) -> Vec<TabletAndScore>;

    fn data_dir(&self, tablet_id: u64) -> PathBuf;

    fn is_migrating(&self, tablet_id: u64) -> bool;

    /// Runs the major compaction for one tablet.
    async fn compact(&self, tablet_id: u64) -> Result<()>;
}

#[derive(Default)]
struct RunningState {
    tablets: HashSet<u64>,
    per_dir: HashMap<PathBuf, usize>,
}

struct Inner {
    config: CompactionConfig,
    client: Arc<dyn CompactionClient>,
    running: Mutex<RunningState>,
}

/// Tracks running compactions and schedules new ones.
#[derive(Clone)]
pub struct CompactionManager {
    inner: Arc<Inner>,
}

impl CompactionManager {
    pub fn new(client: Arc<dyn CompactionClient>, config: CompactionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                running: Mutex::new(RunningState::default()),
            }),
        }
    }

    /// Registers the schedule timer; `schedule` then runs every
    /// `major_compaction_schedule_interval`.
    pub fn init(&self, scheduler: &Scheduler) {
        scheduler.register(Arc::new(ScheduleTask {
            manager: self.clone(),
        }));
    }

    pub fn mark_running(&self, tablet_id: u64, dir: &std::path::Path) {
        let mut state = self.inner.running.lock().unwrap();
        if state.tablets.insert(tablet_id) {
            *state.per_dir.entry(dir.to_path_buf()).or_insert(0) += 1;
        }
    }

    pub fn unmark_running(&self, tablet_id: u64, dir: &std::path::Path) {
        let mut state = self.inner.running.lock().unwrap();
        if state.tablets.remove(&tablet_id) {
            if let Some(count) = state.per_dir.get_mut(dir) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn is_running(&self, tablet_id: u64) -> bool {
        self.inner.running.lock().unwrap().tablets.contains(&tablet_id)
    }

    /// True iff the directory is at its concurrent-compaction cap.
    pub fn disk_limit(&self, dir: &std::path::Path) -> bool {
        let state = self.inner.running.lock().unwrap();
        state.per_dir.get(dir).copied().unwrap_or(0)
            >= self.inner.config.major_compaction_limit_per_disk
    }

    /// Walks the scored candidates and submits every eligible tablet. A
    /// migrating tablet is skipped without being marked running.
    pub fn schedule(&self, candidates: Vec<TabletAndScore>) {
        for candidate in candidates {
            let tablet_id = candidate.tablet_id;
            if self.is_running(tablet_id) {
                continue;
            }
            if self.inner.client.is_migrating(tablet_id) {
                tracing::info!(tablet_id, "skipping compaction for migrating tablet");
                continue;
            }
            let dir = self.inner.client.data_dir(tablet_id);
            if self.disk_limit(&dir) {
                tracing::debug!(tablet_id, dir = %dir.display(), "disk at compaction limit");
                continue;
            }

            self.mark_running(tablet_id, &dir);
            let manager = self.clone();
            tokio::spawn(async move {
                let result = manager.inner.client.compact(tablet_id).await;
                if let Err(e) = &result {
                    tracing::warn!(tablet_id, error = %e, "major compaction failed");
                }
                manager.unmark_running(tablet_id, &dir);
            });
        }
    }
}

struct ScheduleTask {
    manager: CompactionManager,
}

#[async_trait::async_trait]
impl BackgroundTask for ScheduleTask {
    fn name(&self) -> &'static str {
        "pindex-major-compaction"
    }

    fn interval(&self) -> Duration {
        self.manager.inner.config.major_compaction_schedule_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let candidates = self.manager.inner.client.pick_tablets();
        self.manager.schedule(candidates);
        Ok(())
    }
}

//! Publish-version coordination against applied tablet versions.
//!
//! The engine finishes a load task only once every participating tablet has
//! applied the required version. Tablets report progress through
//! [`AppliedVersionSource::max_readable_version`], which is monotonically
//! non-decreasing and only advances after the corresponding commit completes.
//! The manager batches finish tasks, re-checks readiness on a timer, and
//! dispatches callbacks on a dedicated worker pool that drains on shutdown.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context, Scheduler};

/// Engine-side view of each tablet's newest readable version.
pub trait AppliedVersionSource: Send + Sync {
    fn max_readable_version(&self, tablet_id: u64) -> i64;
}

pub type FinishCallback = Box<dyn FnOnce() + Send>;

struct FinishTask {
    /// `(tablet_id, required_version)` pairs the task waits on.
    tablet_versions: Vec<(u64, i64)>,
    callback: FinishCallback,
}

struct Inner {
    source: Arc<dyn AppliedVersionSource>,
    tasks: Mutex<HashMap<i64, FinishTask>>,
    pool: WorkerPool,
    update_interval: Duration,
}

/// Batches finish-task requests and reports them once applied.
#[derive(Clone)]
pub struct PublishVersionManager {
    inner: Arc<Inner>,
}

impl PublishVersionManager {
    /// `configured_threads` is a floor; the pool is sized
    /// `max(configured, min(cpu, 8))`.
    pub fn new(
        source: Arc<dyn AppliedVersionSource>,
        configured_threads: usize,
        update_interval_ms: u64,
    ) -> Self {
        let cpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let pool_size = configured_threads.max(cpu.min(8));
        Self {
            inner: Arc::new(Inner {
                source,
                tasks: Mutex::new(HashMap::new()),
                pool: WorkerPool::new(pool_size),
                update_interval: Duration::from_millis(update_interval_ms),
            }),
        }
    }

    /// Registers the readiness-check timer.
    pub fn init(&self, scheduler: &Scheduler) {
        scheduler.register(Arc::new(UpdateTask {
            manager: self.clone(),
        }));
    }

    /// Registers a finish task identified by `signature`. The callback runs
    /// once every tablet has applied its required version; readiness is
    /// checked immediately and again on every timer tick.
    pub fn finish_task(
        &self,
        signature: i64,
        tablet_versions: Vec<(u64, i64)>,
        callback: FinishCallback,
    ) {
        self.inner.tasks.lock().unwrap().insert(
            signature,
            FinishTask {
                tablet_versions,
                callback,
            },
        );
        self.update();
    }

    /// How many `(tablet, version)` requirements of the task are still
    /// unapplied. An absent signature has nothing left to apply and reports
    /// zero.
    pub fn left_task_applied(&self, signature: i64) -> usize {
        let tasks = self.inner.tasks.lock().unwrap();
        match tasks.get(&signature) {
            None => 0,
            Some(task) => task
                .tablet_versions
                .iter()
                .filter(|&&(tablet_id, version)| {
                    self.inner.source.max_readable_version(tablet_id) < version
                })
                .count(),
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    /// Dispatches every task whose requirements are all applied.
    pub fn update(&self) {
        let mut ready = Vec::new();
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let signatures: Vec<i64> = tasks
                .iter()
                .filter(|(_, task)| {
                    task.tablet_versions.iter().all(|&(tablet_id, version)| {
                        self.inner.source.max_readable_version(tablet_id) >= version
                    })
                })
                .map(|(&sig, _)| sig)
                .collect();
            for sig in signatures {
                if let Some(task) = tasks.remove(&sig) {
                    ready.push((sig, task));
                }
            }
        }
        for (signature, task) in ready {
            tracing::debug!(signature, "finish task ready, dispatching report");
            self.inner.pool.submit(task.callback);
        }
    }
}

struct UpdateTask {
    manager: PublishVersionManager,
}

#[async_trait::async_trait]
impl BackgroundTask for UpdateTask {
    fn name(&self) -> &'static str {
        "publish-version-update"
    }

    fn interval(&self) -> Duration {
        self.manager.inner.update_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.manager.update();
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size worker pool. Dropping it closes the queue; workers drain what
/// was already submitted before exiting.
struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || loop {
                    let job = receiver.lock().unwrap().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    fn submit(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

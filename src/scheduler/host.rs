use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::Result;

/// A leader-only loop body. Runs must be idempotent.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs: u64,
    pub failures: u64,
    /// Ticks dropped because the previous run was still going
    pub skipped: u64,
}

/// Shared, read-only view of every loop's status.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    inner: Arc<RwLock<BTreeMap<String, LoopStatus>>>,
}

impl SchedulerStatus {
    pub async fn snapshot(&self) -> BTreeMap<String, LoopStatus> {
        self.inner.read().await.clone()
    }

    async fn update(&self, name: &str, f: impl FnOnce(&mut LoopStatus)) {
        let mut inner = self.inner.write().await;
        f(inner.entry(name.to_string()).or_default());
    }
}

/// Clears the overlap flag when a run ends, including by panic or abort.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs registered [`PeriodicJob`]s on their own intervals while leadership is held.
///
/// A tick that finds the previous run of the same job still going is skipped.
/// A failing or panicking run is recorded and logged; it never stops sibling
/// loops.
pub struct JobSchedulerHost {
    jobs: Vec<Arc<dyn PeriodicJob>>,
    status: SchedulerStatus,
    clock: Arc<dyn Clock>,
}

impl JobSchedulerHost {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Vec::new(),
            status: SchedulerStatus::default(),
            clock,
        }
    }

    pub fn register(&mut self, job: Arc<dyn PeriodicJob>) {
        self.jobs.push(job);
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.clone()
    }

    /// Run all loops until `cancel` fires, then abort in-progress runs.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        for job in &self.jobs {
            self.status.update(job.name(), |_| {}).await;
            loops.spawn(run_loop(
                job.clone(),
                self.status.clone(),
                self.clock.clone(),
                cancel.clone(),
            ));
        }
        tracing::info!(loops = self.jobs.len(), "Scheduler host started");

        while let Some(res) = loops.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "Scheduler loop terminated abnormally");
            }
        }
        tracing::info!("Scheduler host stopped");
    }
}

async fn run_loop(
    job: Arc<dyn PeriodicJob>,
    status: SchedulerStatus,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let name = job.name();
    let running = Arc::new(AtomicBool::new(false));
    let mut ticker = tokio::time::interval(job.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut runs = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(guard) = RunGuard::try_acquire(&running) else {
                    tracing::debug!(job = name, "Previous run still in progress, tick skipped");
                    status.update(name, |s| s.skipped += 1).await;
                    continue;
                };
                let job = job.clone();
                let status = status.clone();
                let clock = clock.clone();
                runs.spawn(async move {
                    let _guard = guard;
                    let started = clock.now();
                    let res = job.run().await;
                    status
                        .update(name, |s| {
                            s.last_run = Some(started);
                            s.runs += 1;
                            match &res {
                                Ok(()) => {
                                    s.last_success = Some(started);
                                    s.last_error = None;
                                }
                                Err(e) => {
                                    s.failures += 1;
                                    s.last_error = Some(e.to_string());
                                }
                            }
                        })
                        .await;
                    match res {
                        Ok(()) => tracing::trace!(job = name, "Run finished"),
                        Err(e) => tracing::error!(job = name, error = %e, "Run failed"),
                    }
                });
            }
            Some(res) = runs.join_next() => {
                if let Err(e) = res {
                    tracing::error!(job = name, error = %e, "Run panicked");
                    status
                        .update(name, |s| {
                            s.failures += 1;
                            s.last_error = Some(format!("panicked: {}", e));
                        })
                        .await;
                }
            }
        }
    }

    runs.abort_all();
    tracing::debug!(job = name, "Loop stopped");
}

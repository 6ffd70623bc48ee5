//! Trigger loop that fires jobs on a schedule.
//!
//! The trigger owns overlap prevention: a tick that finds
//! `max_concurrent_runs` jobs already in flight is skipped rather than
//! queued, and missed ticks are coalesced into a single firing unless
//! configured otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::calendar::{daily_fires_between, next_daily_fire, Schedule, TimeOfDay};
use crate::error::Result;

/// Work fired by a [`Trigger`].
#[async_trait]
pub trait Job: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run once. `cancel` fires when the trigger shuts down.
    async fn execute(&self, cancel: CancellationToken);
}

/// Trigger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// When to fire
    pub schedule: Schedule,
    /// Collapse missed ticks into one firing
    pub coalesce: bool,
    /// Runs allowed in flight at once
    pub max_concurrent_runs: usize,
}

impl TriggerConfig {
    /// A coalescing, single-instance trigger for `schedule`.
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            coalesce: true,
            max_concurrent_runs: 1,
        }
    }
}

/// Handle to a running trigger loop.
pub struct Trigger {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Trigger {
    /// Validate `config` and start firing `job` on its schedule.
    ///
    /// Cancelling `shutdown` (or calling [`Trigger::shutdown`]) stops the
    /// loop and signals in-flight runs through their cancellation token.
    pub fn spawn(job: Arc<dyn Job>, config: TriggerConfig, shutdown: CancellationToken) -> Result<Self> {
        config.schedule.validate()?;

        let max_runs = config.max_concurrent_runs.max(1);
        let launcher = Launcher {
            job,
            permits: Arc::new(Semaphore::new(max_runs)),
            max_runs,
            shutdown: shutdown.clone(),
        };

        info!(
            job = launcher.job.name(),
            schedule = %config.schedule,
            coalesce = config.coalesce,
            max_concurrent_runs = max_runs,
            "Starting trigger"
        );

        let handle = match config.schedule {
            Schedule::Interval { every } => tokio::spawn(run_interval(launcher, every, config.coalesce)),
            Schedule::Daily { times } => tokio::spawn(run_daily(launcher, times, config.coalesce)),
        };

        Ok(Self { handle, shutdown })
    }

    /// Stop the loop and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Trigger task ended abnormally");
        }
    }

    /// Wait for the loop to end on its own (after external cancellation).
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Trigger task ended abnormally");
        }
    }
}

/// Spawns job runs subject to the concurrency cap.
struct Launcher {
    job: Arc<dyn Job>,
    permits: Arc<Semaphore>,
    max_runs: usize,
    shutdown: CancellationToken,
}

impl Launcher {
    fn fire(&self, ticks: usize) {
        for _ in 0..ticks {
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        job = self.job.name(),
                        "Maximum concurrent runs reached, skipping tick"
                    );
                    continue;
                }
            };

            let job = self.job.clone();
            let cancel = self.shutdown.child_token();
            debug!(job = job.name(), "Firing job");
            tokio::spawn(async move {
                job.execute(cancel).await;
                drop(permit);
            });
        }
    }

    async fn drain(&self) {
        info!(job = self.job.name(), "Trigger stopped, waiting for in-flight runs");
        if let Ok(permits) = self.permits.acquire_many(self.max_runs as u32).await {
            drop(permits);
        }
    }
}

async fn run_interval(launcher: Launcher, every: Duration, coalesce: bool) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(if coalesce {
        MissedTickBehavior::Skip
    } else {
        MissedTickBehavior::Burst
    });

    loop {
        tokio::select! {
            _ = launcher.shutdown.cancelled() => break,
            _ = ticker.tick() => launcher.fire(1),
        }
    }

    launcher.drain().await;
}

async fn run_daily(launcher: Launcher, times: Vec<TimeOfDay>, coalesce: bool) {
    let mut last: NaiveDateTime = Local::now().naive_local();

    loop {
        let Some(next) = next_daily_fire(last, &times) else {
            break;
        };
        let wait = (next - Local::now().naive_local())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(job = launcher.job.name(), next = %next, "Waiting for next daily fire");

        tokio::select! {
            _ = launcher.shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let now = Local::now().naive_local();
        let due = if coalesce {
            1
        } else {
            daily_fires_between(last, now, &times).max(1)
        };
        if due > 1 {
            info!(job = launcher.job.name(), missed = due - 1, "Firing missed daily runs");
        }

        last = now.max(next);
        launcher.fire(due);
    }

    launcher.drain().await;
}

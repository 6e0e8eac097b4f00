//! Control loop background worker.
//!
//! Runs [`JobManager::run_tick`] periodically while holding the fleet-wide
//! active jobs lock, so that only one scheduler process makes cross-job
//! decisions at a time. The lease is renewed while a tick runs; if it is lost
//! the tick stops starting new work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{JobError, JobManager, TickStats};
use crate::store::LeaseLock;

/// Worker that drives the job control loop.
pub struct SchedulerWorker {
    manager: Arc<JobManager>,
    lock: LeaseLock,
    interval: Duration,
    lock_retry: Duration,
}

impl SchedulerWorker {
    pub fn new(
        manager: Arc<JobManager>,
        lock: LeaseLock,
        interval: Duration,
        lock_retry: Duration,
    ) -> Self {
        Self {
            manager,
            lock,
            interval,
            lock_retry,
        }
    }

    /// Run the control loop until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(owner = %self.lock.owner()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            lock_retry_secs = self.lock_retry.as_secs(),
            "Starting scheduler worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.wait_for_lock(&mut shutdown).await {
                break;
            }

            match self.run_cycle().await {
                Ok(stats) if stats.allocated + stats.released + stats.scheduled > 0 => {
                    info!(
                        jobs = stats.jobs_loaded,
                        allocated = stats.allocated,
                        released = stats.released,
                        scheduled = stats.scheduled,
                        failed = stats.failed,
                        "Control loop tick complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Control loop tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler worker shutting down");
    }

    /// Busy-wait for the lock. Returns false if shutdown came first.
    async fn wait_for_lock(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.lock.try_acquire().await {
                Ok(true) => return true,
                Ok(false) => debug!("Active jobs lock held elsewhere; waiting"),
                Err(e) => warn!(error = %e, "Failed to acquire active jobs lock"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.lock_retry) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// How often the lease is renewed during a tick.
    fn renew_every(&self) -> Duration {
        (self.lock.lease() / 3).max(Duration::from_millis(1))
    }

    /// Run one tick under the already acquired lock, then release it.
    async fn run_cycle(&self) -> Result<TickStats, JobError> {
        let lost = AtomicBool::new(false);
        let tick = self
            .manager
            .run_tick_while(|| !lost.load(Ordering::Acquire));
        tokio::pin!(tick);

        let mut renewals = tokio::time::interval(self.renew_every());
        renewals.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires at once; the lease is fresh.
        renewals.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut tick => break result,
                _ = renewals.tick() => match self.lock.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        if !lost.swap(true, Ordering::AcqRel) {
                            error!("Lost active jobs lock during tick; stopping early");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to renew active jobs lock"),
                },
            }
        };

        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "Failed to release active jobs lock");
        }
        result
    }
}

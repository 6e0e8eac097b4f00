//! Job lifecycle orchestration.
//!
//! The manager is responsible for:
//! - Creating jobs from requests and answering queries about them
//! - Stop, restart and delete requests, each as a compare-and-set on the job
//! - One control loop tick: stop, classify, release, allocate, schedule
//!
//! Ticks are serialized across processes by [`SchedulerWorker`](super::SchedulerWorker);
//! administrative actions may run concurrently with a tick and win or lose
//! against it on the job's revision.

use std::sync::Arc;

use chrono::Utc;
use hydromaas_id::JobId;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{build_priority_queues, JobQueue, QueuePolicy};
use super::{
    ActionReason, Job, JobActionResponse, JobError, JobExecPhase, JobExecStep, JobRequest,
    JobStatus, JobStore,
};
use crate::launcher::{LaunchOutcome, Launcher};
use crate::resources::{AssetGrouping, ResourceManager};
use crate::store::{retry_on_conflict, Retryable};

/// Counters for one control loop tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub jobs_loaded: usize,
    pub stopped: usize,
    pub released: usize,
    pub closed: usize,
    pub allocated: usize,
    pub scheduled: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// The tick stopped early because it was told to.
    pub interrupted: bool,
}

/// Jobs of one tick sorted by what the tick does with them next.
#[derive(Default)]
struct Organized {
    allocation: Vec<Job>,
    release: Vec<Job>,
    other: Vec<Job>,
}

/// Drives jobs from submission to release.
pub struct JobManager {
    jobs: JobStore,
    resources: ResourceManager,
    launcher: Arc<dyn Launcher>,
    grouping: AssetGrouping,
    policy: QueuePolicy,
}

impl JobManager {
    pub fn new(jobs: JobStore, resources: ResourceManager, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            jobs,
            resources,
            launcher,
            grouping: AssetGrouping::default(),
            policy: QueuePolicy::default(),
        }
    }

    pub fn with_grouping(mut self, grouping: AssetGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn job_store(&self) -> &JobStore {
        &self.jobs
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    // =========================================================================
    // Queries and administrative actions
    // =========================================================================

    /// Validate a request and persist the job it describes at `(INIT, DEFAULT)`.
    #[instrument(skip(self, request))]
    pub async fn create_job(&self, request: JobRequest) -> Result<Job, JobError> {
        let mut job = request.into_job()?;
        if self.jobs.exists(&job.job_id()).await? {
            return Err(JobError::DuplicateJob(job.job_id()));
        }

        self.jobs.save(&mut job).await.map_err(|e| {
            if e.is_conflict() {
                JobError::DuplicateJob(job.job_id())
            } else {
                e
            }
        })?;

        info!(
            job_id = %job.job_id(),
            cpus = job.cpu_count(),
            memory = job.memory_size(),
            paradigm = %job.allocation_paradigm(),
            "Job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobError> {
        self.jobs.get(&job_id).await
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<Option<JobStatus>, JobError> {
        Ok(self.jobs.get(&job_id).await?.map(|job| job.status()))
    }

    pub async fn get_active_jobs(&self) -> Result<Vec<Job>, JobError> {
        self.jobs.get_active_jobs().await
    }

    /// Release whatever the job holds, then remove it.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: JobId) -> JobActionResponse {
        let result: Result<JobActionResponse, JobError> = retry_on_conflict(|| async {
            let Some(job) = self.jobs.get(&job_id).await? else {
                return Ok(JobActionResponse::not_found(job_id));
            };
            if let Some(held) = job.allocations() {
                self.resources.release_resources(held).await?;
            }
            self.jobs.delete(&job).await?;
            info!(job_id = %job_id, "Job deleted");
            Ok(JobActionResponse::success(format!("job {job_id} deleted")))
        })
        .await;

        result.unwrap_or_else(|e| {
            warn!(job_id = %job_id, error = %e, "Failed to delete job");
            JobActionResponse::store_failure(&e)
        })
    }

    /// Ask a running job to stop; the next tick calls the launcher.
    #[instrument(skip(self))]
    pub async fn request_stop(&self, job_id: JobId) -> JobActionResponse {
        let result: Result<JobActionResponse, JobError> = retry_on_conflict(|| async {
            let Some(mut job) = self.jobs.get(&job_id).await? else {
                return Ok(JobActionResponse::not_found(job_id));
            };
            if job.status_step() != JobExecStep::Running {
                return Ok(JobActionResponse::invalid_state(&job, JobExecStep::Running));
            }

            job.set_status_step(JobExecStep::Stopping);
            self.jobs.save(&mut job).await?;
            info!(job_id = %job_id, "Stop requested");
            Ok(JobActionResponse::success(format!("job {job_id} is stopping")))
        })
        .await;

        result.unwrap_or_else(|e| {
            warn!(job_id = %job_id, error = %e, "Failed to request stop");
            JobActionResponse::store_failure(&e)
        })
    }

    /// Send a stopped job back toward scheduling.
    ///
    /// The job goes straight to AWAITING_SCHEDULING if every allocation it
    /// held is still live; otherwise the survivors are released and it waits
    /// for a fresh allocation.
    #[instrument(skip(self))]
    pub async fn request_restart(&self, job_id: JobId) -> JobActionResponse {
        let result: Result<JobActionResponse, JobError> = retry_on_conflict(|| async {
            let Some(mut job) = self.jobs.get(&job_id).await? else {
                return Ok(JobActionResponse::not_found(job_id));
            };
            if job.status_step() != JobExecStep::Stopped {
                return Ok(JobActionResponse::invalid_state(&job, JobExecStep::Stopped));
            }

            let next = if self.revalidate_allocations(&mut job).await? {
                JobExecStep::AwaitingScheduling
            } else {
                JobExecStep::AwaitingAllocation
            };
            job.set_status_step(next);
            self.jobs.save(&mut job).await?;
            info!(job_id = %job_id, status = %job.status(), "Restart requested");
            Ok(JobActionResponse::success(format!(
                "job {job_id} restarted at {}",
                job.status()
            )))
        })
        .await;

        result.unwrap_or_else(|e| {
            warn!(job_id = %job_id, error = %e, "Failed to request restart");
            JobActionResponse::store_failure(&e)
        })
    }

    /// Check that every allocation the job holds is still live.
    ///
    /// Returns true if the job keeps its allocations. If any is gone, the
    /// rest are released and the job's allocations are cleared.
    async fn revalidate_allocations(&self, job: &mut Job) -> Result<bool, JobError> {
        let Some(held) = job.allocations().map(<[_]>::to_vec) else {
            return Ok(false);
        };

        for allocation in &held {
            if !self.resources.allocation_exists(allocation).await? {
                warn!(
                    job_id = %job.job_id(),
                    allocation_id = %allocation.unique_id(),
                    "Held allocation no longer exists; reallocating"
                );
                self.resources.release_resources(&held).await?;
                job.set_allocations(None);
                return Ok(false);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Allocation, release and scheduling
    // =========================================================================

    /// Ask the resource manager for the job's allocation.
    ///
    /// On success the job holds its allocations at AWAITING_DATA, persisted.
    /// Otherwise the job is left untouched and `false` is returned.
    #[instrument(skip(self, job), fields(job_id = %job.job_id()))]
    pub async fn request_allocations(
        &self,
        job: &mut Job,
        require_awaiting_status: bool,
    ) -> Result<bool, JobError> {
        if require_awaiting_status && job.status_step() != JobExecStep::AwaitingAllocation {
            debug!(status = %job.status(), "Job not awaiting allocation");
            return Ok(false);
        }

        let Some(allocations) = self
            .resources
            .allocate(
                job.allocation_paradigm(),
                job.cpu_count(),
                job.memory_size(),
                self.grouping,
            )
            .await?
        else {
            debug!(
                cpus = job.cpu_count(),
                memory = job.memory_size(),
                "Insufficient capacity"
            );
            return Ok(false);
        };

        let mut updated = job.clone();
        updated.set_allocations(Some(allocations.clone()));
        updated.set_status_step(JobExecStep::AwaitingData);

        if let Err(e) = self.jobs.save(&mut updated).await {
            if let Err(release) = self.resources.release_resources(&allocations).await {
                error!(error = %release, "Failed to return allocations of unsaved job");
            }
            if e.is_conflict() {
                info!("Job changed during allocation; retrying next tick");
                return Ok(false);
            }
            return Err(e);
        }

        info!(
            allocations = allocations.len(),
            cpus = job.cpu_count(),
            memory = job.memory_size(),
            "Resources allocated"
        );
        *job = updated;
        Ok(true)
    }

    /// Return a finished or failed job's allocations.
    ///
    /// Succeeds without doing anything when the job holds none. A job whose
    /// status does not call for release is refused as not eligible.
    #[instrument(skip(self, job), fields(job_id = %job.job_id()))]
    pub async fn release_allocations(&self, job: &mut Job) -> JobActionResponse {
        let job_id = job.job_id();
        let mut current = job.clone();

        loop {
            if !current.should_release_resources() {
                return JobActionResponse::failure(
                    ActionReason::NotEligible,
                    format!("job {job_id} at {} does not release resources", current.status()),
                );
            }
            let Some(held) = current.allocations().map(<[_]>::to_vec) else {
                *job = current;
                return JobActionResponse::success(format!("job {job_id} holds no allocations"));
            };

            if let Err(e) = self.resources.release_resources(&held).await {
                let e = JobError::from(e);
                warn!(error = %e, "Failed to release allocations");
                return JobActionResponse::store_failure(&e);
            }
            current.set_allocations(None);

            match self.jobs.save(&mut current).await {
                Ok(()) => {
                    info!(allocations = held.len(), "Allocations released");
                    *job = current;
                    return JobActionResponse::success(format!(
                        "released {} allocations of job {job_id}",
                        held.len()
                    ));
                }
                Err(e) if e.is_conflict() => match self.jobs.get(&job_id).await {
                    Ok(Some(reloaded)) => current = reloaded,
                    Ok(None) => return JobActionResponse::not_found(job_id),
                    Err(e) => return JobActionResponse::store_failure(&e),
                },
                Err(e) => {
                    warn!(error = %e, "Failed to save released job");
                    return JobActionResponse::store_failure(&e);
                }
            }
        }
    }

    /// Hand the job to the launcher. Any launcher failure fails the job.
    #[instrument(skip(self, job), fields(job_id = %job.job_id()))]
    pub async fn request_scheduling(&self, job: &mut Job) -> Result<bool, JobError> {
        let outcome = match self.launcher.start_job(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Launcher failed to start job");
                LaunchOutcome::default()
            }
        };

        let mut updated = job.clone();
        if outcome.success {
            updated.set_worker_handles(outcome.handles);
            updated.set_status_step(JobExecStep::Scheduled);
        } else {
            updated.set_status_step(JobExecStep::Failed);
        }
        self.jobs.save(&mut updated).await?;

        info!(status = %updated.status(), "Scheduling requested");
        *job = updated;
        Ok(outcome.success)
    }

    // =========================================================================
    // Control loop tick
    // =========================================================================

    /// Save during a tick. A conflict means someone else changed the job;
    /// the tick drops it and the next tick sees the new state.
    async fn save_in_tick(&self, job: &mut Job, stats: &mut TickStats) -> bool {
        match self.jobs.save(job).await {
            Ok(()) => true,
            Err(e) if e.is_conflict() => {
                debug!(job_id = %job.job_id(), "Job changed concurrently; skipping this tick");
                stats.conflicts += 1;
                false
            }
            Err(e) => {
                warn!(job_id = %job.job_id(), error = %e, "Failed to save job");
                false
            }
        }
    }

    async fn process_stop(&self, job: &mut Job, stats: &mut TickStats) -> bool {
        match self.launcher.stop_job(job).await {
            Ok(()) => {
                job.set_worker_handles(Vec::new());
                job.set_status_step(JobExecStep::Stopped);
                stats.stopped += 1;
            }
            Err(e) => {
                error!(job_id = %job.job_id(), error = %e, "Launcher failed to stop job");
                job.set_status_step(JobExecStep::Failed);
                stats.failed += 1;
            }
        }
        self.save_in_tick(job, stats).await
    }

    /// Advance jobs whose next step needs no outside input and sort them
    /// into the tick's work lists.
    ///
    /// `stopped_now` are the jobs stopped earlier in this tick; they stay
    /// STOPPED until the next one.
    async fn organize_active_jobs(
        &self,
        jobs: Vec<Job>,
        stopped_now: &[JobId],
        stats: &mut TickStats,
    ) -> Organized {
        let mut organized = Organized::default();

        for mut job in jobs {
            let mut dirty = false;

            if job.status_phase() == JobExecPhase::Init {
                job.set_status_phase(JobExecPhase::ModelExec);
                dirty = true;
            }

            if matches!(
                job.status_step(),
                JobExecStep::AwaitingDataCheck | JobExecStep::AwaitingPartitioning
            ) {
                continue;
            }

            if job.status_step() == JobExecStep::Stopped && !stopped_now.contains(&job.job_id()) {
                if let Err(e) = self.revalidate_allocations(&mut job).await {
                    warn!(job_id = %job.job_id(), error = %e, "Failed to revalidate allocations");
                    continue;
                }
                job.set_status_step(JobExecStep::AwaitingAllocation);
                dirty = true;
            }

            if job.status_step() == JobExecStep::AwaitingAllocation && job.holds_allocations() {
                job.set_status_step(JobExecStep::AwaitingData);
                dirty = true;
            }

            if dirty && !self.save_in_tick(&mut job, stats).await {
                continue;
            }

            if job.status_step() == JobExecStep::AwaitingAllocation {
                organized.allocation.push(job);
            } else if job.should_release_resources() {
                organized.release.push(job);
            } else {
                organized.other.push(job);
            }
        }

        organized
    }

    /// Attempt allocation for every job in the queue, highest priority first.
    ///
    /// Jobs that fail stay queued for a later tick. Each success bumps every
    /// job skipped before it. Returns true if every job was allocated.
    async fn process_queue(
        &self,
        mut queue: JobQueue,
        keep_going: &(dyn Fn() -> bool + Sync),
        stats: &mut TickStats,
    ) -> bool {
        let mut skipped: Vec<(Job, bool)> = Vec::new();

        while let Some(queued) = queue.pop() {
            let mut job = queued.job;
            if !keep_going() {
                stats.interrupted = true;
                skipped.push((job, queued.changed));
                continue;
            }
            let allocated = match self.request_allocations(&mut job, true).await {
                Ok(allocated) => allocated,
                Err(e) => {
                    warn!(job_id = %job.job_id(), error = %e, "Allocation request failed");
                    false
                }
            };

            if allocated {
                stats.allocated += 1;
                for (waiting, changed) in &mut skipped {
                    waiting.set_allocation_priority(
                        waiting.allocation_priority() + self.policy.skip_bump,
                    );
                    *changed = true;
                }
            } else {
                skipped.push((job, queued.changed));
            }
        }

        let all_allocated = skipped.is_empty();
        for (mut job, changed) in skipped {
            if changed {
                self.save_in_tick(&mut job, stats).await;
            }
        }
        all_allocated
    }

    /// Persist queueing changes of jobs in a queue that is not attempted.
    async fn defer_queue(&self, mut queue: JobQueue, stats: &mut TickStats) {
        while let Some(queued) = queue.pop() {
            if queued.changed {
                let mut job = queued.job;
                self.save_in_tick(&mut job, stats).await;
            }
        }
    }

    /// Close the phase of a job whose step finished it. The step is kept.
    async fn close_phase(&self, job: &mut Job, stats: &mut TickStats) -> bool {
        if job.status().is_error() {
            error!(job_id = %job.job_id(), status = %job.status(), "Job ended in error");
        }
        job.set_status(JobStatus::new(JobExecPhase::Closed, job.status_step()));
        if !self.save_in_tick(job, stats).await {
            return false;
        }
        stats.closed += 1;
        true
    }

    /// Run one pass over every active job and every unsettled one.
    ///
    /// Failures of individual jobs are logged and counted; only a failure to
    /// load the jobs fails the tick.
    pub async fn run_tick(&self) -> Result<TickStats, JobError> {
        self.run_tick_while(|| true).await
    }

    /// [`run_tick`](Self::run_tick), checking `keep_going` before each piece
    /// of work that changes resources or talks to the launcher.
    ///
    /// Once it returns false the tick stops starting new work, saves what it
    /// already changed, and returns with `interrupted` set. Work already in
    /// flight always completes, so no allocation is left without its job.
    #[instrument(skip(self, keep_going))]
    pub async fn run_tick_while<F>(&self, keep_going: F) -> Result<TickStats, JobError>
    where
        F: Fn() -> bool + Sync,
    {
        let keep_going: &(dyn Fn() -> bool + Sync) = &keep_going;
        let mut stats = TickStats::default();
        let jobs = self.jobs.get_jobs_to_process().await?;
        stats.jobs_loaded = jobs.len();

        let mut stopped_now = Vec::new();
        let mut finished = Vec::new();
        let mut remaining = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            if job.status_step() == JobExecStep::Stopping {
                if !keep_going() {
                    stats.interrupted = true;
                    continue;
                }
                if !self.process_stop(&mut job, &mut stats).await {
                    continue;
                }
                stopped_now.push(job.job_id());
            }

            if job.status_step().completes_phase() {
                if job.status_phase() != JobExecPhase::Closed || job.holds_allocations() {
                    finished.push(job);
                }
                continue;
            }
            remaining.push(job);
        }

        let organized = self
            .organize_active_jobs(remaining, &stopped_now, &mut stats)
            .await;
        let mut release = organized.release;

        for mut job in finished {
            if job.status_phase() != JobExecPhase::Closed
                && !self.close_phase(&mut job, &mut stats).await
            {
                continue;
            }
            if job.holds_allocations() {
                release.push(job);
            }
        }

        for mut job in release {
            if !keep_going() {
                stats.interrupted = true;
                break;
            }
            let held = job.allocations().map_or(0, <[_]>::len);
            let response = self.release_allocations(&mut job).await;
            if !response.success {
                warn!(
                    job_id = %job.job_id(),
                    reason = ?response.reason,
                    message = %response.message,
                    "Release failed"
                );
            } else if held > 0 {
                stats.released += 1;
            }
        }

        let queues = build_priority_queues(organized.allocation, Utc::now(), &self.policy);
        if self.process_queue(queues.high, keep_going, &mut stats).await {
            self.process_queue(queues.medium, keep_going, &mut stats).await;
            self.process_queue(queues.low, keep_going, &mut stats).await;
        } else {
            debug!("High priority jobs left unallocated; deferring lower queues");
            self.defer_queue(queues.medium, &mut stats).await;
            self.defer_queue(queues.low, &mut stats).await;
        }

        for mut job in organized.other {
            if job.status_step() != JobExecStep::AwaitingScheduling {
                continue;
            }
            if !keep_going() {
                stats.interrupted = true;
                break;
            }
            match self.request_scheduling(&mut job).await {
                Ok(true) => stats.scheduled += 1,
                Ok(false) => stats.failed += 1,
                Err(e) => {
                    warn!(job_id = %job.job_id(), error = %e, "Failed to record scheduling");
                }
            }
        }

        if stats.interrupted {
            warn!(?stats, "Tick interrupted");
        } else if stats != TickStats::default() {
            debug!(?stats, "Tick complete");
        }
        Ok(stats)
    }
}

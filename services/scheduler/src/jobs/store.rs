//! Job persistence and indexes.

use std::collections::HashSet;
use std::sync::Arc;

use hydromaas_id::JobId;
use tracing::debug;

use super::{Job, JobError};
use crate::store::{load, load_many, Keys, KeyValueStore, Transaction};

/// Reads and writes job records.
///
/// Two index sets are kept in the same commit as every job write: the active
/// set (jobs whose status is active) and the unsettled set (inactive jobs
/// that still hold allocations or have a finished phase left to close).
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn KeyValueStore>,
    keys: Keys,
}

impl JobStore {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub async fn exists(&self, job_id: &JobId) -> Result<bool, JobError> {
        Ok(self.store.get(&self.keys.job(job_id)).await?.is_some())
    }

    /// Load a job, remembering the revision it was read at.
    pub async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobError> {
        let record = load::<Job>(self.store.as_ref(), &self.keys.job(job_id)).await?;
        Ok(record.map(|r| {
            let mut job = r.value;
            job.set_revision(Some(r.version));
            job
        }))
    }

    /// Write a job if it is unchanged since it was loaded.
    ///
    /// A job that was never loaded must not exist yet. On success the job's
    /// revision moves to the new version; on conflict nothing is written and
    /// [`JobError::Store`] carries the conflict.
    pub async fn save(&self, job: &mut Job) -> Result<(), JobError> {
        let key = self.keys.job(&job.job_id());
        let active = job.is_active();
        let unsettled = job.is_unsettled();

        let mut txn = Transaction::new();
        txn.expect_observed(&key, job.revision())
            .put(&key, &*job)?
            .set_membership(self.keys.active_jobs(), &key, active)
            .set_membership(self.keys.unsettled_jobs(), &key, unsettled);
        let version = self.store.commit(txn).await?;

        job.set_revision(Some(version));
        debug!(
            job_id = %job.job_id(),
            status = %job.status(),
            active,
            unsettled,
            "Job saved"
        );
        Ok(())
    }

    /// Remove a job and its index entries, if unchanged since it was loaded.
    pub async fn delete(&self, job: &Job) -> Result<(), JobError> {
        let key = self.keys.job(&job.job_id());
        let mut txn = Transaction::new();
        txn.expect_observed(&key, job.revision())
            .delete(&key)
            .set_remove(self.keys.active_jobs(), &key)
            .set_remove(self.keys.unsettled_jobs(), &key);
        self.store.commit(txn).await?;
        debug!(job_id = %job.job_id(), "Job deleted");
        Ok(())
    }

    async fn load_set(&self, set: &str) -> Result<Vec<Job>, JobError> {
        let keys = self.store.set_members(set).await?;
        Ok(load_many::<Job>(self.store.as_ref(), &keys)
            .await?
            .into_iter()
            .map(|r| {
                let mut job = r.value;
                job.set_revision(Some(r.version));
                job
            })
            .collect())
    }

    pub async fn get_active_jobs(&self) -> Result<Vec<Job>, JobError> {
        self.load_set(&self.keys.active_jobs()).await
    }

    pub async fn get_unsettled_jobs(&self) -> Result<Vec<Job>, JobError> {
        self.load_set(&self.keys.unsettled_jobs()).await
    }

    /// Active jobs followed by unsettled ones, each job once.
    pub async fn get_jobs_to_process(&self) -> Result<Vec<Job>, JobError> {
        let mut jobs = self.get_active_jobs().await?;
        let mut seen: HashSet<JobId> = jobs.iter().map(Job::job_id).collect();
        for job in self.get_unsettled_jobs().await? {
            if seen.insert(job.job_id()) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

//! Launcher interface and mock implementation.
//!
//! A launcher turns a job with granted allocations into running workers and
//! stops them again. The real launcher is a separate service reached over
//! HTTP; a mock is provided for development and tests.

mod http;

pub use http::HttpLauncher;

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use hydromaas_id::JobId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::jobs::Job;

/// What a launcher reports after being asked to start a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub success: bool,
    /// Opaque handles to the started workers.
    #[serde(default)]
    pub handles: Vec<serde_json::Value>,
}

/// Starts and stops the workers of a job.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the job's workers on its allocations.
    async fn start_job(&self, job: &Job) -> Result<LaunchOutcome>;

    /// Stop the job's workers.
    async fn stop_job(&self, job: &Job) -> Result<()>;
}

/// Launcher that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct MockLauncher {
    fail: bool,
    started: Mutex<Vec<JobId>>,
    stopped: Mutex<Vec<JobId>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<JobId> {
        self.started.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn stopped(&self) -> Vec<JobId> {
        self.stopped.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn start_job(&self, job: &Job) -> Result<LaunchOutcome> {
        if self.fail {
            anyhow::bail!("Mock launcher configured to fail");
        }

        let handles: Vec<serde_json::Value> = job
            .allocations()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, a)| {
                serde_json::json!({
                    "worker": format!("{}-{}", job.job_id(), i),
                    "host": a.hostname(),
                    "cpus": a.cpu_count(),
                })
            })
            .collect();
        info!(
            job_id = %job.job_id(),
            workers = handles.len(),
            "[MOCK] Starting job"
        );

        if let Ok(mut started) = self.started.lock() {
            started.push(job.job_id());
        }
        Ok(LaunchOutcome {
            success: true,
            handles,
        })
    }

    async fn stop_job(&self, job: &Job) -> Result<()> {
        if self.fail {
            anyhow::bail!("Mock launcher configured to fail");
        }

        info!(job_id = %job.job_id(), "[MOCK] Stopping job");
        if let Ok(mut stopped) = self.stopped.lock() {
            stopped.push(job.job_id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use crate::resources::{AllocationParadigm, ResourceAllocation};
    use chrono::Utc;
    use hydromaas_id::ResourceId;

    fn allocated_job() -> Job {
        let mut job = Job::new(
            JobId::new(),
            JobKind::Basic,
            2,
            100,
            AllocationParadigm::FillNodes,
        );
        let rid = ResourceId::parse("n1").unwrap();
        job.set_allocations(Some(vec![
            ResourceAllocation::new(rid.clone(), "n1.local", 1, 50, Utc::now()),
            ResourceAllocation::new(rid, "n1.local", 1, 50, Utc::now()),
        ]));
        job
    }

    #[tokio::test]
    async fn test_mock_launcher_start() {
        let launcher = MockLauncher::new();
        let job = allocated_job();

        let outcome = launcher.start_job(&job).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.handles.len(), 2);
        assert_eq!(outcome.handles[0]["host"], "n1.local");
        assert_eq!(launcher.started(), vec![job.job_id()]);
    }

    #[tokio::test]
    async fn test_mock_launcher_stop() {
        let launcher = MockLauncher::new();
        let job = allocated_job();
        launcher.stop_job(&job).await.unwrap();
        assert_eq!(launcher.stopped(), vec![job.job_id()]);
    }

    #[tokio::test]
    async fn test_mock_launcher_failing() {
        let launcher = MockLauncher::failing();
        let job = allocated_job();
        assert!(launcher.start_job(&job).await.is_err());
        assert!(launcher.stop_job(&job).await.is_err());
        assert!(launcher.started().is_empty());
    }
}

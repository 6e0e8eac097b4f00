//! Launcher service client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error};

use super::{LaunchOutcome, Launcher};
use crate::jobs::Job;

/// Launcher backed by a remote launch service.
///
/// - `POST {base}/v1/launches` with the job, answered by a [`LaunchOutcome`]
/// - `POST {base}/v1/launches/{job_id}/stop`
pub struct HttpLauncher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLauncher {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Launcher for HttpLauncher {
    async fn start_job(&self, job: &Job) -> Result<LaunchOutcome> {
        let url = format!("{}/v1/launches", self.base_url);
        debug!(url = %url, job_id = %job.job_id(), "Requesting job launch");

        let response = self.client.post(&url).json(job).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to launch job");
            anyhow::bail!("Failed to launch job: {} - {}", status, body);
        }

        let outcome: LaunchOutcome = response.json().await?;
        debug!(
            job_id = %job.job_id(),
            success = outcome.success,
            handles = outcome.handles.len(),
            "Launch requested"
        );
        Ok(outcome)
    }

    async fn stop_job(&self, job: &Job) -> Result<()> {
        let url = format!("{}/v1/launches/{}/stop", self.base_url, job.job_id());
        debug!(url = %url, job_id = %job.job_id(), "Requesting job stop");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "worker_handles": job.worker_handles() }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to stop job");
            anyhow::bail!("Failed to stop job: {} - {}", status, body);
        }

        Ok(())
    }
}

//! Job submission input.

use hydromaas_id::JobId;
use serde::{Deserialize, Serialize};

use super::job::{DataRequirement, Job, JobKind, PartitionConfig};
use super::JobError;
use crate::resources::{AllocationParadigm, ResourceManager};

/// A request to run a model, as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub cpus: u32,
    pub memory: u64,
    /// Paradigm name; case, `-`, `_` and spaces are ignored.
    pub allocation_paradigm: String,
    /// The underlying model execution request, carried on the job as is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_request: Option<serde_json::Value>,
    /// Caller-chosen id; one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub allocation_priority: i64,
    #[serde(default)]
    pub data_requirements: Vec<DataRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_config: Option<PartitionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}

impl JobRequest {
    pub fn new(cpus: u32, memory: u64, allocation_paradigm: impl Into<String>) -> Self {
        Self {
            cpus,
            memory,
            allocation_paradigm: allocation_paradigm.into(),
            model_request: None,
            job_id: None,
            allocation_priority: 0,
            data_requirements: Vec::new(),
            partition_config: None,
            credentials: None,
        }
    }

    /// Validate the request and build the job it describes.
    pub fn into_job(self) -> Result<Job, JobError> {
        ResourceManager::validate_allocation_parameters(self.cpus, self.memory).map_err(|_| {
            JobError::InvalidRequest(format!(
                "cpus and memory must be positive (cpus={}, memory={})",
                self.cpus, self.memory
            ))
        })?;
        let paradigm: AllocationParadigm = self.allocation_paradigm.parse()?;
        let job_id = match self.job_id.as_deref() {
            Some(raw) => JobId::parse(raw)?,
            None => JobId::new(),
        };
        let kind = match self.model_request {
            Some(originating_request) => JobKind::Requested {
                originating_request,
            },
            None => JobKind::Basic,
        };

        let mut job = Job::new(job_id, kind, self.cpus, self.memory, paradigm);
        if self.allocation_priority != 0 {
            job.set_allocation_priority(self.allocation_priority);
        }
        if !self.data_requirements.is_empty() {
            job.set_data_requirements(self.data_requirements);
        }
        if self.partition_config.is_some() {
            job.set_partition_config(self.partition_config);
        }
        if self.credentials.is_some() {
            job.set_credentials(self.credentials);
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_request() {
        let job = JobRequest::new(4, 500_000, "single-node").into_job().unwrap();
        assert_eq!(job.cpu_count(), 4);
        assert_eq!(job.memory_size(), 500_000);
        assert_eq!(job.allocation_paradigm(), AllocationParadigm::SingleNode);
        assert_eq!(job.kind(), &JobKind::Basic);
    }

    #[test]
    fn test_caller_supplied_id_kept() {
        let id = JobId::new();
        let mut request = JobRequest::new(1, 1, "ROUND_ROBIN");
        request.job_id = Some(id.to_string());
        assert_eq!(request.into_job().unwrap().job_id(), id);
    }

    #[test]
    fn test_model_request_makes_requested_job() {
        let mut request = JobRequest::new(1, 1, "fill nodes");
        request.model_request = Some(json!({"model": "ngen", "config": "realization.json"}));
        request.allocation_priority = 60;
        let job = request.into_job().unwrap();
        assert!(matches!(job.kind(), JobKind::Requested { .. }));
        assert_eq!(job.allocation_priority(), 60);
    }

    #[test]
    fn test_invalid_requests() {
        assert!(matches!(
            JobRequest::new(0, 10, "single-node").into_job(),
            Err(JobError::InvalidRequest(_))
        ));
        assert!(matches!(
            JobRequest::new(1, 0, "single-node").into_job(),
            Err(JobError::InvalidRequest(_))
        ));
        assert!(matches!(
            JobRequest::new(1, 1, "best-fit").into_job(),
            Err(JobError::UnrecognizedParadigm(_))
        ));

        let mut request = JobRequest::new(1, 1, "single-node");
        request.job_id = Some("not-a-uuid".into());
        assert!(matches!(request.into_job(), Err(JobError::InvalidJobId(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let request: JobRequest = serde_json::from_value(json!({
            "cpus": 2,
            "memory": 2048,
            "allocation_paradigm": "single-node"
        }))
        .unwrap();
        assert!(request.job_id.is_none());
        assert!(request.data_requirements.is_empty());
    }
}

//! The scheduled job entity.

use chrono::{DateTime, Utc};
use hydromaas_id::JobId;
use serde::{Deserialize, Serialize};

use super::status::{JobExecPhase, JobExecStep, JobStatus};
use crate::resources::{AllocationParadigm, ResourceAllocation};

/// What kind of job this is, and what it carries for its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobKind {
    Basic,
    /// Created from a model execution request, kept verbatim.
    Requested { originating_request: serde_json::Value },
}

/// Kind of data a requirement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataCategory {
    Config,
    Forcing,
    Hydrofabric,
    Observation,
    Output,
}

/// Data a job reads or writes, fulfilled by an external data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequirement {
    /// Opaque description of the data's extent (time range, catchments, ...).
    pub domain: serde_json::Value,
    pub is_input: bool,
    pub category: DataCategory,
    /// Dataset that satisfies the requirement, once one is found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_by: Option<String>,
}

impl DataRequirement {
    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled_by.is_some()
    }
}

/// Partitioning of the modeled domain across workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionConfig(pub serde_json::Value);

/// A unit of work moving through the scheduling pipeline.
///
/// Fields change only through the `set_*` methods, each of which bumps
/// `last_updated`. `revision` is the store version the job was loaded at and
/// is never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    job_id: JobId,
    #[serde(flatten)]
    kind: JobKind,
    cpu_count: u32,
    memory_size: u64,
    allocation_paradigm: AllocationParadigm,
    #[serde(default)]
    allocation_priority: i64,
    #[serde(default)]
    allocations: Option<Vec<ResourceAllocation>>,
    #[serde(default)]
    data_requirements: Vec<DataRequirement>,
    #[serde(default)]
    partition_config: Option<PartitionConfig>,
    #[serde(default)]
    credentials: Option<serde_json::Value>,
    #[serde(default)]
    worker_handles: Vec<serde_json::Value>,
    status: JobStatus,
    last_updated: DateTime<Utc>,
    #[serde(skip)]
    revision: Option<i64>,
}

impl Job {
    /// A new job at `(INIT, DEFAULT)`.
    pub fn new(
        job_id: JobId,
        kind: JobKind,
        cpu_count: u32,
        memory_size: u64,
        allocation_paradigm: AllocationParadigm,
    ) -> Self {
        Self {
            job_id,
            kind,
            cpu_count,
            memory_size,
            allocation_paradigm,
            allocation_priority: 0,
            allocations: None,
            data_requirements: Vec::new(),
            partition_config: None,
            credentials: None,
            worker_handles: Vec::new(),
            status: JobStatus::default(),
            last_updated: Utc::now(),
            revision: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn allocation_paradigm(&self) -> AllocationParadigm {
        self.allocation_paradigm
    }

    pub fn allocation_priority(&self) -> i64 {
        self.allocation_priority
    }

    /// Granted allocations; never `Some` of an empty list.
    pub fn allocations(&self) -> Option<&[ResourceAllocation]> {
        self.allocations.as_deref()
    }

    pub fn holds_allocations(&self) -> bool {
        self.allocations.is_some()
    }

    pub fn data_requirements(&self) -> &[DataRequirement] {
        &self.data_requirements
    }

    pub fn partition_config(&self) -> Option<&PartitionConfig> {
        self.partition_config.as_ref()
    }

    pub fn credentials(&self) -> Option<&serde_json::Value> {
        self.credentials.as_ref()
    }

    pub fn worker_handles(&self) -> &[serde_json::Value] {
        &self.worker_handles
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn status_step(&self) -> JobExecStep {
        self.status.step()
    }

    pub fn status_phase(&self) -> JobExecPhase {
        self.status.phase()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn should_release_resources(&self) -> bool {
        self.status.should_release_resources()
    }

    /// Inactive but still owed work by the control loop: allocations to
    /// return, or a finished phase not yet closed.
    pub fn is_unsettled(&self) -> bool {
        !self.is_active()
            && (self.holds_allocations()
                || (self.status_step().completes_phase()
                    && self.status_phase() != JobExecPhase::Closed))
    }

    pub(crate) fn revision(&self) -> Option<i64> {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: Option<i64>) {
        self.revision = revision;
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.touch();
    }

    /// Enter `phase` at its default start step.
    pub fn set_status_phase(&mut self, phase: JobExecPhase) {
        self.set_status(JobStatus::entering(phase));
    }

    /// Move to `step` within the current phase. Setting the current step
    /// again changes nothing, including `last_updated`.
    pub fn set_status_step(&mut self, step: JobExecStep) {
        if self.status.step() != step {
            self.set_status(self.status.get_for_new_step(step));
        }
    }

    /// An empty list clears the allocations.
    pub fn set_allocations(&mut self, allocations: Option<Vec<ResourceAllocation>>) {
        self.allocations = allocations.filter(|a| !a.is_empty());
        self.touch();
    }

    pub fn set_allocation_priority(&mut self, priority: i64) {
        self.allocation_priority = priority;
        self.touch();
    }

    pub fn set_data_requirements(&mut self, requirements: Vec<DataRequirement>) {
        self.data_requirements = requirements;
        self.touch();
    }

    pub fn set_partition_config(&mut self, config: Option<PartitionConfig>) {
        self.partition_config = config;
        self.touch();
    }

    pub fn set_credentials(&mut self, credentials: Option<serde_json::Value>) {
        self.credentials = credentials;
        self.touch();
    }

    pub fn set_worker_handles(&mut self, handles: Vec<serde_json::Value>) {
        self.worker_handles = handles;
        self.touch();
    }
}

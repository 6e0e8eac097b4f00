//! Two-level job status: a coarse phase and a fine-grained step within it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fine-grained progress marker within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobExecStep {
    Default,
    AwaitingDataCheck,
    DataUnprovideable,
    AwaitingPartitioning,
    PartitioningFailed,
    AwaitingAllocation,
    AwaitingData,
    DataFailure,
    AwaitingScheduling,
    Scheduled,
    Running,
    Stopping,
    Stopped,
    Completed,
    Canceled,
    Failed,
}

impl JobExecStep {
    pub const ALL: [JobExecStep; 16] = [
        JobExecStep::Default,
        JobExecStep::AwaitingDataCheck,
        JobExecStep::DataUnprovideable,
        JobExecStep::AwaitingPartitioning,
        JobExecStep::PartitioningFailed,
        JobExecStep::AwaitingAllocation,
        JobExecStep::AwaitingData,
        JobExecStep::DataFailure,
        JobExecStep::AwaitingScheduling,
        JobExecStep::Scheduled,
        JobExecStep::Running,
        JobExecStep::Stopping,
        JobExecStep::Stopped,
        JobExecStep::Completed,
        JobExecStep::Canceled,
        JobExecStep::Failed,
    ];

    /// `(is_interrupted, is_error, completes_phase)`
    const fn flags(self) -> (bool, bool, bool) {
        use JobExecStep::*;
        match self {
            Default | AwaitingDataCheck | AwaitingPartitioning | AwaitingAllocation
            | AwaitingData | AwaitingScheduling | Scheduled | Running => (false, false, false),
            Stopping | Stopped => (true, false, false),
            DataFailure => (false, true, false),
            Completed => (false, false, true),
            Canceled => (true, false, true),
            Failed | DataUnprovideable | PartitioningFailed => (false, true, true),
        }
    }

    pub const fn is_interrupted(self) -> bool {
        self.flags().0
    }

    pub const fn is_error(self) -> bool {
        self.flags().1
    }

    pub const fn completes_phase(self) -> bool {
        self.flags().2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobExecStep::Default => "DEFAULT",
            JobExecStep::AwaitingDataCheck => "AWAITING_DATA_CHECK",
            JobExecStep::DataUnprovideable => "DATA_UNPROVIDEABLE",
            JobExecStep::AwaitingPartitioning => "AWAITING_PARTITIONING",
            JobExecStep::PartitioningFailed => "PARTITIONING_FAILED",
            JobExecStep::AwaitingAllocation => "AWAITING_ALLOCATION",
            JobExecStep::AwaitingData => "AWAITING_DATA",
            JobExecStep::DataFailure => "DATA_FAILURE",
            JobExecStep::AwaitingScheduling => "AWAITING_SCHEDULING",
            JobExecStep::Scheduled => "SCHEDULED",
            JobExecStep::Running => "RUNNING",
            JobExecStep::Stopping => "STOPPING",
            JobExecStep::Stopped => "STOPPED",
            JobExecStep::Completed => "COMPLETED",
            JobExecStep::Canceled => "CANCELED",
            JobExecStep::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobExecStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobExecStep {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobExecStep::ALL
            .into_iter()
            .find(|step| step.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StatusParseError(s.to_string()))
    }
}

/// Coarse workflow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobExecPhase {
    Init,
    ModelExec,
    OutputExec,
    Closed,
    Unknown,
}

impl JobExecPhase {
    pub const ALL: [JobExecPhase; 5] = [
        JobExecPhase::Init,
        JobExecPhase::ModelExec,
        JobExecPhase::OutputExec,
        JobExecPhase::Closed,
        JobExecPhase::Unknown,
    ];

    /// Step a job is put at when it enters this phase.
    pub const fn default_start_step(self) -> JobExecStep {
        match self {
            JobExecPhase::Init | JobExecPhase::Unknown => JobExecStep::Default,
            JobExecPhase::ModelExec | JobExecPhase::OutputExec => JobExecStep::AwaitingAllocation,
            JobExecPhase::Closed => JobExecStep::Completed,
        }
    }

    pub const fn is_active(self) -> bool {
        matches!(
            self,
            JobExecPhase::Init | JobExecPhase::ModelExec | JobExecPhase::OutputExec
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobExecPhase::Init => "INIT",
            JobExecPhase::ModelExec => "MODEL_EXEC",
            JobExecPhase::OutputExec => "OUTPUT_EXEC",
            JobExecPhase::Closed => "CLOSED",
            JobExecPhase::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for JobExecPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobExecPhase {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobExecPhase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StatusParseError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job status '{0}'")]
pub struct StatusParseError(pub String);

/// A `(phase, step)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobStatus {
    phase: JobExecPhase,
    step: JobExecStep,
}

impl JobStatus {
    pub const fn new(phase: JobExecPhase, step: JobExecStep) -> Self {
        Self { phase, step }
    }

    /// A phase at its default start step.
    pub const fn entering(phase: JobExecPhase) -> Self {
        Self::new(phase, phase.default_start_step())
    }

    pub const fn phase(&self) -> JobExecPhase {
        self.phase
    }

    pub const fn step(&self) -> JobExecStep {
        self.step
    }

    /// The phase is active and the step has not completed it.
    pub const fn is_active(&self) -> bool {
        self.phase.is_active() && !self.step.completes_phase()
    }

    pub const fn is_error(&self) -> bool {
        self.step.is_error()
    }

    pub const fn is_interrupted(&self) -> bool {
        self.step.is_interrupted()
    }

    pub fn should_release_resources(&self) -> bool {
        self.step == JobExecStep::Failed || self.phase == JobExecPhase::Closed
    }

    /// The same phase at `step`.
    pub const fn get_for_new_step(self, step: JobExecStep) -> Self {
        Self::new(self.phase, step)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new(JobExecPhase::Init, JobExecStep::Default)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phase, self.step)
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (phase, step) = s
            .split_once(':')
            .ok_or_else(|| StatusParseError(s.to_string()))?;
        Ok(Self::new(phase.parse()?, step.parse()?))
    }
}

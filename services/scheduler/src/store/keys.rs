//! Namespaced store key layout.

use hydromaas_id::{AllocationId, JobId, ResourceId};

/// Builds the keys under which scheduler records live.
///
/// All keys share one prefix so several deployments can use the same backing
/// store without colliding.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resource(&self, id: &ResourceId) -> String {
        format!("{}:resource:{}", self.prefix, id)
    }

    /// Set enumerating the resource keys of one pool.
    pub fn resource_pool(&self, pool: &str) -> String {
        format!("{}:resources:{}", self.prefix, pool)
    }

    pub fn allocation(&self, id: &AllocationId) -> String {
        format!("{}:allocation:{}", self.prefix, id)
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    /// Set of keys of jobs that are currently active.
    pub fn active_jobs(&self) -> String {
        format!("{}:jobs:active", self.prefix)
    }

    /// Set of keys of inactive jobs that still hold allocations or have a
    /// finished phase left to close.
    pub fn unsettled_jobs(&self) -> String {
        format!("{}:jobs:unsettled", self.prefix)
    }

    pub fn active_jobs_lock(&self) -> String {
        format!("{}:lock:active_jobs", self.prefix)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("maas")
    }
}

//! Claims carved out of a single resource.

use chrono::{DateTime, Utc};
use hydromaas_id::{AllocationId, ResourceId};
use serde::{Deserialize, Serialize};

/// CPU and memory granted from exactly one [`Resource`](super::Resource).
///
/// Allocations are immutable; releasing one deletes its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    resource_id: ResourceId,
    hostname: String,
    cpu_count: u32,
    memory: u64,
    created: DateTime<Utc>,
}

impl ResourceAllocation {
    pub fn new(
        resource_id: ResourceId,
        hostname: impl Into<String>,
        cpu_count: u32,
        memory: u64,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id,
            hostname: hostname.into(),
            cpu_count,
            memory,
            created,
        }
    }

    pub fn unique_id(&self) -> AllocationId {
        AllocationId::new(self.resource_id.clone(), self.created)
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Granted CPUs (not the requested amount).
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// Granted memory (not the requested amount).
    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

/// Sum of granted CPUs and memory.
pub fn totals(allocations: &[ResourceAllocation]) -> (u64, u64) {
    allocations.iter().fold((0, 0), |(cpus, memory), a| {
        (cpus + u64::from(a.cpu_count), memory + a.memory)
    })
}

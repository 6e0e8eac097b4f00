//! Compute node records.

use hydromaas_id::ResourceId;
use serde::{Deserialize, Serialize};

/// Whether a node is in service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceAvailability {
    Active,
    Inactive,
    Unknown,
}

/// Whether a node can currently accept work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Ready,
    NotReady,
    Unknown,
}

/// Result of carving a request out of a [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub cpus: u32,
    pub memory: u64,
    /// Both the CPU and the memory request were met in full.
    pub fully_satisfied: bool,
}

impl Grant {
    pub fn is_empty(&self) -> bool {
        self.cpus == 0 && self.memory == 0
    }
}

/// A compute node and what is left of its CPU and memory.
///
/// `cpu_count` and `memory` are the currently available amounts; only
/// [`Resource::allocate`] and [`Resource::release`] change them, and they never
/// exceed the totals fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pool_id: ResourceId,
    hostname: String,
    availability: ResourceAvailability,
    state: ResourceState,
    cpu_count: u32,
    memory: u64,
    total_cpus: u32,
    total_memory: u64,
}

impl Resource {
    /// A fully available, active and ready node.
    pub fn new(pool_id: ResourceId, hostname: impl Into<String>, cpu_count: u32, memory: u64) -> Self {
        Self {
            pool_id,
            hostname: hostname.into(),
            availability: ResourceAvailability::Active,
            state: ResourceState::Ready,
            cpu_count,
            memory,
            total_cpus: cpu_count,
            total_memory: memory,
        }
    }

    /// Set totals larger than the initially available amounts, for nodes
    /// registered while part of their capacity is already in use.
    ///
    /// Totals below the available amounts are raised to them.
    pub fn with_totals(mut self, total_cpus: u32, total_memory: u64) -> Self {
        self.total_cpus = total_cpus.max(self.cpu_count);
        self.total_memory = total_memory.max(self.memory);
        self
    }

    /// This inventory applied to a node already registered as `current`.
    ///
    /// Hostname, availability, state and totals come from `self`. Whatever
    /// `current` has handed out stays handed out: the available amounts are
    /// the new totals less that usage, and totals never drop below it.
    pub fn carrying_usage_of(&self, current: &Resource) -> Resource {
        let cpus_in_use = current.total_cpus.saturating_sub(current.cpu_count);
        let memory_in_use = current.total_memory.saturating_sub(current.memory);
        let total_cpus = self.total_cpus.max(cpus_in_use);
        let total_memory = self.total_memory.max(memory_in_use);
        Resource {
            cpu_count: total_cpus - cpus_in_use,
            memory: total_memory - memory_in_use,
            total_cpus,
            total_memory,
            ..self.clone()
        }
    }

    pub fn with_availability(mut self, availability: ResourceAvailability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = state;
        self
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.pool_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn availability(&self) -> ResourceAvailability {
        self.availability
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn total_cpus(&self) -> u32 {
        self.total_cpus
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Active and ready, regardless of remaining capacity.
    pub fn is_usable(&self) -> bool {
        self.availability == ResourceAvailability::Active && self.state == ResourceState::Ready
    }

    /// Usable and with some CPU and memory left.
    pub fn is_allocatable(&self) -> bool {
        self.is_usable() && self.cpu_count > 0 && self.memory > 0
    }

    /// Take up to the requested amounts. CPU and memory are deducted
    /// independently; neither goes below zero.
    pub fn allocate(&mut self, requested_cpus: u32, requested_memory: u64) -> Grant {
        let cpus = requested_cpus.min(self.cpu_count);
        let memory = requested_memory.min(self.memory);
        self.cpu_count -= cpus;
        self.memory -= memory;
        Grant {
            cpus,
            memory,
            fully_satisfied: cpus == requested_cpus && memory == requested_memory,
        }
    }

    /// Return previously allocated amounts. Callers must only return what they
    /// took; anything beyond the totals is dropped.
    pub fn release(&mut self, cpus: u32, memory: u64) {
        self.cpu_count = self.cpu_count.saturating_add(cpus).min(self.total_cpus);
        self.memory = self.memory.saturating_add(memory).min(self.total_memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cpus: u32, memory: u64) -> Resource {
        Resource::new(ResourceId::parse("node-1").unwrap(), "node-1.local", cpus, memory)
    }

    #[test]
    fn test_totals_default_to_initial_amounts() {
        let r = node(8, 1000);
        assert_eq!(r.total_cpus(), 8);
        assert_eq!(r.total_memory(), 1000);
    }

    #[test]
    fn test_reregistration_keeps_usage() {
        let mut current = node(8, 1000);
        current.allocate(3, 400);

        let same = node(8, 1000).carrying_usage_of(&current);
        assert_eq!((same.cpu_count(), same.memory()), (5, 600));

        let grown = node(16, 2000)
            .with_state(ResourceState::NotReady)
            .carrying_usage_of(&current);
        assert_eq!((grown.cpu_count(), grown.memory()), (13, 1600));
        assert_eq!(grown.state(), ResourceState::NotReady);

        let shrunk = node(2, 100).carrying_usage_of(&current);
        assert_eq!((shrunk.cpu_count(), shrunk.memory()), (0, 0));
        assert_eq!((shrunk.total_cpus(), shrunk.total_memory()), (3, 400));
    }

    #[test]
    fn test_full_allocation() {
        let mut r = node(8, 1000);
        let grant = r.allocate(4, 400);
        assert_eq!(
            grant,
            Grant {
                cpus: 4,
                memory: 400,
                fully_satisfied: true
            }
        );
        assert_eq!(r.cpu_count(), 4);
        assert_eq!(r.memory(), 600);
    }

    #[test]
    fn test_partial_allocation_never_goes_negative() {
        let mut r = node(2, 100);
        let grant = r.allocate(4, 50);
        assert_eq!(grant.cpus, 2);
        assert_eq!(grant.memory, 50);
        assert!(!grant.fully_satisfied);
        assert_eq!(r.cpu_count(), 0);
        assert_eq!(r.memory(), 50);
    }

    #[test]
    fn test_cpu_and_memory_deducted_independently() {
        let mut r = node(8, 10);
        let grant = r.allocate(2, 50);
        assert_eq!(grant.cpus, 2);
        assert_eq!(grant.memory, 10);
        assert!(!grant.fully_satisfied);
    }

    #[test]
    fn test_release_restores_and_caps_at_totals() {
        let mut r = node(8, 1000);
        r.allocate(3, 300);
        r.release(3, 300);
        assert_eq!(r.cpu_count(), 8);
        assert_eq!(r.memory(), 1000);

        r.release(5, 5);
        assert_eq!(r.cpu_count(), 8);
        assert_eq!(r.memory(), 1000);
    }

    #[test]
    fn test_allocatable_requires_active_ready_and_capacity() {
        assert!(node(1, 1).is_allocatable());
        assert!(!node(0, 1).is_allocatable());
        assert!(!node(1, 0).is_allocatable());
        assert!(node(0, 0).is_usable());
        assert!(!node(4, 4)
            .with_availability(ResourceAvailability::Inactive)
            .is_allocatable());
        assert!(!node(4, 4).with_state(ResourceState::NotReady).is_usable());
    }

    #[test]
    fn test_with_totals_never_below_available() {
        let r = node(8, 1000).with_totals(4, 2000);
        assert_eq!(r.total_cpus(), 8);
        assert_eq!(r.total_memory(), 2000);
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(node(2, 10)).unwrap();
        assert_eq!(json["pool_id"], "node-1");
        assert_eq!(json["availability"], "ACTIVE");
        assert_eq!(json["state"], "READY");
        assert_eq!(json["total_cpus"], 2);
    }
}

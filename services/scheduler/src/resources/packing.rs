//! Packing a job's request onto the fleet.
//!
//! Each strategy either returns allocations whose granted totals equal the
//! request, or returns `None` after releasing everything it allocated along
//! the way.

use hydromaas_id::ResourceId;
use tracing::{debug, instrument, warn};

use super::{AssetGrouping, Resource, ResourceAllocation, ResourceError, ResourceManager};

/// Split `memory` over `units` parts; the last part takes the remainder.
fn unit_memory(memory: u64, units: u32, index: u32) -> u64 {
    let per = memory / u64::from(units);
    if index + 1 == units {
        memory - per * u64::from(units - 1)
    } else {
        per
    }
}

/// A node's planned share in a round-robin request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Share {
    resource_id: ResourceId,
    cpus: u32,
    memory: u64,
}

/// Give one more unit to each node with room, in order, until `remainder`
/// runs out. Fails if a full pass makes no progress.
fn spread_remainder(
    planned: &mut [u64],
    capacity: &[u64],
    mut remainder: u64,
) -> bool {
    while remainder > 0 {
        let mut progressed = false;
        for (plan, cap) in planned.iter_mut().zip(capacity) {
            if remainder == 0 {
                break;
            }
            if *plan < *cap {
                *plan += 1;
                remainder -= 1;
                progressed = true;
            }
        }
        if !progressed {
            return false;
        }
    }
    true
}

/// Plan an even split of `cpus` and `memory` over `nodes`.
///
/// Every node must cover the base share; remainders go one unit at a time to
/// nodes with room beyond it. Memory is split only over nodes that receive
/// CPUs.
fn plan_round_robin(nodes: &[Resource], cpus: u32, memory: u64) -> Option<Vec<Share>> {
    if nodes.is_empty() {
        return None;
    }
    let n = nodes.len() as u64;

    let cpu_capacity: Vec<u64> = nodes.iter().map(|r| u64::from(r.cpu_count())).collect();
    let base_cpus = u64::from(cpus) / n;
    if cpu_capacity.iter().any(|&c| c < base_cpus) {
        return None;
    }
    let mut planned_cpus = vec![base_cpus; nodes.len()];
    if !spread_remainder(&mut planned_cpus, &cpu_capacity, u64::from(cpus) % n) {
        return None;
    }

    let participants: Vec<(&Resource, u64)> = nodes
        .iter()
        .zip(planned_cpus)
        .filter(|(_, c)| *c > 0)
        .collect();
    let k = participants.len() as u64;
    let memory_capacity: Vec<u64> = participants.iter().map(|(r, _)| r.memory()).collect();
    let base_memory = memory / k;
    if memory_capacity.iter().any(|&m| m < base_memory) {
        return None;
    }
    let mut planned_memory = vec![base_memory; participants.len()];
    if !spread_remainder(&mut planned_memory, &memory_capacity, memory % k) {
        return None;
    }

    Some(
        participants
            .into_iter()
            .zip(planned_memory)
            .map(|((r, c), m)| Share {
                resource_id: r.resource_id().clone(),
                cpus: c as u32,
                memory: m,
            })
            .collect(),
    )
}

impl ResourceManager {
    /// Allocate `cpus`/`memory` from one node, as one allocation (BUNDLE) or
    /// one per CPU (SILO). Appends to `made` and returns what was granted.
    ///
    /// SILO units are never partial; the first unit the node refuses ends
    /// the run.
    async fn take(
        &self,
        resource_id: &ResourceId,
        cpus: u32,
        memory: u64,
        grouping: AssetGrouping,
        partial: bool,
        made: &mut Vec<ResourceAllocation>,
    ) -> Result<(u32, u64), ResourceError> {
        match grouping {
            AssetGrouping::Bundle => {
                match self.allocate_resource(resource_id, cpus, memory, partial).await? {
                    Some(a) => {
                        let granted = (a.cpu_count(), a.memory());
                        made.push(a);
                        Ok(granted)
                    }
                    None => Ok((0, 0)),
                }
            }
            AssetGrouping::Silo => {
                let (mut got_cpus, mut got_memory) = (0, 0);
                for i in 0..cpus {
                    let unit = unit_memory(memory, cpus, i);
                    let Some(a) = self.allocate_resource(resource_id, 1, unit, false).await? else {
                        break;
                    };
                    got_cpus += a.cpu_count();
                    got_memory += a.memory();
                    made.push(a);
                }
                Ok((got_cpus, got_memory))
            }
        }
    }

    /// Turn the outcome of a strategy into its result, releasing everything
    /// in `made` unless the strategy succeeded.
    async fn settle(
        &self,
        outcome: Result<bool, ResourceError>,
        made: Vec<ResourceAllocation>,
    ) -> Result<Option<Vec<ResourceAllocation>>, ResourceError> {
        match outcome {
            Ok(true) if !made.is_empty() => Ok(Some(made)),
            Ok(_) => {
                if !made.is_empty() {
                    debug!(count = made.len(), "Rolling back partial allocations");
                }
                self.release_resources(&made).await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(rollback) = self.release_resources(&made).await {
                    warn!(error = %rollback, "Rollback after allocation error failed");
                }
                Err(e)
            }
        }
    }

    async fn allocatable_resources(&self) -> Result<Vec<Resource>, ResourceError> {
        Ok(self
            .get_resources()
            .await?
            .into_iter()
            .filter(Resource::is_allocatable)
            .collect())
    }

    /// Place the whole request on the first allocatable node that can hold
    /// it.
    #[instrument(skip(self))]
    pub async fn allocate_single_node(
        &self,
        cpus: u32,
        memory: u64,
        grouping: AssetGrouping,
    ) -> Result<Option<Vec<ResourceAllocation>>, ResourceError> {
        Self::validate_allocation_parameters(cpus, memory)?;
        let candidates = self.allocatable_resources().await?;
        let Some(node) = candidates
            .iter()
            .find(|r| r.cpu_count() >= cpus && r.memory() >= memory)
        else {
            debug!("No single node can hold the request");
            return Ok(None);
        };

        let mut made = Vec::new();
        let outcome = self
            .take(node.resource_id(), cpus, memory, grouping, false, &mut made)
            .await
            .map(|granted| granted == (cpus, memory));
        self.settle(outcome, made).await
    }

    /// Greedily fill allocatable nodes in order until the request is met.
    ///
    /// BUNDLE asks each node for everything still outstanding and keeps
    /// whatever part it grants. SILO takes one-CPU units from a node until it
    /// refuses one, then moves on. Success needs both totals met.
    #[instrument(skip(self))]
    pub async fn allocate_fill_nodes(
        &self,
        cpus: u32,
        memory: u64,
        grouping: AssetGrouping,
    ) -> Result<Option<Vec<ResourceAllocation>>, ResourceError> {
        Self::validate_allocation_parameters(cpus, memory)?;
        let candidates = self.allocatable_resources().await?;

        let mut made = Vec::new();
        let outcome = match grouping {
            AssetGrouping::Bundle => self.fill_nodes(&candidates, cpus, memory, &mut made).await,
            AssetGrouping::Silo => {
                self.fill_nodes_by_unit(&candidates, cpus, memory, &mut made)
                    .await
            }
        };
        self.settle(outcome, made).await
    }

    async fn fill_nodes(
        &self,
        candidates: &[Resource],
        cpus: u32,
        memory: u64,
        made: &mut Vec<ResourceAllocation>,
    ) -> Result<bool, ResourceError> {
        let mut remaining_cpus = cpus;
        let mut remaining_memory = memory;

        for node in candidates {
            if remaining_cpus == 0 {
                break;
            }

            let before = made.len();
            let (got_cpus, got_memory) = self
                .take(
                    node.resource_id(),
                    remaining_cpus,
                    remaining_memory,
                    AssetGrouping::Bundle,
                    true,
                    made,
                )
                .await?;

            // A grant without CPUs, or without memory while memory is still
            // owed, does not move the request forward.
            if got_cpus == 0 || (remaining_memory > 0 && got_memory == 0) {
                let discarded = made.split_off(before);
                self.release_resources(&discarded).await?;
                continue;
            }

            remaining_cpus -= got_cpus;
            remaining_memory -= got_memory;
        }

        Ok(remaining_cpus == 0 && remaining_memory == 0)
    }

    /// Fill nodes one CPU at a time. Unit `i` of the request always carries
    /// the same memory, whichever node it lands on.
    async fn fill_nodes_by_unit(
        &self,
        candidates: &[Resource],
        cpus: u32,
        memory: u64,
        made: &mut Vec<ResourceAllocation>,
    ) -> Result<bool, ResourceError> {
        let mut next_unit = 0;

        for node in candidates {
            while next_unit < cpus {
                let unit = unit_memory(memory, cpus, next_unit);
                let Some(a) = self
                    .allocate_resource(node.resource_id(), 1, unit, false)
                    .await?
                else {
                    break;
                };
                made.push(a);
                next_unit += 1;
            }
            if next_unit == cpus {
                break;
            }
        }

        Ok(next_unit == cpus)
    }

    /// Spread the request evenly over every active, ready node.
    ///
    /// The split is planned from one snapshot before anything is allocated.
    /// Capacity consumed elsewhere between planning and execution makes the
    /// execution fail and roll back.
    #[instrument(skip(self))]
    pub async fn allocate_round_robin(
        &self,
        cpus: u32,
        memory: u64,
        grouping: AssetGrouping,
    ) -> Result<Option<Vec<ResourceAllocation>>, ResourceError> {
        Self::validate_allocation_parameters(cpus, memory)?;
        let nodes: Vec<Resource> = self
            .get_resources()
            .await?
            .into_iter()
            .filter(Resource::is_usable)
            .collect();

        let Some(plan) = plan_round_robin(&nodes, cpus, memory) else {
            debug!(nodes = nodes.len(), "Round-robin split does not fit the fleet");
            return Ok(None);
        };

        let mut made = Vec::new();
        let outcome = self.execute_plan(&plan, grouping, &mut made).await;
        self.settle(outcome, made).await
    }

    async fn execute_plan(
        &self,
        plan: &[Share],
        grouping: AssetGrouping,
        made: &mut Vec<ResourceAllocation>,
    ) -> Result<bool, ResourceError> {
        for share in plan {
            let granted = self
                .take(&share.resource_id, share.cpus, share.memory, grouping, false, made)
                .await?;
            if granted != (share.cpus, share.memory) {
                debug!(
                    resource_id = %share.resource_id,
                    "Planned share no longer available"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

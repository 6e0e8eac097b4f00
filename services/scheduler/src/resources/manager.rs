//! Atomic allocate and release against the shared store.

use std::sync::Arc;

use chrono::Utc;
use hydromaas_id::ResourceId;
use tracing::{debug, instrument, warn};

use super::{
    AllocationParadigm, AssetGrouping, Resource, ResourceAllocation, ResourceError,
};
use crate::store::{load, load_many, retry_on_conflict, Keys, KeyValueStore, Transaction};

/// Owns one pool of [`Resource`]s and every allocation made from it.
///
/// Several managers, in this or other processes, may share one store. Every
/// mutation is a read-compute-commit cycle conditioned on the versions read,
/// retried until it commits without conflict.
#[derive(Clone)]
pub struct ResourceManager {
    store: Arc<dyn KeyValueStore>,
    keys: Keys,
    pool: String,
}

impl ResourceManager {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Keys, pool: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            pool: pool.into(),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Register a node, or update the inventory of one already registered.
    ///
    /// Re-registering a known node keeps what its live allocations hold
    /// deducted; see [`Resource::carrying_usage_of`].
    #[instrument(skip(self, resource), fields(resource_id = %resource.resource_id()))]
    pub async fn add_resource(&self, resource: &Resource) -> Result<(), ResourceError> {
        let key = self.keys.resource(resource.resource_id());
        let pool_key = self.keys.resource_pool(&self.pool);

        retry_on_conflict(|| async {
            let current = load::<Resource>(self.store.as_ref(), &key).await?;
            let record = match &current {
                Some(current) => resource.carrying_usage_of(&current.value),
                None => resource.clone(),
            };

            let mut txn = Transaction::new();
            txn.expect_observed(&key, current.as_ref().map(|c| c.version))
                .put(&key, &record)?
                .set_add(&pool_key, &key);
            self.store.commit(txn).await?;
            debug!(
                cpus = record.cpu_count(),
                memory = record.memory(),
                updated = current.is_some(),
                "Resource registered"
            );
            Ok(())
        })
        .await
    }

    pub async fn add_resources(&self, resources: &[Resource]) -> Result<(), ResourceError> {
        for resource in resources {
            self.add_resource(resource).await?;
        }
        Ok(())
    }

    /// Every node of the pool, in registration order.
    pub async fn get_resources(&self) -> Result<Vec<Resource>, ResourceError> {
        let keys = self
            .store
            .set_members(&self.keys.resource_pool(&self.pool))
            .await?;
        let records = load_many::<Resource>(self.store.as_ref(), &keys).await?;
        Ok(records.into_iter().map(|r| r.value).collect())
    }

    pub async fn get_resource_ids(&self) -> Result<Vec<ResourceId>, ResourceError> {
        Ok(self
            .get_resources()
            .await?
            .into_iter()
            .map(|r| r.resource_id().clone())
            .collect())
    }

    pub async fn get_resource(&self, id: &ResourceId) -> Result<Option<Resource>, ResourceError> {
        let record = load::<Resource>(self.store.as_ref(), &self.keys.resource(id)).await?;
        Ok(record.map(|r| r.value))
    }

    /// Sum of available CPUs over the pool, from one consistent read.
    pub async fn get_available_cpu_count(&self) -> Result<u64, ResourceError> {
        Ok(self
            .get_resources()
            .await?
            .iter()
            .map(|r| u64::from(r.cpu_count()))
            .sum())
    }

    /// Both amounts must be positive.
    pub fn validate_allocation_parameters(cpus: u32, memory: u64) -> Result<(), ResourceError> {
        if cpus == 0 || memory == 0 {
            return Err(ResourceError::InvalidParameters { cpus, memory });
        }
        Ok(())
    }

    /// Carve an allocation out of one node.
    ///
    /// Without `partial`, a request the node cannot fully meet changes nothing
    /// and returns `None`. With `partial`, whatever the node can give is
    /// granted; `None` then means it had nothing at all. A known node that is
    /// not both active and ready also yields `None`, never an error; only an
    /// unregistered node is [`ResourceError::UnknownResource`].
    #[instrument(skip(self), fields(resource_id = %resource_id))]
    pub async fn allocate_resource(
        &self,
        resource_id: &ResourceId,
        cpus: u32,
        memory: u64,
        partial: bool,
    ) -> Result<Option<ResourceAllocation>, ResourceError> {
        if cpus == 0 {
            return Err(ResourceError::InvalidParameters { cpus, memory });
        }
        let resource_key = self.keys.resource(resource_id);

        retry_on_conflict(|| async {
            let Some(current) = load::<Resource>(self.store.as_ref(), &resource_key).await? else {
                return Err(ResourceError::UnknownResource(resource_id.clone()));
            };
            let mut resource = current.value;
            if !resource.is_usable() {
                debug!("Resource not active and ready");
                return Ok(None);
            }

            let grant = resource.allocate(cpus, memory);
            if grant.is_empty() || (!grant.fully_satisfied && !partial) {
                debug!(
                    granted_cpus = grant.cpus,
                    granted_memory = grant.memory,
                    "Request not satisfiable on resource"
                );
                return Ok(None);
            }

            let allocation = ResourceAllocation::new(
                resource_id.clone(),
                resource.hostname(),
                grant.cpus,
                grant.memory,
                Utc::now(),
            );

            // An allocation id taken by a concurrent writer shows up as a
            // conflict on the allocation key, and the retry draws a new
            // timestamp.
            let mut txn = Transaction::new();
            txn.expect_version(&resource_key, current.version)
                .put(&resource_key, &resource)?
                .expect_absent(self.keys.allocation(&allocation.unique_id()))
                .put(self.keys.allocation(&allocation.unique_id()), &allocation)?;
            self.store.commit(txn).await?;

            debug!(
                allocation_id = %allocation.unique_id(),
                cpus = grant.cpus,
                memory = grant.memory,
                "Resource allocated"
            );
            Ok(Some(allocation))
        })
        .await
    }

    /// Return an allocation to its node.
    ///
    /// The allocation record is deleted in the same commit that credits the
    /// node, so releasing it a second time finds nothing and returns `false`.
    #[instrument(skip(self, allocation), fields(allocation_id = %allocation.unique_id()))]
    pub async fn release_resource(
        &self,
        allocation: &ResourceAllocation,
    ) -> Result<bool, ResourceError> {
        let allocation_key = self.keys.allocation(&allocation.unique_id());
        let resource_key = self.keys.resource(allocation.resource_id());

        retry_on_conflict(|| async {
            let Some(record) =
                load::<ResourceAllocation>(self.store.as_ref(), &allocation_key).await?
            else {
                debug!("Allocation already released");
                return Ok(false);
            };
            let held = record.value;

            let mut txn = Transaction::new();
            txn.expect_version(&allocation_key, record.version)
                .delete(&allocation_key);

            match load::<Resource>(self.store.as_ref(), &resource_key).await? {
                Some(current) => {
                    let mut resource = current.value;
                    resource.release(held.cpu_count(), held.memory());
                    txn.expect_version(&resource_key, current.version)
                        .put(&resource_key, &resource)?;
                }
                None => {
                    warn!(
                        resource_id = %held.resource_id(),
                        "Releasing allocation of a resource that no longer exists"
                    );
                }
            }

            self.store.commit(txn).await?;
            debug!(
                cpus = held.cpu_count(),
                memory = held.memory(),
                "Resource released"
            );
            Ok(true)
        })
        .await
    }

    pub async fn release_resources(
        &self,
        allocations: &[ResourceAllocation],
    ) -> Result<(), ResourceError> {
        for allocation in allocations {
            self.release_resource(allocation).await?;
        }
        Ok(())
    }

    /// Whether the allocation has not been released.
    pub async fn allocation_exists(
        &self,
        allocation: &ResourceAllocation,
    ) -> Result<bool, ResourceError> {
        let key = self.keys.allocation(&allocation.unique_id());
        Ok(self.store.get(&key).await?.is_some())
    }

    /// Pack a request with the given paradigm.
    ///
    /// Returns `None` when the fleet cannot hold the request; nothing stays
    /// allocated in that case.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        paradigm: AllocationParadigm,
        cpus: u32,
        memory: u64,
        grouping: AssetGrouping,
    ) -> Result<Option<Vec<ResourceAllocation>>, ResourceError> {
        match paradigm {
            AllocationParadigm::SingleNode => self.allocate_single_node(cpus, memory, grouping).await,
            AllocationParadigm::FillNodes => self.allocate_fill_nodes(cpus, memory, grouping).await,
            AllocationParadigm::RoundRobin => {
                self.allocate_round_robin(cpus, memory, grouping).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceAvailability, ResourceState};
    use crate::store::MemoryStore;

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    async fn manager_with(nodes: &[(&str, u32, u64)]) -> ResourceManager {
        let manager = ResourceManager::new(Arc::new(MemoryStore::new()), Keys::default(), "default");
        for (name, cpus, memory) in nodes {
            manager
                .add_resource(&Resource::new(rid(name), format!("{name}.local"), *cpus, *memory))
                .await
                .unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_resources_listed_in_registration_order() {
        let manager = manager_with(&[("c", 1, 1), ("a", 1, 1), ("b", 1, 1)]).await;
        let ids: Vec<String> = manager
            .get_resource_ids()
            .await
            .unwrap()
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_available_cpu_count_sums_pool() {
        let manager = manager_with(&[("a", 4, 10), ("b", 6, 10)]).await;
        assert_eq!(manager.get_available_cpu_count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_allocate_and_release_round_trip() {
        let manager = manager_with(&[("a", 8, 1000)]).await;
        let allocation = manager
            .allocate_resource(&rid("a"), 3, 300, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(allocation.cpu_count(), 3);
        assert_eq!(allocation.hostname(), "a.local");

        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!((node.cpu_count(), node.memory()), (5, 700));
        assert!(manager.allocation_exists(&allocation).await.unwrap());

        assert!(manager.release_resource(&allocation).await.unwrap());
        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!((node.cpu_count(), node.memory()), (8, 1000));
        assert!(!manager.allocation_exists(&allocation).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_twice_credits_once() {
        let manager = manager_with(&[("a", 8, 1000)]).await;
        let allocation = manager
            .allocate_resource(&rid("a"), 2, 100, false)
            .await
            .unwrap()
            .unwrap();
        manager.allocate_resource(&rid("a"), 2, 100, false).await.unwrap();

        manager.release_resources(&[allocation.clone()]).await.unwrap();
        manager.release_resources(&[allocation]).await.unwrap();

        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!((node.cpu_count(), node.memory()), (6, 900));
    }

    #[tokio::test]
    async fn test_unsatisfied_non_partial_request_changes_nothing() {
        let manager = manager_with(&[("a", 2, 1000)]).await;
        let result = manager.allocate_resource(&rid("a"), 4, 10, false).await.unwrap();
        assert!(result.is_none());
        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!(node.cpu_count(), 2);
    }

    #[tokio::test]
    async fn test_partial_request_takes_what_is_left() {
        let manager = manager_with(&[("a", 2, 1000)]).await;
        let allocation = manager
            .allocate_resource(&rid("a"), 4, 10, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(allocation.cpu_count(), 2);
        assert_eq!(allocation.memory(), 10);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let manager = manager_with(&[("a", 2, 1000)]).await;
        assert!(matches!(
            manager.allocate_resource(&rid("a"), 0, 10, false).await,
            Err(ResourceError::InvalidParameters { .. })
        ));
        assert!(matches!(
            manager.allocate_resource(&rid("zzz"), 1, 10, false).await,
            Err(ResourceError::UnknownResource(_))
        ));
        assert!(ResourceManager::validate_allocation_parameters(1, 0).is_err());
        assert!(ResourceManager::validate_allocation_parameters(1, 1).is_ok());
    }

    #[tokio::test]
    async fn test_inactive_resource_not_allocated() {
        let manager = manager_with(&[]).await;
        manager
            .add_resource(
                &Resource::new(rid("a"), "a", 4, 100)
                    .with_availability(ResourceAvailability::Inactive),
            )
            .await
            .unwrap();
        assert!(manager
            .allocate_resource(&rid("a"), 1, 1, true)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_not_ready_resource_yields_none() {
        let manager = manager_with(&[]).await;
        manager
            .add_resource(&Resource::new(rid("a"), "a", 4, 100).with_state(ResourceState::NotReady))
            .await
            .unwrap();
        assert!(manager
            .allocate_resource(&rid("a"), 1, 1, false)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            manager.allocate_resource(&rid("missing"), 1, 1, false).await,
            Err(ResourceError::UnknownResource(_))
        ));
        assert_eq!(manager.get_resource(&rid("a")).await.unwrap().unwrap().cpu_count(), 4);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_live_allocations_deducted() {
        let manager = manager_with(&[("a", 8, 1000), ("b", 4, 500)]).await;
        let allocation = manager
            .allocate_resource(&rid("a"), 3, 300, false)
            .await
            .unwrap()
            .unwrap();

        manager
            .add_resources(&[
                Resource::new(rid("a"), "a.local", 8, 1000),
                Resource::new(rid("b"), "b.local", 4, 500),
            ])
            .await
            .unwrap();
        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!((node.cpu_count(), node.memory()), (5, 700));
        assert_eq!(manager.get_resource_ids().await.unwrap().len(), 2);

        // Inventory changes apply; usage is still held.
        manager
            .add_resource(
                &Resource::new(rid("a"), "a.renamed", 12, 1000)
                    .with_availability(ResourceAvailability::Inactive),
            )
            .await
            .unwrap();
        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!(node.hostname(), "a.renamed");
        assert_eq!(node.availability(), ResourceAvailability::Inactive);
        assert_eq!((node.cpu_count(), node.total_cpus()), (9, 12));

        assert!(manager.release_resource(&allocation).await.unwrap());
        let node = manager.get_resource(&rid("a")).await.unwrap().unwrap();
        assert_eq!((node.cpu_count(), node.memory()), (12, 1000));
    }
}

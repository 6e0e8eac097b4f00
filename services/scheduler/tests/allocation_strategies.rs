//! Packing strategy integration tests.
//!
//! Every strategy either grants exactly what was asked or leaves the fleet
//! as it found it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hydromaas_id::ResourceId;
use hydromaas_scheduler::{
    resources::{
        totals, AllocationParadigm, AssetGrouping, Resource, ResourceAllocation, ResourceManager,
    },
    store::{Keys, KeyValueStore, MemoryStore, StoreError, Transaction, Versioned},
};

fn nodes_of(nodes: &[(&str, u32, u64)]) -> Vec<Resource> {
    nodes
        .iter()
        .map(|(name, cpus, memory)| {
            Resource::new(ResourceId::parse(name).unwrap(), *name, *cpus, *memory)
        })
        .collect()
}

async fn fleet(nodes: &[(&str, u32, u64)]) -> ResourceManager {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let manager = ResourceManager::new(store, Keys::new("it"), "default");
    manager.add_resources(&nodes_of(nodes)).await.unwrap();
    manager
}

/// Store through which a rival scheduler takes capacity from one node right
/// after the n-th commit made through it.
struct Contended {
    inner: Arc<dyn KeyValueStore>,
    rival: ResourceManager,
    target: ResourceId,
    take: (u32, u64),
    after: usize,
    commits: AtomicUsize,
    taken: Mutex<Vec<ResourceAllocation>>,
}

impl Contended {
    fn taken(&self) -> Vec<ResourceAllocation> {
        self.taken.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyValueStore for Contended {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError> {
        self.inner.get(key).await
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<Versioned<serde_json::Value>>>, StoreError> {
        self.inner.get_many(keys).await
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(set).await
    }

    async fn commit(&self, txn: Transaction) -> Result<i64, StoreError> {
        let version = self.inner.commit(txn).await?;
        if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            let (cpus, memory) = self.take;
            let allocation = self
                .rival
                .allocate_resource(&self.target, cpus, memory, false)
                .await
                .unwrap()
                .expect("rival allocation");
            self.taken.lock().unwrap().push(allocation);
        }
        Ok(version)
    }
}

/// A fleet whose manager loses `take` on `target` to a rival after `after`
/// commits of its own. Also returns a manager reading the same fleet without
/// interference.
async fn contended_fleet(
    nodes: &[(&str, u32, u64)],
    target: &str,
    take: (u32, u64),
    after: usize,
) -> (ResourceManager, ResourceManager, Arc<Contended>) {
    let inner: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let rival = ResourceManager::new(inner.clone(), Keys::new("it"), "default");
    rival.add_resources(&nodes_of(nodes)).await.unwrap();

    let contended = Arc::new(Contended {
        inner,
        rival: rival.clone(),
        target: ResourceId::parse(target).unwrap(),
        take,
        after,
        commits: AtomicUsize::new(0),
        taken: Mutex::new(Vec::new()),
    });
    let store: Arc<dyn KeyValueStore> = contended.clone();
    let manager = ResourceManager::new(store, Keys::new("it"), "default");
    (manager, rival, contended)
}

fn placed(allocations: &[ResourceAllocation]) -> Vec<(&str, u32, u64)> {
    allocations
        .iter()
        .map(|a| (a.resource_id().as_str(), a.cpu_count(), a.memory()))
        .collect()
}

async fn cpus_left(manager: &ResourceManager) -> Vec<u32> {
    manager
        .get_resources()
        .await
        .unwrap()
        .iter()
        .map(Resource::cpu_count)
        .collect()
}

/// Every node's available amounts plus its live allocations equal its totals.
async fn assert_conserved(manager: &ResourceManager, live: &[ResourceAllocation]) {
    for node in manager.get_resources().await.unwrap() {
        let held: Vec<_> = live
            .iter()
            .filter(|a| a.resource_id() == node.resource_id())
            .cloned()
            .collect();
        let (cpus, memory) = totals(&held);
        assert_eq!(u64::from(node.cpu_count()) + cpus, u64::from(node.total_cpus()));
        assert_eq!(node.memory() + memory, node.total_memory());
    }
}

#[tokio::test]
async fn test_single_node_takes_first_fit() {
    let manager = fleet(&[("a", 5, 1_000), ("b", 96, 100_000)]).await;

    let allocations = manager
        .allocate_single_node(5, 800, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].resource_id().as_str(), "a");
    assert_eq!(allocations[0].cpu_count(), 5);
    assert_eq!(allocations[0].memory(), 800);
    assert_eq!(cpus_left(&manager).await, vec![0, 96]);
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_single_node_silo_splits_per_cpu() {
    let manager = fleet(&[("a", 4, 1_000)]).await;

    let allocations = manager
        .allocate_single_node(3, 100, AssetGrouping::Silo)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocations.len(), 3);
    assert!(allocations.iter().all(|a| a.cpu_count() == 1));
    assert_eq!(totals(&allocations), (3, 100));
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_fill_nodes_stops_once_satisfied() {
    let manager = fleet(&[("n1", 5, 5_000), ("n2", 96, 96_000), ("n3", 42, 42_000)]).await;

    let allocations = manager
        .allocate_fill_nodes(10, 10_000, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    let placed: Vec<(&str, u32)> = allocations
        .iter()
        .map(|a| (a.resource_id().as_str(), a.cpu_count()))
        .collect();
    assert_eq!(placed, vec![("n1", 5), ("n2", 5)]);
    assert_eq!(totals(&allocations), (10, 10_000));
    assert_eq!(cpus_left(&manager).await, vec![0, 91, 42]);
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_fill_nodes_low_memory_node_gives_its_cpus() {
    let manager = fleet(&[("n1", 5, 1_000), ("n2", 96, 96_000), ("n3", 42, 42_000)]).await;

    let allocations = manager
        .allocate_fill_nodes(10, 10_000, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        placed(&allocations),
        vec![("n1", 5, 1_000), ("n2", 5, 9_000)]
    );
    assert_eq!(cpus_left(&manager).await, vec![0, 91, 42]);
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_fill_nodes_moves_remaining_memory_to_next_node() {
    let manager = fleet(&[("n1", 5, 1_000), ("n2", 5, 100_000)]).await;

    let allocations = manager
        .allocate_fill_nodes(10, 10_000, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        placed(&allocations),
        vec![("n1", 5, 1_000), ("n2", 5, 9_000)]
    );
    assert_eq!(totals(&allocations), (10, 10_000));
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_fill_nodes_fails_when_memory_falls_short() {
    let manager = fleet(&[("n1", 5, 1_000), ("n2", 5, 1_000)]).await;

    let result = manager
        .allocate_fill_nodes(10, 10_000, AssetGrouping::Bundle)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(cpus_left(&manager).await, vec![5, 5]);
    assert_conserved(&manager, &[]).await;
}

#[tokio::test]
async fn test_fill_nodes_silo_units_span_nodes() {
    let manager = fleet(&[("n1", 2, 1_000), ("n2", 8, 8_000)]).await;

    let allocations = manager
        .allocate_fill_nodes(5, 500, AssetGrouping::Silo)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocations.len(), 5);
    assert!(allocations.iter().all(|a| a.cpu_count() == 1 && a.memory() == 100));
    let on_n1 = allocations
        .iter()
        .filter(|a| a.resource_id().as_str() == "n1")
        .count();
    assert_eq!(on_n1, 2);
    assert_eq!(cpus_left(&manager).await, vec![0, 5]);
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_fill_nodes_silo_rolls_back_partway() {
    // n1 runs out of memory after two units, n2 out of CPUs after one.
    let manager = fleet(&[("n1", 4, 50), ("n2", 1, 1_000)]).await;

    let result = manager
        .allocate_fill_nodes(4, 100, AssetGrouping::Silo)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(cpus_left(&manager).await, vec![4, 1]);
    assert_conserved(&manager, &[]).await;
}

#[tokio::test]
async fn test_fill_nodes_rolls_back_when_fleet_exhausted() {
    let manager = fleet(&[("n1", 2, 1_000), ("n2", 2, 1_000)]).await;

    let result = manager
        .allocate_fill_nodes(5, 100, AssetGrouping::Bundle)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(cpus_left(&manager).await, vec![2, 2]);
    assert_conserved(&manager, &[]).await;
}

#[tokio::test]
async fn test_round_robin_even_split() {
    let manager = fleet(&[("a", 4, 300), ("b", 4, 300), ("c", 4, 300)]).await;

    let allocations = manager
        .allocate_round_robin(9, 90, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocations.len(), 3);
    assert!(allocations.iter().all(|a| a.cpu_count() == 3));
    assert_eq!(totals(&allocations), (9, 90));
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_round_robin_remainder_goes_to_spare_capacity() {
    let manager = fleet(&[("a", 3, 300), ("b", 4, 300), ("c", 4, 300)]).await;

    let allocations = manager
        .allocate_round_robin(10, 90, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    let cpus: Vec<u32> = allocations.iter().map(|a| a.cpu_count()).collect();
    assert_eq!(cpus, vec![3, 4, 3]);
    assert_eq!(totals(&allocations), (10, 90));
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_round_robin_fails_cleanly_without_base_share() {
    let manager = fleet(&[("a", 2, 300), ("b", 4, 300), ("c", 4, 300)]).await;

    let result = manager
        .allocate_round_robin(10, 90, AssetGrouping::Bundle)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(cpus_left(&manager).await, vec![2, 4, 4]);
    assert_conserved(&manager, &[]).await;
}

#[tokio::test]
async fn test_round_robin_silo_splits_each_share() {
    let manager = fleet(&[("a", 4, 300), ("b", 4, 300), ("c", 4, 300)]).await;

    let allocations = manager
        .allocate_round_robin(6, 60, AssetGrouping::Silo)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocations.len(), 6);
    assert!(allocations.iter().all(|a| a.cpu_count() == 1 && a.memory() == 10));
    assert_eq!(cpus_left(&manager).await, vec![2, 2, 2]);
    assert_conserved(&manager, &allocations).await;
}

#[tokio::test]
async fn test_single_node_silo_rolls_back_when_capacity_taken_midway() {
    // The rival takes two CPUs right after the first unit lands.
    let (manager, rival, contended) = contended_fleet(&[("a", 4, 400)], "a", (2, 100), 1).await;

    let result = manager
        .allocate_single_node(4, 400, AssetGrouping::Silo)
        .await
        .unwrap();
    assert!(result.is_none());

    let taken = contended.taken();
    assert_eq!(taken.len(), 1);
    assert_eq!(cpus_left(&rival).await, vec![2]);
    assert_conserved(&rival, &taken).await;
}

#[tokio::test]
async fn test_round_robin_silo_rolls_back_when_planned_share_taken() {
    // Planned 2 + 2; the rival takes one of b's CPUs after a's two units
    // and b's first.
    let (manager, rival, contended) =
        contended_fleet(&[("a", 2, 200), ("b", 2, 200)], "b", (1, 1), 3).await;

    let result = manager
        .allocate_round_robin(4, 400, AssetGrouping::Silo)
        .await
        .unwrap();
    assert!(result.is_none());

    let taken = contended.taken();
    assert_eq!(cpus_left(&rival).await, vec![2, 1]);
    assert_conserved(&rival, &taken).await;
}

#[tokio::test]
async fn test_reregistering_fleet_keeps_live_allocations() {
    let nodes = [("a", 4, 1_000), ("b", 4, 1_000)];
    let manager = fleet(&nodes).await;

    let allocations = manager
        .allocate_fill_nodes(6, 600, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cpus_left(&manager).await, vec![0, 2]);

    manager.add_resources(&nodes_of(&nodes)).await.unwrap();
    assert_eq!(cpus_left(&manager).await, vec![0, 2]);
    assert_conserved(&manager, &allocations).await;

    // Nothing double-books the re-registered nodes.
    assert!(manager
        .allocate_single_node(4, 100, AssetGrouping::Bundle)
        .await
        .unwrap()
        .is_none());

    manager.release_resources(&allocations).await.unwrap();
    assert_eq!(cpus_left(&manager).await, vec![4, 4]);
    assert_conserved(&manager, &[]).await;
}

#[tokio::test]
async fn test_dispatch_by_paradigm() {
    let manager = fleet(&[("a", 4, 400), ("b", 4, 400)]).await;

    let allocations = manager
        .allocate(AllocationParadigm::RoundRobin, 4, 200, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocations.len(), 2);
    assert_eq!(cpus_left(&manager).await, vec![2, 2]);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let manager = fleet(&[("a", 4, 400)]).await;
    let allocations = manager
        .allocate_single_node(4, 400, AssetGrouping::Bundle)
        .await
        .unwrap()
        .unwrap();

    manager.release_resources(&allocations).await.unwrap();
    manager.release_resources(&allocations).await.unwrap();
    assert!(!manager.release_resource(&allocations[0]).await.unwrap());

    let node = &manager.get_resources().await.unwrap()[0];
    assert_eq!(node.cpu_count(), 4);
    assert_eq!(node.memory(), 400);
    assert!(!manager.allocation_exists(&allocations[0]).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_conserve_capacity() {
    let manager = fleet(&[("a", 4, 1_000), ("b", 4, 1_000), ("c", 4, 1_000), ("d", 4, 1_000)]).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .allocate_fill_nodes(1, 10, AssetGrouping::Bundle)
                .await
                .unwrap()
        }));
    }

    let mut granted = Vec::new();
    for handle in handles {
        if let Some(allocations) = handle.await.unwrap() {
            granted.extend(allocations);
        }
    }

    assert_eq!(granted.len(), 16);
    assert_eq!(manager.get_available_cpu_count().await.unwrap(), 0);
    assert_conserved(&manager, &granted).await;

    manager.release_resources(&granted).await.unwrap();
    assert_eq!(manager.get_available_cpu_count().await.unwrap(), 16);
    assert_conserved(&manager, &[]).await;
}

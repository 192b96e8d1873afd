//! Scheduler: the allocator, lease manager and node registry behind one handle

use autobot_core::{
    AllocationRequest, AutobotConfig, AutobotError, AutobotResult, GpuSlot, Lease, LeaseFilter,
    LeaseId, LeaseTtl, ModelCapacity, NodeInfo, Reservation, SlotOccupancy, StorageConfig,
};
use autobot_network::{prober_from_config, NodeProber, NodeRegistry, RefreshSummary};
use autobot_store::{
    capacity_by_model, InventoryStore, LeaseStore, MemoryInventory, MemoryLeaseStore,
    StateSnapshot,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::allocator::Allocator;
use crate::lease::LeaseManager;
use crate::placement::strategy_for;
use crate::retry::StoreRetry;

/// A node with its slots, as reported to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub info: NodeInfo,
    pub eligible: bool,
    pub slots: Vec<GpuSlot>,
    pub capacity: Vec<ModelCapacity>,
}

/// Cluster-wide summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub nodes_total: usize,
    pub nodes_eligible: usize,
    /// Capacity on eligible nodes only
    pub models: Vec<ModelCapacity>,
    pub active_leases: usize,
}

/// Disagreement between the inventory and the lease records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inconsistency {
    /// Slot reserved by a lease that is not active or does not cover it
    OrphanReservation {
        node_id: String,
        index: u32,
        lease_id: Option<LeaseId>,
    },
    /// Active lease covering a slot it does not hold
    MissingReservation {
        lease_id: LeaseId,
        node_id: String,
        index: u32,
    },
    /// Slot covered by more than one active lease
    DoubleBooked {
        node_id: String,
        index: u32,
        leases: Vec<LeaseId>,
    },
}

/// Handle over the whole resolver
pub struct Scheduler {
    inventory: Arc<dyn InventoryStore>,
    lease_store: Arc<dyn LeaseStore>,
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    allocator: Allocator,
    default_ttl: LeaseTtl,
    sweep_interval: Duration,
    storage: StorageConfig,
}

impl Scheduler {
    /// Build a scheduler over the given stores and prober
    pub fn new(
        config: &AutobotConfig,
        inventory: Arc<dyn InventoryStore>,
        lease_store: Arc<dyn LeaseStore>,
        prober: Arc<dyn NodeProber>,
    ) -> AutobotResult<Self> {
        config.validate()?;

        let retry = StoreRetry::new(
            config.allocator.store_retries,
            Duration::from_millis(config.allocator.store_retry_backoff_ms),
        );
        let registry = Arc::new(NodeRegistry::new(
            config.nodes.clone(),
            prober,
            inventory.clone(),
            config.registry.clone(),
        )?);
        let leases = Arc::new(LeaseManager::new(
            lease_store.clone(),
            inventory.clone(),
            &config.leases,
            retry,
        ));
        let allocator = Allocator::new(
            inventory.clone(),
            registry.clone(),
            leases.clone(),
            strategy_for(config.allocator.placement),
            config.allocator.clone(),
        );
        let default_ttl = config.leases.default_ttl()?;

        info!(
            nodes = config.nodes.len(),
            default_ttl = %default_ttl,
            "Scheduler initialized"
        );

        Ok(Self {
            inventory,
            lease_store,
            registry,
            leases,
            allocator,
            default_ttl,
            sweep_interval: Duration::from_secs(config.leases.sweep_interval_secs.max(1)),
            storage: config.storage.clone(),
        })
    }

    /// Build a scheduler with in-process stores and the configured prober
    pub fn from_config(config: &AutobotConfig) -> AutobotResult<Self> {
        let prober = prober_from_config(&config.registry.probe)?;
        Self::new(
            config,
            Arc::new(MemoryInventory::new()),
            Arc::new(MemoryLeaseStore::new()),
            prober,
        )
    }

    /// Reserve `count` GPUs of `model` on one node
    pub async fn allocate(
        &self,
        model: &str,
        count: u32,
        requester: &str,
        ttl: Option<LeaseTtl>,
    ) -> AutobotResult<Reservation> {
        let request =
            AllocationRequest::new(model, count, requester, ttl.unwrap_or(self.default_ttl));
        self.allocator.allocate(&request).await
    }

    pub async fn release(&self, id: LeaseId) -> AutobotResult<Lease> {
        self.leases.release(id).await
    }

    pub async fn renew(&self, id: LeaseId, ttl: Option<LeaseTtl>) -> AutobotResult<Lease> {
        self.leases.renew(id, ttl).await
    }

    pub async fn lease(&self, id: LeaseId) -> AutobotResult<Lease> {
        self.leases.get(id).await
    }

    pub async fn list_leases(&self, filter: LeaseFilter) -> AutobotResult<Vec<Lease>> {
        self.leases.list(filter).await
    }

    /// Every discovered node with its slots
    pub async fn nodes(&self) -> AutobotResult<Vec<NodeView>> {
        let mut views = Vec::new();
        for info in self.registry.list_nodes().await {
            let slots = match self.inventory.get_slots(&info.id).await {
                Ok(slots) => slots,
                Err(AutobotError::NodeNotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            views.push(NodeView {
                eligible: info.is_eligible(),
                capacity: capacity_by_model(&slots),
                info,
                slots,
            });
        }
        Ok(views)
    }

    pub async fn drain(&self, node_id: &str) -> AutobotResult<NodeInfo> {
        self.registry.drain(node_id).await
    }

    pub async fn undrain(&self, node_id: &str) -> AutobotResult<NodeInfo> {
        self.registry.undrain(node_id).await
    }

    pub async fn status(&self) -> AutobotResult<ClusterStatus> {
        let nodes = self.registry.list_nodes().await;
        let mut eligible_slots = Vec::new();
        let mut nodes_eligible = 0;
        for node in nodes.iter().filter(|n| n.is_eligible()) {
            nodes_eligible += 1;
            match self.inventory.get_slots(&node.id).await {
                Ok(slots) => eligible_slots.extend(slots),
                Err(AutobotError::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let active_leases = self.leases.list(LeaseFilter::default()).await?.len();

        Ok(ClusterStatus {
            nodes_total: nodes.len(),
            nodes_eligible,
            models: capacity_by_model(&eligible_slots),
            active_leases,
        })
    }

    /// Probe every node once
    pub async fn refresh(&self) -> RefreshSummary {
        self.registry.refresh().await
    }

    /// Expire due leases, forget old ones and repair orphaned slots
    pub async fn sweep(&self) -> AutobotResult<Vec<Lease>> {
        let now = Utc::now();
        let expired = self.leases.sweep_expired_at(now).await?;
        self.leases.prune(now).await?;
        self.reconcile().await?;
        Ok(expired)
    }

    /// Compare inventory occupancy against active leases
    pub async fn check_consistency(&self) -> AutobotResult<Vec<Inconsistency>> {
        let nodes = self.inventory.snapshot().await?;
        let active = self.leases.list(LeaseFilter::default()).await?;

        let mut covering: BTreeMap<(String, u32), Vec<LeaseId>> = BTreeMap::new();
        for lease in &active {
            for &index in &lease.slot_indices {
                covering
                    .entry((lease.node_id.clone(), index))
                    .or_default()
                    .push(lease.id);
            }
        }

        let mut slots: BTreeMap<(String, u32), GpuSlot> = BTreeMap::new();
        for node in nodes {
            for slot in node.slots {
                slots.insert((node.node_id.clone(), slot.index), slot);
            }
        }

        let mut found = Vec::new();

        for ((node_id, index), leases) in &covering {
            if leases.len() > 1 {
                found.push(Inconsistency::DoubleBooked {
                    node_id: node_id.clone(),
                    index: *index,
                    leases: leases.clone(),
                });
            }
            for &lease_id in leases {
                let held = slots.get(&(node_id.clone(), *index)).is_some_and(|s| {
                    s.occupancy == SlotOccupancy::Reserved && s.lease_id == Some(lease_id)
                });
                if !held {
                    found.push(Inconsistency::MissingReservation {
                        lease_id,
                        node_id: node_id.clone(),
                        index: *index,
                    });
                }
            }
        }

        let orphans = slots
            .iter()
            .filter(|(_, slot)| slot.occupancy == SlotOccupancy::Reserved)
            .filter(|(key, slot)| {
                !covering
                    .get(*key)
                    .is_some_and(|leases| slot.lease_id.is_some_and(|id| leases.contains(&id)))
            })
            .map(|((node_id, index), slot)| Inconsistency::OrphanReservation {
                node_id: node_id.clone(),
                index: *index,
                lease_id: slot.lease_id,
            });
        found.extend(orphans);

        Ok(found)
    }

    /// Free slots still reserved under leases that have ended.
    /// Returns the number of slots freed.
    ///
    /// Slots held under lease ids with no record are left alone, since an
    /// allocation in flight reserves slots before its lease is stored.
    pub async fn reconcile(&self) -> AutobotResult<usize> {
        self.repair(false).await
    }

    async fn repair(&self, include_unknown: bool) -> AutobotResult<usize> {
        let inconsistencies = self.check_consistency().await?;
        let mut freed = 0;
        let mut reported: HashSet<LeaseId> = HashSet::new();

        for inconsistency in inconsistencies {
            match inconsistency {
                Inconsistency::OrphanReservation {
                    node_id,
                    index,
                    lease_id: Some(lease_id),
                } => {
                    match self.lease_store.get(lease_id).await? {
                        Some(lease) if lease.is_active() => {
                            error!(
                                node = %node_id,
                                slot = index,
                                lease_id = %lease_id,
                                "Slot held by an active lease that does not cover it"
                            );
                            continue;
                        }
                        None if !include_unknown => {
                            debug!(node = %node_id, slot = index, lease_id = %lease_id, "Slot held by unrecorded lease");
                            continue;
                        }
                        _ => {}
                    }
                    freed += self.inventory.set_free(&node_id, &[index], lease_id).await?;
                    warn!(node = %node_id, slot = index, lease_id = %lease_id, "Freed orphaned slot");
                }
                Inconsistency::MissingReservation { lease_id, .. } => {
                    if reported.insert(lease_id) {
                        error!(lease_id = %lease_id, "Active lease does not hold its slots");
                    }
                }
                other => error!(inconsistency = ?other, "Inventory inconsistency"),
            }
        }

        if freed > 0 {
            info!(freed = freed, "Reconciled inventory");
        }
        Ok(freed)
    }

    /// Write the current state to `path`
    pub async fn save_snapshot(&self, path: &Path) -> AutobotResult<()> {
        let snapshot =
            StateSnapshot::capture(self.inventory.as_ref(), self.lease_store.as_ref()).await?;
        snapshot.save(path).await
    }

    /// Load state from `path` if it exists, then free every slot no
    /// active lease covers. Call before serving requests.
    /// Returns whether a snapshot was found.
    pub async fn restore_snapshot(&self, path: &Path) -> AutobotResult<bool> {
        let Some(snapshot) = StateSnapshot::load(path).await? else {
            info!(path = %path.display(), "No snapshot to restore");
            return Ok(false);
        };
        let leases = snapshot.leases.len();
        snapshot
            .apply(self.inventory.as_ref(), self.lease_store.as_ref())
            .await?;
        let freed = self.repair(true).await?;
        info!(
            path = %path.display(),
            leases = leases,
            freed = freed,
            "Snapshot restored"
        );
        Ok(true)
    }

    /// Configured snapshot path, if any
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.storage.snapshot_path.as_deref()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn inventory(&self) -> &Arc<dyn InventoryStore> {
        &self.inventory
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Start the refresh, sweep and snapshot loops. They stop when
    /// `shutdown` flips to `true`.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = self.clone();
        handles.push(every(
            "refresh",
            self.registry.refresh_interval(),
            shutdown.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    let summary = scheduler.refresh().await;
                    if summary.failed > 0 {
                        debug!(failed = summary.failed, "Refresh had probe failures");
                    }
                }
            },
        ));

        let scheduler = self.clone();
        handles.push(every("sweep", self.sweep_interval, shutdown.clone(), move || {
            let scheduler = scheduler.clone();
            async move {
                if let Err(e) = scheduler.sweep().await {
                    warn!(error = %e, "Lease sweep failed");
                }
            }
        }));

        if let Some(path) = self.storage.snapshot_path.clone() {
            let scheduler = self.clone();
            let interval = Duration::from_secs(self.storage.snapshot_interval_secs.max(1));
            handles.push(every("snapshot", interval, shutdown, move || {
                let scheduler = scheduler.clone();
                let path = path.clone();
                async move {
                    if let Err(e) = scheduler.save_snapshot(&path).await {
                        warn!(path = %path.display(), error = %e, "Snapshot failed");
                    }
                }
            }));
        }

        handles
    }
}

/// Run `tick` every `period` until shutdown. The first tick fires after one
/// full period. Each tick runs as its own task so a panic ends that tick
/// only.
fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(task = name, period = ?period, "Background task started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = tokio::spawn(tick()).await {
                        error!(task = name, error = %e, "Background tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(task = name, "Background task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobot_core::{LeaseState, NodeSpec};
    use autobot_network::StaticProber;

    fn config() -> AutobotConfig {
        AutobotConfig {
            nodes: vec![NodeSpec {
                id: "gpu-node-7".to_string(),
                gpus: [("rtx2080".to_string(), 4)].into_iter().collect(),
                agent_url: None,
            }],
            ..AutobotConfig::default()
        }
    }

    async fn scheduler() -> Scheduler {
        let scheduler = Scheduler::new(
            &config(),
            Arc::new(MemoryInventory::new()),
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(StaticProber),
        )
        .unwrap();
        scheduler.refresh().await;
        scheduler
    }

    #[tokio::test]
    async fn test_status_counts() {
        let scheduler = scheduler().await;
        scheduler.allocate("rtx2080", 3, "bob", None).await.unwrap();

        let status = scheduler.status().await.unwrap();
        assert_eq!(status.nodes_total, 1);
        assert_eq!(status.nodes_eligible, 1);
        assert_eq!(status.active_leases, 1);
        assert_eq!(status.models[0].model, "rtx2080");
        assert_eq!(status.models[0].total, 4);
        assert_eq!(status.models[0].free, 1);
    }

    #[tokio::test]
    async fn test_default_ttl_applied() {
        let scheduler = scheduler().await;
        let reservation = scheduler.allocate("rtx2080", 1, "bob", None).await.unwrap();
        let lease = scheduler.lease(reservation.lease_id).await.unwrap();
        assert_eq!(lease.ttl, LeaseTtl::Seconds(24 * 3600));
    }

    #[tokio::test]
    async fn test_reconcile_frees_ended_lease_slots() {
        let scheduler = scheduler().await;
        let reservation = scheduler.allocate("rtx2080", 2, "bob", None).await.unwrap();

        // Lease ended without its slots being freed.
        scheduler
            .lease_store
            .transition(
                reservation.lease_id,
                LeaseState::Active,
                LeaseState::Expired,
                Utc::now(),
            )
            .await
            .unwrap();

        let found = scheduler.check_consistency().await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(matches!(found[0], Inconsistency::OrphanReservation { .. }));

        assert_eq!(scheduler.reconcile().await.unwrap(), 2);
        assert!(scheduler.check_consistency().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_leaves_unrecorded_reservations() {
        let scheduler = scheduler().await;
        let in_flight = LeaseId::new();
        scheduler
            .inventory()
            .try_set_occupied("gpu-node-7", &[2, 3], in_flight)
            .await
            .unwrap();

        assert_eq!(scheduler.reconcile().await.unwrap(), 0);
        assert_eq!(scheduler.check_consistency().await.unwrap().len(), 2);

        assert_eq!(scheduler.repair(true).await.unwrap(), 2);
        assert!(scheduler.check_consistency().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nodes_view() {
        let scheduler = scheduler().await;
        scheduler.drain("gpu-node-7").await.unwrap();

        let nodes = scheduler.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(!nodes[0].eligible);
        assert_eq!(nodes[0].slots.len(), 4);
        assert_eq!(nodes[0].capacity[0].free, 4);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let scheduler = Arc::new(scheduler().await);
        let (tx, rx) = watch::channel(false);
        let handles = scheduler.spawn_background(rx);
        assert_eq!(handles.len(), 2);

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_panicking_tick_keeps_loop_running() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let ticks = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let handle = {
            let ticks = ticks.clone();
            every("flaky", Duration::from_millis(10), rx, move || {
                let ticks = ticks.clone();
                async move {
                    if ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first tick fails");
                    }
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while ticks.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

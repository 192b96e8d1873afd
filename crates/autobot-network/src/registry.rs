//! Node registry: which nodes are alive and eligible for allocation

use autobot_core::{
    AutobotError, AutobotResult, NodeInfo, NodeSpec, NodeStatus, RegistryConfig, SlotSpec,
};
use autobot_store::InventoryStore;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::probe::NodeProber;

type NodesMap = BTreeMap<String, NodeInfo>;

/// Outcome of one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub probed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Nodes that crossed the failure threshold in this pass
    pub became_unreachable: Vec<String>,
    /// Nodes drained after staying unreachable past the grace period
    pub drained: Vec<String>,
}

/// Liveness registry fed by periodic probes
pub struct NodeRegistry {
    /// Nodes to probe
    catalog: Vec<NodeSpec>,
    /// Nodes seen at least once, indexed by id
    nodes: RwLock<NodesMap>,
    prober: Arc<dyn NodeProber>,
    inventory: Arc<dyn InventoryStore>,
    config: RegistryConfig,
}

impl NodeRegistry {
    /// Create a registry over a node catalog
    pub fn new(
        catalog: Vec<NodeSpec>,
        prober: Arc<dyn NodeProber>,
        inventory: Arc<dyn InventoryStore>,
        config: RegistryConfig,
    ) -> AutobotResult<Self> {
        for node in &catalog {
            autobot_core::validate_node_id(&node.id)?;
        }

        info!(
            nodes = catalog.len(),
            prober = prober.name(),
            failure_threshold = config.failure_threshold,
            "Node registry initialized"
        );

        Ok(Self {
            catalog,
            nodes: RwLock::new(BTreeMap::new()),
            prober,
            inventory,
            config,
        })
    }

    /// Probe every catalog node and update liveness
    pub async fn refresh(&self) -> RefreshSummary {
        self.refresh_at(Utc::now()).await
    }

    /// [`NodeRegistry::refresh`] with an explicit clock
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> RefreshSummary {
        let probes = self.catalog.iter().map(|node| async move {
            let result = self.prober.probe(node).await;
            (node.id.clone(), result)
        });
        let results = join_all(probes).await;

        // Feed the inventory before touching registry state so eligibility
        // never points at a node without slots.
        let mut outcomes: Vec<(String, Result<u32, String>)> = Vec::with_capacity(results.len());
        for (node_id, result) in results {
            let outcome = match result {
                Ok(slots) => self.record_slots(&node_id, slots).await,
                Err(e) => Err(e.to_string()),
            };
            outcomes.push((node_id, outcome));
        }

        let mut summary = RefreshSummary {
            probed: outcomes.len(),
            ..RefreshSummary::default()
        };

        let grace = Duration::seconds(self.config.drain_grace_secs as i64);
        let mut nodes = self.nodes.write().await;

        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(slot_count) => {
                    summary.succeeded += 1;
                    let node = nodes.entry(node_id.clone()).or_insert_with(|| {
                        info!(node = %node_id, slots = slot_count, "Node discovered");
                        NodeInfo::new(node_id.clone())
                    });
                    let previous = node.status;
                    node.status = if node.operator_drained {
                        NodeStatus::Drained
                    } else {
                        NodeStatus::Alive
                    };
                    node.consecutive_failures = 0;
                    node.last_seen = Some(now);
                    node.unreachable_since = None;
                    node.slot_count = slot_count;

                    if previous != node.status {
                        info!(node = %node_id, from = %previous, to = %node.status, "Node status changed");
                    }
                }
                Err(error) => {
                    summary.failed += 1;
                    let Some(node) = nodes.get_mut(&node_id) else {
                        debug!(node = %node_id, error = %error, "Probe failed for undiscovered node");
                        continue;
                    };
                    node.consecutive_failures += 1;
                    warn!(
                        node = %node_id,
                        failures = node.consecutive_failures,
                        error = %error,
                        "Node probe failed"
                    );

                    let status = node.status;
                    match status {
                        NodeStatus::Alive
                            if node.consecutive_failures >= self.config.failure_threshold =>
                        {
                            node.status = NodeStatus::Unreachable;
                            node.unreachable_since = Some(now);
                            summary.became_unreachable.push(node_id.clone());
                            warn!(node = %node_id, "Node marked unreachable");
                        }
                        NodeStatus::Unreachable => {
                            let since = *node.unreachable_since.get_or_insert(now);
                            if now - since >= grace {
                                node.status = NodeStatus::Drained;
                                summary.drained.push(node_id.clone());
                                warn!(node = %node_id, "Node drained after grace period");
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        debug!(
            probed = summary.probed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Registry refreshed"
        );
        summary
    }

    async fn record_slots(&self, node_id: &str, slots: Vec<SlotSpec>) -> Result<u32, String> {
        let count = slots.len() as u32;
        self.inventory
            .upsert_node(node_id, slots)
            .await
            .map(|_| count)
            .map_err(|e| format!("inventory update failed: {}", e))
    }

    /// Alive, non-drained nodes ordered by id
    pub async fn list_eligible_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        nodes.values().filter(|n| n.is_eligible()).cloned().collect()
    }

    /// Every discovered node ordered by id
    pub async fn list_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        nodes.values().cloned().collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Exclude a node from allocation. Existing leases are untouched.
    pub async fn drain(&self, node_id: &str) -> AutobotResult<NodeInfo> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| AutobotError::NodeNotFound(node_id.to_string()))?;
        node.operator_drained = true;
        node.status = NodeStatus::Drained;
        info!(node = node_id, "Node drained by operator");
        Ok(node.clone())
    }

    /// Return an operator-drained node to service. It becomes alive on the
    /// next successful probe.
    pub async fn undrain(&self, node_id: &str) -> AutobotResult<NodeInfo> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| AutobotError::NodeNotFound(node_id.to_string()))?;
        node.operator_drained = false;
        if node.status == NodeStatus::Drained {
            node.status = NodeStatus::Unreachable;
            node.unreachable_since = None;
        }
        info!(node = node_id, "Node undrained by operator");
        Ok(node.clone())
    }

    /// Refresh interval from configuration
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.refresh_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProber;
    use async_trait::async_trait;
    use autobot_store::MemoryInventory;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Static prober with a switchable set of dead nodes
    struct FlakyProber {
        down: Mutex<HashSet<String>>,
    }

    impl FlakyProber {
        fn new() -> Self {
            Self {
                down: Mutex::new(HashSet::new()),
            }
        }

        fn set_down(&self, node: &str, down: bool) {
            let mut set = self.down.lock().unwrap();
            if down {
                set.insert(node.to_string());
            } else {
                set.remove(node);
            }
        }
    }

    #[async_trait]
    impl NodeProber for FlakyProber {
        async fn probe(&self, node: &NodeSpec) -> AutobotResult<Vec<SlotSpec>> {
            if self.down.lock().unwrap().contains(&node.id) {
                return Err(AutobotError::Probe("connection refused".to_string()));
            }
            StaticProber.probe(node).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn catalog() -> Vec<NodeSpec> {
        ["gpu-node-1", "gpu-node-2"]
            .iter()
            .map(|id| NodeSpec {
                id: id.to_string(),
                gpus: [("rtx2080".to_string(), 4)].into_iter().collect(),
                agent_url: None,
            })
            .collect()
    }

    fn registry(prober: Arc<FlakyProber>) -> (NodeRegistry, Arc<MemoryInventory>) {
        let inventory = Arc::new(MemoryInventory::new());
        let config = RegistryConfig {
            failure_threshold: 2,
            drain_grace_secs: 60,
            ..RegistryConfig::default()
        };
        let registry = NodeRegistry::new(catalog(), prober, inventory.clone(), config).unwrap();
        (registry, inventory)
    }

    #[tokio::test]
    async fn test_refresh_discovers_nodes() {
        let (registry, inventory) = registry(Arc::new(FlakyProber::new()));
        assert!(registry.list_eligible_nodes().await.is_empty());

        let summary = registry.refresh().await;
        assert_eq!(summary.probed, 2);
        assert_eq!(summary.succeeded, 2);

        let eligible = registry.list_eligible_nodes().await;
        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[0].id, "gpu-node-1");
        assert_eq!(eligible[0].slot_count, 4);
        assert_eq!(inventory.get_slots("gpu-node-2").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failure_threshold_then_drain() {
        let prober = Arc::new(FlakyProber::new());
        let (registry, _) = registry(prober.clone());
        let t0 = Utc::now();
        registry.refresh_at(t0).await;

        prober.set_down("gpu-node-2", true);

        // One failure is tolerated.
        registry.refresh_at(t0 + Duration::seconds(10)).await;
        assert_eq!(
            registry.get("gpu-node-2").await.unwrap().status,
            NodeStatus::Alive
        );

        let summary = registry.refresh_at(t0 + Duration::seconds(20)).await;
        assert_eq!(summary.became_unreachable, vec!["gpu-node-2".to_string()]);
        let eligible = registry.list_eligible_nodes().await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "gpu-node-1");

        let summary = registry.refresh_at(t0 + Duration::seconds(90)).await;
        assert_eq!(summary.drained, vec!["gpu-node-2".to_string()]);
        assert_eq!(
            registry.get("gpu-node-2").await.unwrap().status,
            NodeStatus::Drained
        );

        // Recovery brings an auto-drained node back.
        prober.set_down("gpu-node-2", false);
        registry.refresh_at(t0 + Duration::seconds(100)).await;
        assert_eq!(registry.list_eligible_nodes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_operator_drain_survives_probes() {
        let (registry, _) = registry(Arc::new(FlakyProber::new()));
        registry.refresh().await;

        registry.drain("gpu-node-1").await.unwrap();
        registry.refresh().await;
        let eligible = registry.list_eligible_nodes().await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "gpu-node-2");

        registry.undrain("gpu-node-1").await.unwrap();
        registry.refresh().await;
        assert_eq!(registry.list_eligible_nodes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_unknown_node() {
        let (registry, _) = registry(Arc::new(FlakyProber::new()));
        let result = registry.drain("nope").await;
        assert!(matches!(result, Err(AutobotError::NodeNotFound(_))));
    }

    #[test]
    fn test_rejects_bad_node_id() {
        let mut nodes = catalog();
        nodes[0].id = "gpu:1".to_string();
        let result = NodeRegistry::new(
            nodes,
            Arc::new(StaticProber),
            Arc::new(MemoryInventory::new()),
            RegistryConfig::default(),
        );
        assert!(result.is_err());
    }
}

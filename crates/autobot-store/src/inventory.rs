//! Inventory store: every known node's GPU slots and their occupancy

use async_trait::async_trait;
use autobot_core::{
    AutobotError, AutobotResult, GpuSlot, LeaseId, ModelCapacity, SlotOccupancy, SlotSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outcome of an atomic reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupancy {
    /// Every requested slot flipped from free to reserved
    Reserved,
    /// At least one slot was not free; nothing changed
    Conflict { index: u32, reason: String },
}

/// All slots of one node, used for snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInventory {
    pub node_id: String,
    pub slots: Vec<GpuSlot>,
}

/// Durable mapping of nodes to GPU slots.
///
/// All occupancy changes go through [`InventoryStore::try_set_occupied`] and
/// [`InventoryStore::set_free`].
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Slots of a node ordered by index
    async fn get_slots(&self, node_id: &str) -> AutobotResult<Vec<GpuSlot>>;

    /// Reserve every slot in `slot_indices` for `lease_id`, or none of them
    async fn try_set_occupied(
        &self,
        node_id: &str,
        slot_indices: &[u32],
        lease_id: LeaseId,
    ) -> AutobotResult<Occupancy>;

    /// Free the given slots that are currently held by `lease_id`.
    /// Returns how many slots were freed.
    async fn set_free(
        &self,
        node_id: &str,
        slot_indices: &[u32],
        lease_id: LeaseId,
    ) -> AutobotResult<usize>;

    /// Merge a probe result into the node's slots
    async fn upsert_node(&self, node_id: &str, slots: Vec<SlotSpec>) -> AutobotResult<()>;

    /// Normalized models present anywhere in the inventory
    async fn known_models(&self) -> AutobotResult<BTreeSet<String>>;

    /// Copy of the whole inventory
    async fn snapshot(&self) -> AutobotResult<Vec<NodeInventory>>;

    /// Replace the whole inventory
    async fn restore(&self, nodes: Vec<NodeInventory>) -> AutobotResult<()>;
}

type NodeSlots = Arc<Mutex<Vec<GpuSlot>>>;

/// In-process inventory.
///
/// The outer lock only guards the node map; each node's slots sit behind
/// their own mutex so reservations on different nodes never contend.
pub struct MemoryInventory {
    nodes: RwLock<BTreeMap<String, NodeSlots>>,
}

impl MemoryInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    async fn node(&self, node_id: &str) -> AutobotResult<NodeSlots> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| AutobotError::NodeNotFound(node_id.to_string()))
    }
}

impl Default for MemoryInventory {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_position(slots: &[GpuSlot], index: u32) -> Option<usize> {
    slots.binary_search_by_key(&index, |s| s.index).ok()
}

#[async_trait]
impl InventoryStore for MemoryInventory {
    async fn get_slots(&self, node_id: &str) -> AutobotResult<Vec<GpuSlot>> {
        let node = self.node(node_id).await?;
        let slots = node.lock().await;
        Ok(slots.clone())
    }

    async fn try_set_occupied(
        &self,
        node_id: &str,
        slot_indices: &[u32],
        lease_id: LeaseId,
    ) -> AutobotResult<Occupancy> {
        if slot_indices.is_empty() {
            return Err(AutobotError::InvalidRequest(
                "no slots to reserve".to_string(),
            ));
        }
        let unique: BTreeSet<u32> = slot_indices.iter().copied().collect();
        if unique.len() != slot_indices.len() {
            return Err(AutobotError::InvalidRequest(format!(
                "duplicate slot indices {:?}",
                slot_indices
            )));
        }

        let node = self.node(node_id).await?;
        let mut slots = node.lock().await;

        let mut positions = Vec::with_capacity(slot_indices.len());
        for &index in slot_indices {
            let Some(pos) = slot_position(&slots, index) else {
                return Ok(Occupancy::Conflict {
                    index,
                    reason: "slot does not exist".to_string(),
                });
            };
            let slot = &slots[pos];
            if slot.occupancy != SlotOccupancy::Free {
                return Ok(Occupancy::Conflict {
                    index,
                    reason: "slot already reserved".to_string(),
                });
            }
            if slot.busy {
                return Ok(Occupancy::Conflict {
                    index,
                    reason: "slot in use outside autobot".to_string(),
                });
            }
            positions.push(pos);
        }

        for pos in positions {
            let slot = &mut slots[pos];
            slot.occupancy = SlotOccupancy::Reserved;
            slot.lease_id = Some(lease_id);
        }

        debug!(node = node_id, slots = ?slot_indices, lease_id = %lease_id, "Slots reserved");
        Ok(Occupancy::Reserved)
    }

    async fn set_free(
        &self,
        node_id: &str,
        slot_indices: &[u32],
        lease_id: LeaseId,
    ) -> AutobotResult<usize> {
        let node = self.node(node_id).await?;
        let mut slots = node.lock().await;

        let mut freed = 0;
        for &index in slot_indices {
            let Some(pos) = slot_position(&slots, index) else {
                continue;
            };
            let slot = &mut slots[pos];
            if slot.lease_id == Some(lease_id) {
                slot.occupancy = SlotOccupancy::Free;
                slot.lease_id = None;
                freed += 1;
            }
        }

        debug!(node = node_id, slots = ?slot_indices, lease_id = %lease_id, freed, "Slots freed");
        Ok(freed)
    }

    async fn upsert_node(&self, node_id: &str, specs: Vec<SlotSpec>) -> AutobotResult<()> {
        let mut specs = specs;
        specs.sort_by_key(|s| s.index);
        specs.dedup_by_key(|s| s.index);

        let existing = self.nodes.read().await.get(node_id).cloned();
        let node = match existing {
            Some(node) => node,
            None => {
                let mut nodes = self.nodes.write().await;
                nodes
                    .entry(node_id.to_string())
                    .or_insert_with(|| {
                        info!(node = node_id, slots = specs.len(), "Node added to inventory");
                        Arc::new(Mutex::new(Vec::new()))
                    })
                    .clone()
            }
        };

        let mut slots = node.lock().await;
        let mut merged = Vec::with_capacity(specs.len());
        let mut reported = BTreeSet::new();

        for spec in specs {
            reported.insert(spec.index);
            match slot_position(&slots, spec.index) {
                Some(pos) => {
                    let mut slot = slots[pos].clone();
                    if slot.model != spec.model {
                        warn!(
                            node = node_id,
                            index = spec.index,
                            old = %slot.model,
                            new = %spec.model,
                            "Slot model changed"
                        );
                        slot.model = spec.model;
                    }
                    slot.busy = spec.busy;
                    slot.owner = spec.owner;
                    merged.push(slot);
                }
                None => merged.push(GpuSlot {
                    node_id: node_id.to_string(),
                    index: spec.index,
                    model: spec.model,
                    occupancy: SlotOccupancy::Free,
                    lease_id: None,
                    busy: spec.busy,
                    owner: spec.owner,
                }),
            }
        }

        // Slots that vanished from the probe stay only while a lease holds them.
        for slot in slots.iter() {
            if !reported.contains(&slot.index) && slot.occupancy == SlotOccupancy::Reserved {
                warn!(node = node_id, index = slot.index, "Reserved slot missing from probe");
                let mut kept = slot.clone();
                kept.busy = true;
                merged.push(kept);
            }
        }

        merged.sort_by_key(|s| s.index);
        *slots = merged;
        Ok(())
    }

    async fn known_models(&self) -> AutobotResult<BTreeSet<String>> {
        let nodes: Vec<NodeSlots> = self.nodes.read().await.values().cloned().collect();
        let mut models = BTreeSet::new();
        for node in nodes {
            models.extend(node.lock().await.iter().map(|s| s.model.clone()));
        }
        Ok(models)
    }

    async fn snapshot(&self) -> AutobotResult<Vec<NodeInventory>> {
        let nodes: Vec<(String, NodeSlots)> = self
            .nodes
            .read()
            .await
            .iter()
            .map(|(id, slots)| (id.clone(), slots.clone()))
            .collect();

        let mut snapshot = Vec::with_capacity(nodes.len());
        for (node_id, slots) in nodes {
            snapshot.push(NodeInventory {
                node_id,
                slots: slots.lock().await.clone(),
            });
        }
        Ok(snapshot)
    }

    async fn restore(&self, inventory: Vec<NodeInventory>) -> AutobotResult<()> {
        let mut nodes = self.nodes.write().await;
        nodes.clear();
        for mut entry in inventory {
            entry.slots.sort_by_key(|s| s.index);
            nodes.insert(entry.node_id, Arc::new(Mutex::new(entry.slots)));
        }
        info!(nodes = nodes.len(), "Inventory restored");
        Ok(())
    }
}

/// Per-model totals for a set of slots
pub fn capacity_by_model(slots: &[GpuSlot]) -> Vec<ModelCapacity> {
    let mut by_model: BTreeMap<&str, ModelCapacity> = BTreeMap::new();
    for slot in slots {
        let entry = by_model
            .entry(slot.model.as_str())
            .or_insert_with(|| ModelCapacity {
                model: slot.model.clone(),
                ..ModelCapacity::default()
            });
        entry.total += 1;
        if slot.occupancy == SlotOccupancy::Reserved {
            entry.reserved += 1;
        } else if slot.busy {
            entry.busy += 1;
        } else {
            entry.free += 1;
        }
    }
    by_model.into_values().collect()
}

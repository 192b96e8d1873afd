//! Slot allocator: turns a request into a reservation on one node

use autobot_core::{
    normalize_model, AllocationRequest, AllocatorConfig, AutobotError, AutobotResult, LeaseId,
    Reservation,
};
use autobot_network::NodeRegistry;
use autobot_store::{InventoryStore, Occupancy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::lease::LeaseManager;
use crate::placement::{Candidate, PlacementDecision, PlacementStrategy};
use crate::retry::StoreRetry;

/// Reserves slots for allocation requests.
///
/// Reads are optimistic; the inventory's atomic reservation decides every
/// race. A lost race re-reads the cluster and tries again, up to
/// `max_attempts` times within `allocate_timeout_ms`.
pub struct Allocator {
    inventory: Arc<dyn InventoryStore>,
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    placement: Arc<dyn PlacementStrategy>,
    config: AllocatorConfig,
    retry: StoreRetry,
}

impl Allocator {
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        registry: Arc<NodeRegistry>,
        leases: Arc<LeaseManager>,
        placement: Arc<dyn PlacementStrategy>,
        config: AllocatorConfig,
    ) -> Self {
        let retry = StoreRetry::new(
            config.store_retries,
            Duration::from_millis(config.store_retry_backoff_ms),
        );
        info!(
            placement = placement.name(),
            max_attempts = config.max_attempts,
            "Allocator initialized"
        );
        Self {
            inventory,
            registry,
            leases,
            placement,
            config,
            retry,
        }
    }

    /// Reserve `request.count` slots of `request.model` on a single node
    pub async fn allocate(&self, request: &AllocationRequest) -> AutobotResult<Reservation> {
        request.validate()?;
        let model = normalize_model(&request.model);

        let known = self
            .retry
            .run("known_models", || self.inventory.known_models())
            .await?;
        if !known.contains(&model) {
            return Err(AutobotError::InvalidRequest(format!(
                "unknown GPU model '{}'",
                request.model
            )));
        }

        if self.config.sweep_before_allocate {
            if let Err(e) = self.leases.sweep_expired().await {
                warn!(error = %e, "Pre-allocation sweep failed");
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.allocate_timeout_ms);
        let mut conflicts: HashMap<String, u32> = HashMap::new();

        for attempt in 1..=self.config.max_attempts.max(1) {
            if Instant::now() >= deadline {
                warn!(model = %model, attempt = attempt, "Allocation timed out");
                break;
            }

            let candidates = self.candidates(&model).await?;
            let decisions = self.placement.place(candidates, request.count);
            let Some(decision) = self.pick(decisions, &conflicts) else {
                debug!(model = %model, count = request.count, "No node qualifies");
                return Err(no_capacity(&model, request.count));
            };

            let lease_id = LeaseId::new();
            let mut guard = PendingReservation::new(
                self.inventory.clone(),
                self.leases.clone(),
                &decision,
                lease_id,
            );
            let outcome = self
                .retry
                .run("try_set_occupied", || {
                    self.inventory
                        .try_set_occupied(&decision.node_id, &decision.slot_indices, lease_id)
                })
                .await;

            match outcome {
                Ok(Occupancy::Reserved) => {
                    let result = self.finish(request, &model, decision, lease_id).await;
                    guard.disarm();
                    return result;
                }
                Ok(Occupancy::Conflict { index, reason }) => {
                    let count = conflicts.entry(decision.node_id.clone()).or_insert(0);
                    *count += 1;
                    debug!(
                        node = %decision.node_id,
                        slot = index,
                        reason = %reason,
                        attempt = attempt,
                        "Reservation conflict, retrying"
                    );
                }
                // The node vanished between read and reserve.
                Err(AutobotError::NodeNotFound(node)) => {
                    debug!(node = %node, attempt = attempt, "Node left inventory, retrying");
                    conflicts.insert(node, u32::MAX);
                }
                Err(e) => return Err(e),
            }
            guard.disarm();
        }

        warn!(
            model = %model,
            count = request.count,
            attempts = self.config.max_attempts,
            "Allocation gave up"
        );
        Err(no_capacity(&model, request.count))
    }

    /// Free slots of the requested model on every eligible node
    async fn candidates(&self, model: &str) -> AutobotResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for node in self.registry.list_eligible_nodes().await {
            let slots = match self
                .retry
                .run("get_slots", || self.inventory.get_slots(&node.id))
                .await
            {
                Ok(slots) => slots,
                Err(AutobotError::NodeNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let free_indices: Vec<u32> = slots
                .iter()
                .filter(|s| s.model == model && s.is_allocatable())
                .map(|s| s.index)
                .collect();
            if !free_indices.is_empty() {
                candidates.push(Candidate {
                    node_id: node.id,
                    free_indices,
                });
            }
        }
        Ok(candidates)
    }

    /// Best decision, preferring nodes that have not hit the conflict limit.
    /// Nodes over the limit are only tried when nothing else qualifies.
    fn pick(
        &self,
        decisions: Vec<PlacementDecision>,
        conflicts: &HashMap<String, u32>,
    ) -> Option<PlacementDecision> {
        let limit = self.config.per_node_conflict_retries;
        let over_limit =
            |d: &PlacementDecision| conflicts.get(&d.node_id).copied().unwrap_or(0) >= limit;

        let (preferred, deferred): (Vec<_>, Vec<_>) =
            decisions.into_iter().partition(|d| !over_limit(d));
        preferred
            .into_iter()
            .next()
            .or_else(|| deferred.into_iter().next())
    }

    /// Record the lease for a successful reservation, undoing the
    /// reservation if that fails
    async fn finish(
        &self,
        request: &AllocationRequest,
        model: &str,
        decision: PlacementDecision,
        lease_id: LeaseId,
    ) -> AutobotResult<Reservation> {
        let lease = match self
            .leases
            .create_lease(
                lease_id,
                &decision.node_id,
                &decision.slot_indices,
                model,
                &request.requester,
                request.ttl,
            )
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(
                    lease_id = %lease_id,
                    node = %decision.node_id,
                    error = %e,
                    "Lease creation failed, rolling back reservation"
                );
                if let Err(rollback) = self
                    .retry
                    .run("set_free", || {
                        self.inventory
                            .set_free(&decision.node_id, &decision.slot_indices, lease_id)
                    })
                    .await
                {
                    error!(
                        lease_id = %lease_id,
                        node = %decision.node_id,
                        error = %rollback,
                        "Rollback failed, slots left for reconciliation"
                    );
                }
                return Err(e);
            }
        };

        info!(
            lease_id = %lease.id,
            node = %lease.node_id,
            slots = ?lease.slot_indices,
            model = model,
            requester = %request.requester,
            "Allocated GPUs"
        );

        Ok(Reservation {
            node_id: lease.node_id,
            slot_indices: lease.slot_indices,
            lease_id: lease.id,
            model: lease.model,
            expires_at: lease.expires_at,
        })
    }
}

/// Undoes a reservation whose allocation never returned.
///
/// Armed from just before `try_set_occupied` until the allocation settles.
/// Dropping it armed, because the caller went away or something panicked,
/// spawns a task that ends the lease if it was recorded and frees whatever
/// slots are still held under its id.
struct PendingReservation {
    inventory: Arc<dyn InventoryStore>,
    leases: Arc<LeaseManager>,
    node_id: String,
    slot_indices: Vec<u32>,
    lease_id: LeaseId,
    armed: bool,
}

impl PendingReservation {
    fn new(
        inventory: Arc<dyn InventoryStore>,
        leases: Arc<LeaseManager>,
        decision: &PlacementDecision,
        lease_id: LeaseId,
    ) -> Self {
        Self {
            inventory,
            leases,
            node_id: decision.node_id.clone(),
            slot_indices: decision.slot_indices.clone(),
            lease_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                lease_id = %self.lease_id,
                node = %self.node_id,
                "Allocation abandoned outside a runtime, slots left for reconciliation"
            );
            return;
        };

        let inventory = self.inventory.clone();
        let leases = self.leases.clone();
        let node_id = std::mem::take(&mut self.node_id);
        let slot_indices = std::mem::take(&mut self.slot_indices);
        let lease_id = self.lease_id;
        warn!(lease_id = %lease_id, node = %node_id, "Allocation abandoned, rolling back");

        runtime.spawn(async move {
            match leases.release(lease_id).await {
                Ok(_) | Err(AutobotError::LeaseNotFound(_)) => {}
                Err(e) => {
                    error!(lease_id = %lease_id, error = %e, "Failed to end abandoned lease");
                }
            }
            if let Err(e) = inventory.set_free(&node_id, &slot_indices, lease_id).await {
                error!(
                    lease_id = %lease_id,
                    node = %node_id,
                    error = %e,
                    "Failed to free abandoned reservation"
                );
            }
        });
    }
}

fn no_capacity(model: &str, count: u32) -> AutobotError {
    AutobotError::NoCapacity(format!(
        "no eligible node has {} free {} GPU(s)",
        count, model
    ))
}

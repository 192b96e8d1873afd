//! Lease lifecycle: creation, release, renewal and expiry

use autobot_core::{
    AutobotError, AutobotResult, Lease, LeaseConfig, LeaseFilter, LeaseId, LeaseState, LeaseTtl,
};
use autobot_store::{InventoryStore, LeaseStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::retry::StoreRetry;

/// Owns lease records and frees slots when leases end
pub struct LeaseManager {
    leases: Arc<dyn LeaseStore>,
    inventory: Arc<dyn InventoryStore>,
    /// Lifetime cap for manual leases
    max_manual: Option<Duration>,
    /// How long ended leases stay listable
    retention: Duration,
    retry: StoreRetry,
}

impl LeaseManager {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        inventory: Arc<dyn InventoryStore>,
        config: &LeaseConfig,
        retry: StoreRetry,
    ) -> Self {
        Self {
            leases,
            inventory,
            max_manual: config.max_manual_lease_secs.and_then(seconds),
            retention: seconds(config.retention_secs).unwrap_or(Duration::MAX),
            retry,
        }
    }

    /// Record an active lease over slots the caller already reserved
    /// under `id`
    pub async fn create_lease(
        &self,
        id: LeaseId,
        node_id: &str,
        slot_indices: &[u32],
        model: &str,
        requester: &str,
        ttl: LeaseTtl,
    ) -> AutobotResult<Lease> {
        let lease = Lease::new(
            id,
            node_id.to_string(),
            slot_indices.to_vec(),
            model.to_string(),
            requester.to_string(),
            ttl,
            Utc::now(),
        )?;

        self.retry
            .run("lease_insert", || self.leases.insert(lease.clone()))
            .await?;

        info!(
            lease_id = %id,
            node = node_id,
            slots = ?lease.slot_indices,
            model = model,
            requester = requester,
            ttl = %ttl,
            "Lease created"
        );
        Ok(lease)
    }

    /// End an active lease and free its slots. Releasing a lease that
    /// already ended reports `LeaseNotFound` and changes nothing.
    pub async fn release(&self, id: LeaseId) -> AutobotResult<Lease> {
        let lease = self
            .end(id, LeaseState::Released, Utc::now())
            .await?
            .ok_or_else(|| AutobotError::LeaseNotFound(id.to_string()))?;

        info!(
            lease_id = %id,
            node = %lease.node_id,
            slots = ?lease.slot_indices,
            "Lease released"
        );
        Ok(lease)
    }

    /// Push an active lease's expiry forward. `ttl` replaces the lease's
    /// own TTL for this renewal when given.
    pub async fn renew(&self, id: LeaseId, ttl: Option<LeaseTtl>) -> AutobotResult<Lease> {
        let current = self
            .retry
            .run("lease_get", || self.leases.get(id))
            .await?
            .filter(Lease::is_active)
            .ok_or_else(|| AutobotError::LeaseNotFound(id.to_string()))?;

        let ttl = ttl.unwrap_or(current.ttl);
        let expires_at = ttl.expiry_from(Utc::now())?;

        let lease = self
            .retry
            .run("lease_update_expiry", || {
                self.leases.update_expiry(id, expires_at)
            })
            .await?
            .ok_or_else(|| AutobotError::LeaseNotFound(id.to_string()))?;

        info!(lease_id = %id, ttl = %ttl, "Lease renewed");
        Ok(lease)
    }

    /// Expire every lease due now
    pub async fn sweep_expired(&self) -> AutobotResult<Vec<Lease>> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expire every lease due at `now` and free its slots
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> AutobotResult<Vec<Lease>> {
        let active = self
            .retry
            .run("lease_list", || self.leases.list(LeaseFilter::default()))
            .await?;

        let mut expired = Vec::new();
        for lease in active {
            if !lease.is_due_at(now, self.max_manual) {
                continue;
            }
            // Lost races with release are skipped.
            if let Some(lease) = self.end(lease.id, LeaseState::Expired, now).await? {
                info!(
                    lease_id = %lease.id,
                    node = %lease.node_id,
                    slots = ?lease.slot_indices,
                    requester = %lease.requester,
                    "Lease expired"
                );
                expired.push(lease);
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Sweep expired leases");
        }
        Ok(expired)
    }

    /// Move an active lease to `to` and free its slots.
    ///
    /// The state change wins first so only one caller frees the slots. If
    /// freeing fails the slots stay reserved under an ended lease until
    /// reconciliation picks them up.
    async fn end(
        &self,
        id: LeaseId,
        to: LeaseState,
        at: DateTime<Utc>,
    ) -> AutobotResult<Option<Lease>> {
        let Some(lease) = self
            .retry
            .run("lease_transition", || {
                self.leases.transition(id, LeaseState::Active, to, at)
            })
            .await?
        else {
            return Ok(None);
        };

        match self
            .retry
            .run("set_free", || {
                self.inventory
                    .set_free(&lease.node_id, &lease.slot_indices, lease.id)
            })
            .await
        {
            Ok(freed) if freed != lease.slot_indices.len() => {
                warn!(
                    lease_id = %id,
                    node = %lease.node_id,
                    freed = freed,
                    expected = lease.slot_indices.len(),
                    "Lease ended with slots not held by it"
                );
            }
            Ok(_) => {}
            Err(AutobotError::NodeNotFound(_)) => {
                warn!(lease_id = %id, node = %lease.node_id, "Lease ended on unknown node");
            }
            Err(e) => {
                error!(lease_id = %id, node = %lease.node_id, error = %e, "Failed to free lease slots");
                return Err(e);
            }
        }

        Ok(Some(lease))
    }

    pub async fn get(&self, id: LeaseId) -> AutobotResult<Lease> {
        self.retry
            .run("lease_get", || self.leases.get(id))
            .await?
            .ok_or_else(|| AutobotError::LeaseNotFound(id.to_string()))
    }

    pub async fn list(&self, filter: LeaseFilter) -> AutobotResult<Vec<Lease>> {
        self.retry
            .run("lease_list", || self.leases.list(filter))
            .await
    }

    /// Forget leases that ended more than the retention period before `now`
    pub async fn prune(&self, now: DateTime<Utc>) -> AutobotResult<usize> {
        // Nothing can have ended that long ago.
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return Ok(0);
        };
        let pruned = self
            .retry
            .run("lease_prune", || self.leases.prune_ended_before(cutoff))
            .await?;
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned ended leases");
        }
        Ok(pruned)
    }
}

/// `secs` as a chrono duration, `None` when chrono cannot represent it
fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

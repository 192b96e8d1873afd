//! Lease storage

use async_trait::async_trait;
use autobot_core::{AutobotError, AutobotResult, Lease, LeaseFilter, LeaseId, LeaseState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage for lease records.
///
/// State changes go through [`LeaseStore::transition`], which only applies
/// when the stored state still matches `from`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a new lease; fails if the id already exists
    async fn insert(&self, lease: Lease) -> AutobotResult<()>;

    async fn get(&self, id: LeaseId) -> AutobotResult<Option<Lease>>;

    /// Leases ordered by creation time
    async fn list(&self, filter: LeaseFilter) -> AutobotResult<Vec<Lease>>;

    /// Move a lease from `from` to `to`, stamping `ended_at`.
    /// Returns the updated lease, or `None` if it is missing or not in `from`.
    async fn transition(
        &self,
        id: LeaseId,
        from: LeaseState,
        to: LeaseState,
        at: DateTime<Utc>,
    ) -> AutobotResult<Option<Lease>>;

    /// Set a new expiry on an active lease
    async fn update_expiry(
        &self,
        id: LeaseId,
        expires_at: Option<DateTime<Utc>>,
    ) -> AutobotResult<Option<Lease>>;

    /// Drop ended leases that ended before `cutoff`
    async fn prune_ended_before(&self, cutoff: DateTime<Utc>) -> AutobotResult<usize>;

    /// Replace every record
    async fn restore(&self, leases: Vec<Lease>) -> AutobotResult<()>;
}

/// In-process lease store
pub struct MemoryLeaseStore {
    leases: RwLock<HashMap<LeaseId, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn insert(&self, lease: Lease) -> AutobotResult<()> {
        let mut leases = self.leases.write().await;
        if leases.contains_key(&lease.id) {
            return Err(AutobotError::Internal(format!(
                "lease {} already exists",
                lease.id
            )));
        }
        leases.insert(lease.id, lease);
        Ok(())
    }

    async fn get(&self, id: LeaseId) -> AutobotResult<Option<Lease>> {
        Ok(self.leases.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: LeaseFilter) -> AutobotResult<Vec<Lease>> {
        let leases = self.leases.read().await;
        let mut out: Vec<Lease> = leases
            .values()
            .filter(|l| filter.include_ended || l.is_active())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn transition(
        &self,
        id: LeaseId,
        from: LeaseState,
        to: LeaseState,
        at: DateTime<Utc>,
    ) -> AutobotResult<Option<Lease>> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&id) {
            Some(lease) if lease.state == from => {
                lease.state = to;
                if to != LeaseState::Active {
                    lease.ended_at = Some(at);
                }
                debug!(lease_id = %id, from = %from, to = %to, "Lease transitioned");
                Ok(Some(lease.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_expiry(
        &self,
        id: LeaseId,
        expires_at: Option<DateTime<Utc>>,
    ) -> AutobotResult<Option<Lease>> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&id) {
            Some(lease) if lease.is_active() => {
                lease.expires_at = expires_at;
                Ok(Some(lease.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn prune_ended_before(&self, cutoff: DateTime<Utc>) -> AutobotResult<usize> {
        let mut leases = self.leases.write().await;
        let before = leases.len();
        leases.retain(|_, l| match l.ended_at {
            Some(ended_at) => ended_at >= cutoff,
            None => true,
        });
        Ok(before - leases.len())
    }

    async fn restore(&self, restored: Vec<Lease>) -> AutobotResult<()> {
        let mut leases = self.leases.write().await;
        leases.clear();
        leases.extend(restored.into_iter().map(|l| (l.id, l)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobot_core::LeaseTtl;
    use chrono::Duration;

    fn lease(now: DateTime<Utc>) -> Lease {
        Lease::new(
            LeaseId::new(),
            "gpu-node-7".to_string(),
            vec![0, 1],
            "rtx2080".to_string(),
            "tester".to_string(),
            LeaseTtl::Seconds(60),
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryLeaseStore::new();
        let l = lease(Utc::now());
        store.insert(l.clone()).await.unwrap();

        assert_eq!(store.get(l.id).await.unwrap(), Some(l.clone()));
        assert!(store.insert(l).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let l = lease(now);
        store.insert(l.clone()).await.unwrap();

        let released = store
            .transition(l.id, LeaseState::Active, LeaseState::Released, now)
            .await
            .unwrap();
        assert_eq!(released.unwrap().state, LeaseState::Released);

        // A racing sweep loses.
        let expired = store
            .transition(l.id, LeaseState::Active, LeaseState::Expired, now)
            .await
            .unwrap();
        assert!(expired.is_none());
        assert_eq!(
            store.get(l.id).await.unwrap().unwrap().state,
            LeaseState::Released
        );
    }

    #[tokio::test]
    async fn test_list_filter_and_prune() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let active = lease(now);
        let ended = lease(now);
        store.insert(active.clone()).await.unwrap();
        store.insert(ended.clone()).await.unwrap();
        store
            .transition(ended.id, LeaseState::Active, LeaseState::Expired, now)
            .await
            .unwrap();

        assert_eq!(store.list(LeaseFilter::default()).await.unwrap().len(), 1);
        let all = store
            .list(LeaseFilter {
                include_ended: true,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let pruned = store
            .prune_ended_before(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get(ended.id).await.unwrap().is_none());
        assert!(store.get(active.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_expiry_only_active() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let l = lease(now);
        store.insert(l.clone()).await.unwrap();

        let later = now + Duration::seconds(600);
        let renewed = store.update_expiry(l.id, Some(later)).await.unwrap();
        assert_eq!(renewed.unwrap().expires_at, Some(later));

        store
            .transition(l.id, LeaseState::Active, LeaseState::Released, now)
            .await
            .unwrap();
        assert!(store.update_expiry(l.id, Some(later)).await.unwrap().is_none());
    }
}

//! JSON state snapshots

use autobot_core::{AutobotError, AutobotResult, Lease, LeaseFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::inventory::{InventoryStore, NodeInventory};
use crate::lease_store::LeaseStore;

const SNAPSHOT_VERSION: u32 = 1;

/// Inventory and leases at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub nodes: Vec<NodeInventory>,
    pub leases: Vec<Lease>,
}

impl StateSnapshot {
    /// Copy the current state out of the stores
    pub async fn capture(
        inventory: &dyn InventoryStore,
        leases: &dyn LeaseStore,
    ) -> AutobotResult<Self> {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            nodes: inventory.snapshot().await?,
            leases: leases
                .list(LeaseFilter {
                    include_ended: true,
                })
                .await?,
        })
    }

    /// Replace the stores' contents with this snapshot
    pub async fn apply(
        self,
        inventory: &dyn InventoryStore,
        leases: &dyn LeaseStore,
    ) -> AutobotResult<()> {
        inventory.restore(self.nodes).await?;
        leases.restore(self.leases).await?;
        Ok(())
    }

    /// Write the snapshot atomically (temp file, then rename)
    pub async fn save(&self, path: &Path) -> AutobotResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
                info!(path = %parent.display(), "Created snapshot directory");
            }
        }

        let data = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(
            path = %path.display(),
            nodes = self.nodes.len(),
            leases = self.leases.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Read a snapshot; `None` if the file does not exist
    pub async fn load(path: &Path) -> AutobotResult<Option<Self>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Self = serde_json::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(AutobotError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{MemoryInventory, Occupancy};
    use crate::lease_store::MemoryLeaseStore;
    use autobot_core::{LeaseId, LeaseTtl, SlotSpec};

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("autobot.json");

        let inventory = MemoryInventory::new();
        let leases = MemoryLeaseStore::new();
        inventory
            .upsert_node("gpu-node-7", (0..8).map(|i| SlotSpec::new(i, "rtx2080")).collect())
            .await
            .unwrap();

        let id = LeaseId::new();
        let outcome = inventory
            .try_set_occupied("gpu-node-7", &[0, 1], id)
            .await
            .unwrap();
        assert_eq!(outcome, Occupancy::Reserved);
        leases
            .insert(Lease::new(
                id,
                "gpu-node-7".to_string(),
                vec![0, 1],
                "rtx2080".to_string(),
                "tester".to_string(),
                LeaseTtl::Manual,
                Utc::now(),
            )
            .unwrap())
            .await
            .unwrap();

        StateSnapshot::capture(&inventory, &leases)
            .await
            .unwrap()
            .save(&path)
            .await
            .unwrap();

        let loaded = StateSnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.leases.len(), 1);

        let inventory2 = MemoryInventory::new();
        let leases2 = MemoryLeaseStore::new();
        loaded.apply(&inventory2, &leases2).await.unwrap();

        let slots = inventory2.get_slots("gpu-node-7").await.unwrap();
        assert_eq!(slots[0].lease_id, Some(id));
        assert!(leases2.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = StateSnapshot::load(&dir.path().join("missing.json"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_temp_path() {
        let tmp = temp_path(Path::new("/var/lib/autobot/state.json"));
        assert_eq!(tmp, PathBuf::from("/var/lib/autobot/state.json.tmp"));
    }
}

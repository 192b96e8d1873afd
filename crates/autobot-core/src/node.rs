//! Nodes, GPU slots and model names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::LeaseId;

/// Liveness of a cluster node as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Last probe succeeded
    Alive,
    /// Probe failed `failure_threshold` times in a row
    Unreachable,
    /// Excluded from allocation by an operator or after a long outage
    Drained,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "alive"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
            NodeStatus::Drained => write!(f, "drained"),
        }
    }
}

/// Registry view of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier (host name). Never contains ':'.
    pub id: String,
    /// Current liveness
    pub status: NodeStatus,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Time of the last successful probe
    pub last_seen: Option<DateTime<Utc>>,
    /// Time the node became unreachable
    pub unreachable_since: Option<DateTime<Utc>>,
    /// Drained by an operator (survives successful probes)
    pub operator_drained: bool,
    /// Number of slots reported by the last successful probe
    pub slot_count: u32,
}

impl NodeInfo {
    /// A node that has never been probed successfully
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: NodeStatus::Unreachable,
            consecutive_failures: 0,
            last_seen: None,
            unreachable_since: None,
            operator_drained: false,
            slot_count: 0,
        }
    }

    /// Whether the allocator may place new leases on this node
    pub fn is_eligible(&self) -> bool {
        self.status == NodeStatus::Alive && !self.operator_drained
    }
}

/// Occupancy of a single GPU slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotOccupancy {
    Free,
    Reserved,
}

/// One addressable GPU on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSlot {
    /// Owning node
    pub node_id: String,
    /// Stable 0-based index within the node
    pub index: u32,
    /// Normalized model name
    pub model: String,
    /// Whether a lease holds this slot
    pub occupancy: SlotOccupancy,
    /// Lease holding this slot, set iff reserved
    pub lease_id: Option<LeaseId>,
    /// In use by something autobot does not manage
    #[serde(default)]
    pub busy: bool,
    /// Users running processes on the GPU, as last probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl GpuSlot {
    /// Free and not busy
    pub fn is_allocatable(&self) -> bool {
        self.occupancy == SlotOccupancy::Free && !self.busy
    }
}

/// Slot description produced by a node probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub index: u32,
    pub model: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl SlotSpec {
    pub fn new(index: u32, model: &str) -> Self {
        Self {
            index,
            model: normalize_model(model),
            busy: false,
            owner: None,
        }
    }
}

/// Free and total counts for one model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapacity {
    pub model: String,
    pub total: u32,
    pub reserved: u32,
    pub busy: u32,
    pub free: u32,
}

/// Normalize a GPU model name so catalog names and driver names compare equal.
///
/// `RTX_2080_Ti`, `NVIDIA GeForce RTX 2080 Ti` and `rtx2080ti` all become
/// `rtx2080ti`.
pub fn normalize_model(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .map(|word| word.to_ascii_lowercase())
        .filter(|word| !matches!(word.as_str(), "nvidia" | "geforce"))
        .collect::<String>()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Check that a node id can appear in a `node:indices` line
pub fn validate_node_id(id: &str) -> crate::AutobotResult<()> {
    if id.trim().is_empty() {
        return Err(crate::AutobotError::Config(
            "node id must not be empty".to_string(),
        ));
    }
    if id.contains(':') {
        return Err(crate::AutobotError::Config(format!(
            "node id '{}' must not contain ':'",
            id
        )));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(crate::AutobotError::Config(format!(
            "node id '{}' must not contain whitespace",
            id
        )));
    }
    Ok(())
}

/// Format a reservation the way the wrapper script parses it
pub fn format_reservation_line(node_id: &str, slot_indices: &[u32]) -> String {
    let indices = slot_indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("{}:{}", node_id, indices)
}

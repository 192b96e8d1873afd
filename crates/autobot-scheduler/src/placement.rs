//! Candidate node ranking

use autobot_core::PlacementPolicy;
use std::sync::Arc;

/// A node and its currently free slots of the requested model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: String,
    /// Ascending
    pub free_indices: Vec<u32>,
}

impl Candidate {
    pub fn free_count(&self) -> usize {
        self.free_indices.len()
    }
}

/// Placement decision for one reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    /// Node to reserve on
    pub node_id: String,
    /// Slot indices to reserve
    pub slot_indices: Vec<u32>,
}

/// Strategy for ordering qualifying nodes
pub trait PlacementStrategy: Send + Sync {
    /// Decisions for every candidate with at least `count` free slots, best first
    fn place(&self, candidates: Vec<Candidate>, count: u32) -> Vec<PlacementDecision>;

    /// Get the strategy name
    fn name(&self) -> &'static str;
}

/// Prefer the node whose free count is closest to the request; ties go to
/// the lower node id. An exact fit always wins.
pub struct BestFit;

impl PlacementStrategy for BestFit {
    fn place(&self, candidates: Vec<Candidate>, count: u32) -> Vec<PlacementDecision> {
        let mut qualifying = qualifying(candidates, count);
        qualifying.sort_by(|a, b| {
            a.free_count()
                .cmp(&b.free_count())
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        qualifying.iter().map(|c| decide(c, count)).collect()
    }

    fn name(&self) -> &'static str {
        "best-fit"
    }
}

/// First qualifying node in id order
pub struct FirstFit;

impl PlacementStrategy for FirstFit {
    fn place(&self, candidates: Vec<Candidate>, count: u32) -> Vec<PlacementDecision> {
        let mut qualifying = qualifying(candidates, count);
        qualifying.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        qualifying.iter().map(|c| decide(c, count)).collect()
    }

    fn name(&self) -> &'static str {
        "first-fit"
    }
}

/// Strategy for a configured policy
pub fn strategy_for(policy: PlacementPolicy) -> Arc<dyn PlacementStrategy> {
    match policy {
        PlacementPolicy::BestFit => Arc::new(BestFit),
        PlacementPolicy::FirstFit => Arc::new(FirstFit),
    }
}

fn qualifying(candidates: Vec<Candidate>, count: u32) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| c.free_count() >= count as usize)
        .collect()
}

/// Lowest `count` free indices
fn decide(candidate: &Candidate, count: u32) -> PlacementDecision {
    let mut indices = candidate.free_indices.clone();
    indices.sort_unstable();
    indices.truncate(count as usize);
    PlacementDecision {
        node_id: candidate.node_id.clone(),
        slot_indices: indices,
    }
}

//! Node probe trait and the catalog-backed prober

use async_trait::async_trait;
use autobot_core::{AutobotError, AutobotResult, NodeSpec, SlotSpec};

/// Reports the GPU slots of a node, or fails if the node cannot be reached
#[async_trait]
pub trait NodeProber: Send + Sync {
    /// Probe one node
    async fn probe(&self, node: &NodeSpec) -> AutobotResult<Vec<SlotSpec>>;

    /// Get the prober name
    fn name(&self) -> &'static str;
}

/// Prober that trusts the catalog: every node is alive with the GPUs it lists.
///
/// Slot indices are assigned per model in catalog order, so
/// `{ RTX_2080_Ti = 2, RTX_3090 = 1 }` yields `rtx2080ti` at 0 and 1 and
/// `rtx3090` at 2.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticProber;

impl StaticProber {
    pub fn slots_for(node: &NodeSpec) -> Vec<SlotSpec> {
        let mut slots = Vec::new();
        let mut index = 0;
        for (model, count) in &node.gpus {
            for _ in 0..*count {
                slots.push(SlotSpec::new(index, model));
                index += 1;
            }
        }
        slots
    }
}

#[async_trait]
impl NodeProber for StaticProber {
    async fn probe(&self, node: &NodeSpec) -> AutobotResult<Vec<SlotSpec>> {
        if node.gpus.is_empty() {
            return Err(AutobotError::Probe(format!(
                "node {} lists no GPUs",
                node.id
            )));
        }
        Ok(Self::slots_for(node))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(gpus: &[(&str, u32)]) -> NodeSpec {
        NodeSpec {
            id: "autobot-1-1".to_string(),
            gpus: gpus
                .iter()
                .map(|(m, c)| (m.to_string(), *c))
                .collect::<BTreeMap<_, _>>(),
            agent_url: None,
        }
    }

    #[tokio::test]
    async fn test_static_probe_indices() {
        let spec = node(&[("RTX_2080_Ti", 2), ("RTX_3080_Ti", 1)]);
        let slots = StaticProber.probe(&spec).await.unwrap();

        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].model, "rtx2080ti");
        assert_eq!(slots[1].index, 1);
        assert_eq!(slots[2].model, "rtx3080ti");
        assert_eq!(slots[2].index, 2);
        assert!(slots.iter().all(|s| !s.busy));
    }

    #[tokio::test]
    async fn test_static_probe_empty_node_fails() {
        let spec = node(&[]);
        assert!(StaticProber.probe(&spec).await.is_err());
        assert_eq!(StaticProber.name(), "static");
    }
}

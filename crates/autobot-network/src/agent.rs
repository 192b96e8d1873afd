//! Probing HTTP node agents

use async_trait::async_trait;
use autobot_core::{AutobotError, AutobotResult, NodeSpec, ProbeConfig, SlotSpec};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::probe::NodeProber;

/// GPU entry served by a node agent at `GET /gpus`
#[derive(Debug, Clone, Deserialize)]
pub struct AgentGpu {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub memory_used_mib: u64,
}

/// Prober for nodes running an HTTP agent
pub struct HttpProber {
    /// HTTP client for probes
    client: reqwest::Client,
    /// Path appended to the agent URL
    gpus_path: String,
    busy_memory_mib: u64,
}

impl HttpProber {
    /// Create a new HTTP prober
    pub fn new(config: &ProbeConfig) -> AutobotResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AutobotError::Probe(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            gpus_path: "/gpus".to_string(),
            busy_memory_mib: config.busy_memory_mib,
        })
    }
}

#[async_trait]
impl NodeProber for HttpProber {
    async fn probe(&self, node: &NodeSpec) -> AutobotResult<Vec<SlotSpec>> {
        let base = node.agent_url.as_deref().ok_or_else(|| {
            AutobotError::Probe(format!("node {} has no agent_url", node.id))
        })?;
        let url = format!("{}{}", base.trim_end_matches('/'), self.gpus_path);

        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!(node = %node.id, endpoint = %url, error = %e, "Agent probe error");
            AutobotError::Probe(format!("agent {} unreachable: {}", url, e))
        })?;

        if !response.status().is_success() {
            warn!(
                node = %node.id,
                endpoint = %url,
                status = %response.status(),
                "Agent probe failed"
            );
            return Err(AutobotError::Probe(format!(
                "agent {} returned {}",
                url,
                response.status()
            )));
        }

        let gpus: Vec<AgentGpu> = response
            .json()
            .await
            .map_err(|e| AutobotError::Probe(format!("bad agent response from {}: {}", url, e)))?;

        debug!(node = %node.id, gpus = gpus.len(), "Agent probe passed");

        Ok(gpus
            .into_iter()
            .map(|gpu| {
                let mut slot = SlotSpec::new(gpu.index, &gpu.name);
                slot.busy = gpu.memory_used_mib >= self.busy_memory_mib;
                slot
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

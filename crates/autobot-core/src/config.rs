//! Configuration types for autobot

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::{AutobotError, AutobotResult, LeaseTtl};

/// Environment variable prefix for configuration overrides
/// (`AUTOBOT__ALLOCATOR__MAX_ATTEMPTS=4`)
pub const ENV_PREFIX: &str = "AUTOBOT";

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutobotConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Node registry configuration
    pub registry: RegistryConfig,
    /// Allocator configuration
    pub allocator: AllocatorConfig,
    /// Lease configuration
    pub leases: LeaseConfig,
    /// Snapshot persistence configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Cluster node catalog
    pub nodes: Vec<NodeSpec>,
}

impl AutobotConfig {
    /// Load defaults, then the optional TOML file, then `AUTOBOT__*` environment overrides
    pub fn load(path: Option<&Path>) -> AutobotResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> AutobotResult<()> {
        if self.registry.failure_threshold == 0 {
            return Err(AutobotError::Config(
                "registry.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.allocator.max_attempts == 0 {
            return Err(AutobotError::Config(
                "allocator.max_attempts must be at least 1".to_string(),
            ));
        }
        self.leases.default_ttl()?;

        let mut seen = HashSet::new();
        for node in &self.nodes {
            crate::validate_node_id(&node.id)?;
            if !seen.insert(node.id.as_str()) {
                return Err(AutobotError::Config(format!(
                    "node '{}' is listed more than once",
                    node.id
                )));
            }
            if self.registry.probe.kind == ProbeKind::Http && node.agent_url.is_none() {
                return Err(AutobotError::Config(format!(
                    "node '{}' needs agent_url for the http probe",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9190,
            cors_enabled: false,
        }
    }
}

/// Node registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds between liveness probes
    pub refresh_interval_secs: u64,
    /// Consecutive probe failures before a node is unreachable
    pub failure_threshold: u32,
    /// Seconds a node may stay unreachable before it is drained
    pub drain_grace_secs: u64,
    /// Probe settings
    pub probe: ProbeConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            failure_threshold: 3,
            drain_grace_secs: 600,
            probe: ProbeConfig::default(),
        }
    }
}

/// How nodes are probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Trust the catalog; every node is always alive
    Static,
    /// `nvidia-smi` over ssh
    Ssh,
    /// HTTP node agent
    Http,
}

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    /// Remote user for ssh probes
    pub ssh_user: Option<String>,
    /// Login host to hop through (`ssh user@jump ssh node ...`)
    pub jump_host: Option<String>,
    /// Probe timeout in seconds
    pub timeout_secs: u64,
    /// A GPU using at least this much memory is treated as busy
    pub busy_memory_mib: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Static,
            ssh_user: None,
            jump_host: None,
            timeout_secs: 10,
            busy_memory_mib: 500,
        }
    }
}

/// Candidate node ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// Node whose free count is closest to the request
    BestFit,
    /// First qualifying node in id order
    FirstFit,
}

/// Allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub placement: PlacementPolicy,
    /// Upper bound on reservation attempts per request
    pub max_attempts: u32,
    /// Conflicts tolerated on one node before it is skipped
    pub per_node_conflict_retries: u32,
    /// Wall-clock bound per request in milliseconds
    pub allocate_timeout_ms: u64,
    /// Retries for a failing store call
    pub store_retries: u32,
    /// Base backoff between store retries in milliseconds
    pub store_retry_backoff_ms: u64,
    /// Sweep expired leases before every allocation
    pub sweep_before_allocate: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            placement: PlacementPolicy::BestFit,
            max_attempts: 8,
            per_node_conflict_retries: 2,
            allocate_timeout_ms: 5000,
            store_retries: 3,
            store_retry_backoff_ms: 50,
            sweep_before_allocate: true,
        }
    }
}

/// Lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL used when a request does not name one (`24h`, `90m`, `manual`)
    pub default_ttl: String,
    /// Seconds between expiry sweeps
    pub sweep_interval_secs: u64,
    /// Cap on the lifetime of manual leases
    pub max_manual_lease_secs: Option<u64>,
    /// How long released and expired leases are kept
    pub retention_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl: "24h".to_string(),
            sweep_interval_secs: 15,
            max_manual_lease_secs: None,
            retention_secs: 86400,
        }
    }
}

impl LeaseConfig {
    pub fn default_ttl(&self) -> AutobotResult<LeaseTtl> {
        self.default_ttl
            .parse()
            .map_err(|e| AutobotError::Config(format!("leases.default_ttl: {}", e)))
    }
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where to keep the JSON state snapshot; no persistence when unset
    pub snapshot_path: Option<PathBuf>,
    /// Seconds between snapshots
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_secs: 60,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// One node in the cluster catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Host name; used as node id
    pub id: String,
    /// Expected GPUs, model name to count
    #[serde(default)]
    pub gpus: BTreeMap<String, u32>,
    /// Base URL of the node agent for the http probe
    #[serde(default)]
    pub agent_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[api]
port = 9200

[registry]
failure_threshold = 2

[registry.probe]
kind = "ssh"
ssh_user = "autobot"
jump_host = "login.cluster"

[allocator]
placement = "first-fit"

[leases]
default_ttl = "manual"
max_manual_lease_secs = 604800

[[nodes]]
id = "autobot-0-9"
gpus = { RTX_2080_Ti = 4 }

[[nodes]]
id = "autobot-0-25"
gpus = { RTX_3090 = 8 }
"#;

    #[test]
    fn test_default_config() {
        let config = AutobotConfig::default();
        assert_eq!(config.api.port, 9190);
        assert_eq!(config.allocator.placement, PlacementPolicy::BestFit);
        assert_eq!(config.leases.default_ttl().unwrap(), LeaseTtl::Seconds(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parse() {
        let config: AutobotConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.api.port, 9200);
        assert_eq!(config.registry.failure_threshold, 2);
        assert_eq!(config.registry.refresh_interval_secs, 30);
        assert_eq!(config.registry.probe.kind, ProbeKind::Ssh);
        assert_eq!(config.allocator.placement, PlacementPolicy::FirstFit);
        assert_eq!(config.leases.default_ttl().unwrap(), LeaseTtl::Manual);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].gpus["RTX_3090"], 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AutobotConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api.port, 9200);
        assert_eq!(config.nodes.len(), 2);
    }

    #[test]
    fn test_rejects_colon_in_node_id() {
        let config: AutobotConfig = toml::from_str(
            r#"
[[nodes]]
id = "gpu:7"
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(AutobotError::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_nodes() {
        let config: AutobotConfig = toml::from_str(
            r#"
[[nodes]]
id = "gpu-node-7"

[[nodes]]
id = "gpu-node-7"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_probe_requires_agent_url() {
        let mut config = AutobotConfig::default();
        config.registry.probe.kind = ProbeKind::Http;
        config.nodes.push(NodeSpec {
            id: "gpu-node-7".to_string(),
            gpus: BTreeMap::new(),
            agent_url: None,
        });
        assert!(config.validate().is_err());
    }
}

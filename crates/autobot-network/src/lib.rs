//! autobot-network: Node probing and liveness
//!
//! This crate provides the node registry and the probers that feed it:
//! - Catalog-backed static probing
//! - `nvidia-smi` over ssh
//! - HTTP node agents

pub mod agent;
pub mod probe;
pub mod registry;
pub mod ssh;

pub use agent::HttpProber;
pub use probe::{NodeProber, StaticProber};
pub use registry::{NodeRegistry, RefreshSummary};
pub use ssh::SshProber;

use autobot_core::{AutobotResult, ProbeConfig, ProbeKind};
use std::sync::Arc;

/// Build the prober selected by configuration
pub fn prober_from_config(config: &ProbeConfig) -> AutobotResult<Arc<dyn NodeProber>> {
    Ok(match config.kind {
        ProbeKind::Static => Arc::new(StaticProber),
        ProbeKind::Ssh => Arc::new(SshProber::new(config)),
        ProbeKind::Http => Arc::new(HttpProber::new(config)?),
    })
}

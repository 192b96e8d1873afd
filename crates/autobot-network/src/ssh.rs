//! Probing nodes with `nvidia-smi` over ssh

use async_trait::async_trait;
use autobot_core::{AutobotError, AutobotResult, NodeSpec, ProbeConfig, SlotSpec};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::probe::NodeProber;

/// Per-GPU usage query; one CSV line per GPU
pub const USAGE_QUERY: &str = "nvidia-smi --query-gpu=index,name,memory.used,memory.total,gpu_uuid --format=csv,noheader,nounits";

/// Compute processes with the GPU each one runs on
pub const PROCESS_QUERY: &str = "nvidia-smi --query-compute-apps=pid,gpu_uuid --format=csv,noheader";

/// `pid user` for every compute process
pub const OWNER_QUERY: &str = "nvidia-smi --query-compute-apps=pid --format=csv,noheader | paste -sd, - | xargs -r ps -o pid=,user= -p";

/// Line separating the query outputs
const SECTION_MARK: &str = "==autobot==";

/// Remote command run on each node. Only a failing usage query fails the
/// probe; the process and owner queries are best effort.
pub fn probe_command() -> String {
    format!(
        "{} && (echo {mark}; {}; echo {mark}; {}; true)",
        USAGE_QUERY,
        PROCESS_QUERY,
        OWNER_QUERY,
        mark = SECTION_MARK
    )
}

/// Runs [`probe_command`] on each node, optionally through a login host
#[derive(Debug, Clone)]
pub struct SshProber {
    user: Option<String>,
    jump_host: Option<String>,
    timeout: Duration,
    busy_memory_mib: u64,
}

impl SshProber {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            jump_host: config.jump_host.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            busy_memory_mib: config.busy_memory_mib,
        }
    }

    fn target(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        }
    }

    /// Arguments passed to `ssh`
    fn ssh_args(&self, node_id: &str) -> Vec<String> {
        let connect_timeout = self.timeout.as_secs().max(1).to_string();
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout),
        ];
        match &self.jump_host {
            Some(jump) => {
                args.push(self.target(jump));
                args.push(format!("ssh {} \"{}\"", node_id, probe_command()));
            }
            None => {
                args.push(self.target(node_id));
                args.push(probe_command());
            }
        }
        args
    }
}

#[async_trait]
impl NodeProber for SshProber {
    async fn probe(&self, node: &NodeSpec) -> AutobotResult<Vec<SlotSpec>> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(&node.id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(node = %node.id, "Probing node over ssh");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                AutobotError::Probe(format!(
                    "ssh probe of {} timed out after {:?}",
                    node.id, self.timeout
                ))
            })?
            .map_err(|e| AutobotError::Probe(format!("failed to run ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AutobotError::Probe(format!(
                "ssh probe of {} exited with {}: {}",
                node.id,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_probe(&stdout, self.busy_memory_mib)
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

/// Parse [`probe_command`] output into slots, attributing each GPU to the
/// users running processes on it
pub fn parse_probe(output: &str, busy_memory_mib: u64) -> AutobotResult<Vec<SlotSpec>> {
    let mut sections = output.split(SECTION_MARK);
    let usage = sections.next().unwrap_or_default();
    let processes = sections.next().unwrap_or_default();
    let owners = sections.next().unwrap_or_default();

    let gpus = parse_usage(usage, busy_memory_mib)?;
    let users = parse_owners(owners);

    let mut by_gpu: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for line in processes.lines() {
        let Some((pid, uuid)) = line.split_once(',') else {
            continue;
        };
        let Ok(pid) = pid.trim().parse::<u32>() else {
            continue;
        };
        if let Some(user) = users.get(&pid) {
            by_gpu.entry(uuid.trim()).or_default().insert(user.as_str());
        }
    }

    Ok(gpus
        .into_iter()
        .map(|(mut slot, uuid)| {
            if let Some(owners) = uuid.as_deref().and_then(|u| by_gpu.get(u)) {
                slot.owner = Some(owners.iter().copied().collect::<Vec<_>>().join(","));
            }
            slot
        })
        .collect())
}

/// Parse [`USAGE_QUERY`] output into slots and their GPU UUIDs.
///
/// A GPU whose used memory reaches `busy_memory_mib` is marked busy. Lines that
/// do not start with an index (headers, warnings) are skipped.
fn parse_usage(
    output: &str,
    busy_memory_mib: u64,
) -> AutobotResult<Vec<(SlotSpec, Option<String>)>> {
    let mut slots = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 4 {
            warn!(line = %line, "Unexpected nvidia-smi output format");
            continue;
        }
        let Ok(index) = parts[0].parse::<u32>() else {
            debug!(line = %line, "Skipping non-GPU line");
            continue;
        };
        let used: u64 = parts[2].parse().unwrap_or_else(|_| {
            warn!(line = %line, "Unparseable memory.used, treating GPU as busy");
            u64::MAX
        });

        let mut slot = SlotSpec::new(index, parts[1]);
        slot.busy = used >= busy_memory_mib;
        slots.push((slot, parts.get(4).map(|uuid| uuid.to_string())));
    }

    if slots.is_empty() {
        return Err(AutobotError::Probe("nvidia-smi reported no GPUs".to_string()));
    }
    Ok(slots)
}

/// Parse `ps -o pid=,user=` output
fn parse_owners(output: &str) -> BTreeMap<u32, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let user = fields.next()?;
            Some((pid, user.to_string()))
        })
        .collect()
}

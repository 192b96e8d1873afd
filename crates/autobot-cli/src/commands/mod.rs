//! CLI commands implementation

mod client;

pub use client::{
    ApiClient, ClientError, NodeResponse, ReservationResponse, EXIT_INVALID_REQUEST,
    EXIT_UNAVAILABLE,
};

use anyhow::Result;
use autobot_core::Lease;
use chrono::{DateTime, Utc};

/// `$USER@<hostname>`, or `unknown` when the user cannot be determined
pub fn default_requester() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());

    match (user, host) {
        (Some(user), Some(host)) => format!("{}@{}", user, host),
        (Some(user), None) => user,
        (None, _) => "unknown".to_string(),
    }
}

fn describe_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    match expires_at {
        Some(at) => format!("expires {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => "until released".to_string(),
    }
}

/// Reserve GPUs and print `node:idx,idx`
pub async fn available(
    client: &ApiClient,
    model: &str,
    count: u32,
    quiet: bool,
    ttl: Option<&str>,
    requester: &str,
) -> Result<()> {
    let reservation = client.allocate(model, count, requester, ttl).await?;
    for line in available_output(&reservation, quiet) {
        println!("{}", line);
    }
    Ok(())
}

/// Stdout lines for a reservation. The last line is always `node:idx,idx`.
fn available_output(reservation: &ReservationResponse, quiet: bool) -> Vec<String> {
    let mut lines = Vec::with_capacity(2);
    if !quiet {
        lines.push(format!(
            "Reserved {} {} GPU(s) on {} (lease {}, {})",
            reservation.slot_indices.len(),
            reservation.model,
            reservation.node_id,
            reservation.lease_id,
            describe_expiry(reservation.expires_at)
        ));
    }
    lines.push(reservation.line.clone());
    lines
}

/// Release a lease
pub async fn release(client: &ApiClient, lease_id: &str) -> Result<()> {
    client.release(lease_id).await?;
    println!("Lease {} released", lease_id);
    Ok(())
}

/// Renew a lease
pub async fn renew(client: &ApiClient, lease_id: &str, ttl: Option<&str>) -> Result<()> {
    let lease = client.renew(lease_id, ttl).await?;
    println!("Lease {} renewed, {}", lease.id, describe_expiry(lease.expires_at));
    Ok(())
}

/// List leases
pub async fn leases(client: &ApiClient, all: bool) -> Result<()> {
    let leases = client.leases(all).await?;

    if leases.is_empty() {
        println!("No leases found");
        return Ok(());
    }

    println!(
        "{:<36} {:<24} {:<12} {:<10} {:<20} {}",
        "ID", "SLOTS", "MODEL", "STATE", "REQUESTER", "EXPIRES"
    );
    println!("{}", "-".repeat(120));
    for lease in leases {
        print_lease(&lease);
    }

    Ok(())
}

fn print_lease(lease: &Lease) {
    let slots = autobot_core::format_reservation_line(&lease.node_id, &lease.slot_indices);
    let expires = lease
        .expires_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "manual".to_string());
    println!(
        "{:<36} {:<24} {:<12} {:<10} {:<20} {}",
        lease.id.to_string(),
        slots,
        lease.model,
        lease.state.to_string(),
        lease.requester,
        expires
    );
}

/// List nodes
pub async fn nodes(client: &ApiClient) -> Result<()> {
    let nodes = client.nodes().await?;

    if nodes.is_empty() {
        println!("No nodes discovered");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<9} {}",
        "NODE", "STATUS", "ELIGIBLE", "GPUS (free/total)"
    );
    println!("{}", "-".repeat(80));
    for node in nodes {
        let gpus: Vec<String> = node
            .capacity
            .iter()
            .map(|c| format!("{} {}/{}", c.model, c.free, c.total))
            .collect();
        println!(
            "{:<20} {:<12} {:<9} {}",
            node.info.id,
            node.info.status.to_string(),
            if node.eligible { "yes" } else { "no" },
            gpus.join(", ")
        );
        for line in busy_owner_lines(&node) {
            println!("{}", line);
        }
    }

    Ok(())
}

/// One indented line per busy GPU whose users are known
fn busy_owner_lines(node: &NodeResponse) -> Vec<String> {
    node.slots
        .iter()
        .filter(|slot| slot.busy)
        .filter_map(|slot| {
            slot.owner
                .as_deref()
                .map(|owner| format!("  gpu {} ({}) busy: {}", slot.index, slot.model, owner))
        })
        .collect()
}

/// Drain a node
pub async fn drain(client: &ApiClient, node: &str) -> Result<()> {
    let info = client.drain(node).await?;
    println!("Node {} drained ({})", info.id, info.status);
    Ok(())
}

/// Undrain a node
pub async fn undrain(client: &ApiClient, node: &str) -> Result<()> {
    let info = client.undrain(node).await?;
    println!(
        "Node {} returned to service, eligible after its next successful probe",
        info.id
    );
    Ok(())
}

/// Show cluster status
pub async fn status(client: &ApiClient) -> Result<()> {
    let status = client.status().await?;

    println!("autobot v{}", status.version);
    println!();
    println!(
        "Nodes: {} total, {} eligible",
        status.nodes_total, status.nodes_eligible
    );
    println!("Active leases: {}", status.active_leases);
    if !status.models.is_empty() {
        println!();
        println!(
            "{:<16} {:>6} {:>9} {:>6} {:>6}",
            "MODEL", "FREE", "RESERVED", "BUSY", "TOTAL"
        );
        for model in status.models {
            println!(
                "{:<16} {:>6} {:>9} {:>6} {:>6}",
                model.model, model.free, model.reserved, model.busy, model.total
            );
        }
    }

    Ok(())
}

/// Exit code for a failed command
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ClientError>() {
        Some(client_err) => client_err.exit_code(),
        None => EXIT_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_anyhow() {
        let err: anyhow::Error = ClientError::Api {
            status: 409,
            kind: "no_capacity".to_string(),
            message: "full".to_string(),
        }
        .into();
        assert_eq!(exit_code(&err), 3);

        let err: anyhow::Error = ClientError::Api {
            status: 404,
            kind: "not_found".to_string(),
            message: "gone".to_string(),
        }
        .into();
        assert_eq!(exit_code(&err), EXIT_INVALID_REQUEST);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), EXIT_UNAVAILABLE);
    }

    fn reservation() -> ReservationResponse {
        ReservationResponse {
            node_id: "gpu-node-7".to_string(),
            slot_indices: vec![0, 1, 2, 3],
            lease_id: "4f9c2a5e-8a57-4b8e-9d0a-2b7f0b2f6f11".parse().unwrap(),
            model: "rtx2080".to_string(),
            expires_at: None,
            line: "gpu-node-7:0,1,2,3".to_string(),
        }
    }

    #[test]
    fn test_quiet_output_is_only_the_line() {
        assert_eq!(
            available_output(&reservation(), true),
            vec!["gpu-node-7:0,1,2,3".to_string()]
        );
    }

    #[test]
    fn test_verbose_output_ends_with_the_line() {
        let lines = available_output(&reservation(), false);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Reserved 4 rtx2080 GPU(s) on gpu-node-7"));
        assert!(lines[0].ends_with("until released)"));
        assert_eq!(lines[1], "gpu-node-7:0,1,2,3");
    }

    #[test]
    fn test_busy_owner_lines() {
        let node: NodeResponse = serde_json::from_value(serde_json::json!({
            "id": "autobot-0-25",
            "status": "alive",
            "consecutive_failures": 0,
            "last_seen": null,
            "unreachable_since": null,
            "operator_drained": false,
            "slot_count": 3,
            "eligible": true,
            "slots": [
                { "node_id": "autobot-0-25", "index": 0, "model": "rtx3090",
                  "occupancy": "free", "lease_id": null, "busy": false },
                { "node_id": "autobot-0-25", "index": 1, "model": "rtx3090",
                  "occupancy": "free", "lease_id": null, "busy": true, "owner": "alice,bob" },
                { "node_id": "autobot-0-25", "index": 2, "model": "rtx3090",
                  "occupancy": "free", "lease_id": null, "busy": true }
            ],
            "capacity": []
        }))
        .unwrap();
        assert_eq!(
            busy_owner_lines(&node),
            vec!["  gpu 1 (rtx3090) busy: alice,bob".to_string()]
        );
    }

    #[test]
    fn test_default_requester_not_empty() {
        assert!(!default_requester().is_empty());
    }

    #[test]
    fn test_describe_expiry() {
        assert_eq!(describe_expiry(None), "until released");
        let at = DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(describe_expiry(Some(at)), "expires 2026-10-19 12:00:00 UTC");
    }
}

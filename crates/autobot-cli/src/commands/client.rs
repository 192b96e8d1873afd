//! HTTP client for the autobot daemon

use autobot_core::{GpuSlot, Lease, LeaseId, ModelCapacity, NodeInfo};
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Exit code for a request the daemon will never accept
pub const EXIT_INVALID_REQUEST: i32 = 2;
/// Exit code when no node has enough free GPUs right now
pub const EXIT_NO_CAPACITY: i32 = 3;
/// Exit code for daemon, store and transport failures
pub const EXIT_UNAVAILABLE: i32 = 4;

/// Failure talking to the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon answered with an error body
    #[error("{message} (HTTP {status})")]
    Api {
        status: u16,
        kind: String,
        message: String,
    },

    /// The daemon could not be reached
    #[error("cannot reach autobot daemon at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The daemon answered with something unexpected
    #[error("unexpected response from daemon: {0}")]
    Decode(String),
}

impl ClientError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Api { kind, .. } => match kind.as_str() {
                "invalid_request" | "not_found" => EXIT_INVALID_REQUEST,
                "no_capacity" => EXIT_NO_CAPACITY,
                _ => EXIT_UNAVAILABLE,
            },
            ClientError::Unreachable { .. } | ClientError::Decode(_) => EXIT_UNAVAILABLE,
        }
    }
}

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

/// Allocation request body
#[derive(Debug, Serialize)]
struct AllocateRequest<'a> {
    model: &'a str,
    count: u32,
    requester: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<&'a str>,
}

/// Renewal request body
#[derive(Debug, Serialize)]
struct RenewRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<&'a str>,
}

/// Reservation response from API
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationResponse {
    pub node_id: String,
    pub slot_indices: Vec<u32>,
    pub lease_id: LeaseId,
    pub model: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub line: String,
}

/// Node response from API
#[derive(Debug, Clone, Deserialize)]
pub struct NodeResponse {
    #[serde(flatten)]
    pub info: NodeInfo,
    pub eligible: bool,
    #[serde(default)]
    pub slots: Vec<GpuSlot>,
    pub capacity: Vec<ModelCapacity>,
}

/// Status response from API
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub nodes_total: usize,
    pub nodes_eligible: usize,
    pub models: Vec<ModelCapacity>,
    pub active_leases: usize,
}

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn allocate(
        &self,
        model: &str,
        count: u32,
        requester: &str,
        ttl: Option<&str>,
    ) -> Result<ReservationResponse, ClientError> {
        let body = AllocateRequest {
            model,
            count,
            requester,
            ttl,
        };
        self.json(self.client.post(self.url("/api/v1/allocations")).json(&body))
            .await
    }

    pub async fn release(&self, lease_id: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/api/v1/leases/{}", lease_id));
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    pub async fn renew(&self, lease_id: &str, ttl: Option<&str>) -> Result<Lease, ClientError> {
        let url = self.url(&format!("/api/v1/leases/{}/renew", lease_id));
        self.json(self.client.post(url).json(&RenewRequest { ttl }))
            .await
    }

    pub async fn leases(&self, all: bool) -> Result<Vec<Lease>, ClientError> {
        let url = self.url(&format!("/api/v1/leases?all={}", all));
        self.json(self.client.get(url)).await
    }

    pub async fn nodes(&self) -> Result<Vec<NodeResponse>, ClientError> {
        self.json(self.client.get(self.url("/api/v1/nodes"))).await
    }

    pub async fn drain(&self, node: &str) -> Result<NodeInfo, ClientError> {
        let url = self.url(&format!("/api/v1/nodes/{}/drain", node));
        self.json(self.client.post(url)).await
    }

    pub async fn undrain(&self, node: &str) -> Result<NodeInfo, ClientError> {
        let url = self.url(&format!("/api/v1/nodes/{}/undrain", node));
        self.json(self.client.post(url)).await
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        self.json(self.client.get(self.url("/api/v1/status"))).await
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Send a request, turning error statuses into [`ClientError::Api`]
    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = request.send().await.map_err(|source| ClientError::Unreachable {
            url: self.base_url.clone(),
            source,
        })?;

        let status = response.status();
        debug!(status = %status, url = %response.url(), "Daemon responded");
        if status.is_success() {
            return Ok(response);
        }

        let text = response
            .text()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => ClientError::Api {
                status: status.as_u16(),
                kind: body.kind,
                message: body.message,
            },
            Err(_) => ClientError::Api {
                status: status.as_u16(),
                kind: if status.is_client_error() {
                    "invalid_request".to_string()
                } else {
                    "internal".to_string()
                },
                message: format!("{}: {}", status, text.trim()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reservation_json() -> serde_json::Value {
        serde_json::json!({
            "node_id": "gpu-node-7",
            "slot_indices": [0, 1, 2, 3],
            "lease_id": "4f9c2a5e-8a57-4b8e-9d0a-2b7f0b2f6f11",
            "model": "rtx2080",
            "expires_at": null,
            "line": "gpu-node-7:0,1,2,3"
        })
    }

    #[tokio::test]
    async fn test_allocate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/allocations"))
            .and(body_json(serde_json::json!({
                "model": "rtx2080",
                "count": 4,
                "requester": "alice@login"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(reservation_json()))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let reservation = client
            .allocate("rtx2080", 4, "alice@login", None)
            .await
            .unwrap();
        assert_eq!(reservation.line, "gpu-node-7:0,1,2,3");
        assert_eq!(reservation.slot_indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_no_capacity_exit_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/allocations"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "kind": "no_capacity",
                "message": "No capacity: no eligible node has 4 free rtx2080 GPU(s)"
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let err = client
            .allocate("rtx2080", 4, "alice", Some("5m"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_NO_CAPACITY);
        assert!(err.to_string().contains("no eligible node"));
    }

    #[tokio::test]
    async fn test_invalid_request_exit_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/allocations"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "kind": "invalid_request",
                "message": "Invalid request: unknown GPU model 'h100'"
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let err = client.allocate("h100", 1, "alice", None).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_store_unavailable_exit_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/allocations"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "kind": "store_unavailable",
                "message": "Store unavailable: lease table offline"
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let err = client.allocate("rtx2080", 1, "alice", None).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_non_json_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let err = client.status().await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_daemon_unreachable() {
        // Nothing listens on the discard port.
        let client = ApiClient::new("http://127.0.0.1:9");
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }));
        assert_eq!(err.exit_code(), EXIT_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_leases_query_and_release() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/leases"))
            .and(query_param("all", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/leases/4f9c2a5e-8a57-4b8e-9d0a-2b7f0b2f6f11"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/", server.uri()));
        assert!(client.leases(true).await.unwrap().is_empty());
        client
            .release("4f9c2a5e-8a57-4b8e-9d0a-2b7f0b2f6f11")
            .await
            .unwrap();
    }
}

//! Mapping scheduler errors onto HTTP responses

use autobot_core::AutobotError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// JSON body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error kind (`invalid_request`, `no_capacity`, ...)
    pub kind: String,
    pub message: String,
}

/// Handler error carrying an [`AutobotError`]
#[derive(Debug)]
pub struct ApiError(pub AutobotError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AutobotError::InvalidRequest(_) | AutobotError::Config(_) => StatusCode::BAD_REQUEST,
            AutobotError::NoCapacity(_) => StatusCode::CONFLICT,
            AutobotError::LeaseNotFound(_) | AutobotError::NodeNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AutobotError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AutobotError::Probe(_)
            | AutobotError::Io(_)
            | AutobotError::Serialization(_)
            | AutobotError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AutobotError> for ApiError {
    fn from(err: AutobotError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "Request failed");
        }
        let kind = match status {
            StatusCode::BAD_REQUEST => "invalid_request",
            StatusCode::INTERNAL_SERVER_ERROR => "internal",
            _ => self.0.kind(),
        };
        let body = ErrorBody {
            kind: kind.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AutobotError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (AutobotError::NoCapacity("x".into()), StatusCode::CONFLICT),
            (AutobotError::LeaseNotFound("x".into()), StatusCode::NOT_FOUND),
            (AutobotError::NodeNotFound("x".into()), StatusCode::NOT_FOUND),
            (
                AutobotError::StoreUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AutobotError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[test]
    fn test_probe_errors_reported_as_internal() {
        let response = ApiError(AutobotError::Probe("ssh failed".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

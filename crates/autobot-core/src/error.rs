//! Error types for autobot

use thiserror::Error;

/// Main error type for autobot
#[derive(Error, Debug)]
pub enum AutobotError {
    /// The request can never succeed as written (bad model, zero count, bad ttl)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No eligible node currently has enough free matching slots
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// Backing inventory or lease storage could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Lease not found, or no longer active
    #[error("Lease not found: {0}")]
    LeaseNotFound(String),

    /// Node not known to the inventory or registry
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node probe failed
    #[error("Probe error: {0}")]
    Probe(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for autobot operations
pub type AutobotResult<T> = Result<T, AutobotError>;

impl AutobotError {
    /// Stable snake_case name for the error, used on the wire and by the CLI
    pub fn kind(&self) -> &'static str {
        match self {
            AutobotError::InvalidRequest(_) => "invalid_request",
            AutobotError::NoCapacity(_) => "no_capacity",
            AutobotError::StoreUnavailable(_) => "store_unavailable",
            AutobotError::LeaseNotFound(_) | AutobotError::NodeNotFound(_) => "not_found",
            AutobotError::Config(_) => "config",
            AutobotError::Probe(_) => "probe",
            AutobotError::Io(_) | AutobotError::Serialization(_) | AutobotError::Internal(_) => {
                "internal"
            }
        }
    }

    /// Whether retrying the same store call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, AutobotError::StoreUnavailable(_))
    }
}

impl From<serde_json::Error> for AutobotError {
    fn from(err: serde_json::Error) -> Self {
        AutobotError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AutobotError {
    fn from(err: config::ConfigError) -> Self {
        AutobotError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutobotError::NoCapacity("rtx2080 x4".to_string());
        assert_eq!(err.to_string(), "No capacity: rtx2080 x4");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AutobotError = io_err.into();
        assert!(matches!(err, AutobotError::Io(_)));
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AutobotError::InvalidRequest("x".into()).kind(),
            "invalid_request"
        );
        assert_eq!(AutobotError::LeaseNotFound("x".into()).kind(), "not_found");
        assert_eq!(
            AutobotError::StoreUnavailable("x".into()).kind(),
            "store_unavailable"
        );
        assert!(AutobotError::StoreUnavailable("x".into()).is_transient());
        assert!(!AutobotError::NoCapacity("x".into()).is_transient());
    }
}

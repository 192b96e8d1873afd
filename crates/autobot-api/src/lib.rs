//! autobot-api: REST API server for autobot
//!
//! This crate exposes the scheduler over HTTP:
//! - Allocations and lease management
//! - Node listing and drain controls
//! - Cluster status and health

pub mod error;
pub mod rest;

pub use error::{ApiError, ErrorBody};
pub use rest::create_router;

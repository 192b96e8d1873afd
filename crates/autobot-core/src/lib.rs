//! autobot-core: Core types and traits for the autobot GPU resolver
//!
//! This crate provides the fundamental types used throughout autobot:
//! - Nodes, GPU slots and model-name normalization
//! - Leases, allocation requests and reservations
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod lease;
pub mod node;

pub use config::*;
pub use error::*;
pub use lease::*;
pub use node::*;

//! autobot-scheduler: GPU slot allocation for autobot
//!
//! This crate turns allocation requests into leases on single nodes:
//! - Placement of requests on qualifying nodes
//! - Conflict-safe reservation with bounded retries
//! - Lease lifecycle and expiry sweeps
//! - Consistency checks, snapshots and background maintenance

pub mod allocator;
pub mod lease;
pub mod placement;
pub mod retry;
pub mod scheduler;

pub use allocator::Allocator;
pub use lease::LeaseManager;
pub use placement::{BestFit, Candidate, FirstFit, PlacementDecision, PlacementStrategy};
pub use retry::StoreRetry;
pub use scheduler::{ClusterStatus, Inconsistency, NodeView, Scheduler};

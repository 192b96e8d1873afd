//! autobot-store: Inventory and lease storage
//!
//! This crate provides the state autobot allocates from:
//! - The GPU slot inventory with its atomic reserve/free contract
//! - Lease records with compare-and-swap state transitions
//! - JSON snapshots for restart persistence

pub mod inventory;
pub mod lease_store;
pub mod snapshot;

pub use inventory::{capacity_by_model, InventoryStore, MemoryInventory, NodeInventory, Occupancy};
pub use lease_store::{LeaseStore, MemoryLeaseStore};
pub use snapshot::StateSnapshot;

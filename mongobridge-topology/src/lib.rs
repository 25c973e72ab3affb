//! # mongobridge-topology
//!
//! Replica-set discovery and lifecycle management for mongobridge.
//!
//! This crate provides:
//! - Topology snapshots (`replSetGetStatus` + `isMaster` from one member)
//! - The state manager owning the proxy set and the real↔proxy maps
//! - The periodic health checker that aborts the process when the proxies
//!   stop answering
//! - A direct single-server client used for probes

pub mod direct;
pub mod error;
pub mod health;
pub mod manager;
pub mod state;

pub use direct::DirectClient;
pub use error::TopologyError;
pub use health::{Checkable, HealthChecker};
pub use manager::{SetComparison, StateManager};
pub use state::ReplicaSetState;

//! ktui Discovery - Network discovery and polling for smart devices
//!
//! This crate provides:
//! - UDP broadcast probing to find devices without prior knowledge of
//!   their IPs
//! - The polling scheduler that re-runs discovery and refreshes known
//!   devices on a fixed interval with bounded parallelism

pub mod poller;
pub mod prober;

pub use poller::{Poller, PollerConfig, PollerState};
pub use prober::{discover, ProbeConfig};

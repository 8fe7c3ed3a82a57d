//! ktui Core - Device model and registry
//!
//! This crate provides the foundational types for the ktui system:
//! - Device identity and state types for tracking discovered smart devices
//! - The device registry with snapshot publication for UI consumption
//! - Sequence numbering for response ordering

pub mod device;
pub mod registry;

pub use device::{
    DeviceId, DeviceIdentity, DeviceState, DeviceStatus, PowerState, Sequencer,
};
pub use registry::{DeviceRegistry, RegistrySnapshot};

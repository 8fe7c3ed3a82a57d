//! ktui Proto - Wire protocol for Kasa-style smart devices
//!
//! This crate provides the transport codec (running-key XOR cascade over
//! compact JSON), the command/response models, and the TCP device client
//! used for control and query commands.

pub mod client;
pub mod codec;
pub mod command;

pub use client::{DeviceClient, SendError};
pub use codec::{frame, unframe, Codec, DecodeError};
pub use command::{CommandOp, SysInfo};

use serde::{Deserialize, Serialize};

/// Default TCP/UDP control port
pub const DEFAULT_PORT: u16 = 9999;

/// Default initial key byte for the obfuscation cascade
pub const DEFAULT_KEY_SEED: u8 = 171;

/// Wire protocol constants
///
/// The port and cascade seed are configuration, not inference: deployments
/// talking to non-standard firmware can override both.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Device control port (UDP discovery and TCP control)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Initial key byte for the XOR cascade
    #[serde(default = "default_key_seed")]
    pub key_seed: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            key_seed: default_key_seed(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_key_seed() -> u8 {
    DEFAULT_KEY_SEED
}

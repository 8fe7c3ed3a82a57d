//! Device types for tracking discovered smart plugs and switches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable key identifying one physical device across discovery cycles
///
/// Built from the hardware device ID when the device reports one, falling
/// back to the MAC address, falling back to an IP-derived placeholder for
/// devices that have not answered a full query yet. Identity resolution
/// always prefers the hardware ID over the IP: the IP can change under DHCP,
/// the hardware ID cannot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a DeviceId from a hardware device ID string
    pub fn from_device_id(device_id: &str) -> Self {
        Self(device_id.to_string())
    }

    /// Create a DeviceId from a MAC address (normalized to lowercase)
    pub fn from_mac(mac: &str) -> Self {
        Self(mac.to_ascii_lowercase())
    }

    /// Placeholder ID for a device whose hardware ID is not known yet
    pub fn placeholder(addr: IpAddr) -> Self {
        Self(format!("ip-{addr}"))
    }

    /// Whether this ID is an IP-derived placeholder
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("ip-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity tuple for one physical device: stable key plus current address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device key
    pub id: DeviceId,
    /// Most recently observed IP address (may move under DHCP)
    pub addr: IpAddr,
}

impl DeviceIdentity {
    pub fn new(id: DeviceId, addr: IpAddr) -> Self {
        Self { id, addr }
    }
}

/// Relay state of a plug or switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn from_relay(state: u8) -> Self {
        if state != 0 {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
        }
    }
}

/// Current status of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is online and responding
    Online,
    /// Device was seen but has stopped responding
    Offline,
    /// Device status is unknown
    #[default]
    Unknown,
}

/// Mutable per-device record held by the registry
///
/// States produced by the prober or the device client are deltas: `None`
/// fields were simply not present in the response and must not clear data
/// already held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// Device identity (stable key + current address)
    pub identity: DeviceIdentity,
    /// Human-readable name configured on the device
    pub alias: Option<String>,
    /// Hardware model string (e.g. "HS103(US)")
    pub model: Option<String>,
    /// Relay state, if the device reported one
    pub power: Option<PowerState>,
    /// Brightness percentage for dimmable devices (0-100)
    pub brightness: Option<u8>,
    /// Online/offline flag
    pub status: DeviceStatus,
    /// When the device was first seen
    pub first_seen: DateTime<Utc>,
    /// When the device last answered
    pub last_seen: DateTime<Utc>,
    /// Most recent per-device error, cleared on the next good response
    pub last_error: Option<String>,
    /// Response ordering number, stamped by the caller before merge
    pub seq: u64,
}

impl DeviceState {
    /// Create a new state with minimal information
    pub fn new(identity: DeviceIdentity) -> Self {
        let now = Utc::now();
        Self {
            identity,
            alias: None,
            model: None,
            power: None,
            brightness: None,
            status: DeviceStatus::Unknown,
            first_seen: now,
            last_seen: now,
            last_error: None,
            seq: 0,
        }
    }

    /// Name to show for this device: alias when set, stable ID otherwise
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.identity.id.as_str())
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Monotone counter for response sequence numbers
///
/// Every response stamped before merge, so a stale in-flight command can
/// never overwrite data from a newer response for the same identity.
#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next sequence number (starts at 1)
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

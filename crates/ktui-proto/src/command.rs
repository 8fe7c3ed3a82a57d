//! Command builders and response models for the device JSON protocol

use ktui_core::{DeviceId, DeviceIdentity, DeviceState, PowerState};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;

/// Operation directed at one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOp {
    /// Full state query (also serves as the discovery payload)
    GetInfo,
    /// Switch the relay on or off
    SetPower(bool),
    /// Set brightness percentage (0-100) on dimmable devices
    SetBrightness(u8),
}

impl CommandOp {
    /// JSON request body for this operation
    pub fn request(&self) -> Value {
        match self {
            Self::GetInfo => json!({"system": {"get_sysinfo": {}}}),
            Self::SetPower(on) => {
                json!({"system": {"set_relay_state": {"state": u8::from(*on)}}})
            }
            Self::SetBrightness(level) => {
                json!({"smartlife.iot.dimmer": {"set_brightness": {"brightness": level}}})
            }
        }
    }

    /// Module/command path under which the acknowledgment body appears,
    /// for operations answered with a bare err_code.
    pub fn ack_path(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::GetInfo => None,
            Self::SetPower(_) => Some(("system", "set_relay_state")),
            Self::SetBrightness(_) => Some(("smartlife.iot.dimmer", "set_brightness")),
        }
    }

    /// Apply the commanded field to a state delta once acknowledged.
    /// Only the field this command affects is authoritative.
    pub fn apply_ack(&self, state: &mut DeviceState) {
        match self {
            Self::GetInfo => {}
            Self::SetPower(on) => {
                state.power = Some(if *on { PowerState::On } else { PowerState::Off });
            }
            Self::SetBrightness(level) => state.brightness = Some(*level),
        }
    }
}

impl std::fmt::Display for CommandOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetInfo => write!(f, "get_info"),
            Self::SetPower(on) => write!(f, "set_power({on})"),
            Self::SetBrightness(level) => write!(f, "set_brightness({level})"),
        }
    }
}

/// `get_sysinfo` response body
///
/// Only the fields ktui tracks; devices report many more, which serde
/// ignores.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SysInfo {
    pub alias: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub mac: Option<String>,
    pub relay_state: Option<u8>,
    pub brightness: Option<u8>,
    #[serde(default)]
    pub err_code: i64,
}

impl SysInfo {
    /// Extract the sysinfo body from a full response envelope
    pub fn from_response(value: &Value) -> Option<Self> {
        let body = value.get("system")?.get("get_sysinfo")?;
        serde_json::from_value(body.clone()).ok()
    }

    /// Stable identity for the reporting device, preferring the hardware
    /// device ID, then the MAC, then an IP placeholder
    pub fn identity(&self, addr: IpAddr) -> DeviceIdentity {
        let id = self
            .device_id
            .as_deref()
            .map(DeviceId::from_device_id)
            .or_else(|| self.mac.as_deref().map(DeviceId::from_mac))
            .unwrap_or_else(|| DeviceId::placeholder(addr));
        DeviceIdentity::new(id, addr)
    }

    /// Map into a registry delta; fields absent from the reply stay unset
    pub fn into_state(self, addr: IpAddr) -> DeviceState {
        let identity = self.identity(addr);
        let mut state = DeviceState::new(identity);
        state.alias = self.alias;
        state.model = self.model;
        state.power = self.relay_state.map(PowerState::from_relay);
        state.brightness = self.brightness;
        state
    }
}

/// Pull the err_code out of a set-command acknowledgment
pub fn ack_err_code(value: &Value, module: &str, command: &str) -> Option<i64> {
    value.get(module)?.get(command)?.get("err_code")?.as_i64()
}

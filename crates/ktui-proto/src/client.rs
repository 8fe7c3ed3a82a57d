//! TCP device client for control and query commands
//!
//! The client owns the network exchange only; stamping sequence numbers and
//! merging the resulting state delta into the registry is the caller's
//! responsibility.

use ktui_core::{DeviceIdentity, DeviceState};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::{frame, Codec, DecodeError, MAX_FRAME_LEN};
use crate::command::{ack_err_code, CommandOp, SysInfo};
use crate::ProtocolConfig;

/// Recoverable failure of one device command
#[derive(Error, Debug)]
pub enum SendError {
    #[error("device unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("timed out waiting for device response")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<DecodeError> for SendError {
    fn from(err: DecodeError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Per-device command client
#[derive(Debug, Clone)]
pub struct DeviceClient {
    codec: Codec,
    port: u16,
    timeout: Duration,
}

impl DeviceClient {
    pub fn new(protocol: &ProtocolConfig, timeout: Duration) -> Self {
        Self {
            codec: Codec::new(protocol.key_seed),
            port: protocol.port,
            timeout,
        }
    }

    /// Send one command to the device's current address
    ///
    /// The whole exchange (connect, write, read, decode) runs under one
    /// deadline, so a hung device costs at most the configured timeout.
    /// The returned state is a delta: only fields the command affects are
    /// authoritative.
    pub async fn send(
        &self,
        identity: &DeviceIdentity,
        op: &CommandOp,
    ) -> Result<DeviceState, SendError> {
        let addr = SocketAddr::new(identity.addr, self.port);
        trace!(device = %identity.id, %addr, command = %op, "Sending command");
        match timeout(self.timeout, self.exchange(addr, op)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(device = %identity.id, %addr, command = %op, "Command timed out");
                Err(SendError::Timeout)
            }
        }
    }

    async fn exchange(&self, addr: SocketAddr, op: &CommandOp) -> Result<DeviceState, SendError> {
        let body = self.codec.encode(&op.request())?;

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(SendError::Unreachable)?;
        stream
            .write_all(&frame(&body))
            .await
            .map_err(SendError::Unreachable)?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(SendError::Unreachable)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(len).into());
        }
        let mut reply = vec![0u8; len];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(SendError::Unreachable)?;

        let value = self.codec.decode(&reply)?;
        map_response(addr.ip(), op, &value)
    }
}

/// Map a decoded reply into a device-state delta
fn map_response(addr: IpAddr, op: &CommandOp, value: &Value) -> Result<DeviceState, SendError> {
    match op.ack_path() {
        None => {
            let info = SysInfo::from_response(value)
                .ok_or_else(|| SendError::Protocol("response missing get_sysinfo body".into()))?;
            if info.err_code != 0 {
                return Err(SendError::Protocol(format!(
                    "device reported error code {}",
                    info.err_code
                )));
            }
            Ok(info.into_state(addr))
        }
        Some((module, command)) => {
            let code = ack_err_code(value, module, command).ok_or_else(|| {
                SendError::Protocol(format!("response missing {module}.{command} body"))
            })?;
            if code != 0 {
                return Err(SendError::Protocol(format!(
                    "device reported error code {code}"
                )));
            }
            // Acknowledgments carry no state; the commanded field is the
            // only authoritative one.
            let mut state = DeviceState::new(DeviceIdentity::new(
                ktui_core::DeviceId::placeholder(addr),
                addr,
            ));
            op.apply_ack(&mut state);
            Ok(state)
        }
    }
}

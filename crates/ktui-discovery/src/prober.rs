//! UDP broadcast discovery
//!
//! One encoded `get_sysinfo` datagram goes out to each broadcast target;
//! replies are collected on the same socket until the timeout window
//! closes. Each call is independent and restartable.

use anyhow::{Context, Result};
use ktui_core::{DeviceId, DeviceState};
use ktui_proto::{Codec, CommandOp, ProtocolConfig, SysInfo};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

/// Prober configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub protocol: ProtocolConfig,
    /// Overall cap on the listen window
    pub timeout: Duration,
    /// Explicit broadcast target; when unset, the directed broadcast of
    /// every local IPv4 interface plus the limited broadcast is used
    pub broadcast: Option<Ipv4Addr>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            timeout: Duration::from_secs(3),
            broadcast: None,
        }
    }
}

/// Broadcast a discovery request and collect replies until the deadline
///
/// Replies are decoded independently: a malformed datagram is logged and
/// dropped, never aborting the probe. Duplicate replies from one device
/// collapse to the most recently received. Zero replies is a valid
/// outcome, not an error; only a socket setup failure is propagated.
pub async fn discover(config: &ProbeConfig) -> Result<Vec<DeviceState>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .context("failed to bind discovery socket")?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast on discovery socket")?;

    let codec = Codec::new(config.protocol.key_seed);
    let request = codec
        .encode(&CommandOp::GetInfo.request())
        .context("failed to encode discovery request")?;

    let targets = match config.broadcast {
        Some(addr) => vec![addr],
        None => broadcast_targets(),
    };
    for target in &targets {
        let dest = SocketAddr::new(IpAddr::V4(*target), config.protocol.port);
        match socket.send_to(&request, dest).await {
            Ok(_) => trace!(%dest, "Sent discovery request"),
            Err(e) => warn!(%dest, error = %e, "Failed to send discovery datagram"),
        }
    }

    let deadline = Instant::now() + config.timeout;
    let mut sightings: HashMap<DeviceId, DeviceState> = HashMap::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!(error = %e, "Discovery receive failed");
                continue;
            }
            // Window closed.
            Err(_) => break,
        };

        match parse_reply(&codec, &buf[..len], from.ip()) {
            Ok(state) => {
                debug!(device = %state.identity.id, addr = %from, "Discovery reply");
                sightings.insert(state.identity.id.clone(), state);
            }
            Err(e) => warn!(addr = %from, error = %e, "Dropping malformed discovery reply"),
        }
    }

    debug!(found = sightings.len(), "Discovery window closed");
    Ok(sightings.into_values().collect())
}

/// Decode one discovery reply into a device sighting
fn parse_reply(codec: &Codec, data: &[u8], from: IpAddr) -> Result<DeviceState> {
    let value = codec.decode(data)?;
    let info = SysInfo::from_response(&value).context("reply missing get_sysinfo body")?;
    if info.err_code != 0 {
        anyhow::bail!("device reported error code {}", info.err_code);
    }
    Ok(info.into_state(from))
}

/// Directed broadcast address of every local IPv4 interface, plus the
/// limited broadcast
fn broadcast_targets() -> Vec<Ipv4Addr> {
    let mut targets = vec![Ipv4Addr::BROADCAST];
    match NetworkInterface::show() {
        Ok(interfaces) => {
            for iface in interfaces {
                for addr in &iface.addr {
                    if let network_interface::Addr::V4(v4) = addr {
                        if v4.ip.is_loopback() {
                            continue;
                        }
                        let bcast = v4
                            .broadcast
                            .or_else(|| v4.netmask.map(|m| directed_broadcast(v4.ip, m)));
                        if let Some(bcast) = bcast {
                            if !targets.contains(&bcast) {
                                targets.push(bcast);
                            }
                        }
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to enumerate interfaces, using limited broadcast only");
        }
    }
    targets
}

fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loopback_config(port: u16, timeout: Duration) -> ProbeConfig {
        ProbeConfig {
            protocol: ProtocolConfig {
                port,
                key_seed: 171,
            },
            timeout,
            broadcast: Some(Ipv4Addr::LOCALHOST),
        }
    }

    #[test]
    fn test_directed_broadcast() {
        assert_eq!(
            directed_broadcast(
                Ipv4Addr::new(192, 168, 1, 40),
                Ipv4Addr::new(255, 255, 255, 0)
            ),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
    }

    #[test]
    fn test_parse_reply_maps_identity() {
        let codec = Codec::new(171);
        let reply = codec
            .encode(&json!({"system": {"get_sysinfo": {
                "alias": "Fan",
                "deviceId": "8006AABB",
                "relay_state": 1,
            }}}))
            .unwrap();
        let state = parse_reply(
            &codec,
            &reply,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)),
        )
        .unwrap();
        assert_eq!(state.identity.id.as_str(), "8006AABB");
        assert_eq!(state.alias.as_deref(), Some("Fan"));
    }

    #[test]
    fn test_parse_reply_rejects_garbage() {
        let codec = Codec::new(171);
        assert!(parse_reply(
            &codec,
            b"\xff\x00garbage",
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_empty_network_yields_empty_sequence() {
        // Nothing listens on this port; the probe must return empty, not
        // fail.
        let config = loopback_config(48999, Duration::from_millis(200));
        let found = discover(&config).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_fake_device_answers_probe() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();

        let responder = tokio::spawn(async move {
            let codec = Codec::new(171);
            let mut buf = vec![0u8; 4096];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            // Request must decode to the discovery query.
            let request = codec.decode(&buf[..len]).unwrap();
            assert_eq!(request, json!({"system": {"get_sysinfo": {}}}));

            let reply = codec
                .encode(&json!({"system": {"get_sysinfo": {
                    "alias": "Plug",
                    "deviceId": "8006CCDD",
                    "relay_state": 0,
                }}}))
                .unwrap();
            // Answer twice; duplicates must collapse.
            device.send_to(&reply, from).await.unwrap();
            device.send_to(&reply, from).await.unwrap();
        });

        let config = loopback_config(port, Duration::from_millis(500));
        let found = discover(&config).await.unwrap();
        responder.await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity.id.as_str(), "8006CCDD");
        assert_eq!(found[0].alias.as_deref(), Some("Plug"));
    }

    #[tokio::test]
    async fn test_malformed_reply_dropped_probe_continues() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();

        let responder = tokio::spawn(async move {
            let codec = Codec::new(171);
            let mut buf = vec![0u8; 4096];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(b"\x00\xffjunk", from).await.unwrap();
            let reply = codec
                .encode(&json!({"system": {"get_sysinfo": {"deviceId": "8006EEFF"}}}))
                .unwrap();
            device.send_to(&reply, from).await.unwrap();
        });

        let config = loopback_config(port, Duration::from_millis(500));
        let found = discover(&config).await.unwrap();
        responder.await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity.id.as_str(), "8006EEFF");
    }
}

//! Configuration loading and validation

use anyhow::Result;
use ktui_discovery::{PollerConfig, ProbeConfig};
use ktui_proto::ProtocolConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Time between automatic poll cycles, in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Per-command deadline, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Discovery listen window, in milliseconds
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
    /// Consecutive failed cycles before a device is shown offline
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold: u32,
    /// Cap on in-flight refresh commands
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_refresh: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            command_timeout_ms: default_command_timeout(),
            discovery_timeout_ms: default_discovery_timeout(),
            stale_threshold: default_stale_threshold(),
            max_concurrent_refresh: default_max_concurrent(),
        }
    }
}

fn default_interval() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    3000
}

fn default_discovery_timeout() -> u64 {
    3000
}

fn default_stale_threshold() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    8
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Explicit broadcast target (e.g. "192.168.1.255"); when unset the
    /// directed broadcast of every local interface is probed
    #[serde(default)]
    pub broadcast: Option<Ipv4Addr>,
}

impl Config {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.poll.command_timeout_ms)
    }

    /// Convert to the scheduler configuration
    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.poll.interval_secs),
            discovery_timeout: Duration::from_millis(self.poll.discovery_timeout_ms),
            command_timeout: self.command_timeout(),
            stale_threshold: self.poll.stale_threshold,
            max_concurrent_refresh: self.poll.max_concurrent_refresh,
            protocol: self.protocol,
            broadcast: self.discovery.broadcast,
        }
    }

    /// Convert to the one-shot prober configuration
    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            protocol: self.protocol,
            timeout: Duration::from_millis(self.poll.discovery_timeout_ms),
            broadcast: self.discovery.broadcast,
        }
    }
}

/// Load configuration from file, falling back to defaults when absent
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.poll.interval_secs, 30);
        assert_eq!(config.poll.stale_threshold, 3);
        assert_eq!(config.protocol.port, 9999);
        assert_eq!(config.protocol.key_seed, 171);
        assert!(config.discovery.broadcast.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [poll]
            interval_secs = 10

            [discovery]
            broadcast = "192.168.1.255"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll.interval_secs, 10);
        assert_eq!(config.poll.command_timeout_ms, 3000);
        assert_eq!(
            config.discovery.broadcast,
            Some(Ipv4Addr::new(192, 168, 1, 255))
        );
        assert_eq!(config.protocol.port, 9999);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/ktui.toml")).unwrap();
        assert_eq!(config.poll.interval_secs, 30);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[protocol]\nport = 10000\nkey_seed = 42").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.protocol.port, 10000);
        assert_eq!(config.protocol.key_seed, 42);
    }

    #[test]
    fn test_poller_config_conversion() {
        let config = Config::default();
        let poller = config.to_poller_config();
        assert_eq!(poller.poll_interval, Duration::from_secs(30));
        assert_eq!(poller.command_timeout, Duration::from_millis(3000));
        assert_eq!(poller.max_concurrent_refresh, 8);
    }
}

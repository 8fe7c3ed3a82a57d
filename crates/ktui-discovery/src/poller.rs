//! Polling scheduler
//!
//! Repeats `Idle -> Discovering -> Refreshing -> Idle` on a fixed
//! interval. Discovery sightings and refresh responses are merged into the
//! shared registry as they arrive; devices that keep failing are flipped
//! offline after the configured number of consecutive cycles but stay
//! listed.

use anyhow::{Context, Result};
use ktui_core::{DeviceRegistry, Sequencer};
use ktui_proto::{CommandOp, DeviceClient, ProtocolConfig};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::prober::{discover, ProbeConfig};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between poll cycles
    pub poll_interval: Duration,
    /// Listen window for each discovery pass
    pub discovery_timeout: Duration,
    /// Per-command deadline for refresh queries
    pub command_timeout: Duration,
    /// Consecutive failed cycles before a device flips offline
    pub stale_threshold: u32,
    /// Cap on in-flight refresh commands
    pub max_concurrent_refresh: usize,
    pub protocol: ProtocolConfig,
    /// Explicit discovery broadcast target
    pub broadcast: Option<Ipv4Addr>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
            stale_threshold: 3,
            max_concurrent_refresh: 8,
            protocol: ProtocolConfig::default(),
            broadcast: None,
        }
    }
}

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Discovering,
    Refreshing,
    /// Terminal: the loop has shut down
    Cancelled,
}

/// Periodic discovery and refresh driver
pub struct Poller {
    registry: Arc<DeviceRegistry>,
    sequencer: Arc<Sequencer>,
    client: DeviceClient,
    probe: ProbeConfig,
    config: PollerConfig,
    state_tx: watch::Sender<PollerState>,
}

impl Poller {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sequencer: Arc<Sequencer>,
        config: PollerConfig,
    ) -> Self {
        let client = DeviceClient::new(&config.protocol, config.command_timeout);
        let probe = ProbeConfig {
            protocol: config.protocol,
            timeout: config.discovery_timeout,
            broadcast: config.broadcast,
        };
        let (state_tx, _) = watch::channel(PollerState::Idle);
        Self {
            registry,
            sequencer,
            client,
            probe,
            config,
            state_tx,
        }
    }

    /// Watch the scheduler's cycle state
    pub fn state(&self) -> watch::Receiver<PollerState> {
        self.state_tx.subscribe()
    }

    /// Run one full `Discovering -> Refreshing -> Idle` cycle
    ///
    /// Errors only on a fatal resource failure (discovery socket setup);
    /// per-device failures are recorded in the registry and the cycle
    /// continues.
    pub async fn run_cycle(&self) -> Result<()> {
        self.state_tx.send_replace(PollerState::Discovering);
        self.run_discovery().await?;

        self.state_tx.send_replace(PollerState::Refreshing);
        self.refresh_known().await;

        let flipped = self.registry.mark_stale(self.config.stale_threshold).await;
        if !flipped.is_empty() {
            info!(count = flipped.len(), "Devices marked offline");
        }

        self.state_tx.send_replace(PollerState::Idle);
        Ok(())
    }

    async fn run_discovery(&self) -> Result<()> {
        let found = discover(&self.probe).await?;
        debug!(found = found.len(), "Discovery pass complete");
        for mut state in found {
            state.seq = self.sequencer.next();
            self.registry.merge(state).await;
        }
        Ok(())
    }

    /// Query every known device (online and offline) in parallel, bounded
    /// by the concurrency limit; each result is merged as it completes
    async fn refresh_known(&self) {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return;
        }

        let limit = self.config.max_concurrent_refresh.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for device in snapshot.devices.iter() {
            let identity = device.identity.clone();
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // The semaphore is never closed while tasks hold it.
                let _permit = semaphore.acquire_owned().await.ok();
                let result = client.send(&identity, &CommandOp::GetInfo).await;
                (identity, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((identity, result)) = joined else {
                continue;
            };
            match result {
                Ok(mut state) => {
                    state.seq = self.sequencer.next();
                    self.registry.merge(state).await;
                }
                Err(e) => {
                    debug!(device = %identity.id, error = %e, "Refresh failed");
                    self.registry.record_failure(&identity.id, &e.to_string()).await;
                }
            }
        }
    }

    /// Run the polling loop until the shutdown flag flips
    ///
    /// Shutdown is graceful: a cycle already in progress drains its
    /// in-flight commands (each bounded by the command timeout) before the
    /// loop observes the signal, so snapshots are never left half-written.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(self.config.poll_interval);
        info!(interval = ?self.config.poll_interval, "Polling scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        self.state_tx.send_replace(PollerState::Cancelled);
                        return Err(e).context("polling cycle aborted");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state_tx.send_replace(PollerState::Cancelled);
        info!("Polling scheduler stopped");
        Ok(())
    }
}

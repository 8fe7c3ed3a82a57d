//! Session controller
//!
//! Translates display-layer commands into device client calls and
//! reconciles the results into the registry. Dispatch is
//! synchronous-request/async-completion: callers get an acknowledgment
//! ticket immediately and the final result on the outcome feed, while the
//! registry's snapshot stream reflects the state change once the device
//! answers.

use anyhow::{bail, Result};
use ktui_core::{DeviceId, DeviceRegistry, RegistrySnapshot, Sequencer};
use ktui_discovery::{discover, Poller, ProbeConfig};
use ktui_proto::{CommandOp, DeviceClient, SendError};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Acknowledgment handed back as soon as a command is accepted
#[derive(Debug, Clone)]
pub struct CommandTicket {
    pub token: Uuid,
    pub device: DeviceId,
}

/// Final result of an accepted command, delivered on the outcome feed
#[derive(Debug)]
pub struct CommandOutcome {
    pub token: Uuid,
    pub device: DeviceId,
    pub result: Result<(), SendError>,
}

/// Top-level orchestrator between the display layer and the device network
pub struct Session {
    registry: Arc<DeviceRegistry>,
    sequencer: Arc<Sequencer>,
    client: DeviceClient,
    probe: ProbeConfig,
    poller: Arc<Poller>,
    outcome_tx: mpsc::UnboundedSender<CommandOutcome>,
}

impl Session {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sequencer: Arc<Sequencer>,
        client: DeviceClient,
        probe: ProbeConfig,
        poller: Arc<Poller>,
    ) -> (Self, mpsc::UnboundedReceiver<CommandOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                sequencer,
                client,
                probe,
                poller,
                outcome_tx,
            },
            outcome_rx,
        )
    }

    /// Run one on-demand discovery pass and merge the sightings
    pub async fn discover(&self) -> Result<usize> {
        let found = discover(&self.probe).await?;
        let count = found.len();
        for mut state in found {
            state.seq = self.sequencer.next();
            self.registry.merge(state).await;
        }
        info!(found = count, "Manual discovery complete");
        Ok(count)
    }

    /// Run one full poll cycle (discovery plus refresh of every known
    /// device) immediately
    pub async fn refresh(&self) -> Result<()> {
        self.poller.run_cycle().await
    }

    /// Dispatch a command at one device
    ///
    /// Returns a ticket immediately; the device exchange runs in the
    /// background and its result arrives on the outcome feed. The next
    /// snapshot reflects the change once the device has answered.
    pub async fn send_command(&self, id: &DeviceId, op: CommandOp) -> Result<CommandTicket> {
        let Some(current) = self.registry.get(id).await else {
            bail!("unknown device: {id}");
        };

        let token = Uuid::new_v4();
        let ticket = CommandTicket {
            token,
            device: id.clone(),
        };

        let identity = current.identity;
        let device = id.clone();
        let client = self.client.clone();
        let registry = Arc::clone(&self.registry);
        let sequencer = Arc::clone(&self.sequencer);
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let result = match client.send(&identity, &op).await {
                Ok(mut state) => {
                    // Acknowledgments come back under a placeholder
                    // identity; pin the delta to the commanded device.
                    state.identity = identity.clone();
                    state.seq = sequencer.next();
                    registry.merge(state).await;
                    Ok(())
                }
                Err(e) => {
                    warn!(device = %device, command = %op, error = %e, "Command failed");
                    registry.record_failure(&device, &e.to_string()).await;
                    Err(e)
                }
            };
            let _ = outcome_tx.send(CommandOutcome {
                token,
                device,
                result,
            });
        });

        Ok(ticket)
    }

    /// Last committed registry snapshot
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Subscribe to the snapshot change feed
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.registry.subscribe()
    }
}

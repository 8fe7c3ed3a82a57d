//! In-memory device registry with copy-on-write snapshot publication
//!
//! All mutation funnels through one writer lock; readers never touch the
//! lock. Each committed mutation publishes a complete new snapshot on a
//! watch channel, so consumers observe either the previous snapshot or the
//! next one, never an in-progress merge.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::device::{DeviceId, DeviceState, DeviceStatus};

/// Immutable point-in-time view of every known device
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Device states ordered by alias, then by ID
    pub devices: Arc<[DeviceState]>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            devices: Arc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Find a device state by its stable ID
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceState> {
        self.devices.iter().find(|d| d.identity.id == *id)
    }
}

struct Entry {
    state: DeviceState,
    /// Consecutive refresh cycles without a successful response
    missed_cycles: u32,
}

/// Registry of known devices keyed by stable device ID
pub struct DeviceRegistry {
    entries: Mutex<HashMap<DeviceId, Entry>>,
    tx: watch::Sender<RegistrySnapshot>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RegistrySnapshot::empty());
        Self {
            entries: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Merge a response state into the registry (idempotent upsert)
    ///
    /// Ordering rule: a state whose sequence number is not newer than the
    /// stored one is discarded, so stale in-flight responses never clobber
    /// fresher data. Delta semantics: `None` fields leave the stored value
    /// untouched. A successful merge marks the entry online, clears its
    /// error, and resets its missed-cycle counter.
    pub async fn merge(&self, incoming: DeviceState) {
        let mut entries = self.entries.lock().await;
        let mut key = incoming.identity.id.clone();

        if key.is_placeholder() {
            // A placeholder sighting for an address already owned by a real
            // ID folds into that entry instead of duplicating the device.
            if let Some(real) = entries.iter().find_map(|(id, e)| {
                (!id.is_placeholder() && e.state.identity.addr == incoming.identity.addr)
                    .then(|| id.clone())
            }) {
                debug!(placeholder = %key, device = %real, "Folding placeholder sighting into known device");
                key = real;
            }
        } else {
            // A real ID arriving at an address held by a placeholder entry
            // supersedes it.
            let superseded: Vec<DeviceId> = entries
                .iter()
                .filter(|(id, e)| {
                    id.is_placeholder() && e.state.identity.addr == incoming.identity.addr
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in superseded {
                debug!(placeholder = %id, device = %key, "Replacing placeholder entry with real device ID");
                entries.remove(&id);
            }
        }

        match entries.get_mut(&key) {
            Some(entry) => {
                if incoming.seq <= entry.state.seq {
                    debug!(
                        device = %key,
                        seq = incoming.seq,
                        have = entry.state.seq,
                        "Discarding stale response"
                    );
                    return;
                }
                let state = &mut entry.state;
                state.identity.addr = incoming.identity.addr;
                if incoming.alias.is_some() {
                    state.alias = incoming.alias;
                }
                if incoming.model.is_some() {
                    state.model = incoming.model;
                }
                if incoming.power.is_some() {
                    state.power = incoming.power;
                }
                if incoming.brightness.is_some() {
                    state.brightness = incoming.brightness;
                }
                state.status = DeviceStatus::Online;
                state.last_seen = incoming.last_seen;
                state.last_error = None;
                state.seq = incoming.seq;
                entry.missed_cycles = 0;
            }
            None => {
                let mut state = incoming;
                state.identity.id = key.clone();
                state.status = DeviceStatus::Online;
                info!(device = %key, addr = %state.identity.addr, "New device registered");
                entries.insert(
                    key,
                    Entry {
                        state,
                        missed_cycles: 0,
                    },
                );
            }
        }

        self.publish(&entries);
    }

    /// Record a failed refresh for a device
    ///
    /// Increments the consecutive-miss counter and stores the error for
    /// display; power and other observed fields are left as last known.
    pub async fn record_failure(&self, id: &DeviceId, error: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.missed_cycles = entry.missed_cycles.saturating_add(1);
            entry.state.last_error = Some(error.to_string());
            debug!(device = %id, misses = entry.missed_cycles, error = %error, "Refresh failed");
            self.publish(&entries);
        }
    }

    /// Flip devices with at least `threshold` consecutive misses to offline
    ///
    /// Offline devices are retained, not evicted: previously-seen devices
    /// stay listed with an offline indicator. Returns the IDs flipped by
    /// this call.
    pub async fn mark_stale(&self, threshold: u32) -> Vec<DeviceId> {
        let mut entries = self.entries.lock().await;
        let mut flipped = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if entry.missed_cycles >= threshold && entry.state.status != DeviceStatus::Offline {
                entry.state.status = DeviceStatus::Offline;
                info!(device = %id, misses = entry.missed_cycles, "Device marked offline");
                flipped.push(id.clone());
            }
        }
        if !flipped.is_empty() {
            self.publish(&entries);
        }
        flipped
    }

    /// Last fully committed snapshot (never blocks on in-progress merges)
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribe to the snapshot change feed
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.tx.subscribe()
    }

    /// Look up a single device state
    pub async fn get(&self, id: &DeviceId) -> Option<DeviceState> {
        self.entries.lock().await.get(id).map(|e| e.state.clone())
    }

    /// Number of known devices (online and offline)
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn publish(&self, entries: &HashMap<DeviceId, Entry>) {
        let mut devices: Vec<DeviceState> = entries.values().map(|e| e.state.clone()).collect();
        devices.sort_by(|a, b| {
            let ka = (a.alias.as_deref().unwrap_or("").to_ascii_lowercase(), a.identity.id.as_str().to_string());
            let kb = (b.alias.as_deref().unwrap_or("").to_ascii_lowercase(), b.identity.id.as_str().to_string());
            ka.cmp(&kb)
        });
        self.tx.send_replace(RegistrySnapshot {
            taken_at: Utc::now(),
            devices: Arc::from(devices),
        });
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentity, PowerState};
    use std::net::{IpAddr, Ipv4Addr};

    fn state(id: &str, last_octet: u8, seq: u64) -> DeviceState {
        let identity = DeviceIdentity::new(
            DeviceId::from_device_id(id),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)),
        );
        let mut s = DeviceState::new(identity);
        s.seq = seq;
        s
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let registry = DeviceRegistry::new();
        let s = state("dev-a", 10, 1);
        registry.merge(s.clone()).await;
        let first = registry.snapshot();
        registry.merge(s).await;
        let second = registry.snapshot();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(
            first.get(&DeviceId::from_device_id("dev-a")).unwrap().seq,
            second.get(&DeviceId::from_device_id("dev-a")).unwrap().seq,
        );
    }

    #[tokio::test]
    async fn test_later_seq_wins_in_either_merge_order() {
        let mut newer = state("dev-a", 10, 5);
        newer.power = Some(PowerState::On);
        let mut older = state("dev-a", 10, 3);
        older.power = Some(PowerState::Off);

        let forward = DeviceRegistry::new();
        forward.merge(older.clone()).await;
        forward.merge(newer.clone()).await;

        let reverse = DeviceRegistry::new();
        reverse.merge(newer.clone()).await;
        reverse.merge(older.clone()).await;

        let id = DeviceId::from_device_id("dev-a");
        for registry in [forward, reverse] {
            let snap = registry.snapshot();
            let dev = snap.get(&id).unwrap();
            assert_eq!(dev.seq, 5);
            assert_eq!(dev.power, Some(PowerState::On));
        }
    }

    #[tokio::test]
    async fn test_duplicate_identities_collapse_to_one_entry() {
        let registry = DeviceRegistry::new();
        registry.merge(state("dev-a", 10, 1)).await;
        registry.merge(state("dev-a", 10, 2)).await;
        registry.merge(state("dev-a", 10, 3)).await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_delta_leaves_unset_fields_untouched() {
        let registry = DeviceRegistry::new();
        let mut full = state("dev-a", 10, 1);
        full.alias = Some("Heater".to_string());
        full.model = Some("HS103(US)".to_string());
        full.power = Some(PowerState::Off);
        registry.merge(full).await;

        // A set_power acknowledgment only carries the commanded field.
        let mut delta = state("dev-a", 10, 2);
        delta.power = Some(PowerState::On);
        registry.merge(delta).await;

        let snap = registry.snapshot();
        let dev = snap.get(&DeviceId::from_device_id("dev-a")).unwrap();
        assert_eq!(dev.alias.as_deref(), Some("Heater"));
        assert_eq!(dev.model.as_deref(), Some("HS103(US)"));
        assert_eq!(dev.power, Some(PowerState::On));
    }

    #[tokio::test]
    async fn test_ip_moves_with_stable_id() {
        let registry = DeviceRegistry::new();
        registry.merge(state("dev-a", 10, 1)).await;
        registry.merge(state("dev-a", 99, 2)).await;
        assert_eq!(registry.len().await, 1);
        let snap = registry.snapshot();
        let dev = snap.get(&DeviceId::from_device_id("dev-a")).unwrap();
        assert_eq!(
            dev.identity.addr,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99))
        );
    }

    #[tokio::test]
    async fn test_real_id_replaces_placeholder_at_same_addr() {
        let registry = DeviceRegistry::new();
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let mut anon = DeviceState::new(DeviceIdentity::new(DeviceId::placeholder(addr), addr));
        anon.seq = 1;
        registry.merge(anon).await;
        registry.merge(state("dev-a", 10, 2)).await;

        assert_eq!(registry.len().await, 1);
        let snap = registry.snapshot();
        assert!(snap.get(&DeviceId::from_device_id("dev-a")).is_some());
    }

    #[tokio::test]
    async fn test_placeholder_folds_into_real_entry() {
        let registry = DeviceRegistry::new();
        let mut full = state("dev-a", 10, 1);
        full.alias = Some("Lamp".to_string());
        registry.merge(full).await;

        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let mut anon = DeviceState::new(DeviceIdentity::new(DeviceId::placeholder(addr), addr));
        anon.seq = 2;
        registry.merge(anon).await;

        assert_eq!(registry.len().await, 1);
        let snap = registry.snapshot();
        let dev = snap.get(&DeviceId::from_device_id("dev-a")).unwrap();
        assert_eq!(dev.alias.as_deref(), Some("Lamp"));
        assert_eq!(dev.seq, 2);
    }

    #[tokio::test]
    async fn test_offline_after_threshold_and_back_online() {
        let registry = DeviceRegistry::new();
        registry.merge(state("dev-a", 10, 1)).await;
        let id = DeviceId::from_device_id("dev-a");

        registry.record_failure(&id, "connection timed out").await;
        registry.record_failure(&id, "connection timed out").await;
        assert!(registry.mark_stale(3).await.is_empty());

        registry.record_failure(&id, "connection timed out").await;
        let flipped = registry.mark_stale(3).await;
        assert_eq!(flipped, vec![id.clone()]);
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            DeviceStatus::Offline
        );

        // A later successful refresh brings the device back.
        registry.merge(state("dev-a", 10, 2)).await;
        let dev = registry.get(&id).await.unwrap();
        assert_eq!(dev.status, DeviceStatus::Online);
        assert!(dev.last_error.is_none());

        // Counter was reset, so one new miss does not flip it again.
        registry.record_failure(&id, "connection timed out").await;
        assert!(registry.mark_stale(3).await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable_once_taken() {
        let registry = DeviceRegistry::new();
        registry.merge(state("dev-a", 10, 1)).await;
        let before = registry.snapshot();
        registry.merge(state("dev-b", 11, 2)).await;
        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_alias_then_id() {
        let registry = DeviceRegistry::new();
        let mut b = state("dev-b", 11, 1);
        b.alias = Some("zebra".to_string());
        let mut a = state("dev-a", 10, 2);
        a.alias = Some("Attic".to_string());
        registry.merge(b).await;
        registry.merge(a).await;

        let snap = registry.snapshot();
        assert_eq!(snap.devices[0].alias.as_deref(), Some("Attic"));
        assert_eq!(snap.devices[1].alias.as_deref(), Some("zebra"));
    }

    #[tokio::test]
    async fn test_change_feed_sees_new_snapshot() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        registry.merge(state("dev-a", 10, 1)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }
}

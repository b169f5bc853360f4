//! Real-time telemetry fan-out. WebSocket subscribers register per
//! device; ingest broadcasts the persisted record to every subscriber.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;

use hubex_shared::ids::DeviceId;

const CONNECTION_BUFFER: usize = 64;

/// Shared state for all active telemetry WebSocket connections, keyed by
/// the device whose events they watch.
pub struct TelemetryHub {
    clients: DashMap<DeviceId, HashMap<uuid::Uuid, mpsc::Sender<String>>>,
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new subscriber. Returns the connection id and the
    /// receiver half for the connection's send loop.
    pub fn register(&self, device_id: DeviceId) -> (uuid::Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let conn_id = uuid::Uuid::new_v4();
        self.clients.entry(device_id).or_default().insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Remove a subscriber, dropping the device entry once it empties.
    pub fn remove(&self, device_id: DeviceId, conn_id: uuid::Uuid) {
        if let Some(mut entry) = self.clients.get_mut(&device_id) {
            entry.remove(&conn_id);
            if entry.is_empty() {
                drop(entry);
                self.clients.remove_if(&device_id, |_, conns| conns.is_empty());
            }
        }
    }

    /// Total subscriber count across all devices, for the global cap.
    pub fn connection_count(&self) -> usize {
        self.clients.iter().map(|entry| entry.len()).sum()
    }

    /// Broadcast a serialized record to every subscriber of the device.
    /// Best-effort: a subscriber that closed or stopped draining its
    /// buffer is deregistered; other subscribers are unaffected.
    pub fn broadcast(&self, device_id: DeviceId, payload: &serde_json::Value) {
        let serialized = payload.to_string();
        // Snapshot the senders so no map lock is held while sending.
        let targets: Vec<(uuid::Uuid, mpsc::Sender<String>)> = match self.clients.get(&device_id) {
            Some(entry) => entry.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return,
        };

        for (conn_id, tx) in targets {
            if tx.try_send(serialized.clone()).is_err() {
                self.remove(device_id, conn_id);
            }
        }
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_appears_in_connection_count() {
        let hub = TelemetryHub::new();
        let device = DeviceId::new();
        let (_id, _rx) = hub.register(device);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn remove_drops_empty_device_entry() {
        let hub = TelemetryHub::new();
        let device = DeviceId::new();
        let (conn_id, _rx) = hub.register(device);
        hub.remove(device, conn_id);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.clients.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers_of_device() {
        let hub = TelemetryHub::new();
        let device = DeviceId::new();
        let (_a, mut rx_a) = hub.register(device);
        let (_b, mut rx_b) = hub.register(device);

        hub.broadcast(device, &serde_json::json!({ "n": 1 }));

        assert_eq!(rx_a.recv().await.unwrap(), r#"{"n":1}"#);
        assert_eq!(rx_b.recv().await.unwrap(), r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_device() {
        let hub = TelemetryHub::new();
        let watched = DeviceId::new();
        let other = DeviceId::new();
        let (_a, mut rx) = hub.register(watched);

        hub.broadcast(other, &serde_json::json!({ "n": 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_is_deregistered_on_broadcast() {
        let hub = TelemetryHub::new();
        let device = DeviceId::new();
        let (_gone, rx_gone) = hub.register(device);
        let (_live, mut rx_live) = hub.register(device);
        drop(rx_gone);

        hub.broadcast(device, &serde_json::json!({ "n": 2 }));

        assert_eq!(hub.connection_count(), 1);
        assert!(rx_live.recv().await.is_some());
    }
}

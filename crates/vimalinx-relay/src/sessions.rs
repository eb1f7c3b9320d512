//! Device session hub: per-device outboxes and live SSE fan-out.
//!
//! Delivery is always outbox-backed. `send` assigns the next monotonic event
//! id for the device key, appends to a bounded ring (oldest entries beyond
//! [`OUTBOX_CAP`] are dropped), and pushes the entry to every attached
//! connection. `attach` replays everything newer than the caller's
//! `lastEventId` and then streams live entries; dropping the returned guard
//! deregisters the connection without touching the outbox.
//!
//! Within one device key event ids strictly increase and replay in order;
//! across device keys there is no ordering guarantee.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;
use vimalinx_relay_protocol::OutboundEvent;

/// Maximum retained outbox entries per device key; delivery is best-effort
/// beyond this horizon.
pub const OUTBOX_CAP: usize = 200;

struct DeviceOutbox {
    /// Next event id to assign; starts at 1 and never resets while the
    /// process is alive.
    next_event_id: u64,
    entries: VecDeque<OutboundEvent>,
}

impl DeviceOutbox {
    fn new() -> Self {
        Self {
            next_event_id: 1,
            entries: VecDeque::new(),
        }
    }
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

#[derive(Default)]
struct HubInner {
    outboxes: HashMap<String, DeviceOutbox>,
    connections: HashMap<String, Vec<Connection>>,
    next_conn_id: u64,
}

/// Shared hub; one per relay process.
#[derive(Default)]
pub struct SessionHub {
    inner: Mutex<HubInner>,
}

/// Deregisters its connection when dropped (socket close, stream teardown).
pub struct ConnectionGuard {
    hub: Arc<SessionHub>,
    device_key: String,
    conn_id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.detach(&self.device_key, self.conn_id);
    }
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload to the device outbox and fan it out to every live
    /// connection. The entry is retained for replay whether or not anyone is
    /// attached.
    pub fn send(&self, device_key: &str, payload: serde_json::Value) -> OutboundEvent {
        let mut inner = lock(&self.inner);
        let outbox = inner
            .outboxes
            .entry(device_key.to_string())
            .or_insert_with(DeviceOutbox::new);

        let event = OutboundEvent {
            event_id: outbox.next_event_id,
            payload,
        };
        outbox.next_event_id += 1;
        outbox.entries.push_back(event.clone());
        while outbox.entries.len() > OUTBOX_CAP {
            outbox.entries.pop_front();
        }

        if let Some(connections) = inner.connections.get_mut(device_key) {
            // Fan out to all attached connections, pruning any that are gone.
            connections.retain(|conn| conn.tx.send(event.clone()).is_ok());
        }
        event
    }

    /// Register a live connection. Returns the buffered entries newer than
    /// `last_event_id` (ascending), a receiver for live entries, and the
    /// guard that deregisters the connection on drop.
    pub fn attach(
        self: &Arc<Self>,
        device_key: &str,
        last_event_id: u64,
    ) -> (
        Vec<OutboundEvent>,
        mpsc::UnboundedReceiver<OutboundEvent>,
        ConnectionGuard,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);

        let replay: Vec<OutboundEvent> = inner
            .outboxes
            .get(device_key)
            .map(|outbox| {
                outbox
                    .entries
                    .iter()
                    .filter(|e| e.event_id > last_event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        inner.next_conn_id += 1;
        let conn_id = inner.next_conn_id;
        inner
            .connections
            .entry(device_key.to_string())
            .or_default()
            .push(Connection { id: conn_id, tx });

        debug!(device_key, conn_id, replayed = replay.len(), "attached session");

        let guard = ConnectionGuard {
            hub: Arc::clone(self),
            device_key: device_key.to_string(),
            conn_id,
        };
        (replay, rx, guard)
    }

    fn detach(&self, device_key: &str, conn_id: u64) {
        let mut inner = lock(&self.inner);
        if let Some(connections) = inner.connections.get_mut(device_key) {
            connections.retain(|c| c.id != conn_id);
            if connections.is_empty() {
                inner.connections.remove(device_key);
            }
        }
        debug!(device_key, conn_id, "detached session");
    }

    /// Highest event id assigned so far for a device key (0 if none).
    pub fn latest_event_id(&self, device_key: &str) -> u64 {
        let inner = lock(&self.inner);
        inner
            .outboxes
            .get(device_key)
            .map(|o| o.next_event_id - 1)
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_ids_strictly_increase_without_gaps() {
        let hub = SessionHub::new();
        for i in 1..=50u64 {
            let event = hub.send("ana:t1", json!({ "n": i }));
            assert_eq!(event.event_id, i);
        }
        // Independent sequence per device key.
        assert_eq!(hub.send("bob:t9", json!({})).event_id, 1);
    }

    #[tokio::test]
    async fn replay_returns_entries_after_cursor_in_order() {
        let hub = Arc::new(SessionHub::new());
        for i in 1..=10u64 {
            hub.send("ana:t1", json!({ "n": i }));
        }

        let (replay, _rx, _guard) = hub.attach("ana:t1", 7);
        let ids: Vec<u64> = replay.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![8, 9, 10]);

        // Cursor at or past the latest id replays nothing.
        let (replay, _rx, _guard) = hub.attach("ana:t1", 10);
        assert!(replay.is_empty());
        let (replay, _rx, _guard) = hub.attach("ana:t1", 99);
        assert!(replay.is_empty());

        // Default cursor 0 replays the full buffer.
        let (replay, _rx, _guard) = hub.attach("ana:t1", 0);
        assert_eq!(replay.len(), 10);
    }

    #[tokio::test]
    async fn outbox_ring_evicts_oldest_beyond_cap() {
        let hub = Arc::new(SessionHub::new());
        for i in 1..=(OUTBOX_CAP as u64 + 1) {
            hub.send("ana:t1", json!({ "n": i }));
        }

        let (replay, _rx, _guard) = hub.attach("ana:t1", 0);
        assert_eq!(replay.len(), OUTBOX_CAP);
        // Entry 1 was evicted by the 201st send; ids are untouched.
        assert_eq!(replay.first().map(|e| e.event_id), Some(2));
        assert_eq!(replay.last().map(|e| e.event_id), Some(OUTBOX_CAP as u64 + 1));
    }

    #[tokio::test]
    async fn live_entries_fan_out_to_all_connections() {
        let hub = Arc::new(SessionHub::new());
        let (_, mut rx1, _g1) = hub.attach("ana:t1", 0);
        let (_, mut rx2, _g2) = hub.attach("ana:t1", 0);

        hub.send("ana:t1", json!({ "text": "hi" }));

        assert_eq!(rx1.recv().await.unwrap().event_id, 1);
        assert_eq!(rx2.recv().await.unwrap().event_id, 1);
    }

    #[tokio::test]
    async fn dropping_the_guard_detaches_without_discarding_outbox() {
        let hub = Arc::new(SessionHub::new());
        let (_, mut rx, guard) = hub.attach("ana:t1", 0);
        drop(guard);

        hub.send("ana:t1", json!({ "text": "offline" }));
        assert!(rx.recv().await.is_none());

        // The entry still replays to the next attach.
        let (replay, _rx, _guard) = hub.attach("ana:t1", 0);
        assert_eq!(replay.len(), 1);
        assert_eq!(hub.latest_event_id("ana:t1"), 1);
    }
}

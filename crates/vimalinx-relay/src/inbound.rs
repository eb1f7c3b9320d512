//! Per-device inbound queue with long-poll waiters.
//!
//! Gateways retrieve inbound messages without busy-polling: `poll` drains the
//! pending list immediately when non-empty, otherwise parks on a single-slot
//! notification that `enqueue` fires. Exactly one outstanding poll per device
//! key is meaningful; a second concurrent poller displaces the first, which
//! resolves empty. This level-triggered single-waiter model is part of the
//! protocol's contract; do not widen it to multi-waiter fan-out.
//!
//! Cancellation is the caller dropping the poll future (connection close);
//! a wake sent to a cancelled waiter is harmless and the messages stay
//! pending for the next poll.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use vimalinx_relay_protocol::InboundMessage;

/// Longest wait a poll may request.
pub const MAX_WAIT_MS: u64 = 30_000;
/// Wait used when the poll does not specify one.
pub const DEFAULT_WAIT_MS: u64 = 20_000;

#[derive(Default)]
struct QueueSlot {
    pending: Vec<InboundMessage>,
    waiter: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct InboundQueue {
    slots: Mutex<HashMap<String, QueueSlot>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and wake the registered waiter, if any.
    pub fn enqueue(&self, device_key: &str, message: InboundMessage) {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(device_key.to_string()).or_default();
        slot.pending.push(message);
        if let Some(waiter) = slot.waiter.take() {
            // A send failure means the poller went away; the message stays
            // pending for the next poll.
            let _ = waiter.send(());
        }
        debug!(device_key, pending = slot.pending.len(), "enqueued inbound message");
    }

    /// Return pending messages, waiting up to `wait_ms` (clamped to
    /// [0, 30000], default 20000) for something to arrive. Returns an empty
    /// list on timeout or when displaced by a newer poll on the same key.
    pub async fn poll(&self, device_key: &str, wait_ms: Option<u64>) -> Vec<InboundMessage> {
        let wait = Duration::from_millis(wait_ms.unwrap_or(DEFAULT_WAIT_MS).min(MAX_WAIT_MS));

        let rx = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(device_key.to_string()).or_default();
            if !slot.pending.is_empty() {
                return std::mem::take(&mut slot.pending);
            }
            let (tx, rx) = oneshot::channel();
            // Replacing an existing waiter drops its sender, resolving the
            // displaced poll empty. Concurrent pollers on one device key race
            // by design.
            slot.waiter = Some(tx);
            rx
        };

        tokio::select! {
            _ = rx => {}
            _ = tokio::time::sleep(wait) => {}
        }

        let mut slots = lock(&self.slots);
        match slots.get_mut(device_key) {
            Some(slot) => std::mem::take(&mut slot.pending),
            None => Vec::new(),
        }
    }

    /// Number of messages currently pending for a device key.
    pub fn pending_len(&self, device_key: &str) -> usize {
        let slots = lock(&self.slots);
        slots.get(device_key).map(|s| s.pending.len()).unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================

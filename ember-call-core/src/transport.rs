//! Signaling transport abstraction
//!
//! The backend's message transport (connect/publish/subscribe over named
//! destinations, with its own wire format and reconnection policy) is an
//! external collaborator. This module defines the seam the core talks
//! through, plus an in-memory loopback implementation used by tests and
//! local development.

use crate::identity::UserId;
use crate::types::Signal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Reliable-enough publish/subscribe signaling transport.
///
/// Delivery is at-least-once and unordered across the transport's own
/// delivery paths; the router's dedup is what makes that safe. The core never
/// sees the wire encoding, only [`Signal`] records.
#[async_trait]
pub trait SignalTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the connection as the given identity.
    ///
    /// Returns `false` when the transport refused the connection without a
    /// hard error (e.g. it is still establishing credentials).
    ///
    /// # Errors
    ///
    /// Returns error when connecting fails outright.
    async fn connect(&self, identity: UserId) -> Result<bool, Self::Error>;

    /// Close the connection
    async fn disconnect(&self);

    /// Subscribe to a named destination.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription could not be registered.
    async fn subscribe(&self, destination: &str) -> Result<(), Self::Error>;

    /// Publish a signal to a named destination.
    ///
    /// # Errors
    ///
    /// Returns error if the transport could not accept the message.
    async fn publish(&self, destination: &str, signal: &Signal) -> Result<(), Self::Error>;

    /// Receive the next inbound signal.
    ///
    /// # Errors
    ///
    /// Returns error when the connection is gone; the reliability layer
    /// reacts by reconnecting.
    async fn recv(&self) -> Result<Signal, Self::Error>;

    /// Send one application-level heartbeat and wait for its round trip.
    ///
    /// # Errors
    ///
    /// Returns error when the heartbeat could not be exchanged.
    async fn heartbeat(&self) -> Result<(), Self::Error>;
}

/// Loopback transport errors
#[derive(Error, Debug)]
pub enum LoopbackError {
    /// Endpoint inbox closed
    #[error("transport channel closed")]
    Closed,
    /// Operation attempted while disconnected
    #[error("not connected")]
    NotConnected,
}

type SubscriberMap = HashMap<String, HashMap<u64, mpsc::UnboundedSender<Signal>>>;

/// Shared hub connecting [`LoopbackTransport`] endpoints; cheap to clone.
///
/// Tests flip [`LoopbackHub::set_duplicate_delivery`] to simulate the same
/// logical event arriving over two transport paths.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    subscribers: Mutex<SubscriberMap>,
    next_endpoint: AtomicU64,
    duplicate_delivery: AtomicBool,
}

impl LoopbackHub {
    /// Create a hub
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_endpoint: AtomicU64::new(0),
                duplicate_delivery: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver every published signal twice (redelivery simulation)
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Create a new endpoint attached to this hub
    #[must_use]
    pub fn endpoint(&self) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        LoopbackTransport {
            hub: self.clone(),
            endpoint_id: self.inner.next_endpoint.fetch_add(1, Ordering::SeqCst),
            inbox_tx: tx,
            inbox: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
            fail_heartbeats: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
        }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel-backed [`SignalTransport`] endpoint for tests and local runs
pub struct LoopbackTransport {
    hub: LoopbackHub,
    endpoint_id: u64,
    inbox_tx: mpsc::UnboundedSender<Signal>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
    connected: AtomicBool,
    fail_connects: AtomicU32,
    fail_heartbeats: AtomicBool,
    connect_attempts: AtomicU32,
}

impl LoopbackTransport {
    /// Refuse the next `n` connection attempts (backoff testing)
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts observed
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make heartbeats fail until cleared (watchdog testing)
    pub fn set_heartbeat_failing(&self, failing: bool) {
        self.fail_heartbeats.store(failing, Ordering::SeqCst);
    }

    /// Whether the endpoint currently considers itself connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalTransport for LoopbackTransport {
    type Error = LoopbackError;

    async fn connect(&self, identity: UserId) -> Result<bool, Self::Error> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Ok(false);
        }
        tracing::debug!(identity = %identity, "loopback transport connected");
        self.connected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn subscribe(&self, destination: &str) -> Result<(), Self::Error> {
        let mut subs = self.hub.inner.subscribers.lock();
        subs.entry(destination.to_string())
            .or_default()
            .insert(self.endpoint_id, self.inbox_tx.clone());
        Ok(())
    }

    async fn publish(&self, destination: &str, signal: &Signal) -> Result<(), Self::Error> {
        let copies = if self.hub.inner.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let targets: Vec<mpsc::UnboundedSender<Signal>> = {
            let subs = self.hub.inner.subscribers.lock();
            subs.get(destination)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        for tx in targets {
            for _ in 0..copies {
                let _ = tx.send(signal.clone());
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Signal, Self::Error> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(LoopbackError::Closed)
    }

    async fn heartbeat(&self) -> Result<(), Self::Error> {
        if !self.connected.load(Ordering::SeqCst) || self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(LoopbackError::NotConnected);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{EndReason, RoomId};

    fn hangup(room: &str) -> Signal {
        Signal::hangup(RoomId::new(room), UserId::new(1), EndReason::LocalHangup)
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_endpoint() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();

        b.subscribe(&UserId::new(2).signal_destination())
            .await
            .unwrap();
        a.publish(&UserId::new(2).signal_destination(), &hangup("r1"))
            .await
            .unwrap();

        let got = b.recv().await.unwrap();
        assert_eq!(got.room, RoomId::new("r1"));
    }

    #[tokio::test]
    async fn duplicate_delivery_sends_twice() {
        let hub = LoopbackHub::new();
        hub.set_duplicate_delivery(true);
        let a = hub.endpoint();
        let b = hub.endpoint();

        b.subscribe("dest").await.unwrap();
        a.publish("dest", &hangup("r1")).await.unwrap();

        assert!(b.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn resubscribe_does_not_duplicate_delivery() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();

        b.subscribe("dest").await.unwrap();
        b.subscribe("dest").await.unwrap();
        a.publish("dest", &hangup("r1")).await.unwrap();

        assert!(b.recv().await.is_ok());
        let empty = tokio::time::timeout(std::time::Duration::from_millis(20), b.recv()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn connect_refusal_counts_down() {
        let hub = LoopbackHub::new();
        let t = hub.endpoint();
        t.fail_next_connects(1);
        assert!(!t.connect(UserId::new(1)).await.unwrap());
        assert!(t.connect(UserId::new(1)).await.unwrap());
    }
}

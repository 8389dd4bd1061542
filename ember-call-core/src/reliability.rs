//! Signaling link reliability
//!
//! Wraps the raw [`SignalTransport`] connection with exponential-backoff
//! reconnection, an application-level heartbeat, and a watchdog that forces
//! a reconnect when the link goes silent instead of waiting for the
//! transport to notice a half-open connection by itself.
//!
//! Link-state notifications are debounced for every non-connected state so
//! rapid retry storms do not flicker the UI; a transition into
//! [`LinkState::Connected`] is always delivered immediately.

use crate::identity::UserId;
use crate::router::SignalRouter;
use crate::transport::SignalTransport;
use crate::types::Signal;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};

/// Observable state of the signaling link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Attempting to (re)connect
    Connecting,
    /// Link is up
    Connected,
    /// Link is down, reconnect scheduled
    Disconnected,
}

/// Reliability layer tuning knobs
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// First reconnect delay; doubles per failed attempt
    pub backoff_base: Duration,
    /// Reconnect delay ceiling
    pub backoff_max: Duration,
    /// Interval between heartbeats while connected
    pub heartbeat_interval: Duration,
    /// How long one heartbeat round trip may take
    pub heartbeat_deadline: Duration,
    /// Silence threshold after which the watchdog forces a reconnect
    pub watchdog_timeout: Duration,
    /// How often the watchdog checks
    pub watchdog_poll: Duration,
    /// Debounce window for non-connected state notifications
    pub state_debounce: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_deadline: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(30),
            watchdog_poll: Duration::from_secs(5),
            state_debounce: Duration::from_millis(1500),
        }
    }
}

/// Reliability layer errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Link is currently down
    #[error("signaling link is not connected")]
    NotConnected,
    /// Transport rejected the publish
    #[error("failed to send signal: {0}")]
    SendFailed(String),
}

/// Keeps one signaling connection alive and feeds inbound signals into the
/// router.
pub struct ReliableLink<T: SignalTransport> {
    transport: Arc<T>,
    identity: UserId,
    cfg: ReliabilityConfig,
    states: broadcast::Sender<LinkState>,
    connected: AtomicBool,
    last_traffic: Mutex<Instant>,
    state_epoch: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
}

impl<T: SignalTransport> ReliableLink<T> {
    /// Create a link over the given transport
    #[must_use]
    pub fn new(transport: Arc<T>, identity: UserId, cfg: ReliabilityConfig) -> Self {
        let (states, _) = broadcast::channel(32);
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            identity,
            cfg,
            states,
            connected: AtomicBool::new(false),
            last_traffic: Mutex::new(Instant::now()),
            state_epoch: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Subscribe to link-state notifications
    #[must_use]
    pub fn states(&self) -> broadcast::Receiver<LinkState> {
        self.states.subscribe()
    }

    /// Whether the link is currently up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publish a signal to the given user's destination.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] while the link is down and
    /// [`LinkError::SendFailed`] when the transport rejects the message.
    pub async fn send_signal(&self, to: UserId, signal: &Signal) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.transport
            .publish(&to.signal_destination(), signal)
            .await
            .map_err(|e| LinkError::SendFailed(e.to_string()))
    }

    /// Spawn the connection supervisor; inbound signals flow into `router`.
    pub fn start(self: Arc<Self>, router: Arc<SignalRouter>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(router).await })
    }

    /// Signal shutdown and close the transport
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.transport.disconnect().await;
    }

    async fn run(self: Arc<Self>, router: Arc<SignalRouter>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut delay = self.cfg.backoff_base;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.publish_debounced(LinkState::Connecting);
            match self.transport.connect(self.identity).await {
                Ok(true) => {
                    if let Err(e) = self
                        .transport
                        .subscribe(&self.identity.signal_destination())
                        .await
                    {
                        tracing::warn!(error = %e, "subscribe failed after connect");
                    } else {
                        tracing::info!(identity = %self.identity, "signaling link up");
                        delay = self.cfg.backoff_base;
                        self.connected.store(true, Ordering::SeqCst);
                        *self.last_traffic.lock() = Instant::now();
                        self.publish_immediate(LinkState::Connected);

                        self.connected_loop(&router, &mut shutdown).await;

                        self.connected.store(false, Ordering::SeqCst);
                        if *shutdown.borrow() {
                            break;
                        }
                        tracing::warn!("signaling link lost, reconnecting");
                        self.publish_debounced(LinkState::Disconnected);
                        continue;
                    }
                }
                Ok(false) => {
                    tracing::debug!("transport refused connection");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connect failed");
                }
            }
            self.publish_debounced(LinkState::Disconnected);
            let wait = Self::jittered(delay);
            tokio::select! {
                () = sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
            delay = (delay * 2).min(self.cfg.backoff_max);
        }
        tracing::debug!("link supervisor stopped");
    }

    async fn connected_loop(
        &self,
        router: &Arc<SignalRouter>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = tokio::time::interval(self.cfg.watchdog_poll);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                inbound = self.transport.recv() => match inbound {
                    Ok(signal) => {
                        *self.last_traffic.lock() = Instant::now();
                        router.deliver(signal);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed");
                        return;
                    }
                },
                _ = heartbeat.tick() => {
                    match timeout(self.cfg.heartbeat_deadline, self.transport.heartbeat()).await {
                        Ok(Ok(())) => {
                            *self.last_traffic.lock() = Instant::now();
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "heartbeat failed");
                        }
                        Err(_) => {
                            tracing::warn!("heartbeat timed out");
                        }
                    }
                }
                _ = watchdog.tick() => {
                    let silent_for = self.last_traffic.lock().elapsed();
                    if silent_for > self.cfg.watchdog_timeout {
                        tracing::warn!(
                            silent_ms = silent_for.as_millis(),
                            "link silent past watchdog threshold, forcing reconnect"
                        );
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn publish_immediate(&self, state: LinkState) {
        self.state_epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.states.send(state);
    }

    fn publish_debounced(&self, state: LinkState) {
        let epoch = self.state_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let epochs = Arc::clone(&self.state_epoch);
        let states = self.states.clone();
        let debounce = self.cfg.state_debounce;
        tokio::spawn(async move {
            sleep(debounce).await;
            if epochs.load(Ordering::SeqCst) == epoch {
                let _ = states.send(state);
            }
        });
    }

    fn jittered(delay: Duration) -> Duration {
        let base = delay.as_millis() as u64;
        let spread = (base / 2).max(1);
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
    }
}

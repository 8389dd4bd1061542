//! Signal routing, deduplication and pending delivery
//!
//! The transport is at-least-once and unordered: the same logical event can
//! arrive twice (direct and broadcast paths) and a hangup can overtake the
//! offer it cancels. [`SignalRouter`] is the single place that absorbs both:
//! every inbound signal is validated, checked against bounded TTL ledgers,
//! filtered against the active session, and only then handed to whichever
//! consumer is registered, or parked in a bounded, time-expiring mailbox
//! when none is (the offer that arrives before the user taps Accept).

use crate::identity::UserId;
use crate::types::{EndReason, RoomId, SessionId, Signal, SignalKind, SignalShapeError};
use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Router tuning knobs
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Max signals parked for a not-yet-registered consumer
    pub pending_capacity: usize,
    /// How long a parked signal stays deliverable
    pub pending_ttl: Duration,
    /// Capacity of the recently-seen-signal ledger
    pub signal_ledger_capacity: u64,
    /// Window of the recently-seen-signal ledger
    pub signal_ledger_ttl: Duration,
    /// Capacity of the candidate-signature ledger
    pub candidate_ledger_capacity: u64,
    /// Window of the candidate-signature ledger
    pub candidate_ledger_ttl: Duration,
    /// Capacity of the sent-hangup ledger
    pub hangup_ledger_capacity: u64,
    /// Window of the sent-hangup ledger
    pub hangup_ledger_ttl: Duration,
    /// Window during which an offer for a cancelled room is discarded
    pub cancelled_room_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 32,
            pending_ttl: Duration::from_secs(30),
            signal_ledger_capacity: 512,
            signal_ledger_ttl: Duration::from_secs(60),
            candidate_ledger_capacity: 512,
            candidate_ledger_ttl: Duration::from_secs(60),
            hangup_ledger_capacity: 64,
            hangup_ledger_ttl: Duration::from_secs(30),
            cancelled_room_ttl: Duration::from_secs(30),
        }
    }
}

/// Control-plane classifications the session machine observes.
///
/// These fire during [`SignalRouter::deliver`] even when no data-plane
/// consumer is registered, so an idle process can start ringing and an
/// active one can react to a remote hangup.
#[derive(Debug, Clone)]
pub enum RouterNotice {
    /// A validated, non-duplicate offer arrived
    OfferArrived {
        /// Target room
        room: RoomId,
        /// Caller account id
        sender: UserId,
        /// Caller display name if the offer carried one
        sender_name: Option<String>,
        /// Session id assigned by the backend, if present on the offer
        session_id: Option<SessionId>,
        /// Whether the offered description negotiates video
        has_video: bool,
    },
    /// A hangup arrived (includes busy/decline rejections)
    HangupArrived {
        /// Target room
        room: RoomId,
        /// Sender account id
        sender: UserId,
        /// Reason carried by the hangup, if any
        reason: Option<EndReason>,
    },
    /// A remote error signal arrived
    ErrorArrived {
        /// Target room
        room: RoomId,
        /// Sender account id
        sender: UserId,
    },
}

/// Why a signal was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropCause {
    /// Structural validation failed
    Invalid(SignalShapeError),
    /// Already seen within the dedup window
    Duplicate,
    /// Carries a session id other than the active one
    StaleSession,
    /// Offer for a room whose hangup already arrived
    CancelledRoom,
}

/// Result of one [`SignalRouter::deliver`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the registered consumer (or consumed as control plane)
    Delivered,
    /// Parked in the pending mailbox
    Queued,
    /// Discarded; protocol errors are diagnostics only, never user-facing
    Dropped(DropCause),
}

struct PendingSignal {
    parked_at: Instant,
    signal: Signal,
}

struct ConsumerSlot {
    tag: Option<String>,
    room: Option<RoomId>,
    tx: Option<mpsc::UnboundedSender<Signal>>,
    pending: VecDeque<PendingSignal>,
}

/// Routes inbound signals to the active consumer with dedup and buffering.
///
/// One instance per connected user session; constructed explicitly and
/// injected into the call service.
pub struct SignalRouter {
    cfg: RouterConfig,
    seen_signals: Cache<String, ()>,
    seen_candidates: Cache<String, ()>,
    sent_hangups: Cache<String, ()>,
    cancelled_rooms: Cache<String, ()>,
    slot: Mutex<ConsumerSlot>,
    active_room: Mutex<Option<RoomId>>,
    active_session: Mutex<Option<SessionId>>,
    notices: broadcast::Sender<RouterNotice>,
}

impl SignalRouter {
    /// Create a router with the given configuration
    #[must_use]
    pub fn new(cfg: RouterConfig) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            seen_signals: Cache::builder()
                .max_capacity(cfg.signal_ledger_capacity)
                .time_to_live(cfg.signal_ledger_ttl)
                .build(),
            seen_candidates: Cache::builder()
                .max_capacity(cfg.candidate_ledger_capacity)
                .time_to_live(cfg.candidate_ledger_ttl)
                .build(),
            sent_hangups: Cache::builder()
                .max_capacity(cfg.hangup_ledger_capacity)
                .time_to_live(cfg.hangup_ledger_ttl)
                .build(),
            cancelled_rooms: Cache::builder()
                .max_capacity(cfg.hangup_ledger_capacity)
                .time_to_live(cfg.cancelled_room_ttl)
                .build(),
            slot: Mutex::new(ConsumerSlot {
                tag: None,
                room: None,
                tx: None,
                pending: VecDeque::new(),
            }),
            active_room: Mutex::new(None),
            active_session: Mutex::new(None),
            notices,
            cfg,
        }
    }

    /// Subscribe to control-plane notices
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<RouterNotice> {
        self.notices.subscribe()
    }

    /// Record which room currently occupies the call slot
    pub fn set_active_room(&self, room: Option<RoomId>) {
        *self.active_room.lock() = room;
    }

    /// Record the admitted session id used to reject stale signals
    pub fn set_active_session(&self, session: Option<SessionId>) {
        *self.active_session.lock() = session;
    }

    /// Record an outbound hangup for `room`.
    ///
    /// Returns `true` the first time within the ledger window; callers skip
    /// the send when this returns `false`, which is what bounds racing
    /// teardown paths to a single hangup on the wire.
    pub fn note_hangup_sent(&self, room: &RoomId) -> bool {
        let key = room.as_str().to_string();
        if self.sent_hangups.contains_key(&key) {
            return false;
        }
        self.sent_hangups.insert(key, ());
        true
    }

    /// Classify and route one inbound signal.
    #[tracing::instrument(
        skip(self, signal),
        fields(kind = signal.kind.as_str(), room = %signal.room, sender = %signal.sender)
    )]
    pub fn deliver(&self, signal: Signal) -> DeliveryOutcome {
        if let Err(shape) = signal.validate() {
            tracing::debug!(error = %shape, "dropping malformed signal");
            return DeliveryOutcome::Dropped(DropCause::Invalid(shape));
        }

        if self.is_duplicate(&signal) {
            tracing::trace!("dropping duplicate signal");
            return DeliveryOutcome::Dropped(DropCause::Duplicate);
        }

        if signal.kind != SignalKind::Offer {
            if let (Some(active), Some(sid)) =
                (*self.active_session.lock(), signal.session_id)
            {
                if active != sid {
                    tracing::debug!(stale = %sid, active = %active, "dropping stale-session signal");
                    return DeliveryOutcome::Dropped(DropCause::StaleSession);
                }
            }
        }

        match signal.kind {
            SignalKind::Hangup => {
                let active = self.active_room.lock().clone();
                if active.as_ref() != Some(&signal.room) {
                    // Caller cancelled before their offer got here; remember
                    // the room so the late offer is discarded on arrival.
                    self.cancelled_rooms
                        .insert(signal.room.as_str().to_string(), ());
                    tracing::debug!("hangup for inactive room, marked cancelled");
                }
                let _ = self.notices.send(RouterNotice::HangupArrived {
                    room: signal.room.clone(),
                    sender: signal.sender,
                    reason: signal.reason,
                });
                DeliveryOutcome::Delivered
            }
            SignalKind::Error => {
                let _ = self.notices.send(RouterNotice::ErrorArrived {
                    room: signal.room.clone(),
                    sender: signal.sender,
                });
                DeliveryOutcome::Delivered
            }
            SignalKind::Offer => {
                if self.cancelled_rooms.contains_key(signal.room.as_str()) {
                    tracing::debug!("dropping offer for cancelled room");
                    return DeliveryOutcome::Dropped(DropCause::CancelledRoom);
                }
                let has_video = signal.description().is_some_and(|d| d.has_video());
                let _ = self.notices.send(RouterNotice::OfferArrived {
                    room: signal.room.clone(),
                    sender: signal.sender,
                    sender_name: signal.sender_name.clone(),
                    session_id: signal.session_id,
                    has_video,
                });
                self.hand_to_consumer(signal)
            }
            SignalKind::Answer | SignalKind::IceCandidate => self.hand_to_consumer(signal),
        }
    }

    /// Register the data-plane consumer for one room's negotiation signals.
    ///
    /// Re-registering under the same tag replaces the previous channel
    /// (idempotent re-subscription, no duplicate delivery). Any parked
    /// signals for the consumer's room still within their TTL are flushed in
    /// arrival order, then the mailbox is cleared.
    pub fn register_consumer(
        &self,
        tag: impl Into<String>,
        room: RoomId,
        tx: mpsc::UnboundedSender<Signal>,
    ) {
        let tag = tag.into();
        let mut slot = self.slot.lock();
        Self::prune_pending(&mut slot.pending, self.cfg.pending_ttl);
        let mut flushed = 0usize;
        for parked in slot.pending.drain(..) {
            if parked.signal.room == room {
                let _ = tx.send(parked.signal);
                flushed += 1;
            }
        }
        slot.tag = Some(tag);
        slot.room = Some(room);
        slot.tx = Some(tx);
        if flushed > 0 {
            tracing::debug!(flushed, "flushed pending signals to new consumer");
        }
    }

    /// Remove the consumer; buffering resumes until a new one registers
    pub fn unregister_consumer(&self) {
        let mut slot = self.slot.lock();
        slot.tag = None;
        slot.room = None;
        slot.tx = None;
    }

    fn is_duplicate(&self, signal: &Signal) -> bool {
        let key = signal.dedup_key();
        let ledger = if signal.kind == SignalKind::IceCandidate {
            &self.seen_candidates
        } else {
            &self.seen_signals
        };
        if ledger.contains_key(&key) {
            return true;
        }
        ledger.insert(key, ());
        false
    }

    fn hand_to_consumer(&self, signal: Signal) -> DeliveryOutcome {
        let mut slot = self.slot.lock();
        if slot.room.as_ref() == Some(&signal.room) {
            if let Some(tx) = &slot.tx {
                if tx.send(signal.clone()).is_ok() {
                    return DeliveryOutcome::Delivered;
                }
                // Receiver side is gone; fall back to parking.
                slot.tx = None;
                slot.tag = None;
                slot.room = None;
            }
        }
        Self::prune_pending(&mut slot.pending, self.cfg.pending_ttl);
        if slot.pending.len() >= self.cfg.pending_capacity {
            slot.pending.pop_front();
            tracing::warn!("pending mailbox full, evicted oldest signal");
        }
        slot.pending.push_back(PendingSignal {
            parked_at: Instant::now(),
            signal,
        });
        DeliveryOutcome::Queued
    }

    fn prune_pending(pending: &mut VecDeque<PendingSignal>, ttl: Duration) {
        let now = Instant::now();
        while pending
            .front()
            .is_some_and(|p| now.duration_since(p.parked_at) > ttl)
        {
            pending.pop_front();
        }
    }
}

//! Offer/answer negotiation coordination
//!
//! Drives the underlying media transport's handshake to a connected state
//! and recovers it after network loss. The media library itself (capture,
//! encode, transmit) sits behind [`PeerSession`]; this module owns the
//! protocol-level state: which side of the offer/answer exchange we are on,
//! candidates that arrived too early, simultaneous-offer collisions, and the
//! capped, mutually-exclusive restart machinery.

use crate::identity::{Peer, UserId};
use crate::media::LocalStream;
use crate::types::{
    CallKind, IceCandidate, RoomId, SessionDescription, SessionId, Signal, SignalKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Errors surfaced by the underlying media transport
#[derive(Error, Debug)]
pub enum PeerSessionError {
    /// Offer/answer creation failed
    #[error("failed to create description: {0}")]
    CreateFailed(String),
    /// Local or remote description was rejected
    #[error("description rejected: {0}")]
    DescriptionRejected(String),
    /// Candidate could not be applied
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),
    /// Track replacement failed (camera switch)
    #[error("track replacement failed: {0}")]
    TrackReplaceFailed(String),
    /// Session already closed
    #[error("session is closed")]
    Closed,
}

/// Connectivity state reported by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Not yet negotiating
    New,
    /// Candidate pairs being checked
    Checking,
    /// A working path is established
    Connected,
    /// All checks finished with a working path
    Completed,
    /// The working path stopped; may recover
    Disconnected,
    /// No path could be (re)established
    Failed,
    /// Session torn down
    Closed,
}

impl ConnectivityState {
    /// Whether media can flow in this state
    #[must_use]
    pub const fn is_up(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Events emitted by a [`PeerSession`]
#[derive(Debug, Clone)]
pub enum PeerSessionEvent {
    /// Connectivity state changed
    Connectivity(ConnectivityState),
    /// The transport gathered a local reachability candidate
    LocalCandidate(IceCandidate),
    /// Remote media arrived or changed
    RemoteTrack {
        /// Whether the remote stream carries video
        has_video: bool,
    },
}

/// One peer-to-peer media session of the external real-time media library.
///
/// The core drives the handshake through this seam and never touches the
/// library's own types.
#[async_trait]
pub trait PeerSession: Send + Sync + 'static {
    /// Create an offer description; `ice_restart` re-keys connectivity on an
    /// established session.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot produce a description.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerSessionError>;

    /// Create an answer to the currently applied remote offer.
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is applied or creation fails.
    async fn create_answer(&self) -> Result<SessionDescription, PeerSessionError>;

    /// Apply a locally created description.
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected.
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerSessionError>;

    /// Apply the remote peer's description.
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected.
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerSessionError>;

    /// Feed one remote connectivity candidate.
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected.
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerSessionError>;

    /// Attach the local capture stream's tracks.
    ///
    /// # Errors
    ///
    /// Returns error if tracks cannot be attached.
    async fn attach_local(&self, stream: &LocalStream) -> Result<(), PeerSessionError>;

    /// Replace the outgoing video track (camera switch).
    ///
    /// # Errors
    ///
    /// Returns error if the replacement fails; the previous track must then
    /// still be active.
    async fn replace_video_track(&self, track_id: &str) -> Result<(), PeerSessionError>;

    /// Tear the session down; idempotent.
    async fn close(&self);

    /// Current connectivity state
    fn connectivity(&self) -> ConnectivityState;

    /// Subscribe to session events
    fn events(&self) -> broadcast::Receiver<PeerSessionEvent>;
}

/// Creates [`PeerSession`]s; injected so tests supply scripted sessions
#[async_trait]
pub trait PeerSessionFactory: Send + Sync + 'static {
    /// Session type produced by this factory
    type Session: PeerSession;

    /// Create a session prepared for the given call kind.
    ///
    /// # Errors
    ///
    /// Returns error if the media library cannot create a session.
    async fn create(&self, kind: CallKind) -> Result<Arc<Self::Session>, PeerSessionError>;
}

/// Handshake position, mirroring the media transport's signaling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Nothing exchanged yet
    New,
    /// Our offer is out, unanswered
    HaveLocalOffer,
    /// A remote offer is applied, answer pending
    HaveRemoteOffer,
    /// Offer/answer complete
    Stable,
    /// Coordinator closed
    Closed,
}

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// Media transport failure
    #[error(transparent)]
    Session(#[from] PeerSessionError),
    /// Signal cannot be used in the current handshake position
    #[error("unusable signal: {0}")]
    UnusableSignal(&'static str),
    /// Coordinator already closed
    #[error("negotiation is closed")]
    Closed,
}

/// How an incoming offer was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Remote description applied and an answer sent
    Answered,
    /// Collision: our own offer wins the tie-break, incoming offer ignored
    IgnoredGlare,
}

/// Result of a restart request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A restart offer was created and sent
    Started,
    /// A restart is already underway; request ignored
    AlreadyInProgress,
    /// The attempt cap is spent; the call must be failed
    AttemptsExhausted,
}

/// Events re-emitted for the call session state machine
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Connectivity state changed
    Connectivity(ConnectivityState),
    /// The remote answer was applied; the remote party accepted
    AnswerApplied,
    /// Remote media arrived or changed
    RemoteTrack {
        /// Whether the remote stream carries video
        has_video: bool,
    },
}

/// Negotiation tuning knobs
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Restart attempts before the call is declared failed
    pub max_restart_attempts: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
        }
    }
}

/// Owns the handshake for one call attempt.
pub struct NegotiationCoordinator<S: PeerSession> {
    session: Arc<S>,
    room: RoomId,
    local: Peer,
    remote: Mutex<Option<UserId>>,
    call_session: Mutex<Option<SessionId>>,
    phase: Mutex<NegotiationPhase>,
    remote_description_set: AtomicBool,
    held_candidates: Mutex<Vec<IceCandidate>>,
    applied_signatures: Mutex<HashSet<String>>,
    restart_gate: Arc<tokio::sync::Mutex<()>>,
    restart_hold: Mutex<Option<tokio::sync::OwnedMutexGuard<()>>>,
    restart_attempts: AtomicU32,
    cfg: NegotiationConfig,
    outbound: mpsc::UnboundedSender<Signal>,
    events: broadcast::Sender<NegotiationEvent>,
}

impl<S: PeerSession> NegotiationCoordinator<S> {
    /// Create a coordinator for one call attempt.
    ///
    /// `remote` may be unknown when an incoming call is accepted before its
    /// offer arrived; it is learned from the offer itself.
    #[must_use]
    pub fn new(
        session: Arc<S>,
        room: RoomId,
        local: Peer,
        remote: Option<UserId>,
        cfg: NegotiationConfig,
        outbound: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            session,
            room,
            local,
            remote: Mutex::new(remote),
            call_session: Mutex::new(None),
            phase: Mutex::new(NegotiationPhase::New),
            remote_description_set: AtomicBool::new(false),
            held_candidates: Mutex::new(Vec::new()),
            applied_signatures: Mutex::new(HashSet::new()),
            restart_gate: Arc::new(tokio::sync::Mutex::new(())),
            restart_hold: Mutex::new(None),
            restart_attempts: AtomicU32::new(0),
            cfg,
            outbound,
            events,
        }
    }

    /// Subscribe to coordinator events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.events.subscribe()
    }

    /// The underlying media session (camera switches need it)
    #[must_use]
    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Remote party, once known
    #[must_use]
    pub fn remote(&self) -> Option<UserId> {
        *self.remote.lock()
    }

    /// Record the backend session id; outbound signals carry it from here on
    pub fn set_call_session(&self, id: SessionId) {
        *self.call_session.lock() = Some(id);
    }

    /// Current handshake position
    #[must_use]
    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.lock()
    }

    /// Restart attempts consumed so far
    #[must_use]
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    /// Create and send the initial offer (caller side).
    ///
    /// # Errors
    ///
    /// Returns error if the media transport rejects offer creation.
    #[tracing::instrument(skip(self), fields(room = %self.room))]
    pub async fn start_as_caller(&self) -> Result<(), NegotiationError> {
        if self.phase() == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        let description = self.session.create_offer(false).await?;
        self.session.set_local_description(&description).await?;
        *self.phase.lock() = NegotiationPhase::HaveLocalOffer;
        self.send_signal(Signal::offer(
            self.room.clone(),
            &self.local,
            *self.call_session.lock(),
            description,
        ));
        tracing::debug!("offer sent");
        Ok(())
    }

    /// Route one classified signal into the handshake.
    ///
    /// Hangup and error signals are control plane and handled by the session
    /// machine; they are ignored here.
    ///
    /// # Errors
    ///
    /// Returns error if the media transport rejects a description.
    pub async fn handle_signal(&self, signal: &Signal) -> Result<(), NegotiationError> {
        match signal.kind {
            SignalKind::Offer => self.handle_offer(signal).await.map(|_| ()),
            SignalKind::Answer => self.handle_answer(signal).await,
            SignalKind::IceCandidate => self.handle_candidate(signal).await,
            SignalKind::Hangup | SignalKind::Error => Ok(()),
        }
    }

    /// Apply an incoming offer, resolving simultaneous-offer collisions.
    ///
    /// On collision the peer with the numerically lower identity keeps its
    /// own offer; the other peer accepts the incoming one.
    ///
    /// # Errors
    ///
    /// Returns error if the media transport rejects the descriptions.
    #[tracing::instrument(skip(self, signal), fields(room = %self.room, sender = %signal.sender))]
    pub async fn handle_offer(&self, signal: &Signal) -> Result<OfferDisposition, NegotiationError> {
        let description = signal
            .description()
            .ok_or(NegotiationError::UnusableSignal("offer without description"))?;
        if self.phase() == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }

        {
            let mut remote = self.remote.lock();
            if remote.is_none() {
                *remote = Some(signal.sender);
            }
        }
        if let Some(sid) = signal.session_id {
            let mut call_session = self.call_session.lock();
            if call_session.is_none() {
                *call_session = Some(sid);
            }
        }

        if self.phase() == NegotiationPhase::HaveLocalOffer && !description.ice_restart {
            if self.offer_wins_glare(signal.sender) {
                tracing::info!("offer collision, local offer wins tie-break");
                return Ok(OfferDisposition::IgnoredGlare);
            }
            tracing::info!("offer collision, yielding to remote offer");
        }

        self.session.set_remote_description(description).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        *self.phase.lock() = NegotiationPhase::HaveRemoteOffer;
        self.drain_held_candidates().await;

        let answer = self.session.create_answer().await?;
        self.session.set_local_description(&answer).await?;
        *self.phase.lock() = NegotiationPhase::Stable;
        self.send_signal(Signal::answer(
            self.room.clone(),
            self.local.id,
            *self.call_session.lock(),
            answer,
        ));
        self.finish_restart();
        tracing::debug!("answer sent");
        Ok(OfferDisposition::Answered)
    }

    /// Apply an incoming answer.
    ///
    /// Answers arriving outside `HaveLocalOffer` are stale redeliveries and
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the media transport rejects the description.
    #[tracing::instrument(skip(self, signal), fields(room = %self.room))]
    pub async fn handle_answer(&self, signal: &Signal) -> Result<(), NegotiationError> {
        let description = signal
            .description()
            .ok_or(NegotiationError::UnusableSignal("answer without description"))?;
        if self.phase() != NegotiationPhase::HaveLocalOffer {
            tracing::debug!(phase = ?self.phase(), "ignoring answer outside HaveLocalOffer");
            return Ok(());
        }
        self.session.set_remote_description(description).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        *self.phase.lock() = NegotiationPhase::Stable;
        self.drain_held_candidates().await;
        self.finish_restart();
        let _ = self.events.send(NegotiationEvent::AnswerApplied);
        tracing::debug!("answer applied");
        Ok(())
    }

    /// Feed one incoming candidate, buffering it when it outran the remote
    /// description.
    ///
    /// # Errors
    ///
    /// Returns error only for signals without a candidate payload; transport
    /// rejections of individual candidates are logged and absorbed.
    pub async fn handle_candidate(&self, signal: &Signal) -> Result<(), NegotiationError> {
        let candidate = signal
            .ice_candidate()
            .ok_or(NegotiationError::UnusableSignal("candidate without payload"))?;

        if candidate.is_end_of_gathering() {
            tracing::trace!("discarding end-of-gathering marker");
            return Ok(());
        }
        if matches!(
            self.session.connectivity(),
            ConnectivityState::Closed | ConnectivityState::Failed
        ) {
            tracing::trace!("discarding candidate on closed/failed session");
            return Ok(());
        }
        if !self.applied_signatures.lock().insert(candidate.signature()) {
            tracing::trace!("discarding duplicate candidate");
            return Ok(());
        }

        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.held_candidates.lock().push(candidate.clone());
            tracing::trace!("buffered early candidate");
            return Ok(());
        }
        if let Err(e) = self.session.add_remote_candidate(candidate).await {
            tracing::warn!(error = %e, "candidate rejected by media transport");
        }
        Ok(())
    }

    /// Request a negotiation restart.
    ///
    /// Mutually exclusive: while one restart is underway every further
    /// request reports [`RestartOutcome::AlreadyInProgress`]. Attempts are
    /// capped; the counter resets once connectivity is re-established.
    ///
    /// # Errors
    ///
    /// Returns error if the media transport rejects the restart offer.
    #[tracing::instrument(skip(self), fields(room = %self.room))]
    pub async fn restart(&self) -> Result<RestartOutcome, NegotiationError> {
        if self.phase() == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        let Ok(guard) = self.restart_gate.clone().try_lock_owned() else {
            tracing::debug!("restart already in progress");
            return Ok(RestartOutcome::AlreadyInProgress);
        };
        let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.cfg.max_restart_attempts {
            tracing::warn!(attempt, "restart attempts exhausted");
            return Ok(RestartOutcome::AttemptsExhausted);
        }
        tracing::info!(attempt, "starting negotiation restart");

        let mut description = self.session.create_offer(true).await?;
        description.ice_restart = true;
        self.session.set_local_description(&description).await?;
        *self.phase.lock() = NegotiationPhase::HaveLocalOffer;
        *self.restart_hold.lock() = Some(guard);
        self.send_signal(Signal::offer(
            self.room.clone(),
            &self.local,
            *self.call_session.lock(),
            description,
        ));
        Ok(RestartOutcome::Started)
    }

    /// Whether a restart is currently underway
    #[must_use]
    pub fn restart_in_progress(&self) -> bool {
        self.restart_hold.lock().is_some()
    }

    /// Close the coordinator and the underlying session; idempotent
    pub async fn close(&self) {
        *self.phase.lock() = NegotiationPhase::Closed;
        self.finish_restart();
        self.session.close().await;
    }

    /// Spawn the pump forwarding media-session events: local candidates go
    /// out as signals, connectivity changes are re-emitted for the state
    /// machine.
    pub fn spawn_event_pump(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.session.events();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PeerSessionEvent::LocalCandidate(candidate)) => {
                        if candidate.is_end_of_gathering() {
                            continue;
                        }
                        self.send_signal(Signal::candidate(
                            self.room.clone(),
                            self.local.id,
                            *self.call_session.lock(),
                            candidate,
                        ));
                    }
                    Ok(PeerSessionEvent::Connectivity(state)) => {
                        if state.is_up() {
                            self.finish_restart();
                            self.restart_attempts.store(0, Ordering::SeqCst);
                        }
                        let _ = self.events.send(NegotiationEvent::Connectivity(state));
                    }
                    Ok(PeerSessionEvent::RemoteTrack { has_video }) => {
                        let _ = self.events.send(NegotiationEvent::RemoteTrack { has_video });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "lagged on media session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn offer_wins_glare(&self, remote: UserId) -> bool {
        // Lower numeric identity keeps its offer. The rule is isolated here;
        // see DESIGN.md for the identity-assignment assumption behind it.
        self.local.id < remote
    }

    fn finish_restart(&self) {
        self.restart_hold.lock().take();
    }

    async fn drain_held_candidates(&self) {
        let held: Vec<IceCandidate> = self.held_candidates.lock().drain(..).collect();
        if held.is_empty() {
            return;
        }
        tracing::debug!(count = held.len(), "applying buffered candidates");
        for candidate in &held {
            if let Err(e) = self.session.add_remote_candidate(candidate).await {
                tracing::warn!(error = %e, "buffered candidate rejected");
            }
        }
    }

    fn send_signal(&self, signal: Signal) {
        if self.outbound.send(signal).is_err() {
            tracing::warn!("outbound signal channel closed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SdpKind;
    use pretty_assertions::assert_eq;

    struct MockSession {
        events: broadcast::Sender<PeerSessionEvent>,
        remote_desc: Mutex<Option<SessionDescription>>,
        applied: Mutex<Vec<IceCandidate>>,
        connectivity: Mutex<ConnectivityState>,
    }

    impl MockSession {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(32);
            Arc::new(Self {
                events,
                remote_desc: Mutex::new(None),
                applied: Mutex::new(Vec::new()),
                connectivity: Mutex::new(ConnectivityState::New),
            })
        }

        fn set_connectivity(&self, state: ConnectivityState) {
            *self.connectivity.lock() = state;
        }
    }

    #[async_trait]
    impl PeerSession for MockSession {
        async fn create_offer(
            &self,
            ice_restart: bool,
        ) -> Result<SessionDescription, PeerSessionError> {
            let mut d = SessionDescription::offer("v=0\r\nm=audio 9 RTP/AVP 0\r\n");
            d.ice_restart = ice_restart;
            Ok(d)
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerSessionError> {
            Ok(SessionDescription::answer("v=0\r\nm=audio 9 RTP/AVP 0\r\n"))
        }

        async fn set_local_description(
            &self,
            _description: &SessionDescription,
        ) -> Result<(), PeerSessionError> {
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: &SessionDescription,
        ) -> Result<(), PeerSessionError> {
            *self.remote_desc.lock() = Some(description.clone());
            Ok(())
        }

        async fn add_remote_candidate(
            &self,
            candidate: &IceCandidate,
        ) -> Result<(), PeerSessionError> {
            self.applied.lock().push(candidate.clone());
            Ok(())
        }

        async fn attach_local(&self, _stream: &LocalStream) -> Result<(), PeerSessionError> {
            Ok(())
        }

        async fn replace_video_track(&self, _track_id: &str) -> Result<(), PeerSessionError> {
            Ok(())
        }

        async fn close(&self) {
            *self.connectivity.lock() = ConnectivityState::Closed;
        }

        fn connectivity(&self) -> ConnectivityState {
            *self.connectivity.lock()
        }

        fn events(&self) -> broadcast::Receiver<PeerSessionEvent> {
            self.events.subscribe()
        }
    }

    fn coordinator(
        local: u64,
        remote: Option<u64>,
    ) -> (
        Arc<NegotiationCoordinator<MockSession>>,
        Arc<MockSession>,
        mpsc::UnboundedReceiver<Signal>,
    ) {
        let session = MockSession::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let coord = Arc::new(NegotiationCoordinator::new(
            Arc::clone(&session),
            RoomId::new("room"),
            Peer::new(local, "local"),
            remote.map(UserId::new),
            NegotiationConfig::default(),
            tx,
        ));
        (coord, session, rx)
    }

    fn offer_from(sender: u64) -> Signal {
        Signal::offer(
            RoomId::new("room"),
            &Peer::new(sender, "remote"),
            None,
            SessionDescription::offer("v=0\r\nm=audio 9 RTP/AVP 0\r\n"),
        )
    }

    fn answer_from(sender: u64) -> Signal {
        Signal::answer(
            RoomId::new("room"),
            UserId::new(sender),
            None,
            SessionDescription::answer("v=0\r\nm=audio 9 RTP/AVP 0\r\n"),
        )
    }

    fn candidate_from(sender: u64, payload: &str) -> Signal {
        Signal::candidate(
            RoomId::new("room"),
            UserId::new(sender),
            None,
            IceCandidate {
                candidate: payload.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        )
    }

    #[tokio::test]
    async fn caller_sends_offer_and_enters_have_local_offer() {
        let (coord, _session, mut rx) = coordinator(7, Some(42));
        coord.start_as_caller().await.unwrap();

        assert_eq!(coord.phase(), NegotiationPhase::HaveLocalOffer);
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, SignalKind::Offer);
        assert_eq!(sent.description().unwrap().kind, SdpKind::Offer);
    }

    #[tokio::test]
    async fn callee_answers_incoming_offer() {
        let (coord, session, mut rx) = coordinator(42, None);
        let disposition = coord.handle_offer(&offer_from(7)).await.unwrap();

        assert_eq!(disposition, OfferDisposition::Answered);
        assert_eq!(coord.phase(), NegotiationPhase::Stable);
        assert_eq!(coord.remote(), Some(UserId::new(7)));
        assert!(session.remote_desc.lock().is_some());
        assert_eq!(rx.recv().await.unwrap().kind, SignalKind::Answer);
    }

    #[tokio::test]
    async fn glare_lower_identity_keeps_its_offer() {
        let (coord, session, _rx) = coordinator(7, Some(42));
        coord.start_as_caller().await.unwrap();

        let disposition = coord.handle_offer(&offer_from(42)).await.unwrap();
        assert_eq!(disposition, OfferDisposition::IgnoredGlare);
        assert_eq!(coord.phase(), NegotiationPhase::HaveLocalOffer);
        assert!(session.remote_desc.lock().is_none());
    }

    #[tokio::test]
    async fn glare_higher_identity_yields() {
        let (coord, session, _rx) = coordinator(42, Some(7));
        coord.start_as_caller().await.unwrap();

        let disposition = coord.handle_offer(&offer_from(7)).await.unwrap();
        assert_eq!(disposition, OfferDisposition::Answered);
        assert_eq!(coord.phase(), NegotiationPhase::Stable);
        assert!(session.remote_desc.lock().is_some());
    }

    #[tokio::test]
    async fn early_candidates_buffer_and_apply_in_order() {
        let (coord, session, _rx) = coordinator(42, None);
        coord
            .handle_candidate(&candidate_from(7, "candidate:a"))
            .await
            .unwrap();
        coord
            .handle_candidate(&candidate_from(7, "candidate:b"))
            .await
            .unwrap();
        assert!(session.applied.lock().is_empty());

        coord.handle_offer(&offer_from(7)).await.unwrap();
        let applied = session.applied.lock();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].candidate, "candidate:a");
        assert_eq!(applied[1].candidate, "candidate:b");
    }

    #[tokio::test]
    async fn duplicate_candidates_apply_once() {
        let (coord, session, _rx) = coordinator(42, None);
        coord.handle_offer(&offer_from(7)).await.unwrap();
        coord
            .handle_candidate(&candidate_from(7, "candidate:a"))
            .await
            .unwrap();
        coord
            .handle_candidate(&candidate_from(7, "candidate:a"))
            .await
            .unwrap();
        assert_eq!(session.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn end_of_gathering_markers_are_discarded() {
        let (coord, session, _rx) = coordinator(42, None);
        coord.handle_offer(&offer_from(7)).await.unwrap();
        let marker = Signal::candidate(
            RoomId::new("room"),
            UserId::new(7),
            None,
            IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        );
        coord.handle_candidate(&marker).await.unwrap();
        assert!(session.applied.lock().is_empty());
    }

    #[tokio::test]
    async fn candidates_dropped_once_session_failed() {
        let (coord, session, _rx) = coordinator(42, None);
        session.set_connectivity(ConnectivityState::Failed);
        coord
            .handle_candidate(&candidate_from(7, "candidate:a"))
            .await
            .unwrap();
        assert!(session.applied.lock().is_empty());
        assert!(coord.held_candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn stale_answer_is_ignored() {
        let (coord, session, _rx) = coordinator(42, Some(7));
        coord.handle_answer(&answer_from(7)).await.unwrap();
        assert!(session.remote_desc.lock().is_none());
        assert_eq!(coord.phase(), NegotiationPhase::New);
    }

    #[tokio::test]
    async fn answer_completes_offer_exchange() {
        let (coord, _session, _rx) = coordinator(7, Some(42));
        coord.start_as_caller().await.unwrap();
        coord.handle_answer(&answer_from(42)).await.unwrap();
        assert_eq!(coord.phase(), NegotiationPhase::Stable);
    }

    #[tokio::test]
    async fn restart_is_mutually_exclusive_and_capped() {
        let (coord, _session, mut rx) = coordinator(7, Some(42));
        coord.start_as_caller().await.unwrap();
        coord.handle_answer(&answer_from(42)).await.unwrap();
        let _ = rx.recv().await;

        assert_eq!(coord.restart().await.unwrap(), RestartOutcome::Started);
        assert!(coord.restart_in_progress());
        assert_eq!(
            coord.restart().await.unwrap(),
            RestartOutcome::AlreadyInProgress
        );

        // The restart answer releases the gate.
        coord.handle_answer(&answer_from(42)).await.unwrap();
        assert!(!coord.restart_in_progress());

        assert_eq!(coord.restart().await.unwrap(), RestartOutcome::Started);
        coord.handle_answer(&answer_from(42)).await.unwrap();
        assert_eq!(coord.restart().await.unwrap(), RestartOutcome::Started);
        coord.handle_answer(&answer_from(42)).await.unwrap();
        assert_eq!(
            coord.restart().await.unwrap(),
            RestartOutcome::AttemptsExhausted
        );
    }

    #[tokio::test]
    async fn restart_offer_carries_restart_flag() {
        let (coord, _session, mut rx) = coordinator(7, Some(42));
        coord.start_as_caller().await.unwrap();
        coord.handle_answer(&answer_from(42)).await.unwrap();
        let _ = rx.recv().await;

        coord.restart().await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, SignalKind::Offer);
        assert!(sent.description().unwrap().ice_restart);
    }

    #[tokio::test]
    async fn peer_restart_offer_bypasses_glare() {
        let (coord, session, _rx) = coordinator(7, Some(42));
        coord.start_as_caller().await.unwrap();

        let mut restart_offer = offer_from(42);
        if let Some(crate::types::SignalPayload::Description(d)) = &mut restart_offer.payload {
            d.ice_restart = true;
        }
        let disposition = coord.handle_offer(&restart_offer).await.unwrap();
        assert_eq!(disposition, OfferDisposition::Answered);
        assert!(session.remote_desc.lock().is_some());
    }
}

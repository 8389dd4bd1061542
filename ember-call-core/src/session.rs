//! Call session lifecycle
//!
//! [`CallService`] is the single authority for the call's lifecycle state.
//! At most one call session exists per process; every transition (user
//! actions, classified signals, negotiation events, timer firings) is
//! serialized through one async mutex over the active-call slot, so no two
//! mutations of session state can interleave.
//!
//! Expected outcomes (busy, declined, timeout, remote hangup) are data, not
//! errors: they drive a normal transition and reach the UI as a typed
//! [`EndReason`] through the event channel. Only resource acquisition
//! failures and backend faults surface as `Err`.

use crate::identity::{Peer, UserId};
use crate::media::{CaptureDevices, MediaController, MediaEvent, SwitchOutcome};
use crate::negotiation::{
    NegotiationConfig, NegotiationCoordinator, NegotiationError, NegotiationEvent, PeerSession,
    PeerSessionFactory, RestartOutcome,
};
use crate::reliability::ReliableLink;
use crate::router::{RouterNotice, SignalRouter};
use crate::transport::SignalTransport;
use crate::types::{
    CallDirection, CallEvent, CallKind, CallPhase, CallSessionInfo, EndReason, RoomId, SessionId,
    Signal,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Outcome of a call-admission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed; the backend assigned a session id
    Admitted {
        /// Session id for stale-signal rejection
        session_id: SessionId,
    },
    /// The receiver is already in a call
    ReceiverBusy,
    /// This account is already marked in-call by the backend
    CallerBusy,
}

/// The backend's call-admission surface.
///
/// The REST backend itself is out of scope; the service only needs these
/// four operations, each bounded by the configured RPC timeout.
#[async_trait]
pub trait CallBackend: Send + Sync + 'static {
    /// Backend error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Ask to place a call into `room` towards `callee`.
    ///
    /// # Errors
    ///
    /// Returns error on transport/backend failure; busy outcomes are data.
    async fn admit(
        &self,
        room: &RoomId,
        callee: UserId,
        kind: CallKind,
    ) -> Result<Admission, Self::Error>;

    /// Accept an incoming call; returns the session id.
    ///
    /// # Errors
    ///
    /// Returns error on transport/backend failure.
    async fn accept(&self, room: &RoomId) -> Result<SessionId, Self::Error>;

    /// Decline an incoming call.
    ///
    /// # Errors
    ///
    /// Returns error on transport/backend failure.
    async fn decline(&self, room: &RoomId) -> Result<(), Self::Error>;

    /// Report the call over.
    ///
    /// # Errors
    ///
    /// Returns error on transport/backend failure.
    async fn end(&self, room: &RoomId, reason: EndReason) -> Result<(), Self::Error>;
}

/// Call service tuning knobs
#[derive(Debug, Clone)]
pub struct CallServiceConfig {
    /// How long an unanswered call rings
    pub ringing_timeout: Duration,
    /// Negotiation window; shorter than ringing so a hung handshake cannot
    /// outlive the user's patience
    pub connecting_timeout: Duration,
    /// How long a reconnect may take before the call fails
    pub reconnect_timeout: Duration,
    /// Blip window before a disconnect triggers a restart
    pub restart_grace: Duration,
    /// Delay before a terminal session resets to idle
    pub idle_reset_delay: Duration,
    /// Bound on every backend admission/accept/decline/end call
    pub backend_rpc_timeout: Duration,
    /// Optional hard cap on call duration
    pub max_duration: Option<Duration>,
    /// Negotiation restart policy
    pub negotiation: NegotiationConfig,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            ringing_timeout: Duration::from_secs(60),
            connecting_timeout: Duration::from_secs(20),
            reconnect_timeout: Duration::from_secs(30),
            restart_grace: Duration::from_secs(2),
            idle_reset_delay: Duration::from_secs(2),
            backend_rpc_timeout: Duration::from_secs(10),
            max_duration: None,
            negotiation: NegotiationConfig::default(),
        }
    }
}

/// Call service errors
#[derive(Error, Debug)]
pub enum CallServiceError {
    /// A call already occupies the session slot
    #[error("another call is already active")]
    AlreadyInCall,
    /// Callee equals the local identity
    #[error("cannot call yourself")]
    SelfCallNotAllowed,
    /// A second initiate raced an in-flight one (double press)
    #[error("call initiation already underway")]
    DuplicateInitiation,
    /// No call, or the call is not in a state that allows the operation
    #[error("call is not in a state that allows this operation")]
    InvalidState,
    /// Backend request failed or timed out
    #[error("backend request failed: {0}")]
    Backend(String),
    /// Local media failure
    #[error(transparent)]
    Media(#[from] crate::media::MediaError),
    /// Negotiation failure
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Ringing,
    Connecting,
    Reconnect,
    MaxDuration,
}

#[derive(Debug, Clone, Copy)]
enum BackendNotify {
    End,
    Decline,
    Nothing,
}

#[derive(Default)]
struct TimerSet {
    ringing: Option<JoinHandle<()>>,
    connecting: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    max_duration: Option<JoinHandle<()>>,
}

impl TimerSet {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TimerKind::Ringing => &mut self.ringing,
            TimerKind::Connecting => &mut self.connecting,
            TimerKind::Reconnect => &mut self.reconnect,
            TimerKind::MaxDuration => &mut self.max_duration,
        }
    }

    fn set(&mut self, kind: TimerKind, handle: JoinHandle<()>) {
        if let Some(old) = self.slot(kind).replace(handle) {
            old.abort();
        }
    }

    fn clear(&mut self, kind: TimerKind) {
        if let Some(handle) = self.slot(kind).take() {
            handle.abort();
        }
    }

    fn clear_all(&mut self) {
        for kind in [
            TimerKind::Ringing,
            TimerKind::Connecting,
            TimerKind::Reconnect,
            TimerKind::MaxDuration,
        ] {
            self.clear(kind);
        }
    }
}

struct ActiveCall<S: PeerSession> {
    info: CallSessionInfo,
    epoch: u64,
    coordinator: Option<Arc<NegotiationCoordinator<S>>>,
    timers: TimerSet,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: PeerSession> ActiveCall<S> {
    fn new(info: CallSessionInfo, epoch: u64) -> Self {
        Self {
            info,
            epoch,
            coordinator: None,
            timers: TimerSet::default(),
            tasks: Vec::new(),
        }
    }
}

/// Orchestrates one user session's calls.
///
/// A cheap clonable handle over shared state; explicitly constructed with
/// injected collaborators and a start/stop lifecycle. A process hosts
/// exactly one instance per signed-in user.
pub struct CallService<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    core: Arc<CallCore<F, B, D, T>>,
}

impl<F, B, D, T> Clone for CallService<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct CallCore<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    local: Peer,
    cfg: CallServiceConfig,
    router: Arc<SignalRouter>,
    link: Arc<ReliableLink<T>>,
    media: Arc<MediaController<D>>,
    backend: Arc<B>,
    factory: Arc<F>,
    slot: tokio::sync::Mutex<Option<ActiveCall<F::Session>>>,
    teardown_gate: tokio::sync::Mutex<()>,
    initiate_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CallEvent>,
    epochs: AtomicU64,
    service_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<F, B, D, T> CallService<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    /// Create a call service
    #[must_use]
    pub fn new(
        local: Peer,
        router: Arc<SignalRouter>,
        link: Arc<ReliableLink<T>>,
        media: Arc<MediaController<D>>,
        backend: Arc<B>,
        factory: Arc<F>,
        cfg: CallServiceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            core: Arc::new(CallCore {
                local,
                cfg,
                router,
                link,
                media,
                backend,
                factory,
                slot: tokio::sync::Mutex::new(None),
                teardown_gate: tokio::sync::Mutex::new(()),
                initiate_gate: tokio::sync::Mutex::new(()),
                events,
                epochs: AtomicU64::new(0),
                service_tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(
        local: Peer,
        router: Arc<SignalRouter>,
        link: Arc<ReliableLink<T>>,
        media: Arc<MediaController<D>>,
        backend: Arc<B>,
        factory: Arc<F>,
    ) -> CallServiceBuilder<F, B, D, T> {
        CallServiceBuilder {
            local,
            router,
            link,
            media,
            backend,
            factory,
            cfg: CallServiceConfig::default(),
        }
    }

    /// Start the service: bring the signaling link up and wire the pumps.
    pub fn start(&self) {
        CallCore::start(&self.core);
    }

    /// Stop the service, ending any active call
    pub async fn stop(&self) {
        self.end_call(EndReason::Cancelled).await;
        self.core.link.stop().await;
        for task in self.core.service_tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("call service stopped");
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.core.events.subscribe()
    }

    /// Snapshot of the active call, if any
    pub async fn current_call(&self) -> Option<CallSessionInfo> {
        self.core.slot.lock().await.as_ref().map(|c| c.info.clone())
    }

    /// Place a call.
    ///
    /// Busy rejections are not errors: the session returns to idle and the
    /// outcome reaches the UI as a [`CallEvent::CallEnded`] with reason
    /// `busy`.
    ///
    /// # Errors
    ///
    /// [`CallServiceError::SelfCallNotAllowed`] when calling yourself,
    /// [`CallServiceError::DuplicateInitiation`] on a double press,
    /// [`CallServiceError::AlreadyInCall`] when a session is active, plus
    /// media/backend failures.
    pub async fn initiate(&self, callee: Peer, kind: CallKind) -> Result<RoomId, CallServiceError> {
        CallCore::initiate(&self.core, callee, kind).await
    }

    /// Accept an incoming call.
    ///
    /// Usable both from the in-app UI (a session is already ringing) and
    /// from native call-screen callbacks woken by push, where the offer may
    /// not have arrived yet; the caller identity is then learned from the
    /// queued offer once it lands.
    ///
    /// # Errors
    ///
    /// [`CallServiceError::InvalidState`] when a different call is active,
    /// plus media/backend failures.
    pub async fn accept_incoming(
        &self,
        room: &RoomId,
        kind: CallKind,
    ) -> Result<(), CallServiceError> {
        CallCore::accept_incoming(&self.core, room, kind).await
    }

    /// Decline an incoming ringing call.
    ///
    /// # Errors
    ///
    /// [`CallServiceError::InvalidState`] when no matching call is ringing.
    pub async fn decline_incoming(&self, room: &RoomId) -> Result<(), CallServiceError> {
        CallCore::decline_incoming(&self.core, room).await
    }

    /// End the active call.
    ///
    /// Idempotent under concurrent invocation: a user hangup racing a remote
    /// hangup or a timeout converges on one teardown; the outbound hangup
    /// signal and the backend notification go out at most once.
    pub async fn end_call(&self, reason: EndReason) {
        CallCore::teardown(&self.core, None, reason, BackendNotify::End, true).await;
    }

    /// Toggle the microphone; returns the new state.
    ///
    /// # Errors
    ///
    /// Returns error when no local stream is active.
    pub fn toggle_audio(&self) -> Result<bool, CallServiceError> {
        Ok(self.core.media.toggle_audio()?)
    }

    /// Toggle the camera; returns the new state.
    ///
    /// # Errors
    ///
    /// Returns error when no local stream is active.
    pub fn toggle_video(&self) -> Result<bool, CallServiceError> {
        Ok(self.core.media.toggle_video()?)
    }

    /// Toggle loudspeaker routing; returns the new state.
    ///
    /// # Errors
    ///
    /// Returns error when no local stream is active.
    pub fn toggle_speaker(&self) -> Result<bool, CallServiceError> {
        Ok(self.core.media.toggle_speaker()?)
    }

    /// Swap front/back camera; debounced and self-exclusive.
    ///
    /// # Errors
    ///
    /// Returns error when no call is active or the switch fails (the
    /// previous camera then stays live and a [`CallEvent::Fault`] is
    /// emitted).
    pub async fn switch_camera(&self) -> Result<SwitchOutcome, CallServiceError> {
        CallCore::switch_camera(&self.core).await
    }
}

impl<F, B, D, T> CallCore<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn start(this: &Arc<Self>) {
        tracing::info!(identity = %this.local.id, "starting call service");
        let mut tasks = this.service_tasks.lock();

        tasks.push(Arc::clone(&this.link).start(Arc::clone(&this.router)));
        tasks.push(Arc::clone(&this.media).spawn_device_watch());

        let core = Arc::clone(this);
        let mut notices = this.router.notices();
        tasks.push(tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(notice) => Self::on_notice(&core, notice).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "lagged on router notices");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let core = Arc::clone(this);
        let mut states = this.link.states();
        tasks.push(tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(state) => core.emit(CallEvent::LinkStateChanged(state)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let core = Arc::clone(this);
        let mut media_events = this.media.events();
        tasks.push(tokio::spawn(async move {
            loop {
                match media_events.recv().await {
                    Ok(MediaEvent::LocalStreamChanged(stream)) => {
                        core.emit(CallEvent::LocalStreamChanged(stream));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    #[tracing::instrument(skip(this, callee), fields(callee = %callee.id, kind = ?kind))]
    async fn initiate(
        this: &Arc<Self>,
        callee: Peer,
        kind: CallKind,
    ) -> Result<RoomId, CallServiceError> {
        if callee.id == this.local.id {
            return Err(CallServiceError::SelfCallNotAllowed);
        }
        let Ok(_initiating) = this.initiate_gate.try_lock() else {
            return Err(CallServiceError::DuplicateInitiation);
        };

        let room = RoomId::generate();
        let epoch = {
            let mut slot = this.slot.lock().await;
            // A terminal session awaiting its idle reset does not block a
            // new call; its epoch-checked reset task becomes a no-op.
            if slot.as_ref().is_some_and(|c| c.info.phase.is_terminal()) {
                *slot = None;
            }
            if slot.is_some() {
                return Err(CallServiceError::AlreadyInCall);
            }
            let epoch = this.next_epoch();
            let info = CallSessionInfo {
                room: room.clone(),
                session_id: None,
                kind,
                direction: CallDirection::Outgoing,
                peer: Some(callee.clone()),
                phase: CallPhase::Initiating,
                connected_at: None,
            };
            *slot = Some(ActiveCall::new(info, epoch));
            this.router.set_active_room(Some(room.clone()));
            epoch
        };
        this.emit(CallEvent::PhaseChanged {
            room: room.clone(),
            phase: CallPhase::Initiating,
        });
        tracing::info!(room = %room, "call admission requested");

        let admission = tokio::time::timeout(
            this.cfg.backend_rpc_timeout,
            this.backend.admit(&room, callee.id, kind),
        )
        .await;
        let admission = match admission {
            Ok(Ok(a)) => a,
            Ok(Err(e)) => {
                this.abandon_before_ring(epoch, &room).await;
                return Err(CallServiceError::Backend(e.to_string()));
            }
            Err(_) => {
                this.abandon_before_ring(epoch, &room).await;
                return Err(CallServiceError::Backend("admission timed out".into()));
            }
        };

        let session_id = match admission {
            Admission::Admitted { session_id } => session_id,
            Admission::ReceiverBusy | Admission::CallerBusy => {
                tracing::info!(room = %room, "admission rejected: busy");
                this.emit(CallEvent::CallEnded {
                    room: Some(room.clone()),
                    reason: EndReason::Busy,
                });
                this.abandon_before_ring(epoch, &room).await;
                return Ok(room);
            }
        };

        let stream = match this.media.acquire_local_media(kind.includes_video()).await {
            Ok(stream) => stream,
            Err(e) => {
                Self::fail_before_ring(this, epoch, &room, EndReason::MediaDenied).await;
                return Err(e.into());
            }
        };

        let coordinator = match Self::build_negotiation(
            this,
            room.clone(),
            kind,
            Some(callee.id),
            Some(session_id),
            &stream,
            epoch,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                Self::fail_before_ring(this, epoch, &room, EndReason::ConnectionFailed).await;
                return Err(e);
            }
        };

        if let Err(e) = coordinator.start_as_caller().await {
            Self::fail_before_ring(this, epoch, &room, EndReason::ConnectionFailed).await;
            return Err(e.into());
        }

        let mut slot = this.slot.lock().await;
        match slot.as_mut() {
            Some(call) if call.epoch == epoch => {
                call.info.session_id = Some(session_id);
                call.info.phase = CallPhase::Ringing;
                let handle =
                    Self::arm_timer(this, TimerKind::Ringing, this.cfg.ringing_timeout, epoch);
                call.timers.set(TimerKind::Ringing, handle);
            }
            _ => {
                // The call was torn down while we were setting up (remote
                // hangup racing initiation); close what we built.
                drop(slot);
                coordinator.close().await;
                this.media.release().await;
                return Err(CallServiceError::InvalidState);
            }
        }
        drop(slot);
        this.emit(CallEvent::PhaseChanged {
            room: room.clone(),
            phase: CallPhase::Ringing,
        });
        tracing::info!(room = %room, session = %session_id, "ringing");
        Ok(room)
    }

    #[tracing::instrument(skip(this), fields(room = %room))]
    async fn accept_incoming(
        this: &Arc<Self>,
        room: &RoomId,
        kind: CallKind,
    ) -> Result<(), CallServiceError> {
        let (epoch, kind) = {
            let mut slot = this.slot.lock().await;
            match slot.as_mut() {
                Some(call)
                    if call.info.room == *room
                        && call.info.direction == CallDirection::Incoming
                        && call.info.phase == CallPhase::Ringing =>
                {
                    call.timers.clear(TimerKind::Ringing);
                    (call.epoch, call.info.kind)
                }
                Some(_) => return Err(CallServiceError::InvalidState),
                None => {
                    // Accepted from the native call screen before the offer
                    // arrived; the caller is unknown until it does.
                    let epoch = this.next_epoch();
                    let info = CallSessionInfo {
                        room: room.clone(),
                        session_id: None,
                        kind,
                        direction: CallDirection::Incoming,
                        peer: None,
                        phase: CallPhase::Ringing,
                        connected_at: None,
                    };
                    *slot = Some(ActiveCall::new(info, epoch));
                    this.router.set_active_room(Some(room.clone()));
                    (epoch, kind)
                }
            }
        };

        let session_id = match tokio::time::timeout(
            this.cfg.backend_rpc_timeout,
            this.backend.accept(room),
        )
        .await
        {
            Ok(Ok(sid)) => sid,
            Ok(Err(e)) => {
                Self::spawn_teardown(
                    this,
                    room.clone(),
                    EndReason::ConnectionFailed,
                    BackendNotify::End,
                    true,
                );
                return Err(CallServiceError::Backend(e.to_string()));
            }
            Err(_) => {
                Self::spawn_teardown(
                    this,
                    room.clone(),
                    EndReason::ConnectionFailed,
                    BackendNotify::End,
                    true,
                );
                return Err(CallServiceError::Backend("accept timed out".into()));
            }
        };

        let stream = match this.media.acquire_local_media(kind.includes_video()).await {
            Ok(stream) => stream,
            Err(e) => {
                Self::spawn_teardown(
                    this,
                    room.clone(),
                    EndReason::MediaDenied,
                    BackendNotify::End,
                    true,
                );
                return Err(e.into());
            }
        };

        let remote = {
            let slot = this.slot.lock().await;
            match slot.as_ref() {
                Some(call) if call.epoch == epoch => call.info.peer.as_ref().map(|p| p.id),
                _ => return Err(CallServiceError::InvalidState),
            }
        };

        let coordinator = match Self::build_negotiation(
            this,
            room.clone(),
            kind,
            remote,
            Some(session_id),
            &stream,
            epoch,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                Self::spawn_teardown(
                    this,
                    room.clone(),
                    EndReason::ConnectionFailed,
                    BackendNotify::End,
                    true,
                );
                return Err(e);
            }
        };

        let mut slot = this.slot.lock().await;
        match slot.as_mut() {
            Some(call) if call.epoch == epoch => {
                call.info.session_id = Some(session_id);
                call.info.phase = CallPhase::Connecting;
                let handle = Self::arm_timer(
                    this,
                    TimerKind::Connecting,
                    this.cfg.connecting_timeout,
                    epoch,
                );
                call.timers.set(TimerKind::Connecting, handle);
            }
            _ => {
                drop(slot);
                coordinator.close().await;
                this.media.release().await;
                return Err(CallServiceError::InvalidState);
            }
        }
        drop(slot);
        this.emit(CallEvent::PhaseChanged {
            room: room.clone(),
            phase: CallPhase::Connecting,
        });
        tracing::info!(room = %room, session = %session_id, "accepted, negotiating");
        Ok(())
    }

    #[tracing::instrument(skip(this), fields(room = %room))]
    async fn decline_incoming(this: &Arc<Self>, room: &RoomId) -> Result<(), CallServiceError> {
        {
            let slot = this.slot.lock().await;
            match slot.as_ref() {
                Some(call)
                    if call.info.room == *room
                        && call.info.direction == CallDirection::Incoming
                        && call.info.phase == CallPhase::Ringing => {}
                _ => return Err(CallServiceError::InvalidState),
            }
        }
        Self::teardown(
            this,
            Some(room),
            EndReason::Declined,
            BackendNotify::Decline,
            true,
        )
        .await;
        Ok(())
    }

    async fn switch_camera(this: &Arc<Self>) -> Result<SwitchOutcome, CallServiceError> {
        let session = {
            let slot = this.slot.lock().await;
            let call = slot.as_ref().ok_or(CallServiceError::InvalidState)?;
            let coordinator = call
                .coordinator
                .as_ref()
                .ok_or(CallServiceError::InvalidState)?;
            Arc::clone(coordinator.session())
        };
        match this.media.switch_camera(session.as_ref()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                this.emit(CallEvent::Fault {
                    detail: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Wire a peer session, coordinator and all per-call pumps; the caller
    /// installs the returned coordinator into the slot.
    async fn build_negotiation(
        this: &Arc<Self>,
        room: RoomId,
        kind: CallKind,
        remote: Option<UserId>,
        session_id: Option<SessionId>,
        stream: &crate::media::LocalStream,
        epoch: u64,
    ) -> Result<Arc<NegotiationCoordinator<F::Session>>, CallServiceError> {
        let session = this
            .factory
            .create(kind)
            .await
            .map_err(NegotiationError::from)?;
        session
            .attach_local(stream)
            .await
            .map_err(NegotiationError::from)?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Signal>();
        let coordinator = Arc::new(NegotiationCoordinator::new(
            Arc::clone(&session),
            room.clone(),
            this.local.clone(),
            remote,
            this.cfg.negotiation.clone(),
            outbound_tx,
        ));
        if let Some(sid) = session_id {
            coordinator.set_call_session(sid);
            this.router.set_active_session(Some(sid));
        }

        let mut tasks = Vec::new();

        // Outbound pump: signals the coordinator produces go to the remote
        // party; buffered while the remote identity is still unknown.
        let link = Arc::clone(&this.link);
        let coord = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            let mut held: Vec<Signal> = Vec::new();
            while let Some(signal) = outbound_rx.recv().await {
                let Some(remote) = coord.remote() else {
                    held.push(signal);
                    continue;
                };
                for earlier in held.drain(..) {
                    if let Err(e) = link.send_signal(remote, &earlier).await {
                        tracing::warn!(error = %e, "failed to send held signal");
                    }
                }
                if let Err(e) = link.send_signal(remote, &signal).await {
                    tracing::warn!(error = %e, "failed to send signal");
                }
            }
        }));

        // Inbound pump: classified signals from the router drive the
        // handshake.
        let (consumer_tx, mut consumer_rx) = mpsc::unbounded_channel::<Signal>();
        let coord = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            while let Some(signal) = consumer_rx.recv().await {
                if let Err(e) = coord.handle_signal(&signal).await {
                    tracing::warn!(error = %e, kind = signal.kind.as_str(), "signal handling failed");
                }
            }
        }));

        // Negotiation events drive session state.
        let core = Arc::clone(this);
        let mut negotiation_events = coordinator.events();
        tasks.push(tokio::spawn(async move {
            loop {
                match negotiation_events.recv().await {
                    Ok(event) => Self::on_negotiation_event(&core, epoch, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "lagged on negotiation events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        tasks.push(Arc::clone(&coordinator).spawn_event_pump());

        // Register after the pumps exist so the pending-queue flush lands in
        // a live channel.
        this.router
            .register_consumer("negotiation", room.clone(), consumer_tx);

        let mut slot = this.slot.lock().await;
        match slot.as_mut() {
            Some(call) if call.epoch == epoch => {
                call.coordinator = Some(Arc::clone(&coordinator));
                call.tasks.extend(tasks);
                Ok(coordinator)
            }
            _ => {
                drop(slot);
                for task in tasks {
                    task.abort();
                }
                coordinator.close().await;
                Err(CallServiceError::InvalidState)
            }
        }
    }

    /// Quietly drop a session that never rang (admission rejected/failed)
    async fn abandon_before_ring(&self, epoch: u64, room: &RoomId) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|c| c.epoch == epoch) {
            *slot = None;
            self.router.set_active_room(None);
        }
        drop(slot);
        self.emit(CallEvent::PhaseChanged {
            room: room.clone(),
            phase: CallPhase::Idle,
        });
    }

    /// Fail a session that never rang, informing the backend it is over
    async fn fail_before_ring(this: &Arc<Self>, epoch: u64, room: &RoomId, reason: EndReason) {
        {
            let mut slot = this.slot.lock().await;
            if !slot.as_ref().is_some_and(|c| c.epoch == epoch) {
                return;
            }
            if let Some(call) = slot.as_mut() {
                call.timers.clear_all();
                for task in call.tasks.drain(..) {
                    task.abort();
                }
                if let Some(coordinator) = call.coordinator.take() {
                    coordinator.close().await;
                }
            }
            *slot = None;
            this.router.set_active_room(None);
            this.router.set_active_session(None);
            this.router.unregister_consumer();
        }
        this.media.release().await;
        if let Err(e) = tokio::time::timeout(
            this.cfg.backend_rpc_timeout,
            this.backend.end(room, reason),
        )
        .await
        .map_err(|_| "timed out".to_string())
        .and_then(|r| r.map_err(|e| e.to_string()))
        {
            tracing::debug!(error = %e, "backend end notification failed");
        }
        this.emit(CallEvent::CallEnded {
            room: Some(room.clone()),
            reason,
        });
        this.emit(CallEvent::PhaseChanged {
            room: room.clone(),
            phase: CallPhase::Idle,
        });
    }

    fn arm_timer(
        this: &Arc<Self>,
        kind: TimerKind,
        duration: Duration,
        epoch: u64,
    ) -> JoinHandle<()> {
        let core = Arc::clone(this);
        tokio::spawn(async move {
            sleep(duration).await;
            // Detach so teardown's timer cleanup cannot cancel the very task
            // performing it.
            tokio::spawn(async move { Self::on_timeout(&core, epoch, kind).await });
        })
    }

    async fn on_timeout(this: &Arc<Self>, epoch: u64, kind: TimerKind) {
        let action = {
            let slot = this.slot.lock().await;
            let Some(call) = slot.as_ref() else { return };
            if call.epoch != epoch {
                return;
            }
            match (kind, call.info.phase, call.info.direction) {
                (TimerKind::Ringing, CallPhase::Ringing, CallDirection::Outgoing) => Some((
                    call.info.room.clone(),
                    EndReason::Timeout,
                    BackendNotify::End,
                    true,
                )),
                (TimerKind::Ringing, CallPhase::Ringing, CallDirection::Incoming) => Some((
                    call.info.room.clone(),
                    EndReason::Timeout,
                    BackendNotify::Nothing,
                    false,
                )),
                (TimerKind::Connecting, CallPhase::Connecting, _)
                | (TimerKind::Reconnect, CallPhase::Reconnecting, _) => Some((
                    call.info.room.clone(),
                    EndReason::ConnectionFailed,
                    BackendNotify::End,
                    true,
                )),
                (TimerKind::MaxDuration, CallPhase::Connected | CallPhase::Reconnecting, _) => {
                    Some((
                        call.info.room.clone(),
                        EndReason::Timeout,
                        BackendNotify::End,
                        true,
                    ))
                }
                _ => None,
            }
        };
        let Some((room, reason, notify, send_hangup)) = action else {
            return;
        };
        tracing::info!(room = %room, kind = ?kind, "timeout fired");
        Self::teardown(this, Some(&room), reason, notify, send_hangup).await;
    }

    async fn on_notice(this: &Arc<Self>, notice: RouterNotice) {
        match notice {
            RouterNotice::OfferArrived {
                room,
                sender,
                sender_name,
                session_id,
                has_video,
            } => {
                Self::on_offer_notice(this, room, sender, sender_name, session_id, has_video)
                    .await;
            }
            RouterNotice::HangupArrived { room, reason, .. } => {
                let mapped = match reason {
                    Some(EndReason::Busy) => EndReason::Busy,
                    Some(EndReason::Declined) => EndReason::Declined,
                    Some(EndReason::Timeout) => EndReason::Timeout,
                    Some(EndReason::Cancelled) => EndReason::Cancelled,
                    _ => EndReason::RemoteEnded,
                };
                Self::teardown(this, Some(&room), mapped, BackendNotify::Nothing, false).await;
            }
            RouterNotice::ErrorArrived { room, sender } => {
                tracing::warn!(room = %room, sender = %sender, "remote error signal");
                this.emit(CallEvent::Fault {
                    detail: "remote reported a call error".into(),
                });
            }
        }
    }

    async fn on_offer_notice(
        this: &Arc<Self>,
        room: RoomId,
        sender: UserId,
        sender_name: Option<String>,
        session_id: Option<SessionId>,
        has_video: bool,
    ) {
        let mut slot = this.slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|c| c.info.phase.is_terminal() && c.info.room != room)
        {
            // Terminal session awaiting reset; the new call takes the slot.
            *slot = None;
        }
        match slot.as_mut() {
            Some(call) if call.info.room == room => {
                // Renegotiation and glare offers ride the consumer path; the
                // notice only fills in a caller learned late (push-accept).
                if call.info.peer.is_none() {
                    call.info.peer = Some(Peer::new(
                        sender,
                        sender_name.unwrap_or_else(|| sender.to_string()),
                    ));
                }
            }
            Some(call) => {
                // Second incoming call while engaged: answer with an
                // explicit busy signal, never drop it silently.
                tracing::info!(
                    busy_room = %call.info.room,
                    offered_room = %room,
                    "busy, rejecting second incoming call"
                );
                if this.router.note_hangup_sent(&room) {
                    let signal = Signal::hangup(room.clone(), this.local.id, EndReason::Busy);
                    if let Err(e) = this.link.send_signal(sender, &signal).await {
                        tracing::debug!(error = %e, "failed to send busy signal");
                    }
                }
            }
            None => {
                let epoch = this.next_epoch();
                let kind = if has_video {
                    CallKind::Video
                } else {
                    CallKind::Voice
                };
                let peer = Peer::new(sender, sender_name.unwrap_or_else(|| sender.to_string()));
                let info = CallSessionInfo {
                    room: room.clone(),
                    session_id,
                    kind,
                    direction: CallDirection::Incoming,
                    peer: Some(peer.clone()),
                    phase: CallPhase::Ringing,
                    connected_at: None,
                };
                let mut call = ActiveCall::new(info, epoch);
                let handle =
                    Self::arm_timer(this, TimerKind::Ringing, this.cfg.ringing_timeout, epoch);
                call.timers.set(TimerKind::Ringing, handle);
                *slot = Some(call);
                this.router.set_active_room(Some(room.clone()));
                drop(slot);
                tracing::info!(room = %room, caller = %sender, "incoming call ringing");
                this.emit(CallEvent::IncomingCall {
                    room: room.clone(),
                    peer,
                    kind,
                });
                this.emit(CallEvent::PhaseChanged {
                    room,
                    phase: CallPhase::Ringing,
                });
            }
        }
    }

    async fn on_negotiation_event(this: &Arc<Self>, epoch: u64, event: NegotiationEvent) {
        match event {
            NegotiationEvent::RemoteTrack { has_video } => {
                this.emit(CallEvent::RemoteStreamChanged { has_video });
            }
            NegotiationEvent::AnswerApplied => {
                // The remote party accepted: an outgoing call stops ringing
                // and negotiation gets its own (shorter) window.
                let room = {
                    let mut slot = this.slot.lock().await;
                    let Some(call) = slot.as_mut() else { return };
                    if call.epoch != epoch || call.info.phase != CallPhase::Ringing {
                        return;
                    }
                    call.timers.clear(TimerKind::Ringing);
                    call.info.phase = CallPhase::Connecting;
                    let handle = Self::arm_timer(
                        this,
                        TimerKind::Connecting,
                        this.cfg.connecting_timeout,
                        epoch,
                    );
                    call.timers.set(TimerKind::Connecting, handle);
                    call.info.room.clone()
                };
                this.emit(CallEvent::PhaseChanged {
                    room,
                    phase: CallPhase::Connecting,
                });
            }
            NegotiationEvent::Connectivity(state) if state.is_up() => {
                let room = {
                    let mut slot = this.slot.lock().await;
                    let Some(call) = slot.as_mut() else { return };
                    if call.epoch != epoch
                        || !matches!(
                            call.info.phase,
                            CallPhase::Connecting | CallPhase::Reconnecting
                        )
                    {
                        return;
                    }
                    call.timers.clear(TimerKind::Connecting);
                    call.timers.clear(TimerKind::Reconnect);
                    call.info.phase = CallPhase::Connected;
                    if call.info.connected_at.is_none() {
                        call.info.connected_at = Some(Utc::now());
                        if let Some(cap) = this.cfg.max_duration {
                            let handle = Self::arm_timer(this, TimerKind::MaxDuration, cap, epoch);
                            call.timers.set(TimerKind::MaxDuration, handle);
                        }
                    }
                    call.info.room.clone()
                };
                tracing::info!(room = %room, "call connected");
                this.emit(CallEvent::PhaseChanged {
                    room,
                    phase: CallPhase::Connected,
                });
            }
            NegotiationEvent::Connectivity(crate::negotiation::ConnectivityState::Disconnected) => {
                let room = {
                    let mut slot = this.slot.lock().await;
                    let Some(call) = slot.as_mut() else { return };
                    if call.epoch != epoch || call.info.phase != CallPhase::Connected {
                        return;
                    }
                    call.info.phase = CallPhase::Reconnecting;
                    let handle = Self::arm_timer(
                        this,
                        TimerKind::Reconnect,
                        this.cfg.reconnect_timeout,
                        epoch,
                    );
                    call.timers.set(TimerKind::Reconnect, handle);
                    call.info.room.clone()
                };
                tracing::warn!(room = %room, "connectivity lost, reconnecting");
                this.emit(CallEvent::PhaseChanged {
                    room,
                    phase: CallPhase::Reconnecting,
                });
                // Grace window: brief blips recover on their own without a
                // restart.
                let core = Arc::clone(this);
                let grace = this.cfg.restart_grace;
                tokio::spawn(async move {
                    sleep(grace).await;
                    Self::attempt_restart(&core, epoch).await;
                });
            }
            NegotiationEvent::Connectivity(crate::negotiation::ConnectivityState::Failed) => {
                let room = {
                    let mut slot = this.slot.lock().await;
                    let Some(call) = slot.as_mut() else { return };
                    if call.epoch != epoch
                        || !matches!(
                            call.info.phase,
                            CallPhase::Connecting | CallPhase::Connected | CallPhase::Reconnecting
                        )
                    {
                        return;
                    }
                    if call.info.phase != CallPhase::Reconnecting {
                        call.info.phase = CallPhase::Reconnecting;
                        let handle = Self::arm_timer(
                            this,
                            TimerKind::Reconnect,
                            this.cfg.reconnect_timeout,
                            epoch,
                        );
                        call.timers.set(TimerKind::Reconnect, handle);
                        Some(call.info.room.clone())
                    } else {
                        None
                    }
                };
                if let Some(room) = room {
                    this.emit(CallEvent::PhaseChanged {
                        room,
                        phase: CallPhase::Reconnecting,
                    });
                }
                let core = Arc::clone(this);
                tokio::spawn(async move {
                    Self::attempt_restart(&core, epoch).await;
                });
            }
            NegotiationEvent::Connectivity(_) => {}
        }
    }

    async fn attempt_restart(this: &Arc<Self>, epoch: u64) {
        let coordinator = {
            let slot = this.slot.lock().await;
            match slot.as_ref() {
                Some(call)
                    if call.epoch == epoch && call.info.phase == CallPhase::Reconnecting =>
                {
                    call.coordinator.clone()
                }
                _ => return,
            }
        };
        let Some(coordinator) = coordinator else { return };
        match coordinator.restart().await {
            Ok(RestartOutcome::Started | RestartOutcome::AlreadyInProgress) => {}
            Ok(RestartOutcome::AttemptsExhausted) => {
                tracing::warn!("restart attempts exhausted, failing call");
                Self::teardown(this, None, EndReason::ConnectionFailed, BackendNotify::End, true)
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "restart failed, failing call");
                Self::teardown(this, None, EndReason::ConnectionFailed, BackendNotify::End, true)
                    .await;
            }
        }
    }

    fn spawn_teardown(
        this: &Arc<Self>,
        room: RoomId,
        reason: EndReason,
        notify: BackendNotify,
        send_hangup: bool,
    ) {
        let core = Arc::clone(this);
        tokio::spawn(async move {
            Self::teardown(&core, Some(&room), reason, notify, send_hangup).await;
        });
    }

    /// The single teardown routine every ending converges on.
    ///
    /// Guarded by one mutual-exclusion gate: any request to tear down while
    /// teardown is underway is a no-op. Only this routine closes the
    /// capture stream and the negotiation handle.
    async fn teardown(
        this: &Arc<Self>,
        room_filter: Option<&RoomId>,
        reason: EndReason,
        notify: BackendNotify,
        send_hangup: bool,
    ) {
        let Ok(_gate) = this.teardown_gate.try_lock() else {
            tracing::debug!("teardown already in progress");
            return;
        };

        let mut slot = this.slot.lock().await;
        let Some(call) = slot.as_mut() else { return };
        if let Some(wanted) = room_filter {
            if call.info.room != *wanted {
                return;
            }
        }
        if call.info.phase.is_terminal() {
            return;
        }

        call.timers.clear_all();
        for task in call.tasks.drain(..) {
            task.abort();
        }
        let coordinator = call.coordinator.take();
        let room = call.info.room.clone();
        let epoch = call.epoch;
        let remote = call
            .info
            .peer
            .as_ref()
            .map(|p| p.id)
            .or_else(|| coordinator.as_ref().and_then(|c| c.remote()));
        let terminal = if matches!(reason, EndReason::ConnectionFailed | EndReason::MediaDenied) {
            CallPhase::Failed
        } else {
            CallPhase::Ended
        };
        call.info.phase = terminal;
        drop(slot);

        tracing::info!(room = %room, reason = %reason, phase = ?terminal, "tearing down call");

        if let Some(coordinator) = coordinator {
            coordinator.close().await;
        }
        this.media.release().await;
        this.router.unregister_consumer();
        this.router.set_active_session(None);

        if send_hangup {
            if let Some(remote) = remote {
                if this.router.note_hangup_sent(&room) {
                    let signal = Signal::hangup(room.clone(), this.local.id, reason);
                    if let Err(e) = this.link.send_signal(remote, &signal).await {
                        tracing::debug!(error = %e, "failed to send hangup signal");
                    }
                }
            }
        }

        let backend_result = match notify {
            BackendNotify::End => tokio::time::timeout(
                this.cfg.backend_rpc_timeout,
                this.backend.end(&room, reason),
            )
            .await
            .map_err(|_| "timed out".to_string())
            .and_then(|r| r.map_err(|e| e.to_string())),
            BackendNotify::Decline => tokio::time::timeout(
                this.cfg.backend_rpc_timeout,
                this.backend.decline(&room),
            )
            .await
            .map_err(|_| "timed out".to_string())
            .and_then(|r| r.map_err(|e| e.to_string())),
            BackendNotify::Nothing => Ok(()),
        };
        if let Err(e) = backend_result {
            tracing::debug!(error = %e, "backend notification failed");
        }

        this.emit(CallEvent::PhaseChanged {
            room: room.clone(),
            phase: terminal,
        });
        this.emit(CallEvent::CallEnded {
            room: Some(room.clone()),
            reason,
        });

        // Reset to idle after a grace delay so a call started right away
        // cannot race in-flight cleanup.
        let core = Arc::clone(this);
        let delay = this.cfg.idle_reset_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let mut slot = core.slot.lock().await;
            if slot.as_ref().is_some_and(|c| c.epoch == epoch) {
                *slot = None;
                core.router.set_active_room(None);
                drop(slot);
                core.emit(CallEvent::PhaseChanged {
                    room,
                    phase: CallPhase::Idle,
                });
            }
        });
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    local: Peer,
    router: Arc<SignalRouter>,
    link: Arc<ReliableLink<T>>,
    media: Arc<MediaController<D>>,
    backend: Arc<B>,
    factory: Arc<F>,
    cfg: CallServiceConfig,
}

impl<F, B, D, T> CallServiceBuilder<F, B, D, T>
where
    F: PeerSessionFactory,
    B: CallBackend,
    D: CaptureDevices,
    T: SignalTransport,
{
    /// Override the configuration
    #[must_use]
    pub fn with_config(mut self, cfg: CallServiceConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Build the service
    #[must_use]
    pub fn build(self) -> CallService<F, B, D, T> {
        CallService::new(
            self.local,
            self.router,
            self.link,
            self.media,
            self.backend,
            self.factory,
            self.cfg,
        )
    }
}

//! Shared test doubles and harness wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use ember_call_core::{
    Admission, CallBackend, CallEvent, CallKind, CallPhase, CallService, CallServiceConfig,
    CameraFacing, CaptureDevices, CaptureFailure, ConnectivityState, DeviceEvent, IceCandidate,
    LinkState, LocalStream, LoopbackHub, LoopbackTransport, MediaConfig, MediaController,
    NegotiationConfig, Peer, PeerSession, PeerSessionError, PeerSessionEvent, PeerSessionFactory,
    ReliabilityConfig, ReliableLink, RoomId, RouterConfig, SessionDescription, SessionId, Signal,
    SignalKind, SignalRouter, SignalTransport, TrackHandle, TrackKind, UserId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(120);

/// Route crate logs into the test harness; `RUST_LOG=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Backend stub with call counters and a scriptable admission outcome.
pub struct MockBackend {
    admission: Mutex<Admission>,
    admit_delay: Mutex<Duration>,
    admits: AtomicU32,
    accepts: AtomicU32,
    declines: AtomicU32,
    ends: AtomicU32,
}

#[derive(Error, Debug)]
#[error("backend unavailable")]
pub struct BackendDown;

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            admission: Mutex::new(Admission::Admitted {
                session_id: SessionId(11),
            }),
            admit_delay: Mutex::new(Duration::ZERO),
            admits: AtomicU32::new(0),
            accepts: AtomicU32::new(0),
            declines: AtomicU32::new(0),
            ends: AtomicU32::new(0),
        })
    }

    pub fn set_admission(&self, outcome: Admission) {
        *self.admission.lock() = outcome;
    }

    pub fn set_admit_delay(&self, delay: Duration) {
        *self.admit_delay.lock() = delay;
    }

    pub fn admits(&self) -> u32 {
        self.admits.load(Ordering::SeqCst)
    }

    pub fn accepts(&self) -> u32 {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn declines(&self) -> u32 {
        self.declines.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> u32 {
        self.ends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallBackend for MockBackend {
    type Error = BackendDown;

    async fn admit(
        &self,
        _room: &RoomId,
        _callee: UserId,
        _kind: CallKind,
    ) -> Result<Admission, Self::Error> {
        self.admits.fetch_add(1, Ordering::SeqCst);
        let delay = *self.admit_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        Ok(self.admission.lock().clone())
    }

    async fn accept(&self, _room: &RoomId) -> Result<SessionId, Self::Error> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(SessionId(11))
    }

    async fn decline(&self, _room: &RoomId) -> Result<(), Self::Error> {
        self.declines.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(
        &self,
        _room: &RoomId,
        _reason: ember_call_core::EndReason,
    ) -> Result<(), Self::Error> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scriptable media session double.
pub struct MockPeerSession {
    has_video: bool,
    events: broadcast::Sender<PeerSessionEvent>,
    pub remote_descs: Mutex<Vec<SessionDescription>>,
    pub applied: Mutex<Vec<IceCandidate>>,
    connectivity: Mutex<ConnectivityState>,
    pub closed: AtomicBool,
    pub replaced_tracks: Mutex<Vec<String>>,
}

impl MockPeerSession {
    fn new(has_video: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            has_video,
            events,
            remote_descs: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            connectivity: Mutex::new(ConnectivityState::New),
            closed: AtomicBool::new(false),
            replaced_tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn emit_connectivity(&self, state: ConnectivityState) {
        *self.connectivity.lock() = state;
        let _ = self.events.send(PeerSessionEvent::Connectivity(state));
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(PeerSessionEvent::LocalCandidate(candidate));
    }

    fn sdp(&self) -> String {
        if self.has_video {
            "v=0\r\nm=audio 9 RTP/AVP 0\r\nm=video 9 RTP/AVP 96\r\n".to_string()
        } else {
            "v=0\r\nm=audio 9 RTP/AVP 0\r\n".to_string()
        }
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerSessionError> {
        let mut d = SessionDescription::offer(self.sdp());
        d.ice_restart = ice_restart;
        Ok(d)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerSessionError> {
        Ok(SessionDescription::answer(self.sdp()))
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
        self.remote_descs.lock().push(description.clone());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerSessionError> {
        self.applied.lock().push(candidate.clone());
        Ok(())
    }

    async fn attach_local(&self, _stream: &LocalStream) -> Result<(), PeerSessionError> {
        Ok(())
    }

    async fn replace_video_track(&self, track_id: &str) -> Result<(), PeerSessionError> {
        self.replaced_tracks.lock().push(track_id.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.connectivity.lock() = ConnectivityState::Closed;
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.lock()
    }

    fn events(&self) -> broadcast::Receiver<PeerSessionEvent> {
        self.events.subscribe()
    }
}

/// Factory recording every session it creates.
pub struct MockFactory {
    pub sessions: Mutex<Vec<Arc<MockPeerSession>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn latest(&self) -> Arc<MockPeerSession> {
        self.sessions
            .lock()
            .last()
            .cloned()
            .expect("no peer session created yet")
    }
}

#[async_trait]
impl PeerSessionFactory for MockFactory {
    type Session = MockPeerSession;

    async fn create(&self, kind: CallKind) -> Result<Arc<MockPeerSession>, PeerSessionError> {
        let session = MockPeerSession::new(kind.includes_video());
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Always-working real-hardware capture devices.
pub struct MockDevices {
    counter: AtomicU32,
    released: Mutex<Vec<String>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl MockDevices {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            counter: AtomicU32::new(0),
            released: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn released_count(&self) -> usize {
        self.released.lock().len()
    }

    pub fn end_track(&self, track_id: &str) {
        let _ = self.events.send(DeviceEvent::TrackEnded {
            track_id: track_id.to_string(),
        });
    }
}

#[async_trait]
impl CaptureDevices for MockDevices {
    async fn acquire_stream(
        &self,
        include_video: bool,
        camera: CameraFacing,
    ) -> Result<LocalStream, CaptureFailure> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream {
            audio: Some(TrackHandle {
                id: format!("mic-{n}"),
                kind: TrackKind::Audio,
            }),
            video: include_video.then(|| TrackHandle {
                id: format!("cam-{}-{n}", camera.as_str()),
                kind: TrackKind::Video,
            }),
            audio_enabled: true,
            video_enabled: include_video,
            speaker_on: false,
            camera,
        })
    }

    async fn acquire_camera(&self, facing: CameraFacing) -> Result<TrackHandle, CaptureFailure> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(TrackHandle {
            id: format!("cam-{}-{n}", facing.as_str()),
            kind: TrackKind::Video,
        })
    }

    async fn release_track(&self, track_id: &str) {
        self.released.lock().push(track_id.to_string());
    }

    fn is_virtual_hardware(&self) -> bool {
        false
    }

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

/// Short timeouts so paused-clock tests fast-forward through every phase.
pub fn fast_service_cfg() -> CallServiceConfig {
    CallServiceConfig {
        ringing_timeout: Duration::from_secs(3),
        connecting_timeout: Duration::from_secs(2),
        reconnect_timeout: Duration::from_secs(2),
        restart_grace: Duration::from_millis(200),
        idle_reset_delay: Duration::from_millis(500),
        backend_rpc_timeout: Duration::from_secs(1),
        max_duration: None,
        negotiation: NegotiationConfig {
            max_restart_attempts: 3,
        },
    }
}

pub fn fast_link_cfg() -> ReliabilityConfig {
    ReliabilityConfig {
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(400),
        heartbeat_interval: Duration::from_millis(500),
        heartbeat_deadline: Duration::from_millis(200),
        watchdog_timeout: Duration::from_secs(2),
        watchdog_poll: Duration::from_millis(250),
        state_debounce: Duration::from_millis(100),
    }
}

/// Fully wired call service over a loopback hub.
pub struct Harness {
    pub hub: LoopbackHub,
    pub router: Arc<SignalRouter>,
    pub link: Arc<ReliableLink<LoopbackTransport>>,
    pub media: Arc<MediaController<MockDevices>>,
    pub devices: Arc<MockDevices>,
    pub backend: Arc<MockBackend>,
    pub factory: Arc<MockFactory>,
    pub service: CallService<MockFactory, MockBackend, MockDevices, LoopbackTransport>,
    pub local: Peer,
}

impl Harness {
    pub async fn start(local_id: u64) -> (Self, broadcast::Receiver<CallEvent>) {
        Self::start_with_config(local_id, fast_service_cfg()).await
    }

    pub async fn start_with_config(
        local_id: u64,
        cfg: CallServiceConfig,
    ) -> (Self, broadcast::Receiver<CallEvent>) {
        init_tracing();
        let hub = LoopbackHub::new();
        let router = Arc::new(SignalRouter::new(RouterConfig::default()));
        let link = Arc::new(ReliableLink::new(
            Arc::new(hub.endpoint()),
            UserId::new(local_id),
            fast_link_cfg(),
        ));
        let devices = MockDevices::new();
        let media = Arc::new(MediaController::new(
            Arc::clone(&devices),
            MediaConfig::default(),
        ));
        let backend = MockBackend::new();
        let factory = MockFactory::new();
        let local = Peer::new(local_id, "me");
        let service = CallService::new(
            local.clone(),
            Arc::clone(&router),
            Arc::clone(&link),
            Arc::clone(&media),
            Arc::clone(&backend),
            Arc::clone(&factory),
            cfg,
        );
        let events = service.subscribe_events();
        let mut states = link.states();
        service.start();
        loop {
            let state = timeout(WAIT, states.recv())
                .await
                .expect("timed out waiting for link")
                .expect("link state channel closed");
            if state == LinkState::Connected {
                break;
            }
        }
        (
            Self {
                hub,
                router,
                link,
                media,
                devices,
                backend,
                factory,
                service,
                local,
            },
            events,
        )
    }
}

/// The far side of a call: its own transport endpoint plus an inbox.
pub struct RemotePeer {
    pub peer: Peer,
    transport: Arc<LoopbackTransport>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
    target: String,
}

impl RemotePeer {
    pub async fn new(hub: &LoopbackHub, id: u64, name: &str, local: UserId) -> Self {
        let transport = Arc::new(hub.endpoint());
        transport.connect(UserId::new(id)).await.expect("connect");
        transport
            .subscribe(&UserId::new(id).signal_destination())
            .await
            .expect("subscribe");
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Ok(signal) = pump.recv().await {
                if tx.send(signal).is_err() {
                    break;
                }
            }
        });
        Self {
            peer: Peer::new(id, name),
            transport,
            inbox: tokio::sync::Mutex::new(rx),
            target: local.signal_destination(),
        }
    }

    pub async fn send(&self, signal: Signal) {
        self.transport
            .publish(&self.target, &signal)
            .await
            .expect("publish");
    }

    pub async fn next_signal(&self) -> Signal {
        timeout(WAIT, self.inbox.lock().await.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("peer inbox closed")
    }

    pub async fn next_signal_of(&self, kind: SignalKind) -> Signal {
        loop {
            let signal = self.next_signal().await;
            if signal.kind == kind {
                return signal;
            }
        }
    }

    /// Drain signals until nothing arrives for a second.
    pub async fn collect_until_quiet(&self) -> Vec<Signal> {
        let mut collected = Vec::new();
        loop {
            let mut inbox = self.inbox.lock().await;
            match timeout(Duration::from_secs(1), inbox.recv()).await {
                Ok(Some(signal)) => collected.push(signal),
                Ok(None) | Err(_) => return collected,
            }
        }
    }
}

pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<CallEvent>,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for call event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

pub async fn wait_for_phase(rx: &mut broadcast::Receiver<CallEvent>, wanted: CallPhase) {
    wait_for_event(rx, |e| {
        matches!(e, CallEvent::PhaseChanged { phase, .. } if *phase == wanted)
    })
    .await;
}

pub fn offer_signal(from: &Peer, room: &RoomId, session_id: Option<SessionId>, video: bool) -> Signal {
    let sdp = if video {
        "v=0\r\nm=audio 9 RTP/AVP 0\r\nm=video 9 RTP/AVP 96\r\n"
    } else {
        "v=0\r\nm=audio 9 RTP/AVP 0\r\n"
    };
    let mut signal = Signal::offer(room.clone(), from, session_id, SessionDescription::offer(sdp));
    signal.session_id = session_id;
    signal
}

pub fn answer_signal(from: u64, room: &RoomId, session_id: Option<SessionId>) -> Signal {
    Signal::answer(
        room.clone(),
        UserId::new(from),
        session_id,
        SessionDescription::answer("v=0\r\nm=audio 9 RTP/AVP 0\r\n"),
    )
}

pub fn candidate_signal(from: u64, room: &RoomId, payload: &str) -> Signal {
    Signal::candidate(
        room.clone(),
        UserId::new(from),
        None,
        IceCandidate {
            candidate: payload.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        },
    )
}

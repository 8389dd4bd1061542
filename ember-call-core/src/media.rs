//! Local capture stream management
//!
//! Acquires and releases the microphone/camera stream, owns the mute,
//! camera and speaker toggles, and absorbs device-level failures (a track
//! ending because hardware went away disables that track and re-emits the
//! stream, it never kills the call).
//!
//! Actual device access lives behind [`CaptureDevices`]; the platform shells
//! provide the real implementation, tests provide scripted ones. Emulators
//! and CI machines report virtual hardware, where acquisition gets a shorter
//! timeout and degrades to an empty stream instead of failing the call flow.

use crate::negotiation::PeerSession;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Which camera a video track captures from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    /// Selfie camera
    Front,
    /// Rear camera
    Back,
}

impl CameraFacing {
    /// The other camera
    #[must_use]
    pub const fn flipped(&self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }

    /// Static name for logging and track ids
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }
}

/// Kind of a capture track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

/// Handle to one capture track owned by the device layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    /// Device-layer track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// The local capture stream as exposed to the UI and the peer session
#[derive(Debug, Clone)]
pub struct LocalStream {
    /// Microphone track, if acquired
    pub audio: Option<TrackHandle>,
    /// Camera track, if acquired
    pub video: Option<TrackHandle>,
    /// Microphone live (false = muted or device lost)
    pub audio_enabled: bool,
    /// Camera live (false = toggled off or device lost)
    pub video_enabled: bool,
    /// Loudspeaker routing flag
    pub speaker_on: bool,
    /// Which camera the video track uses
    pub camera: CameraFacing,
}

impl LocalStream {
    /// Degraded stream with no tracks; keeps the call flow exercisable on
    /// virtual hardware
    #[must_use]
    pub fn empty() -> Self {
        Self {
            audio: None,
            video: None,
            audio_enabled: false,
            video_enabled: false,
            speaker_on: false,
            camera: CameraFacing::Front,
        }
    }

    /// Whether a camera track is present
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

/// Device-level events from the capture layer
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A capture track terminated (hardware unplugged, OS revoked)
    TrackEnded {
        /// Track that ended
        track_id: String,
    },
}

/// Failures reported by the device layer
#[derive(Error, Debug)]
pub enum CaptureFailure {
    /// User or OS denied capture permission
    #[error("capture permission denied")]
    PermissionDenied,
    /// Requested device does not exist
    #[error("no such capture device: {0}")]
    NoDevice(String),
    /// Hardware-level failure
    #[error("capture hardware failure: {0}")]
    Hardware(String),
}

/// Platform capture devices.
///
/// Implemented by the mobile shells over their native capture APIs.
#[async_trait]
pub trait CaptureDevices: Send + Sync + 'static {
    /// Acquire a local stream with a microphone track and, when requested,
    /// the given camera.
    ///
    /// # Errors
    ///
    /// Returns error if devices cannot be acquired.
    async fn acquire_stream(
        &self,
        include_video: bool,
        camera: CameraFacing,
    ) -> Result<LocalStream, CaptureFailure>;

    /// Acquire a camera track without touching the rest of the stream.
    ///
    /// # Errors
    ///
    /// Returns error if the camera cannot be acquired.
    async fn acquire_camera(&self, facing: CameraFacing) -> Result<TrackHandle, CaptureFailure>;

    /// Release one track back to the device layer
    async fn release_track(&self, track_id: &str);

    /// Whether this machine reports emulated/virtual capture hardware
    fn is_virtual_hardware(&self) -> bool;

    /// Subscribe to device events
    fn events(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// Media controller tuning knobs
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Acquisition timeout on real hardware
    pub capture_timeout: Duration,
    /// Acquisition timeout on virtual hardware
    pub virtual_capture_timeout: Duration,
    /// Minimum interval between camera switches
    pub camera_switch_min_interval: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_secs(10),
            virtual_capture_timeout: Duration::from_secs(2),
            camera_switch_min_interval: Duration::from_millis(1000),
        }
    }
}

/// Media controller errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Devices unavailable on real hardware
    #[error("camera/microphone access denied or unavailable")]
    AccessDenied,
    /// Operation needs an acquired stream
    #[error("no active local stream")]
    NoActiveStream,
    /// Camera switch without a video track
    #[error("no video track to switch")]
    NoVideoTrack,
    /// Camera switch failed; previous camera stays active
    #[error("camera switch failed: {0}")]
    CameraSwitchFailed(String),
}

/// How a camera switch request resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The camera was swapped
    Switched,
    /// A switch was in progress or inside the debounce window; no-op
    Skipped,
}

/// Events emitted by the controller
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The local stream changed (acquired, toggled, swapped, device lost)
    LocalStreamChanged(LocalStream),
}

/// Owns the local capture stream for the active call.
pub struct MediaController<D: CaptureDevices> {
    devices: Arc<D>,
    cfg: MediaConfig,
    stream: Mutex<Option<LocalStream>>,
    switch_gate: tokio::sync::Mutex<()>,
    last_switch: Mutex<Option<Instant>>,
    events: broadcast::Sender<MediaEvent>,
}

impl<D: CaptureDevices> MediaController<D> {
    /// Create a controller over the platform device layer
    #[must_use]
    pub fn new(devices: Arc<D>, cfg: MediaConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            devices,
            cfg,
            stream: Mutex::new(None),
            switch_gate: tokio::sync::Mutex::new(()),
            last_switch: Mutex::new(None),
            events,
        }
    }

    /// Subscribe to media events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the current local stream
    #[must_use]
    pub fn current(&self) -> Option<LocalStream> {
        self.stream.lock().clone()
    }

    /// Acquire the local capture stream.
    ///
    /// Acquisition is bounded: the timeout is shorter on virtual hardware,
    /// where failure degrades to an empty stream so the call flow still
    /// works end to end. On real hardware failure is surfaced as
    /// [`MediaError::AccessDenied`].
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::AccessDenied`] on real-hardware failure.
    #[tracing::instrument(skip(self))]
    pub async fn acquire_local_media(&self, include_video: bool) -> Result<LocalStream, MediaError> {
        let virtual_hw = self.devices.is_virtual_hardware();
        let window = if virtual_hw {
            self.cfg.virtual_capture_timeout
        } else {
            self.cfg.capture_timeout
        };

        let acquired = tokio::time::timeout(
            window,
            self.devices.acquire_stream(include_video, CameraFacing::Front),
        )
        .await;

        match acquired {
            Ok(Ok(stream)) => {
                *self.stream.lock() = Some(stream.clone());
                self.emit(stream.clone());
                tracing::debug!(video = include_video, "local media acquired");
                Ok(stream)
            }
            Ok(Err(failure)) if virtual_hw => {
                tracing::warn!(error = %failure, "virtual hardware capture failed, degrading to empty stream");
                Ok(self.install_empty_stream())
            }
            Err(_) if virtual_hw => {
                tracing::warn!("virtual hardware capture timed out, degrading to empty stream");
                Ok(self.install_empty_stream())
            }
            Ok(Err(failure)) => {
                tracing::warn!(error = %failure, "capture failed");
                Err(MediaError::AccessDenied)
            }
            Err(_) => {
                tracing::warn!("capture timed out");
                Err(MediaError::AccessDenied)
            }
        }
    }

    /// Toggle the microphone; returns the new enabled state.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoActiveStream`] when nothing is acquired.
    pub fn toggle_audio(&self) -> Result<bool, MediaError> {
        self.mutate_stream(|s| {
            s.audio_enabled = !s.audio_enabled;
            s.audio_enabled
        })
    }

    /// Toggle the camera; returns the new enabled state.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoActiveStream`] when nothing is acquired.
    pub fn toggle_video(&self) -> Result<bool, MediaError> {
        self.mutate_stream(|s| {
            s.video_enabled = !s.video_enabled;
            s.video_enabled
        })
    }

    /// Toggle loudspeaker routing; returns the new state.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoActiveStream`] when nothing is acquired.
    pub fn toggle_speaker(&self) -> Result<bool, MediaError> {
        self.mutate_stream(|s| {
            s.speaker_on = !s.speaker_on;
            s.speaker_on
        })
    }

    /// Swap front/back camera.
    ///
    /// Self-exclusive (a switch already in flight makes this a no-op) and
    /// debounced. The new camera is acquired before the old one is touched,
    /// and the swap only commits if the peer session's track replacement
    /// succeeds; on failure the old camera stays active.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::CameraSwitchFailed`] when acquisition or track
    /// replacement fails; the previous camera is still live then.
    #[tracing::instrument(skip(self, session))]
    pub async fn switch_camera<S: PeerSession>(
        &self,
        session: &S,
    ) -> Result<SwitchOutcome, MediaError> {
        let Ok(_gate) = self.switch_gate.try_lock() else {
            tracing::debug!("camera switch already in progress");
            return Ok(SwitchOutcome::Skipped);
        };
        if let Some(last) = *self.last_switch.lock() {
            if last.elapsed() < self.cfg.camera_switch_min_interval {
                tracing::debug!("camera switch inside debounce window");
                return Ok(SwitchOutcome::Skipped);
            }
        }

        let (old_track, target) = {
            let stream = self.stream.lock();
            let stream = stream.as_ref().ok_or(MediaError::NoActiveStream)?;
            let old = stream.video.clone().ok_or(MediaError::NoVideoTrack)?;
            (old, stream.camera.flipped())
        };

        let new_track = tokio::time::timeout(
            self.cfg.capture_timeout,
            self.devices.acquire_camera(target),
        )
        .await
        .map_err(|_| MediaError::CameraSwitchFailed("camera acquisition timed out".into()))?
        .map_err(|e| MediaError::CameraSwitchFailed(e.to_string()))?;

        if let Err(e) = session.replace_video_track(&new_track.id).await {
            self.devices.release_track(&new_track.id).await;
            tracing::warn!(error = %e, "track replacement failed, keeping previous camera");
            return Err(MediaError::CameraSwitchFailed(e.to_string()));
        }

        let updated = {
            let mut stream = self.stream.lock();
            let Some(s) = stream.as_mut() else {
                return Err(MediaError::NoActiveStream);
            };
            s.video = Some(new_track);
            s.camera = target;
            s.clone()
        };
        self.devices.release_track(&old_track.id).await;
        *self.last_switch.lock() = Some(Instant::now());
        self.emit(updated);
        tracing::info!(camera = target.as_str(), "camera switched");
        Ok(SwitchOutcome::Switched)
    }

    /// Spawn the watcher that reacts to device-level track termination by
    /// disabling the affected track and re-emitting the stream.
    pub fn spawn_device_watch(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.devices.events();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DeviceEvent::TrackEnded { track_id }) => {
                        self.on_track_ended(&track_id);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "lagged on device events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Release the stream and every track it owns; idempotent
    pub async fn release(&self) {
        let stream = self.stream.lock().take();
        let Some(stream) = stream else { return };
        if let Some(t) = &stream.audio {
            self.devices.release_track(&t.id).await;
        }
        if let Some(t) = &stream.video {
            self.devices.release_track(&t.id).await;
        }
        tracing::debug!("local media released");
    }

    fn on_track_ended(&self, track_id: &str) {
        let updated = {
            let mut stream = self.stream.lock();
            let Some(s) = stream.as_mut() else { return };
            if s.audio.as_ref().is_some_and(|t| t.id == track_id) {
                s.audio_enabled = false;
            } else if s.video.as_ref().is_some_and(|t| t.id == track_id) {
                s.video_enabled = false;
            } else {
                return;
            }
            s.clone()
        };
        tracing::warn!(track_id, "capture track ended, track disabled");
        self.emit(updated);
    }

    fn mutate_stream(&self, f: impl FnOnce(&mut LocalStream) -> bool) -> Result<bool, MediaError> {
        let updated = {
            let mut stream = self.stream.lock();
            let s = stream.as_mut().ok_or(MediaError::NoActiveStream)?;
            let value = f(s);
            (value, s.clone())
        };
        self.emit(updated.1);
        Ok(updated.0)
    }

    fn install_empty_stream(&self) -> LocalStream {
        let stream = LocalStream::empty();
        *self.stream.lock() = Some(stream.clone());
        self.emit(stream.clone());
        stream
    }

    fn emit(&self, stream: LocalStream) {
        let _ = self.events.send(MediaEvent::LocalStreamChanged(stream));
    }
}

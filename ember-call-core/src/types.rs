//! Call session types and the signaling data model
//!
//! Everything that crosses the signaling transport is a [`Signal`]: a small
//! structured record the backend relays between the two parties of a call.
//! The transport is at-least-once and unordered, so nothing in this module
//! assumes a signal arrives exactly once or in the order it was sent.

use crate::identity::{Peer, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Room identifier, globally unique per call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap an existing room identifier (e.g. received in a signal)
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generate a fresh room identifier for a new call attempt
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Room identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is structurally usable
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-assigned call session identifier.
///
/// Issued once a call is admitted; signals carrying a different session id
/// than the locally active one are stale leftovers of a superseded session
/// and are dropped at the router (offers excepted, they establish sessions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub i64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What media a call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio only
    Voice,
    /// Audio and camera video
    Video,
}

impl CallKind {
    /// Whether this kind carries a camera track
    #[must_use]
    pub const fn includes_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Who placed the call, from the local point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We are the caller
    Outgoing,
    /// We are being called
    Incoming,
}

/// Call lifecycle state.
///
/// ```text
/// Idle -> Initiating -> Ringing -> Connecting -> Connected <-> Reconnecting
///                                                   |               |
///                                                   v               v
///                                              Ended|Failed ----> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    /// No active session
    Idle,
    /// Backend call-admission request in flight
    Initiating,
    /// Waiting for remote accept (outgoing) or local accept (incoming)
    Ringing,
    /// Offer/answer negotiation in progress
    Connecting,
    /// Media flowing, duration timer running
    Connected,
    /// Connectivity lost, restart in progress
    Reconnecting,
    /// Terminal: ended normally
    Ended,
    /// Terminal: ended by an unrecoverable error
    Failed,
}

impl CallPhase {
    /// Terminal states reset to [`CallPhase::Idle`] after a grace delay
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether a session currently occupies the call slot
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Why a call ended.
///
/// These are expected operational outcomes, not faults; they ride the same
/// event channel the UI already observes and render as short human-readable
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Ringing, connecting or max-duration window elapsed
    Timeout,
    /// Receiver explicitly declined
    Declined,
    /// Receiver was already in another call
    Busy,
    /// Caller cancelled before the call was answered
    Cancelled,
    /// Remote party hung up
    RemoteEnded,
    /// Negotiation restarts exhausted or connect window elapsed
    ConnectionFailed,
    /// Camera/microphone could not be acquired
    MediaDenied,
    /// Local user hung up
    LocalHangup,
}

impl EndReason {
    /// Short user-facing reason string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Declined => "declined",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::RemoteEnded => "remote-ended",
            Self::ConnectionFailed => "connection-failed",
            Self::MediaDenied => "media-denied",
            Self::LocalHangup => "hangup",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which half of the offer/answer exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Caller-side description
    Offer,
    /// Callee-side description
    Answer,
}

/// A negotiated session description exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
    /// Set on offers that restart negotiation on an established session
    #[serde(default)]
    pub ice_restart: bool,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
            ice_restart: false,
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
            ice_restart: false,
        }
    }

    /// Whether the description negotiates a video section
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.sdp.lines().any(|l| l.starts_with("m=video"))
    }
}

/// One connectivity candidate proposed by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// End-of-gathering markers carry an empty candidate string
    #[must_use]
    pub fn is_end_of_gathering(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Dedup signature: payload plus media line index
    #[must_use]
    pub fn signature(&self) -> String {
        format!(
            "{}#{}",
            self.candidate,
            self.sdp_mline_index.map_or(-1, i32::from)
        )
    }
}

/// Signal types relayed over the message transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Connectivity candidate
    IceCandidate,
    /// Call termination (also carries busy/decline rejections via `reason`)
    Hangup,
    /// Remote-side error report
    Error,
}

impl SignalKind {
    /// Static name for tracing fields
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Hangup => "hangup",
            Self::Error => "error",
        }
    }
}

/// Negotiation payload carried by offer/answer/candidate signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    /// Session description (offers and answers)
    Description(SessionDescription),
    /// Connectivity candidate
    Candidate(IceCandidate),
}

/// One signaling message.
///
/// Signals are transient value objects: the router owns them for
/// dedup/queuing and then hands them to the negotiation coordinator by
/// reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Message type
    pub kind: SignalKind,
    /// Target room
    pub room: RoomId,
    /// Sender account id
    pub sender: UserId,
    /// Sender display name (offers carry it so incoming UI can render)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Backend session id, absent until the call is admitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Negotiation payload for offer/answer/candidate signals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SignalPayload>,
    /// Termination reason for hangup signals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
    /// Wall-clock send time, part of the dedup identity
    pub sent_at: DateTime<Utc>,
}

/// Structural validation failures, dropped at the router with diagnostics only
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalShapeError {
    /// Room identifier empty or missing
    #[error("signal has an empty room identifier")]
    EmptyRoom,
    /// Offer or answer without a description payload
    #[error("{0} signal is missing its session description")]
    MissingDescription(&'static str),
    /// Description payload of the wrong half (offer vs answer)
    #[error("description kind does not match signal kind")]
    DescriptionKindMismatch,
    /// Candidate signal without a candidate payload
    #[error("candidate signal is missing its candidate payload")]
    MissingCandidate,
    /// Candidate with neither sdp_mid nor sdp_mline_index
    #[error("candidate carries neither sdp_mid nor sdp_mline_index")]
    UnidentifiedCandidate,
}

impl Signal {
    /// Build an offer signal
    #[must_use]
    pub fn offer(
        room: RoomId,
        sender: &Peer,
        session_id: Option<SessionId>,
        description: SessionDescription,
    ) -> Self {
        Self {
            kind: SignalKind::Offer,
            room,
            sender: sender.id,
            sender_name: Some(sender.display_name.clone()),
            session_id,
            payload: Some(SignalPayload::Description(description)),
            reason: None,
            sent_at: Utc::now(),
        }
    }

    /// Build an answer signal
    #[must_use]
    pub fn answer(
        room: RoomId,
        sender: UserId,
        session_id: Option<SessionId>,
        description: SessionDescription,
    ) -> Self {
        Self {
            kind: SignalKind::Answer,
            room,
            sender,
            sender_name: None,
            session_id,
            payload: Some(SignalPayload::Description(description)),
            reason: None,
            sent_at: Utc::now(),
        }
    }

    /// Build a candidate signal
    #[must_use]
    pub fn candidate(
        room: RoomId,
        sender: UserId,
        session_id: Option<SessionId>,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            kind: SignalKind::IceCandidate,
            room,
            sender,
            sender_name: None,
            session_id,
            payload: Some(SignalPayload::Candidate(candidate)),
            reason: None,
            sent_at: Utc::now(),
        }
    }

    /// Build a hangup signal; busy and decline rejections are hangups with
    /// the corresponding reason
    #[must_use]
    pub fn hangup(room: RoomId, sender: UserId, reason: EndReason) -> Self {
        Self {
            kind: SignalKind::Hangup,
            room,
            sender,
            sender_name: None,
            session_id: None,
            payload: None,
            reason: Some(reason),
            sent_at: Utc::now(),
        }
    }

    /// Description payload, if this is an offer/answer signal
    #[must_use]
    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            Some(SignalPayload::Description(d)) => Some(d),
            _ => None,
        }
    }

    /// Candidate payload, if this is a candidate signal
    #[must_use]
    pub fn ice_candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Some(SignalPayload::Candidate(c)) => Some(c),
            _ => None,
        }
    }

    /// Validate the structural invariants of the signal shape.
    ///
    /// # Errors
    ///
    /// Returns the first shape violation found; such signals are dropped at
    /// the router, never surfaced to the user.
    pub fn validate(&self) -> Result<(), SignalShapeError> {
        if self.room.is_empty() {
            return Err(SignalShapeError::EmptyRoom);
        }
        match self.kind {
            SignalKind::Offer => match self.description() {
                None => Err(SignalShapeError::MissingDescription("offer")),
                Some(d) if d.kind != SdpKind::Offer => {
                    Err(SignalShapeError::DescriptionKindMismatch)
                }
                Some(_) => Ok(()),
            },
            SignalKind::Answer => match self.description() {
                None => Err(SignalShapeError::MissingDescription("answer")),
                Some(d) if d.kind != SdpKind::Answer => {
                    Err(SignalShapeError::DescriptionKindMismatch)
                }
                Some(_) => Ok(()),
            },
            SignalKind::IceCandidate => match self.ice_candidate() {
                None => Err(SignalShapeError::MissingCandidate),
                Some(c)
                    if !c.is_end_of_gathering()
                        && c.sdp_mid.is_none()
                        && c.sdp_mline_index.is_none() =>
                {
                    Err(SignalShapeError::UnidentifiedCandidate)
                }
                Some(_) => Ok(()),
            },
            SignalKind::Hangup | SignalKind::Error => Ok(()),
        }
    }

    /// Dedup identity.
    ///
    /// The transport may deliver one logical event twice (direct and
    /// broadcast paths); this key is what makes redelivery harmless.
    /// Candidates are identified by payload signature, everything else by
    /// type + room + sender + send time.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        match self.ice_candidate() {
            Some(c) => format!("cand|{}|{}", self.room, c.signature()),
            None => format!(
                "{}|{}|{}|{}",
                self.kind.as_str(),
                self.room,
                self.sender,
                self.sent_at.timestamp_millis()
            ),
        }
    }
}

/// Everything the UI needs to render one call attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSessionInfo {
    /// Room identifier for this attempt
    pub room: RoomId,
    /// Backend session id, set once admitted/accepted
    pub session_id: Option<SessionId>,
    /// Voice or video
    pub kind: CallKind,
    /// Outgoing or incoming
    pub direction: CallDirection,
    /// Remote party; may be unknown briefly when an incoming call is
    /// accepted from a push notification before its offer arrived
    pub peer: Option<Peer>,
    /// Current lifecycle state
    pub phase: CallPhase,
    /// Set exactly once, when negotiation first completes
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSessionInfo {
    /// Accumulated call duration; `None` until connected.
    ///
    /// Survives reconnects: `connected_at` is never reset once set.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|t| Utc::now() - t)
    }
}

/// Events delivered to the UI layer and native call-screen integration.
///
/// Subscribe via the service's broadcast channel; dropping the receiver
/// unsubscribes.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Lifecycle state changed
    PhaseChanged {
        /// Room of the session that changed
        room: RoomId,
        /// New state
        phase: CallPhase,
    },
    /// An incoming call is ringing
    IncomingCall {
        /// Room to accept or decline with
        room: RoomId,
        /// Caller
        peer: Peer,
        /// Voice or video
        kind: CallKind,
    },
    /// A call reached a terminal outcome
    CallEnded {
        /// Room of the ended session; absent when admission was rejected
        /// before a room existed
        room: Option<RoomId>,
        /// Typed user-facing reason
        reason: EndReason,
    },
    /// Non-fatal problem the user should see (device lost, switch failed)
    Fault {
        /// Short description
        detail: String,
    },
    /// Local capture stream changed (acquired, toggled, camera swapped)
    LocalStreamChanged(crate::media::LocalStream),
    /// Remote media arrived or changed
    RemoteStreamChanged {
        /// Whether the remote stream carries video
        has_video: bool,
    },
    /// Signaling link state changed
    LinkStateChanged(crate::reliability::LinkState),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::Peer;
    use pretty_assertions::assert_eq;

    fn offer_signal() -> Signal {
        Signal::offer(
            RoomId::new("r1"),
            &Peer::new(7u64, "Maya"),
            Some(SessionId(1)),
            SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
        )
    }

    #[test]
    fn room_id_generate_is_unique() {
        assert_ne!(RoomId::generate(), RoomId::generate());
    }

    #[test]
    fn offer_signal_validates() {
        assert_eq!(offer_signal().validate(), Ok(()));
    }

    #[test]
    fn offer_without_description_is_invalid() {
        let mut sig = offer_signal();
        sig.payload = None;
        assert_eq!(
            sig.validate(),
            Err(SignalShapeError::MissingDescription("offer"))
        );
    }

    #[test]
    fn answer_with_offer_description_is_invalid() {
        let mut sig = offer_signal();
        sig.kind = SignalKind::Answer;
        assert_eq!(sig.validate(), Err(SignalShapeError::DescriptionKindMismatch));
    }

    #[test]
    fn empty_room_is_invalid() {
        let mut sig = offer_signal();
        sig.room = RoomId::new("  ");
        assert_eq!(sig.validate(), Err(SignalShapeError::EmptyRoom));
    }

    #[test]
    fn candidate_without_identifying_fields_is_invalid() {
        let sig = Signal::candidate(
            RoomId::new("r1"),
            UserId::new(7),
            None,
            IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        );
        assert_eq!(sig.validate(), Err(SignalShapeError::UnidentifiedCandidate));
    }

    #[test]
    fn end_of_gathering_marker_validates() {
        let sig = Signal::candidate(
            RoomId::new("r1"),
            UserId::new(7),
            None,
            IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        );
        assert_eq!(sig.validate(), Ok(()));
    }

    #[test]
    fn dedup_key_ignores_timestamp_for_candidates() {
        let cand = IceCandidate {
            candidate: "candidate:1 1 udp 1 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let a = Signal::candidate(RoomId::new("r1"), UserId::new(7), None, cand.clone());
        let mut b = Signal::candidate(RoomId::new("r1"), UserId::new(7), None, cand);
        b.sent_at = b.sent_at + chrono::Duration::seconds(5);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn dedup_key_distinguishes_same_kind_by_timestamp() {
        let a = Signal::hangup(RoomId::new("r1"), UserId::new(7), EndReason::LocalHangup);
        let mut b = a.clone();
        b.sent_at = a.sent_at + chrono::Duration::milliseconds(10);
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn description_detects_video_section() {
        let voice = SessionDescription::offer("v=0\r\nm=audio 9 RTP/AVP 0\r\n");
        let video = SessionDescription::offer("v=0\r\nm=audio 9 RTP/AVP 0\r\nm=video 9 RTP/AVP 96\r\n");
        assert!(!voice.has_video());
        assert!(video.has_video());
    }

    #[test]
    fn signal_round_trips_as_json() {
        let sig = offer_signal();
        let json = serde_json::to_string(&sig).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn end_reason_strings_are_kebab_case() {
        assert_eq!(EndReason::ConnectionFailed.as_str(), "connection-failed");
        assert_eq!(
            serde_json::to_string(&EndReason::RemoteEnded).unwrap(),
            "\"remote-ended\""
        );
    }
}

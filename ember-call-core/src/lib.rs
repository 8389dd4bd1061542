//! Ember Call - real-time call session coordination for the Emberline app
//!
//! This crate is the core that establishes, maintains and tears down a
//! peer-to-peer audio/video call between two mobile clients, signaled over
//! an asynchronous, unordered, at-least-once message transport. It provides:
//!
//! - **Signal routing**: validation, bounded TTL dedup ledgers, and a
//!   time-expiring mailbox for signals that arrive before anyone can consume
//!   them (the offer that lands before the user taps Accept)
//! - **Negotiation coordination**: offer/answer/candidate exchange with
//!   deterministic simultaneous-offer resolution and capped, mutually
//!   exclusive restarts after connectivity loss
//! - **Lifecycle state machine**: one authority for the call's state with
//!   timeouts on every phase that could otherwise hang, idempotent teardown
//!   and typed end reasons instead of exceptions
//! - **Media control**: bounded capture acquisition with virtual-hardware
//!   degradation, mute/camera/speaker toggles, debounced camera switching
//! - **Link reliability**: exponential-backoff reconnection, heartbeats and
//!   a watchdog against half-open signaling connections
//!
//! # Examples
//!
//! ```rust,no_run
//! use ember_call_core::{
//!     CallKind, CallService, CallServiceConfig, LoopbackHub, MediaConfig, MediaController,
//!     Peer, ReliableLink, ReliabilityConfig, RouterConfig, SignalRouter,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     backend: Arc<impl ember_call_core::CallBackend>,
//! #     factory: Arc<impl ember_call_core::PeerSessionFactory>,
//! #     devices: Arc<impl ember_call_core::CaptureDevices>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let me = Peer::new(7u64, "Noa");
//! let router = Arc::new(SignalRouter::new(RouterConfig::default()));
//! let hub = LoopbackHub::new();
//! let link = Arc::new(ReliableLink::new(
//!     Arc::new(hub.endpoint()),
//!     me.id,
//!     ReliabilityConfig::default(),
//! ));
//! let media = Arc::new(MediaController::new(devices, MediaConfig::default()));
//!
//! let service = CallService::new(
//!     me,
//!     router,
//!     link,
//!     media,
//!     backend,
//!     factory,
//!     CallServiceConfig::default(),
//! );
//! service.start();
//!
//! // Start a video call to user 42
//! let room = service
//!     .initiate(Peer::new(42u64, "Sam"), CallKind::Video)
//!     .await?;
//! # let _ = room;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// User identity types
pub mod identity;

/// Call session types and the signaling data model
pub mod types;

/// Signal routing, deduplication and pending delivery
pub mod router;

/// Offer/answer negotiation coordination
pub mod negotiation;

/// Call session lifecycle
pub mod session;

/// Local capture stream management
pub mod media;

/// Signaling link reliability
pub mod reliability;

/// Signaling transport abstraction
pub mod transport;

// Re-export main types at crate root
pub use identity::{Peer, UserId};
pub use media::{
    CameraFacing, CaptureDevices, CaptureFailure, DeviceEvent, LocalStream, MediaConfig,
    MediaController, MediaError, MediaEvent, SwitchOutcome, TrackHandle, TrackKind,
};
pub use negotiation::{
    ConnectivityState, NegotiationConfig, NegotiationCoordinator, NegotiationError,
    NegotiationEvent, NegotiationPhase, OfferDisposition, PeerSession, PeerSessionError,
    PeerSessionEvent, PeerSessionFactory, RestartOutcome,
};
pub use reliability::{LinkError, LinkState, ReliabilityConfig, ReliableLink};
pub use router::{DeliveryOutcome, DropCause, RouterConfig, RouterNotice, SignalRouter};
pub use session::{
    Admission, CallBackend, CallService, CallServiceBuilder, CallServiceConfig, CallServiceError,
};
pub use transport::{LoopbackHub, LoopbackTransport, SignalTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{Peer, UserId};
    pub use crate::media::{CaptureDevices, LocalStream, MediaConfig, MediaController};
    pub use crate::negotiation::{PeerSession, PeerSessionFactory};
    pub use crate::reliability::{LinkState, ReliabilityConfig, ReliableLink};
    pub use crate::router::{RouterConfig, SignalRouter};
    pub use crate::session::{CallBackend, CallService, CallServiceConfig};
    pub use crate::transport::SignalTransport;
    pub use crate::types::{
        CallDirection, CallEvent, CallKind, CallPhase, CallSessionInfo, EndReason, RoomId,
        SessionId, Signal, SignalKind,
    };
}

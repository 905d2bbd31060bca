//! Peer-connection negotiation core for multi-party WebRTC video chat
//!
//! Every client in a room holds one WebRTC connection per remote participant
//! (full mesh). This crate manages those connections: creating them on first
//! contact, exchanging offers and answers with the "perfect negotiation"
//! algorithm, buffering ICE candidates that arrive early, and keeping the local
//! camera, microphone and screen tracks in sync across every peer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  MeshSession                                             │
//! │  ├─ SignalingChannel (WebSocket relay client)            │
//! │  │   ↓ SignalingEvent (membership, description, candidate)│
//! │  ├─ Negotiator (perfect negotiation, glare, ICE restart) │
//! │  │   ↓                                                    │
//! │  ├─ PeerRegistry (peer id → PeerEntry)                   │
//! │  │   └─ PeerEntry: connection, flags, candidate queue,   │
//! │  │                 outbound senders                      │
//! │  └─ TrackSynchronizer ← TrackSource (add/replace/remove) │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use meshcall_webrtc::{MediaKind, MeshConfig, MeshSession, TrackSource};
//! use std::sync::Arc;
//!
//! let config = MeshConfig::default()
//!     .with_signaling_url("ws://localhost:8080/ws")
//!     .with_room("standup");
//!
//! let source = Arc::new(TrackSource::new(config.event_channel_capacity));
//! source.add_track(source.create_track(MediaKind::Audio));
//! source.add_track(source.create_track(MediaKind::Camera));
//!
//! let session = MeshSession::connect(config, source).await?;
//! let mut events = session.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{GlarePolicy, MeshConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use events::MeshEvent;
pub use media::{LocalTrack, MediaKind, TrackEvent, TrackId, TrackSource, TrackSynchronizer};
pub use negotiation::Negotiator;
pub use peer::{
    ConnectionFactory, MediaConnection, PeerEntry, PeerInfo, PeerRegistry, PeerStatus,
    RemoteTrack, WebRtcConnectionFactory,
};
pub use session::MeshSession;
pub use signaling::{
    IceCandidate, SessionDescription, SignalEnvelope, SignalPayload, SignalingChannel,
    SignalingEvent, WebSocketSignalingChannel,
};

//! Peer connections and the registry that owns them

pub mod connection;
pub mod entry;
pub mod registry;
pub mod webrtc;

pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionEventSink, ConnectionFactory,
    IceConnectionState, MediaConnection, PeerStatus, RemoteTrack, RemoteTrackKind, SenderId,
    SignalingState,
};
pub use entry::{NegotiationFlags, OfferReason, PeerEntry};
pub use registry::{PeerInfo, PeerRegistry};
pub use webrtc::{WebRtcConnection, WebRtcConnectionFactory};

//! Media connection abstraction
//!
//! The negotiator drives connections through [`MediaConnection`] so the
//! perfect-negotiation logic is independent of the WebRTC backend. The
//! production backend lives in [`super::webrtc`]; tests use an in-memory one.

use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Offer/answer state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

/// ICE transport state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Peer status surfaced to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Connection created, ICE not yet connected
    Connecting,
    /// Media can flow
    Connected,
    /// ICE failed and the restart did not recover it
    Failed,
    /// Connection closed
    Closed,
}

impl PeerStatus {
    /// Status implied by an ICE state. Transient `Failed` maps to `Connecting`
    /// until the restart has been attempted.
    pub fn from_ice(state: IceConnectionState, restart_attempted: bool) -> Self {
        match state {
            IceConnectionState::New
            | IceConnectionState::Checking
            | IceConnectionState::Disconnected => PeerStatus::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => PeerStatus::Connected,
            IceConnectionState::Failed if restart_attempted => PeerStatus::Failed,
            IceConnectionState::Failed => PeerStatus::Connecting,
            IceConnectionState::Closed => PeerStatus::Closed,
        }
    }
}

/// Handle to one outbound sender on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// Kind of a remote track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTrackKind {
    Audio,
    Video,
}

/// A track received from a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track id as announced by the remote side
    pub track_id: String,
    /// Stream the track belongs to
    pub stream_id: String,
    pub kind: RemoteTrackKind,
}

/// What happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventKind {
    /// A local ICE candidate was gathered and should be trickled
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// The connection wants a new offer/answer exchange
    NegotiationNeeded,
    /// ICE state changed
    IceConnectionStateChanged(IceConnectionState),
    /// Offer/answer state changed
    SignalingStateChanged(SignalingState),
}

/// Event raised by a connection, tagged with the connection that raised it
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub peer_id: String,
    /// Distinguishes events of a replaced connection from the current one
    pub connection_id: String,
    pub kind: ConnectionEventKind,
}

/// Sender half handed to each connection for raising [`ConnectionEvent`]s
#[derive(Debug, Clone)]
pub struct ConnectionEventSink {
    peer_id: String,
    connection_id: String,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEventSink {
    pub fn new(
        peer_id: &str,
        connection_id: &str,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Raise an event. Dropped silently once the session has shut down.
    pub fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id.clone(),
            kind,
        };
        if self.tx.send(event).is_err() {
            trace!(peer_id = %self.peer_id, "Connection event dropped, receiver closed");
        }
    }
}

/// One peer-to-peer media connection
///
/// State accessors are synchronous so callers can read them together with the
/// negotiation flags without yielding in between.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Id of this connection instance
    fn connection_id(&self) -> &str;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Whether a remote description has been applied
    async fn has_remote_description(&self) -> bool;

    /// Create an offer. `ice_restart` requests fresh ICE credentials.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local offer, answer or rollback
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start sending a local track. Returns the new sender.
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId>;

    /// Swap the track an existing sender carries, without renegotiating
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()>;

    /// Stop an existing sender
    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds connections for new peers
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection to `peer_id`. Events go to `events`.
    async fn create(
        &self,
        peer_id: &str,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn MediaConnection>>;
}

//! Events published to the UI layer

use crate::peer::{PeerStatus, RemoteTrack};

/// Something the UI may want to render
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A connection to a peer was created
    PeerConnectionCreated {
        peer_id: String,
        connection_id: String,
    },
    /// A remote track arrived from a peer
    RemoteTrackReceived { peer_id: String, track: RemoteTrack },
    /// A peer's connection status changed
    PeerStatusChanged { peer_id: String, status: PeerStatus },
    /// A peer was removed and its connection closed
    PeerLeft { peer_id: String },
}

impl MeshEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            MeshEvent::PeerConnectionCreated { peer_id, .. }
            | MeshEvent::RemoteTrackReceived { peer_id, .. }
            | MeshEvent::PeerStatusChanged { peer_id, .. }
            | MeshEvent::PeerLeft { peer_id } => peer_id,
        }
    }
}

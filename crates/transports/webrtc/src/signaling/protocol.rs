//! Signaling wire protocol
//!
//! JSON frames exchanged with the relay server. The `payload` of a signal is an
//! externally tagged union, so `{"description": {...}}` and `{"candidate": {...}}`
//! map directly onto [`SignalPayload`] variants.

use serde::{Deserialize, Serialize};

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Rollback of a pending local offer (never sent on the wire)
    Rollback,
}

/// Session description carried in a signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Build a rollback description
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }

    pub fn is_answer(&self) -> bool {
        self.sdp_type == SdpType::Answer
    }

    /// Ids of the tracks this description sends, from its `a=msid:` lines
    pub fn track_ids(&self) -> Vec<&str> {
        self.sdp
            .lines()
            .filter_map(|line| line.strip_prefix("a=msid:"))
            .filter_map(|rest| rest.split_whitespace().nth(1))
            .collect()
    }
}

/// ICE candidate carried in a signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Payload of a signal: either a description or a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalPayload {
    /// SDP offer or answer
    Description(SessionDescription),
    /// Trickled ICE candidate
    Candidate(IceCandidate),
}

/// Envelope relayed between clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Populated by the channel on send
    #[serde(default)]
    pub sender_id: String,

    /// Recipient; `None` broadcasts to the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    /// Room the signal belongs to
    #[serde(default)]
    pub room_id: String,

    /// Description or candidate
    pub payload: SignalPayload,
}

/// Frames sent from a client to the relay server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create or join a room
    #[serde(rename_all = "camelCase")]
    Join { room_id: String },

    /// Relay an envelope
    Signal { envelope: SignalEnvelope },

    /// Leave the current room
    Leave,
}

/// Frames sent from the relay server to a client
///
/// These are also the membership and signal events consumed by the negotiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingEvent {
    /// This client joined; carries its own id
    #[serde(rename_all = "camelCase")]
    Connected { self_id: String },

    /// Another member joined the room
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },

    /// A member left the room
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },

    /// Relayed envelope
    Signal { envelope: SignalEnvelope },

    /// Server-side rejection of a frame
    Error { message: String },
}

impl ClientMessage {
    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize client message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize client message: {}",
                e
            ))
        })
    }
}

impl SignalingEvent {
    /// Convert event to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize signaling event: {}", e))
        })
    }

    /// Parse event from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling event: {}",
                e
            ))
        })
    }

    /// Get the event name as it appears on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingEvent::Connected { .. } => "connected",
            SignalingEvent::PeerJoined { .. } => "peer-joined",
            SignalingEvent::PeerLeft { .. } => "peer-left",
            SignalingEvent::Signal { .. } => "signal",
            SignalingEvent::Error { .. } => "error",
        }
    }
}

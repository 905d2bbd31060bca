//! Signaling channel abstraction and the WebSocket relay client

pub mod client;
pub mod protocol;

pub use client::WebSocketSignalingChannel;
pub use protocol::{
    ClientMessage, IceCandidate, SdpType, SessionDescription, SignalEnvelope, SignalPayload,
    SignalingEvent,
};

use crate::Result;
use async_trait::async_trait;

/// Outbound half of a signaling transport
///
/// Inbound events arrive on the receiver handed out when the channel is
/// opened; they are fed to the negotiator one at a time.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Whether the relay session is active. Offers are not created while it
    /// is not.
    fn is_connected(&self) -> bool;

    /// Our own id as assigned by the relay, once known
    fn self_id(&self) -> Option<String>;

    /// Send a payload to one peer, or to the whole room when `target_id` is `None`
    async fn send(&self, target_id: Option<&str>, payload: SignalPayload) -> Result<()>;
}

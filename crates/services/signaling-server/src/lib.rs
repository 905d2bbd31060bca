//! Signaling relay for meshcall rooms
//!
//! Clients open a WebSocket, join a room and exchange signal envelopes with
//! the other members. The server only tracks membership and relays; it never
//! looks inside descriptions or candidates.
//!
//! ```text
//! client ── join ──────────▶ server ── connected ───▶ client
//!                                   └─ peer-joined ─▶ every other member
//! client ── signal(target) ▶ server ── signal ──────▶ target
//! client ── signal ────────▶ server ── signal ──────▶ every other member
//! client ── leave / close ─▶ server ── peer-left ───▶ remaining members
//! ```

pub mod config;
pub mod handler;
pub mod rooms;
pub mod server;

pub use config::ServerConfig;
pub use rooms::RoomRegistry;
pub use server::{ServerHandle, SignalingServer};

/// Result type alias for the relay server
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised while serving a connection
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The room is at capacity
    #[error("Room {0} is full")]
    RoomFull(String),

    /// A signal arrived before a join
    #[error("Join a room first")]
    NotJoined,

    /// A second join on the same connection
    #[error("Already joined room {0}")]
    AlreadyJoined(String),

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

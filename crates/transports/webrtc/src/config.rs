//! Configuration types for the negotiation core

use serde::{Deserialize, Serialize};

/// Default STUN servers handed to every new peer connection
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Main configuration for a mesh session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// Room to join on the signaling server
    pub room_id: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Number of ICE candidates gathered ahead of time (default: 10)
    pub ice_candidate_pool_size: u8,

    /// How colliding offers are resolved (default: PhaseOnly)
    pub glare_policy: GlarePolicy,

    /// Capacity of the UI event and track event buses (default: 256)
    pub event_channel_capacity: usize,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Glare resolution strategy
///
/// `PhaseOnly` ignores an incoming offer whenever the receiver is neither idle
/// nor applying a remote answer. Two peers that finish their offers at the same
/// moment will both drop the other's offer; that outcome is kept as-is.
///
/// `PeerIdTieBreak` keeps the phase check but lets the peer with the higher id
/// yield: it rolls back its own pending offer and answers the remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GlarePolicy {
    /// Resolve purely from local negotiation flags
    #[default]
    PhaseOnly,
    /// Break ties by comparing peer ids
    PeerIdTieBreak,
}

impl GlarePolicy {
    /// Whether the local side yields to the remote side on a collision
    pub fn yields_to(&self, local_id: Option<&str>, remote_id: &str) -> bool {
        match (self, local_id) {
            (GlarePolicy::PeerIdTieBreak, Some(local)) => local > remote_id,
            _ => false,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/ws".to_string(),
            room_id: "default".to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            ice_candidate_pool_size: 10,
            glare_policy: GlarePolicy::PhaseOnly,
            event_channel_capacity: 256,
        }
    }
}

impl MeshConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - neither STUN nor TURN servers are configured
    /// - a STUN/TURN URL has the wrong scheme
    /// - `room_id` is empty
    /// - `event_channel_capacity` is zero
    /// - `signaling_url` is not a WebSocket URL
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|turn| !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if self.room_id.trim().is_empty() {
            return Err(Error::InvalidConfig("room_id must not be empty".to_string()));
        }

        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        Ok(())
    }

    /// Set the signaling URL
    pub fn with_signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = url.to_string();
        self
    }

    /// Set the room to join
    pub fn with_room(mut self, room_id: &str) -> Self {
        self.room_id = room_id.to_string();
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the glare resolution strategy
    pub fn with_glare_policy(mut self, policy: GlarePolicy) -> Self {
        self.glare_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.stun_servers.len(), 2);
        assert_eq!(config.ice_candidate_pool_size, 10);
    }

    #[test]
    fn test_no_ice_servers_fails() {
        let mut config = MeshConfig::default();
        config.stun_servers.clear();
        assert!(config.validate().is_err());

        let config = config.with_turn_servers(vec![TurnServerConfig {
            url: "turn:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        }]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_stun_scheme_fails() {
        let mut config = MeshConfig::default();
        config.stun_servers = vec!["http://stun.example.com".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_signaling_url_fails() {
        let config = MeshConfig::default().with_signaling_url("http://localhost:8080");
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn test_empty_room_fails() {
        let config = MeshConfig::default().with_room("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshConfig =
            serde_json::from_str(r#"{"room_id":"r1","glare_policy":"peer-id-tie-break"}"#)
                .unwrap();
        assert_eq!(config.room_id, "r1");
        assert_eq!(config.glare_policy, GlarePolicy::PeerIdTieBreak);
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn test_tie_break_yields_for_higher_id() {
        let policy = GlarePolicy::PeerIdTieBreak;
        assert!(policy.yields_to(Some("b"), "a"));
        assert!(!policy.yields_to(Some("a"), "b"));
        assert!(!policy.yields_to(None, "a"));
        assert!(!GlarePolicy::PhaseOnly.yields_to(Some("b"), "a"));
    }
}

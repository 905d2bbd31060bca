//! Relay server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to (default: 0.0.0.0:8080)
    pub bind: SocketAddr,

    /// Maximum members per room (default: 16)
    pub max_room_size: usize,

    /// Frames queued per connection before relaying to it blocks (default: 128)
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_room_size: 16,
            outbound_capacity: 128,
        }
    }
}

impl ServerConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_room_size < 2 {
            return Err(crate::ServerError::InvalidConfig(format!(
                "max_room_size must be at least 2, got {}",
                self.max_room_size
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(crate::ServerError::InvalidConfig(
                "outbound_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind.port(), 8080);
    }

    #[test]
    fn test_room_of_one_is_rejected() {
        let config = ServerConfig {
            max_room_size: 1,
            ..Default::default()
        };
        tokio_test::assert_err!(config.validate());
    }
}

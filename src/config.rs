use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::peer::state::{CONNECTED_NOTIFY_DELAY, GRACE_PERIOD};
use crate::peer::types::ServerConfig;

// Logging is on by default only in development builds; RUST_LOG overrides it.
#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

pub const DEFAULT_SESSION_KEY: &str = "shared-session";

/// Settings for the pairing coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Relay key of the shared session document.
    pub session_key: String,
    /// Wait before retrying after evicting a stale offer+answer document.
    pub retry_backoff_ms: u64,
    /// Wait between channel confirmation and deleting the session document.
    pub cleanup_grace_ms: u64,
    pub peer: PeerConfig,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_key: DEFAULT_SESSION_KEY.into(),
            retry_backoff_ms: 1000,
            cleanup_grace_ms: 3000,
            peer: PeerConfig::default(),
        }
    }
}

impl PairingConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_key.trim().is_empty() {
            return Err(ConfigError::Invalid("session key cannot be empty".into()));
        }
        self.peer.validate()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }
}

/// Settings for the WebRTC negotiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub connected_notify_delay_ms: u64,
    pub disconnect_grace_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
                ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
            ],
            connected_notify_delay_ms: CONNECTED_NOTIFY_DELAY.as_millis() as u64,
            disconnect_grace_ms: GRACE_PERIOD.as_millis() as u64,
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {} has an empty URL",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn connected_notify_delay(&self) -> Duration {
        Duration::from_millis(self.connected_notify_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let c = PairingConfig::default();
        assert_eq!(c.session_key, "shared-session");
        assert_eq!(c.retry_backoff(), Duration::from_secs(1));
        assert_eq!(c.cleanup_grace(), Duration::from_secs(3));
        assert_eq!(c.peer.connected_notify_delay(), Duration::from_secs(2));
        assert_eq!(c.peer.ice_servers.len(), 2);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = PairingConfig::from_json(r#"{"session_key":"room-7","peer":{"ice_servers":[]}}"#)
            .unwrap();
        assert_eq!(c.session_key, "room-7");
        assert_eq!(c.retry_backoff_ms, 1000);
        assert!(c.peer.ice_servers.is_empty());
        assert_eq!(c.peer.disconnect_grace_ms, 10_000);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut c = PairingConfig::default();
        c.peer.ice_servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("u".into()),
            credential: None,
        });
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_session_key_is_rejected() {
        let err = PairingConfig::from_json(r#"{"session_key":"  "}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_json_is_a_parse_error() {
        assert!(matches!(
            PairingConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}

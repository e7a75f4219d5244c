// Room configuration
// Logging is on in debug builds and off by default in release builds

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::utils::add_ice_url_scheme;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Default filter when RUST_LOG is not set
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "meshcall=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "meshcall=info,webrtc=error";

/// ========== DEFAULTS ==========

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3000/signal";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OFFER_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_ICE_RESTART_BUDGET: u32 = 1;
/// How long a session may sit in `Disconnected` before it is treated as failed
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            kind: ServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            kind: ServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    pub connect_timeout_ms: u64,
    pub offer_retry_delay_ms: u64,
    pub ice_restart_budget: u32,
    pub disconnect_grace_ms: u64,
    pub teardown_timeout_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.into(),
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            offer_retry_delay_ms: DEFAULT_OFFER_RETRY_DELAY.as_millis() as u64,
            ice_restart_budget: DEFAULT_ICE_RESTART_BUDGET,
            disconnect_grace_ms: DEFAULT_DISCONNECT_GRACE.as_millis() as u64,
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RoomConfig {
    /// Parses and validates a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: RoomConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ICE servers and normalizes their url schemes
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for server in &mut self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyServerUrl(server.id.clone()));
            }

            if server.kind == ServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }

            server.url = add_ice_url_scheme(server);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn offer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.offer_retry_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = RoomConfig::default();
        assert_eq!(config.offer_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.ice_restart_budget, 1);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_candidate_pool_size, 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RoomConfig::from_json(
            r#"{"signalingUrl":"wss://signal.example.org/ws","connectTimeoutMs":2500}"#,
        )
        .unwrap();
        assert_eq!(config.signaling_url, "wss://signal.example.org/ws");
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(config.disconnect_grace(), DEFAULT_DISCONNECT_GRACE);
    }

    #[test]
    fn turn_without_credentials_rejected() {
        let err = RoomConfig::from_json(
            r#"{"iceServers":[{"id":"relay","type":"turn","url":"turn.example.org:3478"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTurnCredentials(id) if id == "relay"));
    }

    #[test]
    fn empty_url_rejected() {
        let err =
            RoomConfig::from_json(r#"{"iceServers":[{"id":"x","type":"stun","url":""}]}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyServerUrl(_)));
    }

    #[test]
    fn validate_adds_scheme() {
        let config = RoomConfig::from_json(
            r#"{"iceServers":[{"id":"relay","type":"turn","url":"turn.example.org:3478","username":"u","credential":"p"}]}"#,
        )
        .unwrap();
        assert_eq!(config.ice_servers[0].url, "turn:turn.example.org:3478");
    }
}

//! Server and participant configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    /// Idle time after which an empty room is deleted
    pub room_ttl_secs: u64,
    /// Expiry sweep period
    pub sweep_interval_secs: u64,
    /// Room code length
    pub room_id_length: usize,
    /// PIN length (digits)
    pub pin_length: usize,
    /// Room code generation attempts before giving up
    pub max_room_id_attempts: usize,
    /// WebSocket ping period
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            room_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            room_id_length: 8,
            pin_length: 6,
            max_room_id_attempts: 10,
            heartbeat_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// ICE server entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Participant-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Signaling WebSocket URL
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Settling delay before checking that every local track reached a new
    /// session. Zero runs the check inline.
    pub repair_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080/ws".to_string(),
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            repair_delay_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn repair_delay(&self) -> Duration {
        Duration::from_millis(self.repair_delay_ms)
    }
}

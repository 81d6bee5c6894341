//! Configuration management.
//!
//! Settings are loaded from a TOML file and `ROOMCAST_` environment
//! variables, in that order, with later sources taking precedence.
//! Durations are plain seconds, sizes plain bytes.

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub room: RoomSettings,
    pub upload: UploadSettings,
    /// Predefined rooms declared in configuration.
    #[serde(default)]
    pub rooms: Vec<PredefinedRoomConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub address: String,
    pub root_url: String,
    pub name: String,
    pub session_cookie: String,
    /// Storage backend. Only `memory` is compiled in; the `Store` trait is
    /// the seam for a remote backend.
    pub storage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomSettings {
    pub room_id_length: usize,
    pub max_cached_messages: usize,
    pub max_message_length: usize,
    pub max_message_queue: usize,
    pub max_rooms: usize,
    pub max_peers_per_room: usize,
    /// Regex a login handle must match.
    pub peer_handle_format: String,
    /// Room lifetime and idle timeout, in seconds.
    pub room_age: u64,
    /// Reserved knob kept for config compatibility, in seconds.
    pub room_timeout: u64,
    /// Websocket read/write deadline, in seconds.
    pub websocket_timeout: u64,
    /// Peer message budget window, in seconds.
    pub rate_limit_interval: u64,
    pub rate_limit_messages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSettings {
    /// Total resident bytes the upload store may hold.
    pub max_memory: u64,
    /// Largest accepted request body, in bytes.
    pub max_upload_size: u64,
    /// Upload retention, in seconds.
    pub max_age: u64,
    /// Per-room upload budget window, in seconds.
    pub rate_limit_period: u64,
    pub rate_limit_count: u32,
    pub rate_limit_burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedRoomConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub motd: String,
    #[serde(default)]
    pub users: Vec<PredefinedUserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedUserConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub growl: bool,
}

impl Settings {
    /// Load configuration from `config/default` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::Environment::with_prefix("ROOMCAST"))
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specified path.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ROOMCAST"))
            .build()?;

        config.try_deserialize()
    }

    /// Enforce the startup minimums the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_SECS: u64 = 3;
        if self.room.room_age < MIN_SECS || self.room.websocket_timeout < MIN_SECS {
            return Err(ConfigError::Message(
                "room.room_age and room.websocket_timeout should be > 3s".into(),
            ));
        }
        if self.room.room_id_length == 0 {
            return Err(ConfigError::Message(
                "room.room_id_length must be at least 1".into(),
            ));
        }
        if self.room.rate_limit_messages == 0 || self.room.rate_limit_interval == 0 {
            return Err(ConfigError::Message(
                "room.rate_limit_messages and room.rate_limit_interval must be non-zero".into(),
            ));
        }
        if self.room.max_message_queue == 0 {
            return Err(ConfigError::Message(
                "room.max_message_queue must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                address: "127.0.0.1:9000".to_string(),
                root_url: "http://127.0.0.1:9000".to_string(),
                name: "Roomcast".to_string(),
                session_cookie: "roomcast_sess".to_string(),
                storage: "memory".to_string(),
            },
            room: RoomSettings {
                room_id_length: 5,
                max_cached_messages: 100,
                max_message_length: 3000,
                max_message_queue: 100,
                max_rooms: 1000,
                max_peers_per_room: 100,
                peer_handle_format: "^[A-Za-z0-9_-]{1,24}$".to_string(),
                room_age: 3600,
                room_timeout: 900,
                websocket_timeout: 60,
                rate_limit_interval: 1,
                rate_limit_messages: 5,
            },
            upload: UploadSettings {
                max_memory: 32 << 20,
                max_upload_size: 32 << 20,
                max_age: 3600,
                rate_limit_period: 60,
                rate_limit_count: 20,
                rate_limit_burst: 5,
            },
            rooms: Vec::new(),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::room::RoomConfig;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for room snapshots. Snapshots are kept in memory when unset.
    pub data_dir: Option<String>,

    /// Seconds an empty room is kept before eviction
    #[serde(default = "default_room_grace_secs")]
    pub room_grace_secs: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Commands a room may have queued before producers wait
    #[serde(default = "default_room_queue_capacity")]
    pub room_queue_capacity: usize,

    /// Frames a connection may have queued before it counts as stalled
    #[serde(default = "default_conn_queue_capacity")]
    pub conn_queue_capacity: usize,

    /// Ops a document may hold before its room is torn down
    #[serde(default = "default_max_doc_ops")]
    pub max_doc_ops: usize,

    /// Largest accepted WebSocket message
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,

    #[serde(default = "default_gateway_load_attempts")]
    pub gateway_load_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::Env(e))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("ROOM_QUEUE_CAPACITY", self.room_queue_capacity as u64),
            ("CONN_QUEUE_CAPACITY", self.conn_queue_capacity as u64),
            ("SNAPSHOT_INTERVAL_SECS", self.snapshot_interval_secs),
            ("PING_INTERVAL_SECS", self.ping_interval_secs),
            ("MAX_ROOMS", self.max_rooms as u64),
        ];
        match positive.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{} must be greater than zero", name))),
            None => Ok(()),
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Default tracing directive: LOG_LEVEL for this crate, info elsewhere.
    pub fn log_filter(&self) -> String {
        format!(
            "colabri_live={},tower_http=debug,axum::rejection=trace,info",
            self.log_level
        )
    }

    /// Room tunables derived from this configuration.
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            grace: Duration::from_secs(self.room_grace_secs),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            max_rooms: self.max_rooms,
            queue_capacity: self.room_queue_capacity,
            conn_queue_capacity: self.conn_queue_capacity,
            max_doc_ops: self.max_doc_ops,
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
            load_attempts: self.gateway_load_attempts,
            ..RoomConfig::default()
        }
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            data_dir: None,
            room_grace_secs: default_room_grace_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            max_rooms: default_max_rooms(),
            room_queue_capacity: default_room_queue_capacity(),
            conn_queue_capacity: default_conn_queue_capacity(),
            max_doc_ops: default_max_doc_ops(),
            max_frame_bytes: default_max_frame_bytes(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            gateway_load_attempts: default_gateway_load_attempts(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_room_grace_secs() -> u64 {
    30
}

fn default_snapshot_interval_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_pong_timeout_secs() -> u64 {
    30
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_room_queue_capacity() -> usize {
    1024
}

fn default_conn_queue_capacity() -> usize {
    256
}

fn default_max_doc_ops() -> usize {
    1_000_000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_gateway_timeout_ms() -> u64 {
    5_000
}

fn default_gateway_load_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_room_defaults() {
        let room = Config::default().room_config();
        assert_eq!(room.grace, Duration::from_secs(30));
        assert_eq!(room.snapshot_interval, Duration::from_secs(10));
        assert_eq!(room.ping_interval, Duration::from_secs(15));
        assert_eq!(room.pong_timeout, Duration::from_secs(30));
        assert_eq!(room.queue_capacity, 1024);
    }

    #[test]
    fn envy_reads_overrides() {
        let vars = vec![
            ("PORT".to_string(), "4000".to_string()),
            ("ROOM_GRACE_SECS".to_string(), "5".to_string()),
            ("DATA_DIR".to_string(), "/tmp/rooms".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.room_grace_secs, 5);
        assert_eq!(config.data_dir.as_deref(), Some("/tmp/rooms"));
        assert_eq!(config.max_rooms, 10_000);
    }

    #[test]
    fn log_level_drives_default_filter() {
        let vars = vec![
            ("LOG_LEVEL".to_string(), "trace".to_string()),
            ("ENVIRONMENT".to_string(), "production".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert!(config.log_filter().starts_with("colabri_live=trace,"));
        assert!(!config.is_development());
        assert!(Config::default().is_development());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = Config {
            room_queue_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn cors_list_is_trimmed() {
        let config = Config {
            cors_origins: Some("http://a.test, http://b.test,".into()),
            ..Config::default()
        };
        assert_eq!(config.cors_origin_list(), vec!["http://a.test", "http://b.test"]);
    }
}

#![forbid(unsafe_code)]

// Server configuration loaded from environment variables

use crate::media::MediaConfig;
use crate::recording::RecordingConfig;
use crate::room::RoomConfig;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRANSPORT_READY_TIMEOUT_MS: u64 = 10_000;

/// Close a connection if no message arrives within this window
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid range {start_key}..{end_key}: {start} > {end}")]
    InvalidRange {
        start_key: &'static str,
        end_key: &'static str,
        start: u16,
        end: u16,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Peers that stop syncing for this long are evicted; `None` disables eviction
    pub peer_timeout: Option<Duration>,
    pub room: RoomConfig,
    pub media: MediaConfig,
    pub recording: RecordingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: IDLE_TIMEOUT,
            peer_timeout: Some(Duration::from_secs(DEFAULT_PEER_TIMEOUT_SECS)),
            room: RoomConfig::default(),
            media: MediaConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.port = parse_var(vars, "PORT", DEFAULT_PORT)?;

        let max_connections = parse_var(vars, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        config.max_connections = if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            DEFAULT_MAX_CONNECTIONS
        } else {
            max_connections
        };

        let peer_timeout_secs = parse_var(vars, "PEER_TIMEOUT_SECS", DEFAULT_PEER_TIMEOUT_SECS)?;
        config.peer_timeout = (peer_timeout_secs > 0).then(|| Duration::from_secs(peer_timeout_secs));

        let ready_ms = parse_var(vars, "TRANSPORT_READY_TIMEOUT_MS", DEFAULT_TRANSPORT_READY_TIMEOUT_MS)?;
        config.room.transport_ready_timeout = Duration::from_millis(ready_ms);

        // Announced address for ICE candidates
        let announce_ip: IpAddr = parse_var(vars, "ANNOUNCE_IP", IpAddr::V4(Ipv4Addr::LOCALHOST))?;
        config.media.webrtc_transport_config = config
            .media
            .webrtc_transport_config
            .with_public_ip(announce_ip);

        let worker = &mut config.media.worker_config;
        worker.rtc_min_port = parse_var(vars, "RTC_MIN_PORT", worker.rtc_min_port)?;
        worker.rtc_max_port = parse_var(vars, "RTC_MAX_PORT", worker.rtc_max_port)?;
        if worker.rtc_min_port > worker.rtc_max_port {
            return Err(ConfigError::InvalidRange {
                start_key: "RTC_MIN_PORT",
                end_key: "RTC_MAX_PORT",
                start: worker.rtc_min_port,
                end: worker.rtc_max_port,
            });
        }

        let recording = &mut config.recording;
        if let Some(dir) = vars.get("RECORDING_DIR") {
            recording.output_dir = PathBuf::from(dir);
        }
        if let Some(program) = vars.get("FFMPEG_PATH") {
            recording.encoder.program = PathBuf::from(program);
        }
        let max_secs = parse_var(vars, "RECORDING_MAX_SECS", recording.max_duration.as_secs())?;
        recording.max_duration = Duration::from_secs(max_secs);

        let ports = &mut recording.ports;
        ports.range_start = parse_var(vars, "RECORDING_PORT_START", ports.range_start)?;
        ports.range_end = parse_var(vars, "RECORDING_PORT_END", ports.range_end)?;
        if ports.range_start > ports.range_end {
            return Err(ConfigError::InvalidRange {
                start_key: "RECORDING_PORT_START",
                end_key: "RECORDING_PORT_END",
                start: ports.range_start,
                end: ports.range_end,
            });
        }

        Ok(config)
    }
}

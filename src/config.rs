//! Konfiguration aus Umgebungsvariablen

use crate::audio::{FrameConfig, DEFAULT_FRAME_MS, DEFAULT_TARGET_SAMPLE_RATE};
use crate::peer::IceServer;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:8000";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_TURN_URL: &str = "turn:openrelay.metered.ca:80";
pub const DEFAULT_TURN_USERNAME: &str = "openrelayproject";
pub const DEFAULT_TURN_CREDENTIAL: &str = "openrelayproject";
const DEFAULT_TIMESLICE_MS: u64 = 250;
const DEFAULT_HEARTBEAT_SECS: u64 = 25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("Could not determine app data directory")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub signaling_url: String,
    pub user_id: String,
    pub ice_servers: Vec<IceServer>,
    pub frames: FrameConfig,
    pub recording_timeslice: Duration,
    pub recordings_dir: PathBuf,
    pub heartbeat: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest alle Werte über `lookup` (leere Werte zählen als nicht gesetzt)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let user_id = get("CALL_USER_ID").ok_or(ConfigError::Missing("CALL_USER_ID"))?;
        let signaling_url =
            get("SIGNALING_URL").unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());

        let stun = get("STUN_URL").unwrap_or_else(|| DEFAULT_STUN_URL.to_string());
        let turn = IceServer::turn(
            get("TURN_URL").unwrap_or_else(|| DEFAULT_TURN_URL.to_string()),
            get("TURN_USERNAME").unwrap_or_else(|| DEFAULT_TURN_USERNAME.to_string()),
            get("TURN_CREDENTIAL").unwrap_or_else(|| DEFAULT_TURN_CREDENTIAL.to_string()),
        );

        let target_rate = parse(&get, "PCM_TARGET_RATE", DEFAULT_TARGET_SAMPLE_RATE)?;
        let frame_ms = parse(&get, "PCM_FRAME_MS", DEFAULT_FRAME_MS)?;
        let frames = FrameConfig::new(target_rate, frame_ms).map_err(|_| ConfigError::Invalid {
            key: "PCM_FRAME_MS",
            value: format!("{} Hz / {} ms", target_rate, frame_ms),
        })?;

        let timeslice_ms: u64 = parse(&get, "RECORDING_TIMESLICE_MS", DEFAULT_TIMESLICE_MS)?;
        let heartbeat_secs: u64 = parse(&get, "HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;
        if timeslice_ms == 0 || heartbeat_secs == 0 {
            let (key, value) = if timeslice_ms == 0 {
                ("RECORDING_TIMESLICE_MS", timeslice_ms)
            } else {
                ("HEARTBEAT_SECS", heartbeat_secs)
            };
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
            });
        }

        let recordings_dir = match get("RECORDINGS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_recordings_dir()?,
        };

        Ok(Self {
            signaling_url,
            user_id,
            ice_servers: vec![IceServer::stun(stun), turn],
            frames,
            recording_timeslice: Duration::from_millis(timeslice_ms),
            recordings_dir,
            heartbeat: Duration::from_secs(heartbeat_secs),
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn default_recordings_dir() -> Result<PathBuf, ConfigError> {
    let proj_dirs =
        directories::ProjectDirs::from("com", "rtc-call", "rtc-call").ok_or(ConfigError::NoDataDir)?;
    Ok(proj_dirs.data_dir().join("recordings"))
}

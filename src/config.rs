//! Agent configuration.
//!
//! Everything comes from environment variables read once at startup; the
//! camera list comes from an optional YAML file named by `EDGE_CAMERAS_FILE`:
//!
//! ```yaml
//! - camera_id: cam-balcao
//!   name: Balcao 1
//!   rtsp_url: rtsp://10.0.0.12/stream1
//!   roi_config: /etc/edge/roi/balcao.yaml
//!   feed: /var/lib/edge/balcao.jsonl
//! - camera_id: cam-entrada
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::aggregation::DEFAULT_BUCKET_SECONDS;
use crate::heartbeat::{CameraIdentity, DEFAULT_HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL};
use crate::rules::DEFAULT_LONG_QUEUE_THRESHOLD;

pub const DEFAULT_AGENT_ID: &str = "edge-agent";
pub const DEFAULT_CLOUD_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:edge_outbox.db?mode=rwc";
pub const DEFAULT_STATUS_PORT: u16 = 7860;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_SEND_INTERVAL_SECONDS: u64 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("cannot read cameras file {path}: {source}")]
    CamerasIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse cameras file {path}: {source}")]
    CamerasYaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate camera_id {0:?} in cameras file")]
    DuplicateCamera(String),
}

/// One entry of the cameras file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rtsp_url: Option<String>,
    /// Path to the camera's ROI YAML.
    #[serde(default)]
    pub roi_config: Option<PathBuf>,
    /// JSON-lines detection feed. Cameras without one only send heartbeats.
    #[serde(default)]
    pub feed: Option<PathBuf>,
}

impl CameraConfig {
    pub fn identity(&self) -> CameraIdentity {
        CameraIdentity {
            camera_id: self.camera_id.clone(),
            name: self.name.clone(),
            rtsp_url: self.rtsp_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub store_id: String,
    pub agent_id: String,
    pub edge_token: String,
    pub cloud_base_url: String,
    pub timeout: Duration,
    pub send_interval: Duration,
    pub heartbeat_interval: Duration,
    pub bucket_seconds: u32,
    pub long_queue_threshold: f64,
    pub queue_capacity: usize,
    pub database_url: String,
    pub status_port: u16,
    pub heartbeat_only: bool,
    pub cameras: Vec<CameraConfig>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let first = |names: &[&str]| names.iter().find_map(|&n| get(n));

        let store_id = first(&["EDGE_STORE_ID", "STORE_ID"]).ok_or(ConfigError::Missing("EDGE_STORE_ID"))?;
        let edge_token = first(&["EDGE_TOKEN", "EDGE_CLOUD_TOKEN"]).ok_or(ConfigError::Missing("EDGE_TOKEN"))?;
        let agent_id = first(&["EDGE_AGENT_ID", "AGENT_ID"]).unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
        let cloud_base_url = first(&["EDGE_CLOUD_BASE_URL", "CLOUD_BASE_URL"])
            .unwrap_or_else(|| DEFAULT_CLOUD_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let timeout = parse_or(get("EDGE_TIMEOUT_SECONDS"), "EDGE_TIMEOUT_SECONDS", DEFAULT_TIMEOUT_SECONDS)?;
        let send_interval = parse_or(
            get("EDGE_SEND_INTERVAL_SECONDS"),
            "EDGE_SEND_INTERVAL_SECONDS",
            DEFAULT_SEND_INTERVAL_SECONDS,
        )?;
        let heartbeat_interval = parse_or(
            get("EDGE_HEARTBEAT_INTERVAL_SECONDS"),
            "EDGE_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )?;
        let bucket_seconds: u32 = parse_or(get("EDGE_BUCKET_SECONDS"), "EDGE_BUCKET_SECONDS", DEFAULT_BUCKET_SECONDS)?;
        let long_queue_threshold: f64 = parse_or(
            get("EDGE_LONG_QUEUE_THRESHOLD"),
            "EDGE_LONG_QUEUE_THRESHOLD",
            DEFAULT_LONG_QUEUE_THRESHOLD,
        )?;
        let queue_capacity: usize = parse_or(get("EDGE_QUEUE_CAPACITY"), "EDGE_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        let status_port: u16 = parse_or(get("EDGE_STATUS_PORT"), "EDGE_STATUS_PORT", DEFAULT_STATUS_PORT)?;
        let heartbeat_only = parse_flag(get("EDGE_HEARTBEAT_ONLY"), "EDGE_HEARTBEAT_ONLY")?;

        for (name, value) in [
            ("EDGE_TIMEOUT_SECONDS", timeout),
            ("EDGE_SEND_INTERVAL_SECONDS", send_interval),
            ("EDGE_BUCKET_SECONDS", u64::from(bucket_seconds)),
            ("EDGE_QUEUE_CAPACITY", queue_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                });
            }
        }
        if !long_queue_threshold.is_finite() {
            return Err(ConfigError::Invalid {
                name: "EDGE_LONG_QUEUE_THRESHOLD",
                value: long_queue_threshold.to_string(),
            });
        }

        let cameras = match get("EDGE_CAMERAS_FILE") {
            Some(path) => load_cameras(Path::new(&path))?,
            None => Vec::new(),
        };

        Ok(Self {
            store_id,
            agent_id,
            edge_token,
            cloud_base_url,
            timeout: Duration::from_secs(timeout),
            send_interval: Duration::from_secs(send_interval),
            heartbeat_interval: Duration::from_secs(heartbeat_interval).max(MIN_HEARTBEAT_INTERVAL),
            bucket_seconds,
            long_queue_threshold,
            queue_capacity,
            database_url: get("EDGE_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            status_port,
            heartbeat_only,
            cameras,
        })
    }

    /// Token safe for logs.
    pub fn masked_token(&self) -> String {
        mask_secret(&self.edge_token)
    }
}

pub fn load_cameras(path: &Path) -> Result<Vec<CameraConfig>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::CamerasIo {
        path: path.display().to_string(),
        source,
    })?;
    let cameras: Option<Vec<CameraConfig>> =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::CamerasYaml {
            path: path.display().to_string(),
            source,
        })?;
    let cameras = cameras.unwrap_or_default();

    let mut seen = std::collections::HashSet::new();
    for camera in &cameras {
        if !seen.insert(camera.camera_id.as_str()) {
            return Err(ConfigError::DuplicateCamera(camera.camera_id.clone()));
        }
    }
    Ok(cameras)
}

/// `abcd...wxyz`; secrets of eight characters or fewer are fully starred.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_flag(raw: Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(ConfigError::Invalid {
            name,
            value: raw.unwrap_or_default(),
        }),
    }
}

use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::{
    geocode::DEFAULT_GEOCODER_URL,
    permission::PermissionPolicy,
    position::{PositionOptions, WatchOptions},
    session::{HistoryMode, SessionSettings},
};

const DEFAULT_USER_AGENT: &str = concat!("geotrack/", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Debug)]
#[command(
    name = "geotrack",
    version,
    about = "Track device location, reverse-geocode it and forward events over WebSocket",
    author = "TrainLCD"
)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// WebSocket endpoint receiving tracking events (events are dropped when unset)
    #[arg(long, env = "GEOTRACK_WS_URL", value_name = "URL")]
    pub ws_url: Option<String>,

    /// Reverse geocoding endpoint
    #[arg(long, env = "GEOTRACK_GEOCODER_URL", value_name = "URL")]
    pub geocoder_url: Option<String>,

    /// Reverse geocoding request timeout
    #[arg(long, value_name = "SECS")]
    pub geocoder_timeout_secs: Option<u64>,

    /// User-Agent sent to the geocoding service
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Recorded track to replay (JSON or CSV). Newline-delimited JSON fixes are read from stdin when omitted.
    #[arg(long, value_name = "FILE")]
    pub track: Option<PathBuf>,

    /// Delay between replayed fixes
    #[arg(long, value_name = "MS")]
    pub replay_interval_ms: Option<u64>,

    /// Minimum movement between two position updates
    #[arg(long, value_name = "METERS")]
    pub distance_filter: Option<f64>,

    /// Warn about fixes with poor accuracy (true/false)
    #[arg(long)]
    pub high_accuracy: Option<bool>,

    /// How long to wait for the current position
    #[arg(long, value_name = "MS")]
    pub position_timeout_ms: Option<u64>,

    /// Oldest cached position accepted as current
    #[arg(long, value_name = "MS")]
    pub maximum_age_ms: Option<u64>,

    /// How location permission is obtained
    #[arg(long, value_enum)]
    pub permission: Option<PermissionPolicy>,

    /// Keep or clear recorded locations once tracking stops
    #[arg(long, value_enum)]
    pub history: Option<HistoryMode>,

    /// Override the detected device id
    #[arg(long, env = "GEOTRACK_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Override the detected device name
    #[arg(long)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: Option<String>,
    pub geocoder_url: String,
    pub geocoder_timeout: Duration,
    pub user_agent: String,
    pub track: Option<PathBuf>,
    pub replay_interval: Duration,
    pub distance_filter: f64,
    pub high_accuracy: bool,
    pub position_timeout: Duration,
    pub maximum_age: Duration,
    pub permission: PermissionPolicy,
    pub history: HistoryMode,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    ws_url: Option<String>,
    geocoder_url: Option<String>,
    geocoder_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    track: Option<PathBuf>,
    replay_interval_ms: Option<u64>,
    distance_filter: Option<f64>,
    high_accuracy: Option<bool>,
    position_timeout_ms: Option<u64>,
    maximum_age_ms: Option<u64>,
    permission: Option<PermissionPolicy>,
    history: Option<HistoryMode>,
    device_id: Option<String>,
    device_name: Option<String>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let mut file_cfg = if let Some(path) = cli.config.as_ref() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file at {}", path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("failed to parse config file at {}", path.display()))?
        } else {
            FileConfig::default()
        };

        macro_rules! override_with {
            ($($field:ident),+ $(,)?) => {
                $(
                    if let Some(value) = cli.$field {
                        file_cfg.$field = Some(value);
                    }
                )+
            };
        }
        override_with!(
            ws_url,
            geocoder_url,
            geocoder_timeout_secs,
            user_agent,
            track,
            replay_interval_ms,
            distance_filter,
            high_accuracy,
            position_timeout_ms,
            maximum_age_ms,
            permission,
            history,
            device_id,
            device_name,
        );

        let distance_filter = file_cfg.distance_filter.unwrap_or(1.0);
        if !distance_filter.is_finite() {
            anyhow::bail!("distance_filter must be a finite number of meters");
        }

        let permission = file_cfg.permission.unwrap_or_default();
        if permission == PermissionPolicy::Prompt && file_cfg.track.is_none() {
            anyhow::bail!(
                "permission = prompt needs a track file: stdin already carries the position feed"
            );
        }

        Ok(Config {
            ws_url: file_cfg.ws_url.filter(|url| !url.trim().is_empty()),
            geocoder_url: file_cfg
                .geocoder_url
                .unwrap_or_else(|| DEFAULT_GEOCODER_URL.to_string()),
            geocoder_timeout: Duration::from_secs(file_cfg.geocoder_timeout_secs.unwrap_or(10).max(1)),
            user_agent: file_cfg
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            track: file_cfg.track,
            replay_interval: Duration::from_millis(file_cfg.replay_interval_ms.unwrap_or(1000)),
            distance_filter: distance_filter.max(0.0),
            high_accuracy: file_cfg.high_accuracy.unwrap_or(true),
            position_timeout: Duration::from_millis(file_cfg.position_timeout_ms.unwrap_or(15_000)),
            maximum_age: Duration::from_millis(file_cfg.maximum_age_ms.unwrap_or(10_000)),
            permission,
            history: file_cfg.history.unwrap_or_default(),
            device_id: file_cfg.device_id,
            device_name: file_cfg.device_name,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            watch: WatchOptions {
                position: PositionOptions {
                    high_accuracy: self.high_accuracy,
                    timeout: self.position_timeout,
                    maximum_age: self.maximum_age,
                },
                distance_filter: self.distance_filter,
            },
            history: self.history,
        }
    }
}

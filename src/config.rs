use crate::channel::ChannelConfig;
use crate::error::{PlayoutError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const CONFIG_DIR: &str = "logplay";
const CONFIG_FILE: &str = "config.json";

/// How much the machine does on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OpMode {
    /// Transitions fire on their own.
    #[default]
    Auto,
    /// Operator starts each line; timing is still tracked.
    LiveAssist,
    /// Nothing starts unless the operator says so.
    Manual,
}

impl OpMode {
    /// Parse a mode from a string (case-insensitive, accepts hyphens or underscores).
    pub fn from_str_loose(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "auto" | "automatic" => Ok(OpMode::Auto),
            "live-assist" | "live" | "liveassist" => Ok(OpMode::LiveAssist),
            "manual" => Ok(OpMode::Manual),
            _ => Err(format!(
                "Unknown mode '{}'. Expected: auto, live-assist, manual",
                s
            )),
        }
    }
}

impl fmt::Display for OpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpMode::Auto => write!(f, "auto"),
            OpMode::LiveAssist => write!(f, "live-assist"),
            OpMode::Manual => write!(f, "manual"),
        }
    }
}

/// Machine configuration, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Log machine number on this host.
    pub machine: u32,
    /// Service name stamped on traffic records.
    pub service_name: String,
    pub op_mode: OpMode,
    pub channels: [ChannelConfig; 2],
    pub deck_pool_size: usize,
    /// Size of the transport window of running and upcoming lines.
    pub transport_quantity: usize,
    /// How far ahead to look for the next playable line.
    pub lookahead_events: usize,
    pub rescan_interval_ms: u64,
    pub rescan_size: usize,
    /// How long to wait for a missing segue/finish cue before forcing the start.
    pub grace_ms: u32,
    /// Hard-timed lines may start this much before the previous line ends.
    pub preroll_ms: u32,
    pub segue_fade_ms: u32,
    pub stop_fade_ms: u32,
    /// Delay before retrying an automatic start that found no free deck.
    pub retry_ms: u32,
    pub audition_card: u32,
    pub audition_port: u32,
    /// Tail audition plays this much of the end of a line.
    pub audition_preroll_ms: u32,
    pub log_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pad_socket: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_state: Option<PathBuf>,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        PlayoutConfig {
            machine: 0,
            service_name: "Production".to_string(),
            op_mode: OpMode::Auto,
            channels: [
                ChannelConfig {
                    card: 0,
                    port: 0,
                    ..ChannelConfig::default()
                },
                ChannelConfig {
                    card: 0,
                    port: 1,
                    ..ChannelConfig::default()
                },
            ],
            deck_pool_size: 12,
            transport_quantity: 12,
            lookahead_events: 20,
            rescan_interval_ms: 5_000,
            rescan_size: 30,
            grace_ms: 2_000,
            preroll_ms: 0,
            segue_fade_ms: 500,
            stop_fade_ms: 0,
            retry_ms: 1_000,
            audition_card: 0,
            audition_port: 2,
            audition_preroll_ms: 10_000,
            log_dir: default_log_dir(),
            pad_socket: None,
            traffic_log: None,
            restart_state: None,
        }
    }
}

fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
        .join("logs")
}

impl PlayoutConfig {
    /// `<config dir>/logplay/config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    /// Load config from JSON, falling back to defaults if missing or corrupt.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(cfg) => return cfg,
                    Err(e) => warn!("corrupt config file {}, using defaults: {}", path.display(), e),
                },
                Err(e) => warn!("could not read config file {}: {}", path.display(), e),
            }
        }
        PlayoutConfig::default()
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.deck_pool_size == 0 || self.deck_pool_size >= u16::MAX as usize {
            return Err(PlayoutError::Config(format!(
                "deck_pool_size must be between 1 and {}",
                u16::MAX - 1
            )));
        }
        if self.transport_quantity == 0 {
            return Err(PlayoutError::Config(
                "transport_quantity must be at least 1".into(),
            ));
        }
        if self.lookahead_events == 0 {
            return Err(PlayoutError::Config(
                "lookahead_events must be at least 1".into(),
            ));
        }
        if self.rescan_size == 0 {
            return Err(PlayoutError::Config("rescan_size must be at least 1".into()));
        }
        Ok(())
    }
}

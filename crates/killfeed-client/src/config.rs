//! Client configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (KILLFEED_*, nested keys separated by `__`)

use anyhow::{Context, Result};
use ::config::{Environment, File, FileFormat};
use killfeed_protocol::endpoint::DEFAULT_CLIENT_IDENTIFIER;
use killfeed_protocol::{SystemId, LOBBY_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Files tried, in order, when no path is given.
const CONFIG_PATHS: [&str; 3] = [
    "killfeed.toml",
    "/etc/killfeed/killfeed.toml",
    "~/.config/killfeed/killfeed.toml",
];

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server base URL (`ws://`, `wss://`, `http://` or `https://`).
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Identifier sent in the connection URL.
    #[serde(default = "default_client_identifier")]
    pub client_identifier: String,

    /// Channel topic to join.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Systems to subscribe to after joining.
    #[serde(default = "default_systems")]
    pub systems: Vec<SystemId>,

    /// Join timeout in milliseconds.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    /// Heartbeat interval in milliseconds. Heartbeats are off when unset.
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Events buffered per consumer before the oldest are dropped.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Unanswered requests kept before the oldest is given up on.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,

    /// Delayed unsubscribe.
    #[serde(default)]
    pub unsubscribe: Option<UnsubscribeConfig>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Systems to drop some time after subscribing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    /// Delay after the initial subscribe, in seconds.
    #[serde(default = "default_unsubscribe_after")]
    pub after_secs: u64,

    /// Systems to unsubscribe from.
    #[serde(default)]
    pub systems: Vec<SystemId>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_server_url() -> String {
    "ws://localhost:4004".to_string()
}

fn default_client_identifier() -> String {
    DEFAULT_CLIENT_IDENTIFIER.to_string()
}

fn default_topic() -> String {
    LOBBY_TOPIC.to_string()
}

fn default_systems() -> Vec<SystemId> {
    vec![30000142, 30002659, 30002187] // Jita, Dodixie, Amarr
}

fn default_join_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_event_capacity() -> usize {
    1024
}

fn default_pending_limit() -> usize {
    1024
}

fn default_unsubscribe_after() -> u64 {
    300 // 5 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            client_identifier: default_client_identifier(),
            topic: default_topic(),
            systems: default_systems(),
            join_timeout_ms: default_join_timeout(),
            heartbeat_interval_ms: None,
            event_capacity: default_event_capacity(),
            pending_limit: default_pending_limit(),
            unsubscribe: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from a file and the environment.
    ///
    /// With no explicit path the first existing default location is used;
    /// a missing file is not an error then. Environment variables override
    /// the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the explicit file is missing or any source cannot
    /// be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
            }
            None => {
                let found = CONFIG_PATHS
                    .iter()
                    .map(|p| shellexpand::tilde(p).into_owned())
                    .find(|p| Path::new(p).exists());
                if let Some(found) = found {
                    builder = builder.add_source(File::new(&found, FileFormat::Toml));
                }
            }
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("KILLFEED")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("systems")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Join timeout as a duration.
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Heartbeat interval, if enabled.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

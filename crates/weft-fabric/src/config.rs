//! Fabric configuration loading from file and environment variables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Top-level fabric configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FabricConfig {
    /// Hub routing settings.
    #[serde(default)]
    pub hub: HubSection,

    /// Capability discovery settings.
    #[serde(default)]
    pub discovery: DiscoverySection,

    /// Per-agent rate and turn limits.
    #[serde(default)]
    pub limits: LimitsSection,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hub settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    /// Bound of each agent inbox.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// Bound of the in-memory message history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Seconds a timed-out request stays pollable for a late response.
    #[serde(default = "default_late_retention_secs")]
    pub late_retention_secs: u64,

    /// Seconds between janitor sweeps.
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,

    /// Seconds a timed-out partner is excluded from discovery.
    #[serde(default = "default_timeout_partner_ttl_secs")]
    pub timeout_partner_ttl_secs: u64,

    /// Default deadline for `send_and_wait` when the caller names none.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Discovery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Default minimum normalized similarity for semantic queries.
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Seconds since last activity before an agent counts as inactive.
    /// Zero disables the liveness check: registration alone counts.
    #[serde(default)]
    pub liveness_threshold_secs: u64,
}

/// Rate and turn limits applied to spawned agents.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Token budget per sliding minute.
    #[serde(default = "default_tokens_per_minute")]
    pub max_tokens_per_minute: u64,

    /// Token budget per sliding hour.
    #[serde(default = "default_tokens_per_hour")]
    pub max_tokens_per_hour: u64,

    /// Turn cap per conversation.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "weft_hub=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_inbox_capacity() -> usize {
    128
}

fn default_history_capacity() -> usize {
    256
}

fn default_late_retention_secs() -> u64 {
    15 * 60
}

fn default_janitor_interval_secs() -> u64 {
    60
}

fn default_timeout_partner_ttl_secs() -> u64 {
    5 * 60
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_min_score() -> f32 {
    0.3
}

fn default_tokens_per_minute() -> u64 {
    5_500
}

fn default_tokens_per_hour() -> u64 {
    100_000
}

fn default_max_turns() -> u32 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            history_capacity: default_history_capacity(),
            late_retention_secs: default_late_retention_secs(),
            janitor_interval_secs: default_janitor_interval_secs(),
            timeout_partner_ttl_secs: default_timeout_partner_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            liveness_threshold_secs: 0,
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: default_tokens_per_minute(),
            max_tokens_per_hour: default_tokens_per_hour(),
            max_turns: default_max_turns(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DiscoverySection {
    /// The liveness threshold as a duration, `None` when disabled.
    pub fn liveness_threshold(&self) -> Option<Duration> {
        if self.liveness_threshold_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.liveness_threshold_secs))
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `WEFT_LOG_LEVEL` overrides `logging.level`
/// - `WEFT_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `WEFT_INBOX_CAPACITY` overrides `hub.inbox_capacity`
/// - `WEFT_REQUEST_TIMEOUT_SECS` overrides `hub.request_timeout_secs`
/// - `WEFT_MIN_SCORE` overrides `discovery.min_score`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<FabricConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                FabricConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => FabricConfig::default(),
    };

    // Environment variable overrides
    if let Ok(level) = std::env::var("WEFT_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("WEFT_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(capacity) = std::env::var("WEFT_INBOX_CAPACITY") {
        if let Ok(parsed) = capacity.parse() {
            config.hub.inbox_capacity = parsed;
        }
    }
    if let Ok(timeout) = std::env::var("WEFT_REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = timeout.parse() {
            config.hub.request_timeout_secs = parsed;
        }
    }
    if let Ok(score) = std::env::var("WEFT_MIN_SCORE") {
        if let Ok(parsed) = score.parse() {
            config.discovery.min_score = parsed;
        }
    }

    Ok(config)
}

/// Initializes global tracing from the logging config.
///
/// Safe to call once per process; later calls are ignored.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}

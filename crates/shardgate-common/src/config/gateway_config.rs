//! Gateway client configuration structs
//!
//! Loads configuration from environment variables and validates it eagerly.

use serde::Deserialize;
use shardgate_core::{FailureCategory, TotalShards};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main gateway client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub env: Environment,
    /// Bot token used for Identify and the bootstrap request
    pub token: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_gateway_version")]
    pub gateway_version: u8,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default)]
    pub compression: CompressionMode,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Transport compression negotiated with the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMode {
    /// Plain frames
    None,
    /// Connection-wide zlib stream with sync-flush framing
    #[default]
    ZlibStream,
    /// Connection-wide zstd stream
    ZstdStream,
}

impl CompressionMode {
    /// Value of the `compress` query parameter, if any
    #[must_use]
    pub const fn query_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::ZlibStream => Some("zlib-stream"),
            Self::ZstdStream => Some("zstd-stream"),
        }
    }
}

impl FromStr for CompressionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "zlib" | "zlib-stream" => Ok(Self::ZlibStream),
            "zstd" | "zstd-stream" => Ok(Self::ZstdStream),
            other => Err(ConfigError::InvalidValue("SHARDGATE_COMPRESSION", other.to_string())),
        }
    }
}

/// Shard orchestration options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub total_shards: TotalShards,
    /// Subset of shards this process runs (empty = all)
    pub shard_list: Vec<u32>,
    pub spawn_delay_ms: u64,
    pub large_threshold: u64,
    pub very_large_threshold: u64,
    pub heartbeat_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
    /// Identify operations granted per rolling window
    pub identify_limit: u32,
    pub identify_window_ms: u64,
    /// Per-shard spawn handoff budget (`None` = `spawn_delay_ms`)
    pub handoff_timeout_ms: Option<u64>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_tick_ms: u64,
    pub max_concurrency_ceiling: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            total_shards: TotalShards::Auto,
            shard_list: Vec::new(),
            spawn_delay_ms: 5_000,
            large_threshold: 2_500,
            very_large_threshold: 150_000,
            heartbeat_timeout_ms: 45_000,
            health_check_interval_ms: 30_000,
            max_reconnect_attempts: 5,
            auto_reconnect: true,
            identify_limit: 120,
            identify_window_ms: 60_000,
            handoff_timeout_ms: None,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_tick_ms: 500,
            max_concurrency_ceiling: 16,
        }
    }
}

impl ShardingConfig {
    #[must_use]
    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    #[must_use]
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms.unwrap_or(self.spawn_delay_ms))
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub fn identify_window(&self) -> Duration {
        Duration::from_millis(self.identify_window_ms)
    }

    #[must_use]
    pub fn reconnect_tick(&self) -> Duration {
        Duration::from_millis(self.reconnect_tick_ms)
    }

    /// Check option bounds and combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("spawn_delay_ms", self.spawn_delay_ms),
            ("large_threshold", self.large_threshold),
            ("very_large_threshold", self.very_large_threshold),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("identify_window_ms", self.identify_window_ms),
            ("reconnect_tick_ms", self.reconnect_tick_ms),
            ("identify_limit", u64::from(self.identify_limit)),
            ("max_concurrency_ceiling", u64::from(self.max_concurrency_ceiling)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(name, "must be positive".to_string()));
            }
        }

        if self.very_large_threshold < self.large_threshold {
            return Err(ConfigError::Conflict(format!(
                "very_large_threshold ({}) is below large_threshold ({})",
                self.very_large_threshold, self.large_threshold
            )));
        }

        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Conflict(
                "reconnect_max_delay_ms is below reconnect_base_delay_ms".to_string(),
            ));
        }

        if self.handoff_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue(
                "handoff_timeout_ms",
                "must be positive".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for &shard_id in &self.shard_list {
            if !seen.insert(shard_id) {
                return Err(ConfigError::Conflict(format!(
                    "shard {shard_id} listed more than once in shard_list"
                )));
            }
            if let TotalShards::Fixed(total) = self.total_shards {
                if shard_id >= total {
                    return Err(ConfigError::Conflict(format!(
                        "shard_list entry {shard_id} is out of range for {total} total shards"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Circuit breaker options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Failures before opening, for categories without an override
    pub failure_threshold: u32,
    pub category_thresholds: HashMap<FailureCategory, u32>,
    /// Categories that open the circuit on the first failure
    pub break_immediately: HashSet<FailureCategory>,
    pub reset_timeout_ms: u64,
    pub reset_multiplier: f64,
    pub max_reset_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            category_thresholds: HashMap::from([
                (FailureCategory::RateLimit, 3),
                (FailureCategory::Network, 5),
                (FailureCategory::Timeout, 5),
            ]),
            break_immediately: HashSet::from([FailureCategory::Authentication]),
            reset_timeout_ms: 30_000,
            reset_multiplier: 2.0,
            max_reset_timeout_ms: 300_000,
        }
    }
}

impl CircuitConfig {
    /// Threshold for a category (override, else the global default)
    #[must_use]
    pub fn threshold_for(&self, category: FailureCategory) -> u32 {
        self.category_thresholds
            .get(&category)
            .copied()
            .unwrap_or(self.failure_threshold)
    }

    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    #[must_use]
    pub fn max_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.max_reset_timeout_ms)
    }

    /// Check option bounds and combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "circuit_failure_threshold",
                "must be positive".to_string(),
            ));
        }
        if let Some((category, _)) = self.category_thresholds.iter().find(|(_, t)| **t == 0) {
            return Err(ConfigError::InvalidValue(
                "circuit_category_thresholds",
                format!("threshold for {category} must be positive"),
            ));
        }
        if self.reset_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "circuit_reset_timeout_ms",
                "must be positive".to_string(),
            ));
        }
        if !self.reset_multiplier.is_finite() || self.reset_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "circuit_reset_multiplier",
                format!("{} is below 1.0", self.reset_multiplier),
            ));
        }
        if self.max_reset_timeout_ms < self.reset_timeout_ms {
            return Err(ConfigError::Conflict(
                "circuit_max_reset_timeout_ms is below circuit_reset_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_gateway_url() -> String {
    "wss://gateway.discord.gg".to_string()
}

fn default_api_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_gateway_version() -> u8 {
    10
}

fn default_intents() -> u64 {
    513 // GUILDS | GUILD_MESSAGES
}

impl GatewayConfig {
    /// Configuration with defaults for everything but the token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            env: Environment::default(),
            token: token.into(),
            gateway_url: default_gateway_url(),
            api_url: default_api_url(),
            gateway_version: default_gateway_version(),
            intents: default_intents(),
            compression: CompressionMode::default(),
            sharding: ShardingConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if required variables are missing or any value is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("SHARDGATE_TOKEN").ok_or(ConfigError::MissingVar("SHARDGATE_TOKEN"))?;
        let mut config = Self::new(token);

        if let Some(env) = lookup("SHARDGATE_ENV") {
            config.env = match env.to_lowercase().as_str() {
                "production" => Environment::Production,
                "staging" => Environment::Staging,
                "development" => Environment::Development,
                other => return Err(ConfigError::InvalidValue("SHARDGATE_ENV", other.to_string())),
            };
        }
        if let Some(url) = lookup("SHARDGATE_GATEWAY_URL") {
            config.gateway_url = url;
        }
        if let Some(url) = lookup("SHARDGATE_API_URL") {
            config.api_url = url;
        }
        if let Some(version) = parse_var(&lookup, "SHARDGATE_GATEWAY_VERSION")? {
            config.gateway_version = version;
        }
        if let Some(intents) = parse_var(&lookup, "SHARDGATE_INTENTS")? {
            config.intents = intents;
        }
        if let Some(mode) = lookup("SHARDGATE_COMPRESSION") {
            config.compression = mode.parse()?;
        }

        let sharding = &mut config.sharding;
        if let Some(total) = lookup("SHARDGATE_TOTAL_SHARDS") {
            sharding.total_shards = total
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SHARDGATE_TOTAL_SHARDS", total.clone()))?;
        }
        if let Some(list) = lookup("SHARDGATE_SHARD_LIST") {
            sharding.shard_list = parse_list(&list)
                .ok_or(ConfigError::InvalidValue("SHARDGATE_SHARD_LIST", list.clone()))?;
        }
        set_parsed(&lookup, "SHARDGATE_SPAWN_DELAY_MS", &mut sharding.spawn_delay_ms)?;
        set_parsed(&lookup, "SHARDGATE_LARGE_THRESHOLD", &mut sharding.large_threshold)?;
        set_parsed(&lookup, "SHARDGATE_VERY_LARGE_THRESHOLD", &mut sharding.very_large_threshold)?;
        set_parsed(&lookup, "SHARDGATE_HEARTBEAT_TIMEOUT_MS", &mut sharding.heartbeat_timeout_ms)?;
        set_parsed(
            &lookup,
            "SHARDGATE_HEALTH_CHECK_INTERVAL_MS",
            &mut sharding.health_check_interval_ms,
        )?;
        set_parsed(
            &lookup,
            "SHARDGATE_MAX_RECONNECT_ATTEMPTS",
            &mut sharding.max_reconnect_attempts,
        )?;
        set_parsed(&lookup, "SHARDGATE_AUTO_RECONNECT", &mut sharding.auto_reconnect)?;
        set_parsed(&lookup, "SHARDGATE_IDENTIFY_LIMIT", &mut sharding.identify_limit)?;
        set_parsed(&lookup, "SHARDGATE_IDENTIFY_WINDOW_MS", &mut sharding.identify_window_ms)?;
        if let Some(timeout) = parse_var(&lookup, "SHARDGATE_HANDOFF_TIMEOUT_MS")? {
            sharding.handoff_timeout_ms = Some(timeout);
        }

        let circuit = &mut config.circuit;
        set_parsed(&lookup, "SHARDGATE_CIRCUIT_FAILURE_THRESHOLD", &mut circuit.failure_threshold)?;
        set_parsed(&lookup, "SHARDGATE_CIRCUIT_RESET_TIMEOUT_MS", &mut circuit.reset_timeout_ms)?;
        set_parsed(&lookup, "SHARDGATE_CIRCUIT_RESET_MULTIPLIER", &mut circuit.reset_multiplier)?;
        set_parsed(
            &lookup,
            "SHARDGATE_CIRCUIT_MAX_RESET_TIMEOUT_MS",
            &mut circuit.max_reset_timeout_ms,
        )?;
        if let Some(raw) = lookup("SHARDGATE_CIRCUIT_THRESHOLDS") {
            circuit.category_thresholds = parse_category_thresholds(&raw)
                .ok_or(ConfigError::InvalidValue("SHARDGATE_CIRCUIT_THRESHOLDS", raw.clone()))?;
        }
        if let Some(raw) = lookup("SHARDGATE_CIRCUIT_BREAK_IMMEDIATELY") {
            circuit.break_immediately = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(FailureCategory::from_str)
                .collect::<Option<HashSet<_>>>()
                .ok_or(ConfigError::InvalidValue("SHARDGATE_CIRCUIT_BREAK_IMMEDIATELY", raw.clone()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::InvalidValue("SHARDGATE_TOKEN", "empty".to_string()));
        }
        if !(self.gateway_url.starts_with("ws://") || self.gateway_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "SHARDGATE_GATEWAY_URL",
                self.gateway_url.clone(),
            ));
        }
        self.sharding.validate()?;
        self.circuit.validate()
    }

    /// Gateway URL with version, encoding and compression query parameters
    #[must_use]
    pub fn connect_url(&self) -> String {
        self.connect_url_for(&self.gateway_url)
    }

    /// Same query parameters on another base URL (e.g. a resume URL from READY)
    #[must_use]
    pub fn connect_url_for(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        let mut url = format!("{base}/?v={}&encoding=json", self.gateway_version);
        if let Some(compress) = self.compression.query_value() {
            url.push_str("&compress=");
            url.push_str(compress);
        }
        url
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key, raw)),
    }
}

fn set_parsed<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = parse_var(lookup, key)? {
        *target = value;
    }
    Ok(())
}

fn parse_list(raw: &str) -> Option<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

fn parse_category_thresholds(raw: &str) -> Option<HashMap<FailureCategory, u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, threshold) = pair.split_once('=')?;
            Some((FailureCategory::from_str(name)?, threshold.trim().parse().ok()?))
        })
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("Conflicting configuration: {0}")]
    Conflict(String),
}

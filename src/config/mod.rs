use crate::oracle::{ReconcilerSettings, ServiceSettings};
use alloy::primitives::{Address, U256};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid oracle address {0:?}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC HTTP endpoint used for log queries, views and transactions.
    #[serde(default = "default_http_url")]
    pub http_url: String,
    /// Primary WebSocket endpoint for live log subscriptions. Empty = poll only.
    #[serde(default)]
    pub ws_url: String,
    /// Fallback WebSocket endpoints, tried in order after the primary.
    #[serde(default)]
    pub fallback_ws_urls: Vec<String>,
    /// Address of the property valuation oracle contract.
    #[serde(default)]
    pub oracle_address: String,
    /// How many blocks of history to re-read on startup.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    /// Max blocks per eth_getLogs request.
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
    /// Interval between log polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Wallet private key - loaded from env ORACLE_PRIVATE_KEY
    #[serde(default)]
    pub private_key: String,
    /// Valuation data API key - loaded from env ORACLE_API_KEY
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Reconciliation tick in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Age after which an unanswered request is auto-resolved (if simulation is on).
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    /// Age after which a pending request is hidden from the pending count.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Minimum time between a resolution and the next request for a property.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Max events kept in memory.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Emit a metrics summary every N ticks (0 = never).
    #[serde(default = "default_summary_every_ticks")]
    pub summary_every_ticks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Synthesize a resolution when the oracle has not answered in time.
    /// Demo behaviour for oracle backends that never call back.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Valuation reported by synthesized resolutions.
    #[serde(default = "default_placeholder_valuation")]
    pub placeholder_valuation: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Properties whose oracle status is logged periodically.
    #[serde(default)]
    pub property_ids: Vec<u64>,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_http_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_lookback_blocks() -> u64 {
    5_000
}
fn default_log_chunk_size() -> u64 {
    9_999
}
fn default_poll_interval_ms() -> u64 {
    4_000
}
fn default_tick_ms() -> u64 {
    1_000
}
fn default_resolve_timeout_secs() -> u64 {
    5
}
fn default_stale_after_secs() -> u64 {
    600
}
fn default_cooldown_secs() -> u64 {
    3_600
}
fn default_log_capacity() -> usize {
    10_000
}
fn default_summary_every_ticks() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_placeholder_valuation() -> u64 {
    500_000
}
fn default_status_interval_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            cooldown_secs: default_cooldown_secs(),
            log_capacity: default_log_capacity(),
            summary_every_ticks: default_summary_every_ticks(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            placeholder_valuation: default_placeholder_valuation(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            property_ids: Vec::new(),
            status_interval_secs: default_status_interval_secs(),
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

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Parse config from TOML text without touching the environment.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load a default config with endpoints and secrets from the environment (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            chain: ChainConfig {
                http_url: default_http_url(),
                ws_url: String::new(),
                fallback_ws_urls: Vec::new(),
                oracle_address: String::new(),
                lookback_blocks: default_lookback_blocks(),
                log_chunk_size: default_log_chunk_size(),
                poll_interval_ms: default_poll_interval_ms(),
                private_key: String::new(),
                api_key: String::new(),
            },
            reconcile: ReconcileConfig::default(),
            simulation: SimulationConfig::default(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        config
    }

    // Secrets are never stored in the config file.
    fn overlay_env(&mut self) {
        if let Ok(url) = std::env::var("ORACLE_HTTP_URL") {
            self.chain.http_url = url;
        }
        if let Ok(url) = std::env::var("ORACLE_WS_URL") {
            self.chain.ws_url = url;
        }
        if let Ok(addr) = std::env::var("ORACLE_ADDRESS") {
            self.chain.oracle_address = addr;
        }
        if let Ok(key) = std::env::var("ORACLE_PRIVATE_KEY") {
            self.chain.private_key = key;
        }
        if let Ok(key) = std::env::var("ORACLE_API_KEY") {
            self.chain.api_key = key;
        }
    }

    pub fn oracle_address(&self) -> Result<Address, ConfigError> {
        let raw = self.chain.oracle_address.trim();
        if raw.is_empty() {
            return Err(ConfigError::Missing("chain.oracle_address".to_string()));
        }
        Address::from_str(raw).map_err(|_| ConfigError::InvalidAddress(raw.to_string()))
    }

    pub fn has_wallet(&self) -> bool {
        !self.chain.private_key.is_empty()
    }

    pub fn api_key(&self) -> Option<&str> {
        if self.chain.api_key.is_empty() {
            None
        } else {
            Some(&self.chain.api_key)
        }
    }

    /// Primary WebSocket URL first, then fallbacks, without blanks or repeats.
    pub fn ws_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        if !self.chain.ws_url.is_empty() {
            urls.push(self.chain.ws_url.clone());
        }
        for url in &self.chain.fallback_ws_urls {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            tick: Duration::from_millis(self.reconcile.tick_ms.max(1)),
            poll_interval: Duration::from_millis(self.chain.poll_interval_ms.max(1)),
            lookback_blocks: self.chain.lookback_blocks,
            chunk_size: self.chain.log_chunk_size,
            ws_urls: self.ws_urls(),
            reconciler: self.reconciler_settings(),
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            resolve_timeout: Duration::from_secs(self.reconcile.resolve_timeout_secs),
            stale_after: Duration::from_secs(self.reconcile.stale_after_secs),
            cooldown: Duration::from_secs(self.reconcile.cooldown_secs),
            simulate_resolutions: self.simulation.enabled,
            placeholder_valuation: U256::from(self.simulation.placeholder_valuation),
            log_capacity: self.reconcile.log_capacity,
            summary_every_ticks: self.reconcile.summary_every_ticks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_reference_timings() {
        let config = Config::parse(
            r#"
            [chain]
            oracle_address = "0x00000000000000000000000000000000000000aa"
            "#,
        )
        .unwrap();

        let settings = config.reconciler_settings();
        assert_eq!(settings.resolve_timeout, Duration::from_secs(5));
        assert_eq!(settings.stale_after, Duration::from_secs(600));
        assert_eq!(settings.cooldown, Duration::from_secs(3600));
        assert!(settings.simulate_resolutions);
        assert_eq!(config.reconcile.tick_ms, 1000);
        assert!(config.oracle_address().is_ok());
        assert!(!config.has_wallet());
    }

    #[test]
    fn test_ws_urls_skip_blanks_and_duplicates() {
        let config = Config::parse(
            r#"
            [chain]
            ws_url = "wss://a"
            fallback_ws_urls = ["", "wss://a", "wss://b"]
            "#,
        )
        .unwrap();
        assert_eq!(config.ws_urls(), vec!["wss://a".to_string(), "wss://b".to_string()]);
    }

    #[test]
    fn test_missing_and_invalid_address() {
        let config = Config::parse("[chain]\n").unwrap();
        assert!(matches!(config.oracle_address(), Err(ConfigError::Missing(_))));

        let config = Config::parse("[chain]\noracle_address = \"nope\"\n").unwrap();
        assert!(matches!(
            config.oracle_address(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}

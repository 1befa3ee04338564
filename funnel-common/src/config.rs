//! Configuration management for the funnel scanner.
//!
//! The scanner reads a single JSON file at `~/.funnel/config.json`. Every
//! section and field has a default, so a missing file or a partial file is
//! valid input.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (see below)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `FUNNEL_LOG_LEVEL` → observability.log_level
//! - `FUNNEL_LOG_FORMAT` → observability.log_format
//! - `FUNNEL_DB_PATH` → database.path
//! - `FUNNEL_EXCHANGE_URL` → exchange.base_url
//! - `FUNNEL_STRATEGY` → funnel.strategy
//! - `MEXC_API_KEY` → exchange.api_key
//!
//! # Example
//!
//! ```json
//! {
//!   "exchange": { "base_url": "https://api.mexc.com", "min_request_interval_ms": 100 },
//!   "database": { "path": "~/.funnel/funnel.db" },
//!   "funnel": { "strategy": "balanced", "refine_threshold": 0.4 },
//!   "observability": { "log_level": "info", "log_format": "pretty" }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".funnel"),
        |dirs| dirs.home_dir().join(".funnel"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Exchange Configuration
// ============================================================================

/// Market data endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// REST base URL (no trailing slash)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent as `X-MEXC-APIKEY` when present
    #[serde(default)]
    pub api_key: Option<String>,

    /// Refuse to start without an API key
    #[serde(default)]
    pub require_api_key: bool,

    /// Minimum spacing between the starts of two requests
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Quote asset that defines the tradable universe
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Symbol used by the startup connectivity check
    #[serde(default = "default_health_check_symbol")]
    pub health_check_symbol: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            require_api_key: false,
            min_request_interval_ms: default_min_request_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            quote_asset: default_quote_asset(),
            health_check_symbol: default_health_check_symbol(),
        }
    }
}

// ============================================================================
// Database Configuration
// ============================================================================

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; `~` is expanded
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Database path with `~` and environment variables expanded.
    pub fn resolved_path(&self) -> PathBuf {
        let expanded = shellexpand::full(&self.path)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.path.clone());
        PathBuf::from(expanded)
    }
}

// ============================================================================
// Funnel Configuration
// ============================================================================

/// Stage schedules, promotion limits and signal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Cron expression for the hourly scan (stage A)
    #[serde(default = "default_hourly_cron")]
    pub hourly_cron: String,

    /// Cron expression for the 15m refinement (stage B)
    #[serde(default = "default_refine_cron")]
    pub refine_cron: String,

    /// Cron expression for the 5m confirmation (stage C)
    #[serde(default = "default_confirm_cron")]
    pub confirm_cron: String,

    /// Cron expression for the daily universe refresh
    #[serde(default = "default_sync_cron")]
    pub sync_cron: String,

    /// Strategy applied when evaluating bars
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Candidates kept by the hourly scan
    #[serde(default = "default_hourly_top_n")]
    pub hourly_top_n: usize,

    /// Candidates kept by the refinement
    #[serde(default = "default_refine_top_n")]
    pub refine_top_n: usize,

    /// Minimum 15m composite score for promotion to stage C
    #[serde(default = "default_refine_threshold")]
    pub refine_threshold: f64,

    /// Stored 1h bars a symbol needs before the hourly scan considers it
    #[serde(default = "default_min_history_bars")]
    pub min_history_bars: usize,

    /// Bars fetched per symbol on every stage run
    #[serde(default = "default_kline_fetch_limit")]
    pub kline_fetch_limit: u32,

    /// Consecutive kline failures before a symbol is deactivated
    #[serde(default = "default_max_kline_failures")]
    pub max_kline_failures: u32,

    /// Age after which ranked snapshots are pruned
    #[serde(default = "default_snapshot_retention_hours")]
    pub snapshot_retention_hours: i64,

    /// Age after which stored klines are pruned
    #[serde(default = "default_kline_retention_days")]
    pub kline_retention_days: i64,

    /// Depth of the one-time 1h history backfill
    #[serde(default = "default_backfill_days")]
    pub backfill_days: i64,

    /// 24h quote volume a symbol needs for the hourly scan; 0 disables the filter
    #[serde(default = "default_min_quote_volume")]
    pub min_quote_volume: f64,

    /// Look-back for the momentum rate of change on 15m and 5m bars
    #[serde(default = "default_momentum_period")]
    pub momentum_period: usize,

    /// Stop-loss distance below the signal price
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Take-profit distance above the signal price
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            hourly_cron: default_hourly_cron(),
            refine_cron: default_refine_cron(),
            confirm_cron: default_confirm_cron(),
            sync_cron: default_sync_cron(),
            strategy: default_strategy(),
            hourly_top_n: default_hourly_top_n(),
            refine_top_n: default_refine_top_n(),
            refine_threshold: default_refine_threshold(),
            min_history_bars: default_min_history_bars(),
            kline_fetch_limit: default_kline_fetch_limit(),
            max_kline_failures: default_max_kline_failures(),
            snapshot_retention_hours: default_snapshot_retention_hours(),
            kline_retention_days: default_kline_retention_days(),
            backfill_days: default_backfill_days(),
            min_quote_volume: default_min_quote_volume(),
            momentum_period: default_momentum_period(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub funnel: FunnelConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration (explicit path or default) with environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("FUNNEL_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("FUNNEL_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(path) = std::env::var("FUNNEL_DB_PATH") {
            self.database.path = path;
        }
        if let Ok(url) = std::env::var("FUNNEL_EXCHANGE_URL") {
            self.exchange.base_url = url;
        }
        if let Ok(strategy) = std::env::var("FUNNEL_STRATEGY") {
            self.funnel.strategy = strategy;
        }
        if let Ok(key) = std::env::var("MEXC_API_KEY") {
            if !key.is_empty() {
                self.exchange.api_key = Some(key);
            }
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_base_url() -> String {
    "https://api.mexc.com".into()
}
fn default_min_request_interval_ms() -> u64 {
    100
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_quote_asset() -> String {
    "USDT".into()
}
fn default_health_check_symbol() -> String {
    "BTCUSDT".into()
}
fn default_db_path() -> String {
    config_dir().join("funnel.db").to_string_lossy().into_owned()
}
fn default_hourly_cron() -> String {
    "0 1 * * * *".into()
}
fn default_refine_cron() -> String {
    "0 2/15 * * * *".into()
}
fn default_confirm_cron() -> String {
    "0 3/5 * * * *".into()
}
fn default_sync_cron() -> String {
    "0 30 0 * * *".into()
}
fn default_strategy() -> String {
    "balanced".into()
}
fn default_hourly_top_n() -> usize {
    100
}
fn default_refine_top_n() -> usize {
    20
}
fn default_refine_threshold() -> f64 {
    0.4
}
fn default_min_history_bars() -> usize {
    200
}
fn default_kline_fetch_limit() -> u32 {
    250
}
fn default_max_kline_failures() -> u32 {
    5
}
fn default_snapshot_retention_hours() -> i64 {
    24
}
fn default_kline_retention_days() -> i64 {
    30
}
fn default_backfill_days() -> i64 {
    30
}
fn default_min_quote_volume() -> f64 {
    100_000.0
}
fn default_momentum_period() -> usize {
    10
}
fn default_stop_loss_pct() -> f64 {
    0.05
}
fn default_take_profit_pct() -> f64 {
    0.10
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

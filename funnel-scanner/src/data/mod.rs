//! Market data module.
//!
//! Provides the exchange client, the rate gate that spaces its requests, the
//! provider trait the funnel stages depend on, and SQLite persistence.

mod client;
mod provider;
mod rate_limiter;
pub mod local_storage;

pub use client::{ClientError, ExchangeClient, FailureKind};
pub use provider::{KlineQuery, MarketDataSource, MAX_KLINE_LIMIT};
pub use rate_limiter::{RateGate, SharedRateGate};
pub use local_storage::{LocalStorage, LocalStorageConfig, LocalStorageStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::indicators::Trend;

// ============================================================================
// Timeframe
// ============================================================================

/// Bar interval used by the funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    /// 5-minute bars (stage C)
    M5,
    /// 15-minute bars (stage B)
    M15,
    /// 1-hour bars (stage A)
    H1,
}

impl Timeframe {
    /// All timeframes, longest first.
    pub const ALL: [Timeframe; 3] = [Timeframe::H1, Timeframe::M15, Timeframe::M5];

    /// Parse from string (e.g., "1h", "60m", "15m", "M5").
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1h" | "h1" | "60m" => Some(Self::H1),
            "15m" | "m15" => Some(Self::M15),
            "5m" | "m5" => Some(Self::M5),
            _ => None,
        }
    }

    /// Interval string understood by the exchange kline endpoint.
    pub fn api_interval(&self) -> &'static str {
        match self {
            Self::H1 => "60m",
            Self::M15 => "15m",
            Self::M5 => "5m",
        }
    }

    /// Table holding enriched bars of this timeframe.
    pub fn kline_table(&self) -> &'static str {
        match self {
            Self::H1 => "klines_1h",
            Self::M15 => "klines_15m",
            Self::M5 => "klines_5m",
        }
    }

    /// Table holding ranked snapshots produced at this timeframe, if any.
    pub fn snapshot_table(&self) -> Option<&'static str> {
        match self {
            Self::H1 => Some("top_symbols_1h"),
            Self::M15 => Some("top_symbols_15m"),
            Self::M5 => None,
        }
    }

    /// Bars per year, used to annualise volatility.
    pub fn periods_per_year(&self) -> f64 {
        match self {
            Self::H1 => 24.0 * 365.0,
            Self::M15 => 4.0 * 24.0 * 365.0,
            Self::M5 => 12.0 * 24.0 * 365.0,
        }
    }

    /// Bar length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::H1 => 60 * 60 * 1000,
            Self::M15 => 15 * 60 * 1000,
            Self::M5 => 5 * 60 * 1000,
        }
    }

    /// Whether enriched bars of this timeframe carry a momentum column.
    pub fn has_momentum(&self) -> bool {
        !matches!(self, Self::H1)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H1 => write!(f, "1h"),
            Self::M15 => write!(f, "15m"),
            Self::M5 => write!(f, "5m"),
        }
    }
}

// ============================================================================
// Bars
// ============================================================================

/// A single OHLCV bar as delivered by the exchange.
///
/// Numeric fields that failed to parse are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Open time, milliseconds since epoch
    pub open_time: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    /// Close time, milliseconds since epoch
    pub close_time: Option<i64>,
    pub quote_volume: Option<f64>,
}

/// A bar plus the indicator values derived for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedBar {
    pub bar: Bar,
    pub timeframe: Timeframe,
    pub ma_10: Option<f64>,
    pub ma_50: Option<f64>,
    pub rsi_14: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub volume_spike: Option<bool>,
    pub vol_ratio_5: Option<f64>,
    pub vol_ratio_10: Option<f64>,
    /// Annualised with this timeframe's periods per year
    pub volatility: Option<f64>,
    pub trend: Option<Trend>,
    /// Composite probability score in [-1, 1]
    pub prob_score: f64,
    /// Only present on 15m and 5m bars
    pub momentum_roc: Option<f64>,
}

impl EnrichedBar {
    pub fn symbol(&self) -> &str {
        &self.bar.symbol
    }

    pub fn open_time(&self) -> i64 {
        self.bar.open_time
    }

    /// Percent distance of the short MA above the long MA.
    pub fn ma_diff_pct(&self) -> Option<f64> {
        let (short, long) = (self.ma_10?, self.ma_50?);
        if long == 0.0 {
            return None;
        }
        Some((short - long) / long * 100.0)
    }
}

// ============================================================================
// Universe
// ============================================================================

/// Symbol description from the exchange-info endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSymbol {
    pub symbol: String,
    #[serde(default)]
    pub base_asset: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default, deserialize_with = "status_as_string")]
    pub status: String,
    #[serde(default)]
    pub is_spot_trading_allowed: bool,
}

impl ExchangeSymbol {
    /// Status values the exchange uses for a live market.
    pub const LIVE_STATUSES: [&'static str; 3] = ["1", "ENABLED", "TRADING"];

    /// Whether the symbol belongs to the tradable universe for `quote_asset`.
    pub fn is_tradable(&self, quote_asset: &str) -> bool {
        self.is_spot_trading_allowed
            && self.quote_asset.eq_ignore_ascii_case(quote_asset)
            && Self::LIVE_STATUSES.contains(&self.status.as_str())
    }
}

fn status_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Stored symbol row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub status: String,
    pub is_active: bool,
    pub klines_fail_count: u32,
    pub date_added: DateTime<Utc>,
}

// ============================================================================
// Tickers
// ============================================================================

/// 24h rolling ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub volume: Option<f64>,
    pub quote_volume: Option<f64>,
}

impl Ticker24h {
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            symbol: value.get("symbol")?.as_str()?.to_string(),
            last_price: value.get("lastPrice").and_then(parse_number),
            volume: value.get("volume").and_then(parse_number),
            quote_volume: value.get("quoteVolume").and_then(parse_number),
        })
    }
}

/// Order book snapshot; each level is (price, quantity).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl OrderBook {
    pub(crate) fn from_value(value: &Value) -> Self {
        let levels = |key: &str| -> Vec<(f64, f64)> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let row = row.as_array()?;
                            Some((parse_number(row.first()?)?, parse_number(row.get(1)?)?))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            bids: levels("bids"),
            asks: levels("asks"),
        }
    }

    /// Midpoint of the best bid and ask.
    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first()?.0;
        let ask = self.asks.first()?.0;
        Some((bid + ask) / 2.0)
    }
}

// ============================================================================
// Funnel Output
// ============================================================================

/// A symbol ranked by a funnel stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub symbol: String,
    pub score: f64,
    /// 1-based rank within the snapshot
    pub rank: usize,
    pub timeframe: Timeframe,
    pub snapshot_at: DateTime<Utc>,
}

/// A persisted trade signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Assigned by storage
    pub id: Option<i64>,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub price: f64,
    pub volume: Option<f64>,
    pub strategy: String,
    pub prob_score: f64,
    pub confidence: f64,
    pub active_indicators: Vec<String>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub rsi: Option<f64>,
    pub ma_diff_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Parsing Helpers
// ============================================================================

/// Read a JSON number or numeric string.
pub(crate) fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Read a JSON integer or integer string (millisecond timestamps).
pub(crate) fn parse_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

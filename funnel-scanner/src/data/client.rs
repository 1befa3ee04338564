//! REST client for the spot exchange API.
//!
//! Every request passes through a [`RateGate`] and carries a timeout. All
//! failure modes (transport, timeout, non-2xx status, undecodable body and
//! in-body error objects) surface as [`ClientError::RequestFailed`]; the
//! [`FailureKind`] tag records which one happened.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use funnel_common::config::ExchangeConfig;

use super::provider::{KlineQuery, MarketDataSource};
use super::rate_limiter::{RateGate, SharedRateGate};
use super::{parse_number, Bar, ExchangeSymbol, OrderBook, Ticker24h, Timeframe};
use crate::enrichment::parse_klines;

const EXCHANGE_INFO_ENDPOINT: &str = "/api/v3/exchangeInfo";
const KLINES_ENDPOINT: &str = "/api/v3/klines";
const TICKER_24H_ENDPOINT: &str = "/api/v3/ticker/24hr";
const PRICE_ENDPOINT: &str = "/api/v3/ticker/price";
const DEPTH_ENDPOINT: &str = "/api/v3/depth";

/// Longest error body kept in a failure message.
const MAX_ERROR_BODY: usize = 256;

// ============================================================================
// Client Error
// ============================================================================

/// What went wrong with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection or I/O failure
    Transport,
    /// The request exceeded its timeout
    Timeout,
    /// Non-2xx HTTP status
    HttpStatus(u16),
    /// HTTP success with an error object in the body
    Api { code: i64 },
    /// Body was not the expected JSON
    Decode,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Timeout => write!(f, "timeout"),
            Self::HttpStatus(code) => write!(f, "http {}", code),
            Self::Api { code } => write!(f, "api code {}", code),
            Self::Decode => write!(f, "decode"),
        }
    }
}

/// Uniform request failure.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Request to {endpoint} failed ({kind}): {message}")]
    RequestFailed {
        endpoint: String,
        kind: FailureKind,
        message: String,
    },
}

impl ClientError {
    pub fn new(endpoint: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            endpoint: endpoint.to_string(),
            kind,
            message: message.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::RequestFailed { endpoint, .. } => endpoint,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RequestFailed { kind, .. } => *kind,
        }
    }
}

/// Error object embedded in an otherwise successful response, if any.
///
/// The exchange reports failures as `{"code": c, "msg": m}`; codes 0 and 200
/// mean success.
fn embedded_error(body: &Value) -> Option<(i64, String)> {
    let obj = body.as_object()?;
    let code = obj.get("code")?;
    let code = code
        .as_i64()
        .or_else(|| code.as_str().and_then(|s| s.trim().parse().ok()))?;
    if code == 0 || code == 200 {
        return None;
    }
    let msg = obj
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Some((code, msg))
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

// ============================================================================
// Exchange Client
// ============================================================================

/// Rate-limited client for the public market data endpoints.
pub struct ExchangeClient {
    /// Base URL without trailing slash
    base_url: String,
    /// Optional API key
    api_key: Option<String>,
    /// HTTP client
    client: reqwest::Client,
    /// Request spacing
    gate: SharedRateGate,
}

impl ExchangeClient {
    /// Create a client.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        min_interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
            gate: Arc::new(RateGate::new("exchange", min_interval)),
        })
    }

    /// Create from config.
    pub fn from_config(config: &ExchangeConfig) -> anyhow::Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.min_request_interval_ms),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform one gated GET and return the decoded body.
    pub async fn fetch(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, ClientError> {
        self.gate.acquire().await;

        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, params = ?params, "Fetching from exchange");

        let mut request = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .query(params);
        if let Some(key) = &self.api_key {
            request = request.header("X-MEXC-APIKEY", key);
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Transport
            };
            ClientError::new(endpoint, kind, e.to_string())
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Transport
            };
            ClientError::new(endpoint, kind, e.to_string())
        })?;

        if !status.is_success() {
            return Err(ClientError::new(
                endpoint,
                FailureKind::HttpStatus(status.as_u16()),
                truncate(body),
            ));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            ClientError::new(endpoint, FailureKind::Decode, format!("invalid JSON: {}", e))
        })?;

        if let Some((code, msg)) = embedded_error(&value) {
            warn!(endpoint, code, msg = %msg, "Exchange returned an error body");
            return Err(ClientError::new(endpoint, FailureKind::Api { code }, msg));
        }

        Ok(value)
    }
}

#[async_trait]
impl MarketDataSource for ExchangeClient {
    fn name(&self) -> &'static str {
        "mexc"
    }

    async fn exchange_info(&self) -> Result<Vec<ExchangeSymbol>, ClientError> {
        let value = self.fetch(EXCHANGE_INFO_ENDPOINT, &[]).await?;
        let symbols = value
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ClientError::new(EXCHANGE_INFO_ENDPOINT, FailureKind::Decode, "missing symbols array")
            })?;

        Ok(symbols
            .iter()
            .filter_map(|raw| match serde_json::from_value::<ExchangeSymbol>(raw.clone()) {
                Ok(sym) => Some(sym),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed exchange symbol");
                    None
                }
            })
            .collect())
    }

    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: KlineQuery,
    ) -> Result<Vec<Bar>, ClientError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("interval", timeframe.api_interval().to_string()),
        ];
        if let Some(limit) = query.effective_limit() {
            params.push(("limit", limit.to_string()));
        }
        if let Some(start) = query.start_time {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = query.end_time {
            params.push(("endTime", end.to_string()));
        }

        let value = self.fetch(KLINES_ENDPOINT, &params).await?;
        let rows = value.as_array().ok_or_else(|| {
            ClientError::new(KLINES_ENDPOINT, FailureKind::Decode, "expected an array of rows")
        })?;

        Ok(parse_klines(symbol, rows))
    }

    async fn ticker_24h(&self, symbol: Option<&str>) -> Result<Vec<Ticker24h>, ClientError> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let value = self.fetch(TICKER_24H_ENDPOINT, &params).await?;

        let tickers = match &value {
            Value::Array(items) => items.iter().filter_map(Ticker24h::from_value).collect(),
            Value::Object(_) => Ticker24h::from_value(&value).into_iter().collect(),
            _ => {
                return Err(ClientError::new(
                    TICKER_24H_ENDPOINT,
                    FailureKind::Decode,
                    "expected an object or array",
                ))
            }
        };
        Ok(tickers)
    }

    async fn price(&self, symbol: &str) -> Result<f64, ClientError> {
        let value = self
            .fetch(PRICE_ENDPOINT, &[("symbol", symbol.to_string())])
            .await?;
        value
            .get("price")
            .and_then(parse_number)
            .ok_or_else(|| ClientError::new(PRICE_ENDPOINT, FailureKind::Decode, "missing price"))
    }

    async fn depth(&self, symbol: &str, limit: u32) -> Result<OrderBook, ClientError> {
        let value = self
            .fetch(
                DEPTH_ENDPOINT,
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        if !value.is_object() {
            return Err(ClientError::new(
                DEPTH_ENDPOINT,
                FailureKind::Decode,
                "expected an object",
            ));
        }
        Ok(OrderBook::from_value(&value))
    }
}

// ============================================================================
// Tests
// ============================================================================

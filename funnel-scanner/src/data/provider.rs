//! Market data source abstraction.
//!
//! The funnel stages only talk to this trait, so the exchange client can be
//! swapped for a scripted source in tests.

use async_trait::async_trait;

use super::client::ClientError;
use super::{Bar, ExchangeSymbol, OrderBook, Ticker24h, Timeframe};

/// Maximum rows the kline endpoint returns per request.
pub const MAX_KLINE_LIMIT: u32 = 1000;

/// Paging parameters for a kline request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KlineQuery {
    pub limit: Option<u32>,
    /// Inclusive lower bound on open time (ms)
    pub start_time: Option<i64>,
    /// Inclusive upper bound on open time (ms)
    pub end_time: Option<i64>,
}

impl KlineQuery {
    /// The most recent `limit` bars.
    pub fn latest(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Up to `limit` bars opening at or after `start_time`.
    pub fn since(start_time: i64, limit: u32) -> Self {
        Self {
            limit: Some(limit),
            start_time: Some(start_time),
            end_time: None,
        }
    }

    /// Limit clamped to what the endpoint accepts.
    pub fn effective_limit(&self) -> Option<u32> {
        self.limit.map(|l| l.clamp(1, MAX_KLINE_LIMIT))
    }
}

/// Trait for market data sources.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Source name for logging
    fn name(&self) -> &'static str;

    /// Every symbol listed by the exchange.
    async fn exchange_info(&self) -> Result<Vec<ExchangeSymbol>, ClientError>;

    /// Bars for one symbol, oldest first.
    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: KlineQuery,
    ) -> Result<Vec<Bar>, ClientError>;

    /// 24h tickers for one symbol, or for all symbols when `symbol` is `None`.
    async fn ticker_24h(&self, symbol: Option<&str>) -> Result<Vec<Ticker24h>, ClientError>;

    /// Last traded price.
    async fn price(&self, symbol: &str) -> Result<f64, ClientError>;

    /// Top `limit` order book levels on each side.
    async fn depth(&self, symbol: &str, limit: u32) -> Result<OrderBook, ClientError>;

    /// Lightweight connectivity check: a one-row kline fetch.
    async fn health_check(&self, symbol: &str) -> Result<(), ClientError> {
        self.klines(symbol, Timeframe::H1, KlineQuery::latest(1))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_limits() {
        assert_eq!(KlineQuery::latest(5000).effective_limit(), Some(1000));
        assert_eq!(KlineQuery::latest(0).effective_limit(), Some(1));
        assert_eq!(KlineQuery::default().effective_limit(), None);

        let q = KlineQuery::since(1_000, 500);
        assert_eq!(q.start_time, Some(1_000));
        assert_eq!(q.end_time, None);
    }
}

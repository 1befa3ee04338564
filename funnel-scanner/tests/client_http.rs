//! Exchange client tests against a mock HTTP server.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use test_case::test_case;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use funnel_common::config::FunnelConfig;
use funnel_scanner::data::{
    ExchangeClient, ExchangeSymbol, FailureKind, KlineQuery, LocalStorage, MarketDataSource,
    Timeframe,
};
use funnel_scanner::funnel::FunnelStages;
use funnel_scanner::strategy::StrategyBook;

const HOUR_MS: i64 = 3_600_000;

fn client(server: &MockServer) -> ExchangeClient {
    ExchangeClient::new(server.uri(), None, Duration::ZERO, Duration::from_secs(2)).unwrap()
}

/// Hourly kline rows in the exchange's wire format, ending at the current hour.
fn kline_rows(count: usize) -> Value {
    let last = Utc::now().timestamp_millis() / HOUR_MS * HOUR_MS;
    let rows: Vec<Value> = (0..count)
        .map(|i| {
            let open_time = last - (count - 1 - i) as i64 * HOUR_MS;
            let close = 100.0 + i as f64;
            json!([
                open_time,
                format!("{}", close - 0.5),
                format!("{}", close + 1.0),
                format!("{}", close - 1.0),
                format!("{}", close),
                "1000",
                open_time + HOUR_MS - 1,
                format!("{}", close * 1000.0)
            ])
        })
        .collect();
    Value::Array(rows)
}

fn listing(symbol: &str) -> ExchangeSymbol {
    ExchangeSymbol {
        symbol: symbol.to_string(),
        base_asset: symbol.trim_end_matches("USDT").to_string(),
        quote_asset: "USDT".to_string(),
        status: "1".to_string(),
        is_spot_trading_allowed: true,
    }
}

#[tokio::test]
async fn test_klines_parse_wire_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("interval", "60m"))
        .and(query_param("limit", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_rows(3)))
        .mount(&server)
        .await;

    let bars = client(&server)
        .klines("BTCUSDT", Timeframe::H1, KlineQuery::latest(3))
        .await
        .unwrap();

    assert_eq!(bars.len(), 3);
    assert!(bars.windows(2).all(|w| w[1].open_time - w[0].open_time == HOUR_MS));
    assert_eq!(bars[2].close, Some(102.0));
    assert_eq!(bars[0].quote_volume, Some(100_000.0));
    assert!(bars.iter().all(|b| b.symbol == "BTCUSDT"));
}

#[tokio::test]
async fn test_error_body_with_http_200_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 500, "msg": "oversized request"})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .klines("BTCUSDT", Timeframe::H1, KlineQuery::latest(5000))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Api { code: 500 });
    assert_eq!(err.endpoint(), "/api/v3/klines");
    assert!(err.to_string().contains("oversized request"));
}

#[test_case(404 ; "not found")]
#[test_case(429 ; "rate limited")]
#[test_case(503 ; "unavailable")]
#[tokio::test]
async fn test_non_success_status_reports_code(status: u16) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
        .mount(&server)
        .await;

    let err = client(&server).price("BTCUSDT").await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::HttpStatus(status));
}

#[tokio::test]
async fn test_invalid_json_is_decode_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = client(&server).price("BTCUSDT").await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Decode);
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"symbol": "BTCUSDT", "price": "1"}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let client = ExchangeClient::new(
        server.uri(),
        None,
        Duration::ZERO,
        Duration::from_millis(200),
    )
    .unwrap();
    let err = client.price("BTCUSDT").await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Timeout);
}

#[tokio::test]
async fn test_ticker_accepts_object_or_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .and(query_param("symbol", "ETHUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "ETHUSDT", "lastPrice": "2500.5", "volume": "10", "quoteVolume": "25005"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "ETHUSDT", "lastPrice": "2500.5", "quoteVolume": "25005"},
            {"symbol": "BTCUSDT", "lastPrice": "60000", "quoteVolume": "bad"}
        ])))
        .mount(&server)
        .await;

    let client = client(&server);

    let single = client.ticker_24h(Some("ETHUSDT")).await.unwrap();
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].last_price, Some(2500.5));

    let all = client.ticker_24h(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].quote_volume, None);
}

#[tokio::test]
async fn test_exchange_info_skips_malformed_symbols() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [
                {"symbol": "BTCUSDT", "baseAsset": "BTC", "quoteAsset": "USDT",
                 "status": 1, "isSpotTradingAllowed": true},
                {"baseAsset": "NONAME"},
                {"symbol": "ETHBTC", "baseAsset": "ETH", "quoteAsset": "BTC",
                 "status": "ENABLED", "isSpotTradingAllowed": true}
            ]
        })))
        .mount(&server)
        .await;

    let symbols = client(&server).exchange_info().await.unwrap();
    assert_eq!(symbols.len(), 2);
    assert_eq!(symbols[0].status, "1");
    assert!(symbols[0].is_tradable("USDT"));
    assert!(!symbols[1].is_tradable("USDT"));
}

#[tokio::test]
async fn test_depth_levels_and_mid_price() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/depth"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bids": [["99.5", "2"], ["99.0", "1"]],
            "asks": [["100.5", "3"]]
        })))
        .mount(&server)
        .await;

    let book = client(&server).depth("BTCUSDT", 5).await.unwrap();
    assert_eq!(book.bids.len(), 2);
    assert_eq!(book.asks[0], (100.5, 3.0));
    assert_eq!(book.mid_price(), Some(100.0));
}

#[tokio::test]
async fn test_requests_are_spaced_by_min_interval() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"symbol": "BTCUSDT", "price": "1.5"})))
        .expect(4)
        .mount(&server)
        .await;

    let client = ExchangeClient::new(
        server.uri(),
        None,
        Duration::from_millis(100),
        Duration::from_secs(2),
    )
    .unwrap();

    let started = Instant::now();
    for _ in 0..4 {
        assert_eq!(client.price("BTCUSDT").await.unwrap(), 1.5);
    }
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_hourly_scan_survives_error_body_and_counts_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .and(query_param("symbol", "BADUSDT"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 500, "msg": "oversized request"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .and(query_param("symbol", "GOODUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_rows(60)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let storage = LocalStorage::open(dir.path().join("scan.db")).unwrap();
    storage
        .sync_symbols(&[listing("BADUSDT"), listing("GOODUSDT")], "USDT")
        .await
        .unwrap();

    let config = FunnelConfig {
        min_history_bars: 0,
        min_quote_volume: 0.0,
        ..Default::default()
    };
    let stages = FunnelStages::new(
        Arc::new(client(&server)),
        storage.clone(),
        StrategyBook::with_catalog(),
        config,
        "USDT",
    );

    let report = stages.run_hourly_scan().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failures, 1);
    assert!(!report.interrupted);

    let bad = storage.get_symbol("BADUSDT").await.unwrap().unwrap();
    assert_eq!(bad.klines_fail_count, 1);
    assert!(bad.is_active);
    assert_eq!(storage.count_bars("GOODUSDT", Timeframe::H1).await.unwrap(), 60);
}

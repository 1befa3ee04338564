//! Integration tests for the funnel stages and scheduler.
//!
//! A scripted market data source stands in for the exchange so that each
//! stage can be driven against known bars and injected failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use funnel_common::config::FunnelConfig;
use funnel_scanner::data::{
    Bar, ClientError, ExchangeSymbol, FailureKind, KlineQuery, LocalStorage, MarketDataSource,
    OrderBook, Ticker24h, Timeframe,
};
use funnel_scanner::funnel::{FunnelScheduler, FunnelStages, SchedulerState, Stage};
use funnel_scanner::strategy::StrategyBook;

// ============================================================================
// Scripted Source
// ============================================================================

/// Serves fixed bar series per (symbol, timeframe); symbols in `failing`
/// get an in-body API error instead.
struct ScriptedSource {
    listing: Vec<ExchangeSymbol>,
    series: HashMap<(String, Timeframe), Vec<Bar>>,
    failing: Mutex<HashSet<String>>,
    price: Option<f64>,
    book: Option<OrderBook>,
    kline_calls: AtomicU32,
    failed_calls: AtomicU32,
}

impl ScriptedSource {
    fn new(symbols: &[&str]) -> Self {
        Self {
            listing: symbols.iter().map(|s| listing(s)).collect(),
            series: HashMap::new(),
            failing: Mutex::new(HashSet::new()),
            price: None,
            book: None,
            kline_calls: AtomicU32::new(0),
            failed_calls: AtomicU32::new(0),
        }
    }

    fn with_series(mut self, symbol: &str, timeframe: Timeframe, closes: &[f64]) -> Self {
        self.series
            .insert((symbol.to_string(), timeframe), bars(symbol, timeframe, closes));
        self
    }

    fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    fn with_book(mut self, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> Self {
        self.book = Some(OrderBook {
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        });
        self
    }

    fn fail(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    fn recover(&self, symbol: &str) {
        self.failing.lock().unwrap().remove(symbol);
    }

    fn kline_calls(&self) -> u32 {
        self.kline_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MarketDataSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn exchange_info(&self) -> Result<Vec<ExchangeSymbol>, ClientError> {
        Ok(self.listing.clone())
    }

    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: KlineQuery,
    ) -> Result<Vec<Bar>, ClientError> {
        self.kline_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.lock().unwrap().contains(symbol) {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(ClientError::new(
                "/api/v3/klines",
                FailureKind::Api { code: 500 },
                "oversized request",
            ));
        }

        let all = self
            .series
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_default();
        let limit = query.effective_limit().map_or(all.len(), |l| l as usize);
        Ok(match query.start_time {
            Some(start) => all
                .into_iter()
                .filter(|b| b.open_time >= start)
                .take(limit)
                .collect(),
            None => {
                let skip = all.len().saturating_sub(limit);
                all.into_iter().skip(skip).collect()
            }
        })
    }

    async fn ticker_24h(&self, _symbol: Option<&str>) -> Result<Vec<Ticker24h>, ClientError> {
        Err(ClientError::new("/api/v3/ticker/24hr", FailureKind::Transport, "unreachable"))
    }

    async fn price(&self, _symbol: &str) -> Result<f64, ClientError> {
        self.price
            .ok_or_else(|| ClientError::new("/api/v3/ticker/price", FailureKind::Timeout, "slow"))
    }

    async fn depth(&self, _symbol: &str, _limit: u32) -> Result<OrderBook, ClientError> {
        self.book
            .clone()
            .ok_or_else(|| ClientError::new("/api/v3/depth", FailureKind::HttpStatus(503), "down"))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn listing(symbol: &str) -> ExchangeSymbol {
    ExchangeSymbol {
        symbol: symbol.to_string(),
        base_asset: symbol.trim_end_matches("USDT").to_string(),
        quote_asset: "USDT".to_string(),
        status: "ENABLED".to_string(),
        is_spot_trading_allowed: true,
    }
}

/// Bars with the given closes, the last one opening in the current interval.
fn bars(symbol: &str, timeframe: Timeframe, closes: &[f64]) -> Vec<Bar> {
    let step = timeframe.duration_ms();
    let last = Utc::now().timestamp_millis() / step * step;
    let n = closes.len() as i64;
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open_time = last - (n - 1 - i as i64) * step;
            Bar {
                symbol: symbol.to_string(),
                open_time,
                open: Some(close),
                high: Some(close),
                low: Some(close),
                close: Some(close),
                volume: Some(1000.0),
                close_time: Some(open_time + step - 1),
                quote_volume: Some(1000.0 * close),
            }
        })
        .collect()
}

/// Composite score of the last crossover bar.
const CROSSOVER_SCORE: f64 = 0.525 + 0.2 * 4.0 / 7.0;

/// 231 closes whose last bar is an MA crossover with oversold RSI: a slide
/// to 71, a rebound to 80.5, a drift down to 78.5 and a turn back up.
fn crossover_closes() -> Vec<f64> {
    let knots = [
        (0, 100.0),
        (180, 92.0),
        (190, 81.5),
        (205, 71.0),
        (210, 74.0),
        (215, 80.5),
        (227, 78.5),
        (229, 79.0),
        (230, 79.0),
    ];
    (0..=230)
        .map(|t| {
            let i = knots.iter().position(|k| t <= k.0).unwrap_or(knots.len() - 1).max(1);
            let ((t0, p0), (t1, p1)) = (knots[i - 1], knots[i]);
            p0 + (p1 - p0) * (t - t0) as f64 / (t1 - t0) as f64
        })
        .collect()
}

fn rising_closes(n: usize) -> Vec<f64> {
    (0..n).map(|i| 100.0 + i as f64).collect()
}

fn falling_closes(n: usize) -> Vec<f64> {
    (0..n).map(|i| 200.0 - i as f64).collect()
}

fn test_config() -> FunnelConfig {
    FunnelConfig {
        min_history_bars: 0,
        min_quote_volume: 0.0,
        ..Default::default()
    }
}

async fn setup(source: ScriptedSource, config: FunnelConfig) -> (TempDir, Arc<ScriptedSource>, FunnelStages) {
    let dir = TempDir::new().unwrap();
    let storage = LocalStorage::open(dir.path().join("funnel.db")).unwrap();
    let source = Arc::new(source);
    let stages = FunnelStages::new(
        source.clone(),
        storage,
        StrategyBook::with_catalog(),
        config,
        "USDT",
    );
    stages.sync_universe().await.unwrap();
    (dir, source, stages)
}

// ============================================================================
// Stage Tests
// ============================================================================

#[tokio::test]
async fn test_sync_keeps_only_tradable_quote_symbols() {
    let mut source = ScriptedSource::new(&["BTCUSDT", "ETHUSDT"]);
    source.listing.push(ExchangeSymbol {
        quote_asset: "BTC".into(),
        ..listing("ETHBTC")
    });
    source.listing.push(ExchangeSymbol {
        status: "2".into(),
        ..listing("HALTUSDT")
    });

    let (_dir, _source, stages) = setup(source, test_config()).await;
    let report = stages.run(Stage::Sync).await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(
        stages.storage().get_active_symbols().await.unwrap(),
        vec!["BTCUSDT", "ETHUSDT"]
    );
}

#[tokio::test]
async fn test_refinement_without_hourly_snapshot_does_nothing() {
    let (_dir, source, stages) = setup(ScriptedSource::new(&["BTCUSDT"]), test_config()).await;

    let report = tokio_test::assert_ok!(stages.run_refinement().await);
    assert_eq!(report.processed, 0);
    assert!(report.candidates.is_empty());
    assert_eq!(source.kline_calls(), 0);
}

#[tokio::test]
async fn test_full_funnel_emits_signal_with_risk_levels() {
    let source = ScriptedSource::new(&["WINUSDT", "QUIETUSDT"])
        .with_series("WINUSDT", Timeframe::H1, &crossover_closes())
        .with_series("WINUSDT", Timeframe::M15, &crossover_closes())
        .with_series("WINUSDT", Timeframe::M5, &rising_closes(60))
        .with_price(150.0);
    let (_dir, _source, stages) = setup(source, test_config()).await;

    let hourly = stages.run(Stage::Hourly).await.unwrap();
    assert_eq!(hourly.processed, 1);
    // no bars for QUIETUSDT
    assert_eq!(hourly.skipped, 1);
    assert_eq!(hourly.candidates.len(), 1);
    assert_eq!(hourly.candidates[0].symbol, "WINUSDT");
    assert_eq!(hourly.candidates[0].rank, 1);
    assert!((hourly.candidates[0].score - CROSSOVER_SCORE).abs() < 1e-9);
    assert_eq!(hourly.strategy_matches, vec!["WINUSDT"]);

    let refined = stages.run(Stage::Refine).await.unwrap();
    assert_eq!(refined.processed, 1);
    assert_eq!(refined.candidates.len(), 1);
    assert_eq!(refined.candidates[0].timeframe, Timeframe::M15);

    let confirmed = stages.run(Stage::Confirm).await.unwrap();
    assert_eq!(confirmed.signals.len(), 1);
    let signal = &confirmed.signals[0];
    assert!(signal.id.is_some());
    assert_eq!(signal.symbol, "WINUSDT");
    assert_eq!(signal.strategy, "balanced");
    assert_eq!(signal.price, 150.0);
    assert!((signal.stop_loss - 142.5).abs() < 1e-9);
    assert!((signal.take_profit - 165.0).abs() < 1e-9);

    let stored = stages.storage().get_recent_signals(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, signal.id);
}

#[tokio::test]
async fn test_refinement_applies_threshold() {
    let source = ScriptedSource::new(&["WINUSDT"])
        .with_series("WINUSDT", Timeframe::H1, &crossover_closes())
        .with_series("WINUSDT", Timeframe::M15, &crossover_closes());
    let config = FunnelConfig {
        refine_threshold: 0.7,
        ..test_config()
    };
    let (_dir, _source, stages) = setup(source, config).await;

    stages.run_hourly_scan().await.unwrap();
    let refined = stages.run_refinement().await.unwrap();

    assert_eq!(refined.processed, 1);
    assert!(refined.candidates.is_empty());
    // an empty refinement replaces the previous one
    assert!(stages
        .storage()
        .latest_snapshot(Timeframe::M15, chrono::Duration::hours(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_confirmation_skips_falling_momentum() {
    let source = ScriptedSource::new(&["DOWNUSDT"])
        .with_series("DOWNUSDT", Timeframe::M5, &falling_closes(60))
        .with_price(10.0);
    let (_dir, _source, stages) = setup(source, test_config()).await;

    let report = stages
        .run_confirmation(Some(vec!["DOWNUSDT".to_string()]))
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert!(report.signals.is_empty());
}

#[tokio::test]
async fn test_confirmation_falls_back_to_last_close() {
    let source = ScriptedSource::new(&["UPUSDT"])
        .with_series("UPUSDT", Timeframe::M5, &rising_closes(60));
    let (_dir, _source, stages) = setup(source, test_config()).await;

    let report = stages
        .run_confirmation(Some(vec!["UPUSDT".to_string()]))
        .await
        .unwrap();
    assert_eq!(report.signals.len(), 1);
    assert_eq!(report.signals[0].price, 159.0);
}

#[tokio::test]
async fn test_confirmation_uses_book_mid_when_price_fails() {
    let source = ScriptedSource::new(&["UPUSDT"])
        .with_series("UPUSDT", Timeframe::M5, &rising_closes(60))
        .with_book(&[(154.5, 1.0), (154.0, 3.0)], &[(155.5, 2.0)]);
    let (_dir, _source, stages) = setup(source, test_config()).await;

    let report = stages
        .run_confirmation(Some(vec!["UPUSDT".to_string()]))
        .await
        .unwrap();
    assert_eq!(report.signals.len(), 1);
    assert_eq!(report.signals[0].price, 155.0);
}

#[tokio::test]
async fn test_hourly_scan_without_strategy_match() {
    let source = ScriptedSource::new(&["UPUSDT"])
        .with_series("UPUSDT", Timeframe::H1, &rising_closes(60));
    let (_dir, _source, stages) = setup(source, test_config()).await;

    let report = stages.run_hourly_scan().await.unwrap();
    assert_eq!(report.processed, 1);
    // RSI pinned at 100 holds the score below the 0.5 threshold
    assert!(report.strategy_matches.is_empty());
}

#[tokio::test]
async fn test_repeated_kline_failures_deactivate_until_sync() {
    let source = ScriptedSource::new(&["BADUSDT", "OKUSDT"])
        .with_series("OKUSDT", Timeframe::H1, &rising_closes(60));
    let (_dir, source, stages) = setup(source, test_config()).await;
    source.fail("BADUSDT");

    for attempt in 1..=5 {
        let report = stages.run_hourly_scan().await.unwrap();
        assert_eq!(report.failures, 1, "attempt {}", attempt);
        assert_eq!(report.processed, 1);
    }
    assert_eq!(source.failed_calls.load(Ordering::Relaxed), 5);
    assert_eq!(
        stages.storage().get_active_symbols().await.unwrap(),
        vec!["OKUSDT"]
    );

    // deactivated symbols are no longer fetched
    let report = stages.run_hourly_scan().await.unwrap();
    assert_eq!(report.failures, 0);
    assert_eq!(source.failed_calls.load(Ordering::Relaxed), 5);

    source.recover("BADUSDT");
    stages.sync_universe().await.unwrap();
    let record = stages.storage().get_symbol("BADUSDT").await.unwrap().unwrap();
    assert!(record.is_active);
    assert_eq!(record.klines_fail_count, 0);
}

#[tokio::test]
async fn test_unknown_strategy_fails_the_run() {
    let config = FunnelConfig {
        strategy: "yolo".into(),
        ..test_config()
    };
    let (_dir, source, stages) = setup(ScriptedSource::new(&["BTCUSDT"]), config).await;

    assert!(stages.run_hourly_scan().await.is_err());
    assert_eq!(source.kline_calls(), 0);
}

#[tokio::test]
async fn test_backfill_pages_then_skips_when_history_exists() {
    let source = ScriptedSource::new(&["OLDUSDT"])
        .with_series("OLDUSDT", Timeframe::H1, &rising_closes(1500));
    let config = FunnelConfig {
        backfill_days: 60,
        ..test_config()
    };
    let (_dir, source, stages) = setup(source, config).await;

    let report = stages.run(Stage::Backfill).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(source.kline_calls(), 2);

    let stored = stages.storage().count_bars("OLDUSDT", Timeframe::H1).await.unwrap();
    assert!((1440..=1441).contains(&stored), "stored {}", stored);

    let again = stages.backfill_history().await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(source.kline_calls(), 2);
}

#[tokio::test]
async fn test_failed_backfill_is_topped_up_by_hourly_scan() {
    let source = ScriptedSource::new(&["NEWUSDT", "OLDUSDT"])
        .with_series("NEWUSDT", Timeframe::H1, &rising_closes(300))
        .with_series("OLDUSDT", Timeframe::H1, &rising_closes(300));
    let config = FunnelConfig {
        min_quote_volume: 0.0,
        ..Default::default()
    };
    let (_dir, source, stages) = setup(source, config).await;

    source.fail("NEWUSDT");
    let backfill = stages.backfill_history().await.unwrap();
    assert_eq!(backfill.processed, 1);
    assert_eq!(backfill.failures, 1);
    assert_eq!(stages.storage().count_bars("NEWUSDT", Timeframe::H1).await.unwrap(), 0);

    source.recover("NEWUSDT");
    let hourly = stages.run_hourly_scan().await.unwrap();
    assert_eq!(hourly.failures, 0);
    assert_eq!(hourly.skipped, 0);
    assert_eq!(hourly.processed, 2);
    assert_eq!(stages.storage().count_bars("NEWUSDT", Timeframe::H1).await.unwrap(), 300);
    assert!(stages.storage().get_symbol("NEWUSDT").await.unwrap().unwrap().is_active);

    // a later backfill run only touches symbols that are still short
    let again = stages.backfill_history().await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.skipped, 2);
}

#[tokio::test]
async fn test_backfill_retries_symbols_below_min_history() {
    let source = ScriptedSource::new(&["THINUSDT"])
        .with_series("THINUSDT", Timeframe::H1, &rising_closes(300));
    let config = FunnelConfig {
        min_history_bars: 200,
        ..test_config()
    };
    let (_dir, source, stages) = setup(source, config).await;

    // an earlier partial load left a few bars behind
    stages.run_hourly_scan().await.unwrap();
    let calls = source.kline_calls();
    stages
        .storage()
        .prune_klines_before(Timeframe::H1, Utc::now().timestamp_millis() - 10 * 3_600_000)
        .await
        .unwrap();
    assert!(stages.storage().count_bars("THINUSDT", Timeframe::H1).await.unwrap() < 200);

    let report = stages.backfill_history().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(source.kline_calls(), calls + 1);
    assert_eq!(stages.storage().count_bars("THINUSDT", Timeframe::H1).await.unwrap(), 300);
}

#[tokio::test]
async fn test_storage_error_is_counted_not_fatal() {
    let source = ScriptedSource::new(&["AUSDT", "BUSDT"])
        .with_series("AUSDT", Timeframe::H1, &rising_closes(60))
        .with_series("BUSDT", Timeframe::H1, &rising_closes(60));
    let (dir, _source, stages) = setup(source, test_config()).await;

    let first = stages.run_hourly_scan().await.unwrap();
    assert_eq!(first.processed, 2);

    let conn = rusqlite::Connection::open(dir.path().join("funnel.db")).unwrap();
    conn.execute_batch("DROP TABLE klines_1h").unwrap();
    drop(conn);

    let report = tokio_test::assert_ok!(stages.run_hourly_scan().await);
    assert_eq!(report.processed, 0);
    assert_eq!(report.failures, 2);
    assert!(report.candidates.is_empty());
    assert!(stages
        .storage()
        .latest_snapshot(Timeframe::H1, chrono::Duration::hours(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_shutdown_interrupts_between_symbols() {
    let source = ScriptedSource::new(&["AUSDT", "BUSDT"])
        .with_series("AUSDT", Timeframe::H1, &rising_closes(60));
    let dir = TempDir::new().unwrap();
    let storage = LocalStorage::open(dir.path().join("funnel.db")).unwrap();
    let source = Arc::new(source);
    let (tx, rx) = watch::channel(false);
    let stages = FunnelStages::new(
        source.clone(),
        storage,
        StrategyBook::with_catalog(),
        test_config(),
        "USDT",
    )
    .with_shutdown(rx);
    stages.sync_universe().await.unwrap();

    tx.send(true).unwrap();
    let report = stages.run_hourly_scan().await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.processed, 0);
    assert_eq!(source.kline_calls(), 0);
}

// ============================================================================
// Scheduler Tests
// ============================================================================

#[tokio::test]
async fn test_scheduler_rejects_invalid_cron() {
    let (_dir, _source, stages) = setup(ScriptedSource::new(&[]), test_config()).await;
    let config = FunnelConfig {
        refine_cron: "every fifteen minutes".into(),
        ..test_config()
    };
    let (_tx, rx) = watch::channel(false);

    let err = FunnelScheduler::new(Arc::new(stages), &config, rx).err().unwrap();
    assert!(err.to_string().contains("refine"));
}

#[tokio::test]
async fn test_scheduler_runs_stages_and_stops_on_shutdown() {
    let source = ScriptedSource::new(&["AUSDT"])
        .with_series("AUSDT", Timeframe::H1, &rising_closes(60));
    let config = FunnelConfig {
        hourly_cron: "* * * * * *".into(),
        ..test_config()
    };
    let (_dir, source, stages) = setup(source, config.clone()).await;
    let (tx, rx) = watch::channel(false);
    let scheduler = FunnelScheduler::new(Arc::new(stages), &config, rx).unwrap();

    let next = scheduler.get_next_schedules();
    assert_eq!(next.len(), 4);
    assert_eq!(next[0].0, Stage::Hourly);
    assert!(next.windows(2).all(|w| w[0].1 <= w[1].1));

    let stop = async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(scheduler.run(), stop)
    })
    .await
    .expect("scheduler did not stop");

    assert!(result.is_ok());
    assert!(source.kline_calls() >= 1);
    assert_eq!(scheduler.get_state().await, SchedulerState::Stopped);
}

#[tokio::test]
async fn test_scheduler_stops_when_sender_dropped() {
    let (_dir, _source, stages) = setup(ScriptedSource::new(&[]), test_config()).await;
    let (tx, rx) = watch::channel(false);
    let scheduler = FunnelScheduler::new(Arc::new(stages), &test_config(), rx).unwrap();
    drop(tx);

    let result = tokio::time::timeout(Duration::from_secs(2), scheduler.run()).await;
    assert!(matches!(result, Ok(Ok(()))));
}

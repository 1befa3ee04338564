//! Stage implementations.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use funnel_common::config::FunnelConfig;

use super::{Stage, StageReport};
use crate::data::{
    EnrichedBar, KlineQuery, LocalStorage, MarketDataSource, RankedCandidate, Signal, Timeframe,
    MAX_KLINE_LIMIT,
};
use crate::enrichment::{enrich, EnrichmentParams};
use crate::strategy::{SignalMetrics, StrategyBook};

/// Order book levels requested when falling back to the mid price.
const MID_PRICE_DEPTH: u32 = 5;

/// Runs funnel stages against a market data source and local storage.
pub struct FunnelStages {
    source: Arc<dyn MarketDataSource>,
    storage: LocalStorage,
    strategies: StrategyBook,
    config: FunnelConfig,
    quote_asset: String,
    shutdown: Option<watch::Receiver<bool>>,
}

impl FunnelStages {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        storage: LocalStorage,
        strategies: StrategyBook,
        config: FunnelConfig,
        quote_asset: impl Into<String>,
    ) -> Self {
        Self {
            source,
            storage,
            strategies,
            config,
            quote_asset: quote_asset.into(),
            shutdown: None,
        }
    }

    /// Stop between symbols once `shutdown` flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn params(&self) -> EnrichmentParams {
        EnrichmentParams {
            momentum_period: self.config.momentum_period,
        }
    }

    fn snapshot_max_age(&self) -> ChronoDuration {
        ChronoDuration::hours(self.config.snapshot_retention_hours)
    }

    fn backfill_start(&self) -> i64 {
        (Utc::now() - ChronoDuration::days(self.config.backfill_days)).timestamp_millis()
    }

    /// Run one stage by kind.
    pub async fn run(&self, stage: Stage) -> Result<StageReport> {
        match stage {
            Stage::Sync => self.sync_universe().await,
            Stage::Backfill => self.backfill_history().await,
            Stage::Hourly => self.run_hourly_scan().await,
            Stage::Refine => self.run_refinement().await,
            Stage::Confirm => self.run_confirmation(None).await,
        }
    }

    // ========================================================================
    // Per-symbol work
    // ========================================================================

    /// Fetch latest bars, enrich, persist. Fetch failures feed the symbol's
    /// failure counter; success resets it.
    async fn refresh_symbol(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<EnrichedBar>> {
        let query = KlineQuery::latest(self.config.kline_fetch_limit);
        let bars = match self.source.klines(symbol, timeframe, query).await {
            Ok(bars) => bars,
            Err(e) => {
                self.note_fetch_failure(symbol, &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.storage.reset_kline_failures(symbol).await?;

        let enriched = enrich(timeframe, &bars, self.params());
        self.storage
            .save_enriched_bars(&enriched)
            .await
            .with_context(|| format!("Failed to store {} bars for {}", timeframe, symbol))?;
        Ok(enriched)
    }

    async fn note_fetch_failure(&self, symbol: &str, error: &str) {
        match self
            .storage
            .record_kline_failure(symbol, self.config.max_kline_failures)
            .await
        {
            Ok(count) if count >= self.config.max_kline_failures => warn!(
                symbol,
                failures = count,
                error,
                "Kline fetch failed, symbol deactivated until next sync"
            ),
            Ok(count) => warn!(symbol, failures = count, error, "Kline fetch failed"),
            Err(e) => warn!(symbol, error = %e, "Failed to record kline failure"),
        }
    }

    fn rank(
        mut scored: Vec<(String, f64)>,
        top_n: usize,
        timeframe: Timeframe,
    ) -> Vec<RankedCandidate> {
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_n);

        let snapshot_at = Utc::now();
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (symbol, score))| RankedCandidate {
                symbol,
                score,
                rank: i + 1,
                timeframe,
                snapshot_at,
            })
            .collect()
    }

    // ========================================================================
    // Universe
    // ========================================================================

    /// Refresh the tradable universe from exchange info.
    pub async fn sync_universe(&self) -> Result<StageReport> {
        let mut report = StageReport::start(Stage::Sync);

        let listing = self
            .source
            .exchange_info()
            .await
            .context("Failed to fetch exchange info")?;
        let active = self
            .storage
            .sync_symbols(&listing, &self.quote_asset)
            .await?;

        report.processed = active;
        report.skipped = listing.len().saturating_sub(active);
        Ok(report.finish())
    }

    /// Load 1h history for every active symbol that has none stored, or
    /// fewer than `min_history_bars`.
    pub async fn backfill_history(&self) -> Result<StageReport> {
        let mut report = StageReport::start(Stage::Backfill);

        let symbols = self.storage.get_active_symbols().await?;
        let start = self.backfill_start();
        info!(symbols = symbols.len(), days = self.config.backfill_days, "Backfilling 1h history");

        for symbol in &symbols {
            if self.shutting_down() {
                report.interrupted = true;
                break;
            }

            match self.storage.count_bars(symbol, Timeframe::H1).await {
                Ok(stored) if stored > 0 && stored >= self.config.min_history_bars => {
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Failed to count stored bars");
                    report.failures += 1;
                    continue;
                }
            }

            match self.backfill_symbol(symbol, start).await {
                Ok(0) => report.skipped += 1,
                Ok(inserted) => {
                    debug!(symbol = %symbol, inserted, "Backfilled");
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Backfill failed");
                    report.failures += 1;
                }
            }
        }

        Ok(report.finish())
    }

    async fn backfill_symbol(&self, symbol: &str, start: i64) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let step = Timeframe::H1.duration_ms();
        let mut bars = Vec::new();
        let mut cursor = start;

        while cursor < now {
            let page = match self
                .source
                .klines(symbol, Timeframe::H1, KlineQuery::since(cursor, MAX_KLINE_LIMIT))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.note_fetch_failure(symbol, &e.to_string()).await;
                    return Err(e.into());
                }
            };

            let Some(last) = page.last().map(|b| b.open_time) else {
                break;
            };
            let full_page = page.len() >= MAX_KLINE_LIMIT as usize;
            bars.extend(page.into_iter().filter(|b| b.open_time >= cursor));
            if !full_page || last + step <= cursor {
                break;
            }
            cursor = last + step;
        }
        self.storage.reset_kline_failures(symbol).await?;

        bars.sort_by_key(|b| b.open_time);
        bars.dedup_by_key(|b| b.open_time);
        let enriched = enrich(Timeframe::H1, &bars, self.params());
        self.storage.save_enriched_bars(&enriched).await
    }

    /// Top up 1h history for a symbol below `min_history_bars`. Returns
    /// whether enough is stored afterwards.
    async fn ensure_history(&self, symbol: &str) -> Result<bool> {
        let stored = self.storage.count_bars(symbol, Timeframe::H1).await?;
        if stored >= self.config.min_history_bars {
            return Ok(true);
        }
        let inserted = self.backfill_symbol(symbol, self.backfill_start()).await?;
        debug!(symbol, stored, inserted, "Topped up 1h history");
        Ok(stored + inserted >= self.config.min_history_bars)
    }

    // ========================================================================
    // Stage A
    // ========================================================================

    /// Symbols passing the 24h quote-volume filter, or `None` when the filter
    /// is disabled or the ticker call failed.
    async fn liquid_symbols(&self) -> Option<HashSet<String>> {
        if self.config.min_quote_volume <= 0.0 {
            return None;
        }
        match self.source.ticker_24h(None).await {
            Ok(tickers) => Some(
                tickers
                    .into_iter()
                    .filter(|t| t.quote_volume.is_some_and(|v| v >= self.config.min_quote_volume))
                    .map(|t| t.symbol)
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Ticker fetch failed, skipping liquidity filter");
                None
            }
        }
    }

    /// Stage A: score every active symbol on 1h bars and keep the top N.
    pub async fn run_hourly_scan(&self) -> Result<StageReport> {
        let mut report = StageReport::start(Stage::Hourly);
        // unknown strategy names fail the whole run
        self.strategies.get(&self.config.strategy)?;

        let liquid = self.liquid_symbols().await;
        let symbols = self.storage.get_active_symbols().await?;
        let mut scored = Vec::new();

        for symbol in &symbols {
            if self.shutting_down() {
                report.interrupted = true;
                break;
            }
            if liquid.as_ref().is_some_and(|l| !l.contains(symbol)) {
                report.skipped += 1;
                continue;
            }
            match self.ensure_history(symbol).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(symbol = %symbol, "Not enough 1h history");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "History check failed for symbol");
                    report.failures += 1;
                    continue;
                }
            }

            let enriched = match self.refresh_symbol(symbol, Timeframe::H1).await {
                Ok(enriched) => enriched,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Hourly scan failed for symbol");
                    report.failures += 1;
                    continue;
                }
            };
            let Some(latest) = enriched.last() else {
                report.skipped += 1;
                continue;
            };

            let evaluation = self.strategies.evaluate(&self.config.strategy, latest)?;
            if evaluation.signal {
                debug!(
                    symbol = %symbol,
                    strategy = %evaluation.strategy,
                    indicators = evaluation.signal_count(),
                    "Strategy matched on 1h"
                );
                report.strategy_matches.push(symbol.clone());
            }
            report.processed += 1;
            if latest.prob_score > 0.0 {
                scored.push((symbol.clone(), latest.prob_score));
            }
        }

        report.candidates = Self::rank(scored, self.config.hourly_top_n, Timeframe::H1);
        self.storage.save_snapshot(Timeframe::H1, &report.candidates).await?;

        let cutoff = Utc::now() - ChronoDuration::days(self.config.kline_retention_days);
        if let Err(e) = self
            .storage
            .prune_klines_before(Timeframe::H1, cutoff.timestamp_millis())
            .await
        {
            warn!(error = %e, "Failed to prune old 1h bars");
        }

        Ok(report.finish())
    }

    // ========================================================================
    // Stage B
    // ========================================================================

    /// Stage B: re-score the hourly snapshot on 15m bars, keep the top N
    /// above the refine threshold. The result is persisted and returned.
    pub async fn run_refinement(&self) -> Result<StageReport> {
        let mut report = StageReport::start(Stage::Refine);

        let hourly = self
            .storage
            .latest_snapshot(Timeframe::H1, self.snapshot_max_age())
            .await?;
        if hourly.is_empty() {
            info!("No hourly snapshot, nothing to refine");
            return Ok(report.finish());
        }

        let mut scored = Vec::new();
        for candidate in &hourly {
            if self.shutting_down() {
                report.interrupted = true;
                break;
            }

            let enriched = match self.refresh_symbol(&candidate.symbol, Timeframe::M15).await {
                Ok(enriched) => enriched,
                Err(e) => {
                    warn!(symbol = %candidate.symbol, error = %e, "Refinement failed for symbol");
                    report.failures += 1;
                    continue;
                }
            };
            let Some(latest) = enriched.last() else {
                report.skipped += 1;
                continue;
            };

            report.processed += 1;
            if latest.prob_score > self.config.refine_threshold {
                scored.push((candidate.symbol.clone(), latest.prob_score));
            }
        }

        report.candidates = Self::rank(scored, self.config.refine_top_n, Timeframe::M15);
        self.storage.save_snapshot(Timeframe::M15, &report.candidates).await?;
        Ok(report.finish())
    }

    // ========================================================================
    // Stage C
    // ========================================================================

    /// Stage C: confirm on 5m bars and emit signals where momentum is flat or
    /// rising. Reads the stored 15m snapshot unless `symbols` is given.
    pub async fn run_confirmation(&self, symbols: Option<Vec<String>>) -> Result<StageReport> {
        let mut report = StageReport::start(Stage::Confirm);
        self.strategies.get(&self.config.strategy)?;

        let symbols = match symbols {
            Some(symbols) => symbols,
            None => self
                .storage
                .latest_snapshot(Timeframe::M15, self.snapshot_max_age())
                .await?
                .into_iter()
                .map(|c| c.symbol)
                .collect(),
        };
        if symbols.is_empty() {
            info!("No refined candidates, nothing to confirm");
            return Ok(report.finish());
        }

        for symbol in &symbols {
            if self.shutting_down() {
                report.interrupted = true;
                break;
            }

            match self.confirm_symbol(symbol).await {
                Ok(Some(signal)) => {
                    report.processed += 1;
                    report.signals.push(signal);
                }
                Ok(None) => report.processed += 1,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Confirmation failed for symbol");
                    report.failures += 1;
                }
            }
        }

        Ok(report.finish())
    }

    async fn confirm_symbol(&self, symbol: &str) -> Result<Option<Signal>> {
        let enriched = self.refresh_symbol(symbol, Timeframe::M5).await?;
        let Some(latest) = enriched.last() else {
            return Ok(None);
        };

        match latest.momentum_roc {
            Some(roc) if roc >= 0.0 => {}
            _ => {
                debug!(symbol, momentum = ?latest.momentum_roc, "Momentum still falling");
                return Ok(None);
            }
        }

        let Some(price) = self.current_price(symbol, latest).await else {
            warn!(symbol, "No price available, signal dropped");
            return Ok(None);
        };

        let evaluation = self.strategies.evaluate(&self.config.strategy, latest)?;
        let metrics = SignalMetrics::from_bar(latest);

        let mut signal = Signal {
            id: None,
            symbol: symbol.to_string(),
            timeframe: Timeframe::M5,
            price,
            volume: latest.bar.volume,
            strategy: evaluation.strategy,
            prob_score: metrics.prob_score,
            confidence: evaluation.confidence,
            active_indicators: evaluation.active_indicators,
            stop_loss: price * (1.0 - self.config.stop_loss_pct),
            take_profit: price * (1.0 + self.config.take_profit_pct),
            rsi: metrics.rsi,
            ma_diff_pct: metrics.ma_diff_pct,
            created_at: Utc::now(),
        };
        signal.id = Some(self.storage.save_signal(&signal).await?);
        Ok(Some(signal))
    }

    /// Last traded price, then the order book mid, then the bar's close.
    async fn current_price(&self, symbol: &str, latest: &EnrichedBar) -> Option<f64> {
        match self.source.price(symbol).await {
            Ok(price) => return Some(price),
            Err(e) => debug!(symbol, error = %e, "Price fetch failed, trying order book"),
        }
        match self.source.depth(symbol, MID_PRICE_DEPTH).await {
            Ok(book) => {
                if let Some(mid) = book.mid_price() {
                    return Some(mid);
                }
                debug!(symbol, "Order book empty, using last close");
            }
            Err(e) => debug!(symbol, error = %e, "Depth fetch failed, using last close"),
        }
        latest.bar.close
    }
}

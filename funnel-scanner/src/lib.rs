//! Funnel Scanner Library
//!
//! Scans an exchange's spot universe for trading opportunities by funnelling
//! candidates through three progressively shorter timeframes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        funnel-scanner                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐    │
//! │  │  Exchange Client │  │  Enrichment +    │  │  Funnel Stages   │    │
//! │  │  (rate gated)    │─▶│  Strategy Scorer │─▶│  A → B → C       │    │
//! │  └──────────────────┘  └──────────────────┘  └────────┬─────────┘    │
//! │                                                       ▼              │
//! │                                              ┌──────────────────┐    │
//! │                                              │  SQLite storage  │    │
//! │                                              └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Composite score
//! A weighted, clamped [-1, 1] sum of indicator sub-scores (trend, RSI, MACD,
//! volume, volatility, MA cross) computed for every enriched bar.
//!
//! ## Funnel
//! - **Stage A**: hourly, whole universe, top 100 by 1h score
//! - **Stage B**: every 15 minutes, top 20 above a threshold on 15m bars
//! - **Stage C**: every 5 minutes, signals where 5m momentum is flat or rising
//!
//! ## Backtest
//! Replays stored 1h bars against a strategy with fixed stop-loss and
//! take-profit exits.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod backtest;
pub mod data;
pub mod enrichment;
pub mod funnel;
pub mod indicators;
pub mod strategy;

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use funnel_common::config::Config;

use crate::backtest::{run_backtest, BacktestConfig, BacktestResult};
use crate::data::{ExchangeClient, LocalStorage, LocalStorageConfig, MarketDataSource, Timeframe};
use crate::funnel::{FunnelScheduler, FunnelStages, StageReport};
use crate::strategy::{StrategyBook, StrategyConfig};

/// Main scanner service
pub struct ScannerService {
    config: Config,
    source: Arc<dyn MarketDataSource>,
    storage: LocalStorage,
}

impl ScannerService {
    /// Build the service from configuration, connecting to the exchange API
    /// and opening the database.
    pub fn new(config: Config) -> Result<Self> {
        let client = ExchangeClient::from_config(&config.exchange)?;
        let storage = LocalStorage::new(LocalStorageConfig::from_config(&config.database))?;
        Ok(Self::with_parts(config, Arc::new(client), storage))
    }

    /// Build the service around an existing source and storage.
    pub fn with_parts(config: Config, source: Arc<dyn MarketDataSource>, storage: LocalStorage) -> Self {
        Self {
            config,
            source,
            storage,
        }
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// Seed the catalog, then load every stored strategy into a book.
    ///
    /// Fails when the configured strategy is not in the catalog.
    pub async fn load_strategies(&self) -> Result<StrategyBook> {
        self.storage.seed_strategies(&StrategyConfig::catalog()).await?;

        let mut book = StrategyBook::new();
        for strategy in self.storage.list_strategies().await? {
            book.insert(strategy)?;
        }
        book.get(&self.config.funnel.strategy)
            .context("Configured strategy is not in the catalog")?;
        Ok(book)
    }

    /// Funnel stages wired to this service's source and storage.
    pub async fn stages(&self, shutdown: Option<watch::Receiver<bool>>) -> Result<FunnelStages> {
        let strategies = self.load_strategies().await?;
        let stages = FunnelStages::new(
            Arc::clone(&self.source),
            self.storage.clone(),
            strategies,
            self.config.funnel.clone(),
            self.config.exchange.quote_asset.clone(),
        );
        Ok(match shutdown {
            Some(rx) => stages.with_shutdown(rx),
            None => stages,
        })
    }

    /// Replay stored 1h bars for `symbol` against `strategy`, or the
    /// configured strategy when `None`.
    pub async fn backtest(&self, symbol: &str, strategy: Option<&str>) -> Result<BacktestResult> {
        let book = self.load_strategies().await?;
        let strategy = book.get(strategy.unwrap_or(&self.config.funnel.strategy))?;

        let bars = self.storage.get_enriched_bars(symbol, Timeframe::H1, None).await?;
        if bars.is_empty() {
            bail!("No stored 1h bars for {}; run backfill first", symbol);
        }
        Ok(run_backtest(
            &bars,
            strategy,
            &BacktestConfig::from_funnel(&self.config.funnel),
        ))
    }

    /// Connectivity check, universe sync and history backfill.
    pub async fn setup(&self, stages: &FunnelStages) -> Result<Vec<StageReport>> {
        let check_symbol = &self.config.exchange.health_check_symbol;
        self.source
            .health_check(check_symbol)
            .await
            .with_context(|| format!("{} health check failed", self.source.name()))?;
        info!(source = self.source.name(), symbol = %check_symbol, "Market data source reachable");

        let sync = stages.sync_universe().await?;
        let backfill = stages.backfill_history().await?;
        Ok(vec![sync, backfill])
    }

    /// Run setup, then the scheduler until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stages = Arc::new(self.stages(Some(shutdown_rx.clone())).await?);

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested, finishing in-flight work"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            let _ = shutdown_tx.send(true);
        });

        self.setup(&stages).await?;
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let scheduler = FunnelScheduler::new(Arc::clone(&stages), &self.config.funnel, shutdown_rx)?;
        for (stage, at) in scheduler.get_next_schedules() {
            info!(stage = stage.name(), next = %at, "Scheduled");
        }
        scheduler.run().await
    }
}

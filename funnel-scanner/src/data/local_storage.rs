//! Local market data storage using SQLite.
//!
//! Provides persistent storage for:
//! - The symbol universe and per-symbol kline failure counters
//! - Enriched klines, one table per timeframe
//! - Ranked funnel snapshots (hourly and 15-minute)
//! - Emitted signals
//! - The strategy catalog
//!
//! Kline writes are insert-or-ignore keyed by (symbol, open time), so
//! re-fetching overlapping windows never duplicates or rewrites rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use funnel_common::config::DatabaseConfig;

use super::{EnrichedBar, ExchangeSymbol, RankedCandidate, Signal, SymbolRecord, Timeframe};
use crate::indicators::Trend;
use crate::strategy::{RiskLevel, StrategyConfig, StrategyThresholds};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Tradable universe
CREATE TABLE IF NOT EXISTS symbols (
    symbol TEXT PRIMARY KEY,
    base_asset TEXT NOT NULL,
    quote_asset TEXT NOT NULL,
    status TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    klines_fail_count INTEGER NOT NULL DEFAULT 0,
    date_added TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_symbols_active ON symbols(is_active);

-- Enriched 1h klines (no momentum column)
CREATE TABLE IF NOT EXISTS klines_1h (
    symbol TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    open REAL, high REAL, low REAL, close REAL, volume REAL,
    close_time INTEGER, quote_volume REAL,
    ma_10 REAL, ma_50 REAL, rsi_14 REAL,
    macd REAL, macd_signal REAL, macd_hist REAL,
    volume_spike INTEGER, vol_ratio_5 REAL, vol_ratio_10 REAL,
    volatility REAL, trend INTEGER,
    prob_score REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (symbol, open_time)
);

-- Enriched 15m klines
CREATE TABLE IF NOT EXISTS klines_15m (
    symbol TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    open REAL, high REAL, low REAL, close REAL, volume REAL,
    close_time INTEGER, quote_volume REAL,
    ma_10 REAL, ma_50 REAL, rsi_14 REAL,
    macd REAL, macd_signal REAL, macd_hist REAL,
    volume_spike INTEGER, vol_ratio_5 REAL, vol_ratio_10 REAL,
    volatility REAL, trend INTEGER,
    prob_score REAL NOT NULL DEFAULT 0,
    momentum_roc REAL,
    PRIMARY KEY (symbol, open_time)
);

-- Enriched 5m klines
CREATE TABLE IF NOT EXISTS klines_5m (
    symbol TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    open REAL, high REAL, low REAL, close REAL, volume REAL,
    close_time INTEGER, quote_volume REAL,
    ma_10 REAL, ma_50 REAL, rsi_14 REAL,
    macd REAL, macd_signal REAL, macd_hist REAL,
    volume_spike INTEGER, vol_ratio_5 REAL, vol_ratio_10 REAL,
    volatility REAL, trend INTEGER,
    prob_score REAL NOT NULL DEFAULT 0,
    momentum_roc REAL,
    PRIMARY KEY (symbol, open_time)
);

-- Emitted signals (append-only)
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    price REAL NOT NULL,
    volume REAL,
    strategy TEXT NOT NULL,
    prob_score REAL NOT NULL,
    confidence REAL NOT NULL,
    active_indicators TEXT NOT NULL,
    stop_loss REAL NOT NULL,
    take_profit REAL NOT NULL,
    rsi REAL,
    ma_diff_pct REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol, created_at DESC);

-- Strategy catalog
CREATE TABLE IF NOT EXISTS strategies (
    name TEXT PRIMARY KEY,
    min_signals INTEGER NOT NULL,
    prob_threshold REAL NOT NULL,
    thresholds TEXT NOT NULL,
    risk TEXT NOT NULL
);

-- Stage A output
CREATE TABLE IF NOT EXISTS top_symbols_1h (
    symbol TEXT NOT NULL,
    score REAL NOT NULL,
    rank INTEGER NOT NULL,
    snapshot_at INTEGER NOT NULL,
    PRIMARY KEY (snapshot_at, symbol)
);

-- Stage B output
CREATE TABLE IF NOT EXISTS top_symbols_15m (
    symbol TEXT NOT NULL,
    score REAL NOT NULL,
    rank INTEGER NOT NULL,
    snapshot_at INTEGER NOT NULL,
    PRIMARY KEY (snapshot_at, symbol)
);
"#;

const BAR_COLUMNS: &str = "symbol, open_time, open, high, low, close, volume, close_time, \
    quote_volume, ma_10, ma_50, rsi_14, macd, macd_signal, macd_hist, volume_spike, \
    vol_ratio_5, vol_ratio_10, volatility, trend, prob_score";

const BAR_COLUMN_COUNT: usize = 21;

fn bar_columns(timeframe: Timeframe) -> String {
    if timeframe.has_momentum() {
        format!("{}, momentum_roc", BAR_COLUMNS)
    } else {
        BAR_COLUMNS.to_string()
    }
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_text(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for local storage
#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    /// Path to SQLite database
    pub db_path: PathBuf,
}

impl LocalStorageConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.resolved_path())
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self::from_config(&DatabaseConfig::default())
    }
}

// ============================================================================
// Local Storage
// ============================================================================

/// Local SQLite storage for the funnel.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so it lives behind an
/// async mutex; every operation holds the lock for its whole statement or
/// transaction.
#[derive(Clone)]
pub struct LocalStorage {
    db: Arc<Mutex<Connection>>,
    config: LocalStorageConfig,
}

impl LocalStorage {
    /// Open (or create) the database and ensure the schema exists.
    pub fn new(config: LocalStorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&config.db_path)
            .context("Failed to open local storage database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set database pragmas")?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to create database tables")?;

        info!(db_path = %config.db_path.display(), "Initialized local storage");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(LocalStorageConfig::new(path.as_ref()))
    }

    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    // ========================================================================
    // Symbol Universe
    // ========================================================================

    /// Refresh the universe from exchange info.
    ///
    /// Every stored symbol is marked inactive, then each tradable symbol for
    /// `quote_asset` is upserted as active with its failure counter reset.
    /// Returns the number of active symbols.
    pub async fn sync_symbols(&self, symbols: &[ExchangeSymbol], quote_asset: &str) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let now = to_text(Utc::now());

        tx.execute("UPDATE symbols SET is_active = 0", [])?;

        let mut active = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO symbols
                (symbol, base_asset, quote_asset, status, is_active, klines_fail_count, date_added)
                VALUES (?1, ?2, ?3, ?4, 1, 0, ?5)
                ON CONFLICT(symbol) DO UPDATE SET
                    base_asset = excluded.base_asset,
                    quote_asset = excluded.quote_asset,
                    status = excluded.status,
                    is_active = 1,
                    klines_fail_count = 0
                "#,
            )?;
            for symbol in symbols.iter().filter(|s| s.is_tradable(quote_asset)) {
                stmt.execute(params![
                    symbol.symbol,
                    symbol.base_asset,
                    symbol.quote_asset,
                    symbol.status,
                    now,
                ])?;
                active += 1;
            }
        }

        tx.commit().context("Failed to commit symbol sync")?;
        info!(listed = symbols.len(), active, quote_asset, "Synced symbol universe");
        Ok(active)
    }

    /// Active symbols, alphabetically.
    pub async fn get_active_symbols(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT symbol FROM symbols WHERE is_active = 1 ORDER BY symbol")?;
        let symbols = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(symbols)
    }

    pub async fn get_symbol(&self, symbol: &str) -> Result<Option<SymbolRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                r#"
                SELECT symbol, base_asset, quote_asset, status, is_active, klines_fail_count, date_added
                FROM symbols WHERE symbol = ?1
                "#,
                params![symbol],
                |row| {
                    let date_added: String = row.get(6)?;
                    Ok(SymbolRecord {
                        symbol: row.get(0)?,
                        base_asset: row.get(1)?,
                        quote_asset: row.get(2)?,
                        status: row.get(3)?,
                        is_active: row.get(4)?,
                        klines_fail_count: row.get(5)?,
                        date_added: from_text(&date_added),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Count one failed kline fetch; deactivate at `max_failures`.
    ///
    /// Returns the new counter value. Unknown symbols return 0.
    pub async fn record_kline_failure(&self, symbol: &str, max_failures: u32) -> Result<u32> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            UPDATE symbols SET
                klines_fail_count = klines_fail_count + 1,
                is_active = CASE WHEN klines_fail_count + 1 >= ?2 THEN 0 ELSE is_active END
            WHERE symbol = ?1
            "#,
            params![symbol, max_failures],
        )?;

        let count: Option<u32> = db
            .query_row(
                "SELECT klines_fail_count FROM symbols WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Clear the failure counter after a successful fetch.
    pub async fn reset_kline_failures(&self, symbol: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE symbols SET klines_fail_count = 0 WHERE symbol = ?1 AND klines_fail_count != 0",
            params![symbol],
        )?;
        Ok(())
    }

    // ========================================================================
    // Enriched Klines
    // ========================================================================

    /// Insert bars, ignoring any (symbol, open time) already stored.
    ///
    /// Each bar goes to the table of its own timeframe. Returns the number of
    /// rows actually inserted.
    pub async fn save_enriched_bars(&self, bars: &[EnrichedBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut inserted = 0;

        for timeframe in Timeframe::ALL {
            let batch: Vec<&EnrichedBar> = bars.iter().filter(|b| b.timeframe == timeframe).collect();
            if batch.is_empty() {
                continue;
            }

            let column_count = BAR_COLUMN_COUNT + usize::from(timeframe.has_momentum());
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                timeframe.kline_table(),
                bar_columns(timeframe),
                placeholders(column_count)
            );
            let mut stmt = tx.prepare(&sql)?;

            for bar in batch {
                let trend = bar.trend.map(Trend::as_i64);
                let mut values: Vec<&dyn ToSql> = vec![
                    &bar.bar.symbol,
                    &bar.bar.open_time,
                    &bar.bar.open,
                    &bar.bar.high,
                    &bar.bar.low,
                    &bar.bar.close,
                    &bar.bar.volume,
                    &bar.bar.close_time,
                    &bar.bar.quote_volume,
                    &bar.ma_10,
                    &bar.ma_50,
                    &bar.rsi_14,
                    &bar.macd,
                    &bar.macd_signal,
                    &bar.macd_hist,
                    &bar.volume_spike,
                    &bar.vol_ratio_5,
                    &bar.vol_ratio_10,
                    &bar.volatility,
                    &trend,
                    &bar.prob_score,
                ];
                if timeframe.has_momentum() {
                    values.push(&bar.momentum_roc);
                }
                inserted += stmt.execute(values.as_slice())?;
            }
        }

        tx.commit().context("Failed to commit enriched bars")?;
        debug!(
            symbol = %bars[0].symbol(),
            received = bars.len(),
            inserted,
            "Saved enriched bars"
        );
        Ok(inserted)
    }

    fn row_to_bar(row: &rusqlite::Row, timeframe: Timeframe) -> rusqlite::Result<EnrichedBar> {
        let trend: Option<i64> = row.get(19)?;
        let momentum_roc = if timeframe.has_momentum() {
            row.get(21)?
        } else {
            None
        };

        Ok(EnrichedBar {
            bar: super::Bar {
                symbol: row.get(0)?,
                open_time: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
                close_time: row.get(7)?,
                quote_volume: row.get(8)?,
            },
            timeframe,
            ma_10: row.get(9)?,
            ma_50: row.get(10)?,
            rsi_14: row.get(11)?,
            macd: row.get(12)?,
            macd_signal: row.get(13)?,
            macd_hist: row.get(14)?,
            volume_spike: row.get(15)?,
            vol_ratio_5: row.get(16)?,
            vol_ratio_10: row.get(17)?,
            volatility: row.get(18)?,
            trend: trend.and_then(Trend::from_i64),
            prob_score: row.get(20)?,
            momentum_roc,
        })
    }

    /// The most recent `limit` bars (all when `None`), oldest first.
    pub async fn get_enriched_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: Option<usize>,
    ) -> Result<Vec<EnrichedBar>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM {} WHERE symbol = ?1 ORDER BY open_time DESC LIMIT ?2",
            bar_columns(timeframe),
            timeframe.kline_table()
        );
        let limit = limit.map_or(-1, |l| l as i64);

        let mut stmt = db.prepare(&sql)?;
        let mut bars = stmt
            .query_map(params![symbol, limit], |row| Self::row_to_bar(row, timeframe))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    pub async fn count_bars(&self, symbol: &str, timeframe: Timeframe) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE symbol = ?1", timeframe.kline_table()),
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete bars opening before `cutoff_ms`. Returns rows deleted.
    pub async fn prune_klines_before(&self, timeframe: Timeframe, cutoff_ms: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            &format!("DELETE FROM {} WHERE open_time < ?1", timeframe.kline_table()),
            params![cutoff_ms],
        )?;
        if deleted > 0 {
            info!(%timeframe, deleted, "Pruned old klines");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    fn snapshot_table(timeframe: Timeframe) -> Result<&'static str> {
        timeframe
            .snapshot_table()
            .ok_or_else(|| anyhow::anyhow!("No snapshot table for timeframe {}", timeframe))
    }

    /// Replace the stored snapshot for `timeframe` with `candidates`.
    ///
    /// The previous run is superseded even when `candidates` is empty, so the
    /// table only ever holds the latest run.
    pub async fn save_snapshot(&self, timeframe: Timeframe, candidates: &[RankedCandidate]) -> Result<()> {
        let table = Self::snapshot_table(timeframe)?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let pruned = tx.execute(&format!("DELETE FROM {}", table), [])?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (symbol, score, rank, snapshot_at) VALUES (?1, ?2, ?3, ?4)",
                table
            ))?;
            for candidate in candidates {
                stmt.execute(params![
                    candidate.symbol,
                    candidate.score,
                    candidate.rank as i64,
                    to_millis(candidate.snapshot_at),
                ])?;
            }
        }

        tx.commit().context("Failed to commit snapshot")?;
        debug!(table, candidates = candidates.len(), pruned, "Saved snapshot");
        Ok(())
    }

    /// Candidates of the latest snapshot, by rank. Snapshots older than
    /// `max_age` are treated as absent.
    pub async fn latest_snapshot(&self, timeframe: Timeframe, max_age: Duration) -> Result<Vec<RankedCandidate>> {
        let table = Self::snapshot_table(timeframe)?;
        let cutoff = to_millis(Utc::now() - max_age);

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            r#"
            SELECT symbol, score, rank, snapshot_at FROM {table}
            WHERE snapshot_at = (SELECT MAX(snapshot_at) FROM {table}) AND snapshot_at >= ?1
            ORDER BY rank
            "#,
            table = table
        ))?;
        let candidates = stmt
            .query_map(params![cutoff], |row| {
                let rank: i64 = row.get(2)?;
                Ok(RankedCandidate {
                    symbol: row.get(0)?,
                    score: row.get(1)?,
                    rank: rank as usize,
                    timeframe,
                    snapshot_at: from_millis(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Append a signal, returning its id.
    pub async fn save_signal(&self, signal: &Signal) -> Result<i64> {
        let indicators = serde_json::to_string(&signal.active_indicators)?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO signals
            (symbol, timeframe, price, volume, strategy, prob_score, confidence,
             active_indicators, stop_loss, take_profit, rsi, ma_diff_pct, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                signal.symbol,
                signal.timeframe.to_string(),
                signal.price,
                signal.volume,
                signal.strategy,
                signal.prob_score,
                signal.confidence,
                indicators,
                signal.stop_loss,
                signal.take_profit,
                signal.rsi,
                signal.ma_diff_pct,
                to_text(signal.created_at),
            ],
        )
        .context("Failed to save signal")?;

        let id = db.last_insert_rowid();
        info!(id, symbol = %signal.symbol, price = signal.price, strategy = %signal.strategy, "Saved signal");
        Ok(id)
    }

    /// The newest `limit` signals, newest first.
    pub async fn get_recent_signals(&self, limit: usize) -> Result<Vec<Signal>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT id, symbol, timeframe, price, volume, strategy, prob_score, confidence,
                   active_indicators, stop_loss, take_profit, rsi, ma_diff_pct, created_at
            FROM signals ORDER BY id DESC LIMIT ?1
            "#,
        )?;

        let signals = stmt
            .query_map(params![limit as i64], |row| {
                let timeframe: String = row.get(2)?;
                let timeframe = Timeframe::parse(&timeframe).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        Type::Text,
                        format!("unknown timeframe '{}'", timeframe).into(),
                    )
                })?;
                let indicators: String = row.get(8)?;
                let active_indicators = serde_json::from_str(&indicators)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
                let created_at: String = row.get(13)?;
                Ok(Signal {
                    id: Some(row.get(0)?),
                    symbol: row.get(1)?,
                    timeframe,
                    price: row.get(3)?,
                    volume: row.get(4)?,
                    strategy: row.get(5)?,
                    prob_score: row.get(6)?,
                    confidence: row.get(7)?,
                    active_indicators,
                    stop_loss: row.get(9)?,
                    take_profit: row.get(10)?,
                    rsi: row.get(11)?,
                    ma_diff_pct: row.get(12)?,
                    created_at: from_text(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode stored signals")?;
        Ok(signals)
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    /// Insert strategies not already stored. Returns how many were added.
    pub async fn seed_strategies(&self, strategies: &[StrategyConfig]) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO strategies (name, min_signals, prob_threshold, thresholds, risk)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for strategy in strategies {
                added += stmt.execute(params![
                    strategy.name,
                    strategy.min_signals as i64,
                    strategy.prob_threshold,
                    serde_json::to_string(&strategy.thresholds)?,
                    strategy.risk.as_str(),
                ])?;
            }
        }
        tx.commit().context("Failed to commit strategy seed")?;
        if added > 0 {
            info!(added, "Seeded strategies");
        }
        Ok(added)
    }

    fn strategy_from_parts(
        name: String,
        min_signals: i64,
        prob_threshold: f64,
        thresholds: String,
        risk: String,
    ) -> Result<StrategyConfig> {
        let thresholds: StrategyThresholds = serde_json::from_str(&thresholds)
            .with_context(|| format!("Invalid thresholds for strategy {}", name))?;
        let risk = RiskLevel::parse(&risk)
            .ok_or_else(|| anyhow::anyhow!("Invalid risk level '{}' for strategy {}", risk, name))?;
        Ok(StrategyConfig {
            name,
            min_signals: min_signals.max(0) as usize,
            prob_threshold,
            thresholds,
            risk,
        })
    }

    pub async fn get_strategy(&self, name: &str) -> Result<Option<StrategyConfig>> {
        let db = self.db.lock().await;
        let row: Option<(String, i64, f64, String, String)> = db
            .query_row(
                "SELECT name, min_signals, prob_threshold, thresholds, risk FROM strategies WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        row.map(|(n, m, p, t, r)| Self::strategy_from_parts(n, m, p, t, r))
            .transpose()
    }

    pub async fn list_strategies(&self) -> Result<Vec<StrategyConfig>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT name, min_signals, prob_threshold, thresholds, risk FROM strategies ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<rusqlite::Result<Vec<(String, i64, f64, String, String)>>>()?;

        rows.into_iter()
            .map(|(n, m, p, t, r)| Self::strategy_from_parts(n, m, p, t, r))
            .collect()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Get database statistics
    pub async fn get_stats(&self) -> Result<LocalStorageStats> {
        let db = self.db.lock().await;
        let count = |sql: &str| -> rusqlite::Result<u64> {
            db.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|c| c as u64)
        };

        let stats = LocalStorageStats {
            symbols: count("SELECT COUNT(*) FROM symbols")?,
            active_symbols: count("SELECT COUNT(*) FROM symbols WHERE is_active = 1")?,
            bars_1h: count("SELECT COUNT(*) FROM klines_1h")?,
            bars_15m: count("SELECT COUNT(*) FROM klines_15m")?,
            bars_5m: count("SELECT COUNT(*) FROM klines_5m")?,
            signals: count("SELECT COUNT(*) FROM signals")?,
            strategies: count("SELECT COUNT(*) FROM strategies")?,
            db_size_bytes: std::fs::metadata(&self.config.db_path)
                .map(|m| m.len())
                .unwrap_or(0),
        };
        Ok(stats)
    }
}

/// Statistics about local storage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStorageStats {
    pub symbols: u64,
    pub active_symbols: u64,
    pub bars_1h: u64,
    pub bars_15m: u64,
    pub bars_5m: u64,
    pub signals: u64,
    pub strategies: u64,
    pub db_size_bytes: u64,
}

impl std::fmt::Display for LocalStorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LocalStorage: {}/{} active symbols, {} 1h / {} 15m / {} 5m bars, {} signals, {} strategies ({:.2} MB)",
            self.active_symbols,
            self.symbols,
            self.bars_1h,
            self.bars_15m,
            self.bars_5m,
            self.signals,
            self.strategies,
            self.db_size_bytes as f64 / 1_048_576.0
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

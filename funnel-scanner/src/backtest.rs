//! Strategy replay over stored bars.
//!
//! Holds at most one position: enter at the close of a bar the strategy
//! signals on, leave at the first close past the take-profit or stop-loss
//! level. Whatever is still open after the last bar is closed there.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use funnel_common::config::FunnelConfig;

use crate::data::EnrichedBar;
use crate::strategy::{evaluate_strategy, StrategyConfig};

/// Backtest configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// Fraction below entry that closes a trade (0.05 = 5%)
    pub stop_loss_pct: f64,
    /// Fraction above entry that closes a trade
    pub take_profit_pct: f64,
    /// Leading bars never traded, so the long indicators are settled
    pub warmup_bars: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            stop_loss_pct: 0.05,
            take_profit_pct: 0.10,
            warmup_bars: 210,
        }
    }
}

impl BacktestConfig {
    /// Exit levels taken from the funnel's signal settings.
    pub fn from_funnel(config: &FunnelConfig) -> Self {
        Self {
            stop_loss_pct: config.stop_loss_pct,
            take_profit_pct: config.take_profit_pct,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeProfit => "take_profit",
            Self::StopLoss => "stop_loss",
            Self::EndOfData => "end_of_data",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One closed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Open time of the entry bar, milliseconds since epoch
    pub entry_time: i64,
    pub entry_price: f64,
    /// Open time of the exit bar
    pub exit_time: i64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
}

impl TradeRecord {
    /// Return in percent.
    pub fn return_pct(&self) -> f64 {
        (self.exit_price / self.entry_price - 1.0) * 100.0
    }

    pub fn is_winner(&self) -> bool {
        self.return_pct() > 0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenPosition {
    entry_time: i64,
    entry_price: f64,
}

impl OpenPosition {
    fn exit_reason(&self, price: f64, config: &BacktestConfig) -> Option<ExitReason> {
        let change = price / self.entry_price - 1.0;
        if change >= config.take_profit_pct {
            Some(ExitReason::TakeProfit)
        } else if change <= -config.stop_loss_pct {
            Some(ExitReason::StopLoss)
        } else {
            None
        }
    }

    fn close(self, exit_time: i64, exit_price: f64, exit_reason: ExitReason) -> TradeRecord {
        TradeRecord {
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            exit_time,
            exit_price,
            exit_reason,
        }
    }
}

/// Backtest performance metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    /// Percent of trades closed with a gain
    pub win_rate: f64,
    /// Compounded over all trades, percent
    pub total_return_pct: f64,
    pub avg_return_pct: f64,
    /// Gross gain over gross loss; `None` without losing trades
    pub profit_factor: Option<f64>,
    /// Deepest fall of the equity curve from its running peak, percent
    pub max_drawdown_pct: f64,
    /// Mean over standard deviation of trade returns
    pub sharpe_ratio: Option<f64>,
    pub final_capital: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from trade records, compounding each trade's return
    /// into `initial_capital`.
    pub fn from_trades(trades: &[TradeRecord], initial_capital: f64) -> Self {
        let returns: Vec<f64> = trades.iter().map(TradeRecord::return_pct).collect();
        let total_trades = trades.len();
        let winning_trades = trades.iter().filter(|t| t.is_winner()).count();

        let mut equity = initial_capital;
        let mut peak = initial_capital;
        let mut max_drawdown_pct: f64 = 0.0;
        for r in &returns {
            equity *= 1.0 + r / 100.0;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_drawdown_pct = max_drawdown_pct.max((peak - equity) / peak * 100.0);
            }
        }

        let gross_gain: f64 = returns.iter().filter(|r| **r > 0.0).sum();
        let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
        let profit_factor = (gross_loss > 0.0).then(|| gross_gain / gross_loss);

        let (win_rate, avg_return_pct) = if total_trades == 0 {
            (0.0, 0.0)
        } else {
            (
                winning_trades as f64 / total_trades as f64 * 100.0,
                returns.iter().sum::<f64>() / total_trades as f64,
            )
        };

        let total_return_pct = if initial_capital > 0.0 {
            (equity / initial_capital - 1.0) * 100.0
        } else {
            0.0
        };

        Self {
            total_trades,
            winning_trades,
            win_rate,
            total_return_pct,
            avg_return_pct,
            profit_factor,
            max_drawdown_pct,
            sharpe_ratio: Self::sharpe(&returns),
            final_capital: equity,
        }
    }

    fn sharpe(returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        (std_dev > 0.0).then(|| mean / std_dev)
    }
}

impl std::fmt::Display for BacktestMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ratio = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}", v));
        write!(
            f,
            "{} trades, win rate {:.1}%, total return {:+.2}%, max drawdown {:.2}%, \
             profit factor {}, sharpe {}, final capital {:.2}",
            self.total_trades,
            self.win_rate,
            self.total_return_pct,
            self.max_drawdown_pct,
            ratio(self.profit_factor),
            ratio(self.sharpe_ratio),
            self.final_capital
        )
    }
}

/// Backtest result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub config: BacktestConfig,
    /// Bars examined after the warm-up
    pub bars_replayed: usize,
    pub trades: Vec<TradeRecord>,
    pub metrics: BacktestMetrics,
}

/// Replay `bars` (oldest first) against `strategy`.
///
/// Bars without a usable close are passed over. A bar that closes a trade
/// never opens the next one.
pub fn run_backtest(
    bars: &[EnrichedBar],
    strategy: &StrategyConfig,
    config: &BacktestConfig,
) -> BacktestResult {
    let mut trades = Vec::new();
    let mut position: Option<OpenPosition> = None;
    let mut last_priced: Option<(i64, f64)> = None;
    let mut bars_replayed = 0;

    for bar in bars.iter().skip(config.warmup_bars) {
        bars_replayed += 1;
        let Some(price) = bar.bar.close.filter(|p| p.is_finite() && *p > 0.0) else {
            continue;
        };
        last_priced = Some((bar.open_time(), price));

        match position.take() {
            Some(open) => match open.exit_reason(price, config) {
                Some(reason) => {
                    debug!(at = bar.open_time(), price, %reason, "Backtest exit");
                    trades.push(open.close(bar.open_time(), price, reason));
                }
                None => position = Some(open),
            },
            None if evaluate_strategy(bar, strategy).signal => {
                debug!(at = bar.open_time(), price, "Backtest entry");
                position = Some(OpenPosition {
                    entry_time: bar.open_time(),
                    entry_price: price,
                });
            }
            None => {}
        }
    }

    if let (Some(open), Some((time, price))) = (position, last_priced) {
        trades.push(open.close(time, price, ExitReason::EndOfData));
    }

    let metrics = BacktestMetrics::from_trades(&trades, config.initial_capital);
    info!(
        strategy = %strategy.name,
        bars = bars_replayed,
        trades = metrics.total_trades,
        total_return_pct = metrics.total_return_pct,
        "Backtest finished"
    );

    BacktestResult {
        strategy: strategy.name.clone(),
        config: *config,
        bars_replayed,
        trades,
        metrics,
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Strategy scoring.
//!
//! A strategy checks eight boolean indicators against the latest enriched bar
//! and emits a signal when enough of them fire and the composite score clears
//! the strategy's threshold.

mod config;

pub use config::{RiskLevel, StrategyConfig, StrategyThresholds};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

use funnel_common::validation::{Validate, ValidationError};

use crate::data::EnrichedBar;
use crate::indicators::Trend;

/// Indicator names, in evaluation order.
pub mod indicator {
    pub const RSI_OVERSOLD: &str = "rsi_oversold";
    pub const VOL_SPIKE: &str = "vol_spike";
    pub const VOL_RATIO_HIGH: &str = "vol_ratio_high";
    pub const TREND_BULL: &str = "trend_bull";
    pub const MA_CROSS: &str = "ma_cross";
    pub const MACD_BULL: &str = "macd_bull";
    pub const HIGH_VOL: &str = "high_vol";
    pub const PROB_UP: &str = "prob_up";
}

/// Number of indicators a strategy checks.
pub const INDICATOR_COUNT: usize = 8;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid strategy '{name}': {source}")]
    InvalidConfig {
        name: String,
        #[source]
        source: ValidationError,
    },
}

/// Result of checking one bar against one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub strategy: String,
    pub signal: bool,
    pub active_indicators: Vec<String>,
    pub prob_score: f64,
    pub confidence: f64,
}

impl StrategyEvaluation {
    pub fn signal_count(&self) -> usize {
        self.active_indicators.len()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active_indicators.iter().any(|i| i == name)
    }
}

/// Snapshot metrics stored alongside an emitted signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetrics {
    pub prob_score: f64,
    pub rsi: Option<f64>,
    pub ma_diff_pct: Option<f64>,
    pub trend: Option<Trend>,
}

impl SignalMetrics {
    pub fn from_bar(bar: &EnrichedBar) -> Self {
        Self {
            prob_score: bar.prob_score,
            rsi: bar.rsi_14,
            ma_diff_pct: bar.ma_diff_pct(),
            trend: bar.trend,
        }
    }
}

/// Check `bar` against `config`. Undefined inputs never fire.
pub fn evaluate_strategy(bar: &EnrichedBar, config: &StrategyConfig) -> StrategyEvaluation {
    let t = &config.thresholds;
    let above = |v: Option<f64>, threshold: f64| v.is_some_and(|v| v > threshold);

    let checks: [(&str, bool); INDICATOR_COUNT] = [
        (indicator::RSI_OVERSOLD, bar.rsi_14.is_some_and(|r| r < t.rsi_oversold)),
        (
            indicator::VOL_SPIKE,
            t.volume_spike_enabled && bar.volume_spike == Some(true),
        ),
        (indicator::VOL_RATIO_HIGH, above(bar.vol_ratio_5, t.vol_ratio_min)),
        (indicator::TREND_BULL, bar.trend == Some(Trend::Bullish)),
        (
            indicator::MA_CROSS,
            matches!((bar.ma_10, bar.ma_50), (Some(s), Some(l)) if s > l),
        ),
        (indicator::MACD_BULL, above(bar.macd_hist, 0.0)),
        (indicator::HIGH_VOL, above(bar.volatility, t.high_volatility)),
        (indicator::PROB_UP, bar.prob_score > 0.0),
    ];

    let active_indicators: Vec<String> = checks
        .iter()
        .filter(|(_, fired)| *fired)
        .map(|(name, _)| name.to_string())
        .collect();

    let fired = active_indicators.len();
    let prob_score = if bar.prob_score.is_finite() { bar.prob_score } else { 0.0 };
    let confidence = fired as f64 / INDICATOR_COUNT as f64 * prob_score.max(0.0);
    let signal = fired >= config.min_signals && prob_score >= config.prob_threshold;

    StrategyEvaluation {
        strategy: config.name.clone(),
        signal,
        active_indicators,
        prob_score,
        confidence,
    }
}

/// Named strategies available for evaluation.
#[derive(Debug, Clone, Default)]
pub struct StrategyBook {
    strategies: HashMap<String, StrategyConfig>,
}

impl StrategyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book holding the seeded catalog.
    pub fn with_catalog() -> Self {
        let mut book = Self::new();
        for config in StrategyConfig::catalog() {
            book.strategies.insert(config.name.clone(), config);
        }
        book
    }

    /// Add or replace a strategy after validating it.
    pub fn insert(&mut self, config: StrategyConfig) -> Result<(), StrategyError> {
        config
            .validate()
            .map_err(|source| StrategyError::InvalidConfig {
                name: config.name.clone(),
                source,
            })?;
        self.strategies.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&StrategyConfig, StrategyError> {
        self.strategies
            .get(name)
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Evaluate `bar` with the named strategy.
    pub fn evaluate(&self, name: &str, bar: &EnrichedBar) -> Result<StrategyEvaluation, StrategyError> {
        let config = self.get(name)?;
        let evaluation = evaluate_strategy(bar, config);
        if evaluation.signal {
            info!(
                strategy = name,
                symbol = bar.symbol(),
                fired = evaluation.signal_count(),
                prob_score = format!("{:.2}", evaluation.prob_score),
                confidence = format!("{:.2}", evaluation.confidence),
                active = %evaluation.active_indicators.join(","),
                "Strategy signal"
            );
        }
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Bar, Timeframe};

    fn bar() -> EnrichedBar {
        EnrichedBar {
            bar: Bar {
                symbol: "BTCUSDT".into(),
                open_time: 0,
                open: Some(100.0),
                high: Some(100.0),
                low: Some(100.0),
                close: Some(100.0),
                volume: Some(1.0),
                close_time: None,
                quote_volume: None,
            },
            timeframe: Timeframe::H1,
            ma_10: None,
            ma_50: None,
            rsi_14: None,
            macd: None,
            macd_signal: None,
            macd_hist: None,
            volume_spike: None,
            vol_ratio_5: None,
            vol_ratio_10: None,
            volatility: None,
            trend: None,
            prob_score: 0.0,
            momentum_roc: None,
        }
    }

    fn balanced() -> StrategyConfig {
        StrategyBook::with_catalog().get("balanced").unwrap().clone()
    }

    #[test]
    fn test_undefined_inputs_never_fire() {
        let eval = evaluate_strategy(&bar(), &balanced());
        assert!(eval.active_indicators.is_empty());
        assert!(!eval.signal);
        assert_eq!(eval.confidence, 0.0);
    }

    #[test]
    fn test_all_indicators_fire() {
        let mut b = bar();
        b.rsi_14 = Some(20.0);
        b.volume_spike = Some(true);
        b.vol_ratio_5 = Some(2.0);
        b.trend = Some(Trend::Bullish);
        b.ma_10 = Some(101.0);
        b.ma_50 = Some(100.0);
        b.macd_hist = Some(0.1);
        b.volatility = Some(0.5);
        b.prob_score = 0.8;

        let eval = evaluate_strategy(&b, &balanced());
        assert_eq!(eval.signal_count(), INDICATOR_COUNT);
        assert!(eval.signal);
        assert!((eval.confidence - 0.8).abs() < 1e-12);
        assert_eq!(eval.active_indicators[0], indicator::RSI_OVERSOLD);
    }

    #[test]
    fn test_too_few_indicators_blocks_signal_regardless_of_score() {
        let mut b = bar();
        b.prob_score = 1.0;
        b.macd_hist = Some(1.0);
        // prob_up + macd_bull = 2 < 3
        let eval = evaluate_strategy(&b, &balanced());
        assert_eq!(eval.signal_count(), 2);
        assert!(!eval.signal);
        assert!((eval.confidence - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_score_below_threshold_blocks_signal() {
        let mut b = bar();
        b.prob_score = 0.45;
        b.macd_hist = Some(1.0);
        b.trend = Some(Trend::Bullish);
        b.rsi_14 = Some(10.0);
        let eval = evaluate_strategy(&b, &balanced());
        assert_eq!(eval.signal_count(), 4);
        assert!(!eval.signal);
    }

    #[test]
    fn test_negative_score_gives_zero_confidence() {
        let mut b = bar();
        b.prob_score = -0.7;
        b.rsi_14 = Some(10.0);
        assert_eq!(evaluate_strategy(&b, &balanced()).confidence, 0.0);
    }

    #[test]
    fn test_disabled_volume_spike() {
        let mut b = bar();
        b.volume_spike = Some(true);
        let config = balanced().with_thresholds(StrategyThresholds {
            volume_spike_enabled: false,
            ..Default::default()
        });
        assert!(!evaluate_strategy(&b, &config).is_active(indicator::VOL_SPIKE));
    }

    #[test]
    fn test_unknown_strategy() {
        let book = StrategyBook::with_catalog();
        let err = book.evaluate("moonshot", &bar()).unwrap_err();
        assert!(matches!(err, StrategyError::UnknownStrategy(ref n) if n == "moonshot"));
        assert_eq!(book.names(), vec!["aggressive", "balanced", "high_confidence"]);
    }

    #[test]
    fn test_insert_rejects_invalid() {
        let mut book = StrategyBook::new();
        let mut bad = balanced();
        bad.min_signals = 0;
        assert!(matches!(book.insert(bad), Err(StrategyError::InvalidConfig { .. })));
        assert!(book.is_empty());
    }

    #[test]
    fn test_signal_metrics() {
        let mut b = bar();
        b.ma_10 = Some(110.0);
        b.ma_50 = Some(100.0);
        b.rsi_14 = Some(42.0);
        let m = SignalMetrics::from_bar(&b);
        assert_eq!(m.rsi, Some(42.0));
        assert!((m.ma_diff_pct.unwrap() - 10.0).abs() < 1e-9);
    }
}

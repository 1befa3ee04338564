//! Enrichment engine.
//!
//! Turns raw kline rows into [`EnrichedBar`]s: the fixed indicator set plus
//! the composite probability score for every bar.
//!
//! ```text
//!   kline rows ──► parse_klines ──► Bar[] ──► enrich ──► EnrichedBar[]
//!                                              │
//!                                              ├─ MA 10/50, RSI 14, MACD 12/26/9
//!                                              ├─ volume spike (x2 over 10), ratios 5/10
//!                                              ├─ volatility (window 5, annualised)
//!                                              ├─ trend vote
//!                                              ├─ momentum ROC (15m / 5m only)
//!                                              └─ score_composite
//! ```

use serde_json::Value;
use tracing::warn;

use crate::data::{parse_millis, parse_number, Bar, EnrichedBar, Timeframe};
use crate::indicators::{self, Trend};

// ============================================================================
// Parameters
// ============================================================================

pub const MA_SHORT: usize = 10;
pub const MA_LONG: usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const VOLUME_SPIKE_MULTIPLIER: f64 = 2.0;
pub const VOLUME_SPIKE_PERIOD: usize = 10;
pub const VOLATILITY_WINDOW: usize = 5;
pub const DEFAULT_MOMENTUM_PERIOD: usize = 10;

/// Valid observations, counting the bar itself, a bar needs before its
/// composite score is computed.
pub const MIN_SCORE_OBSERVATIONS: usize = 50;

/// Annualised volatility above which the volatility term follows the trend.
pub const VOLATILITY_THRESHOLD: f64 = 0.02;

/// Term weights of the composite score.
pub mod weights {
    pub const TREND: f64 = 0.30;
    pub const RSI: f64 = 0.20;
    pub const MACD: f64 = 0.15;
    pub const VOLUME_SPIKE: f64 = 0.10;
    pub const VOL_RATIO_5: f64 = 0.05;
    pub const VOL_RATIO_10: f64 = 0.05;
    pub const VOLATILITY: f64 = 0.05;
    pub const MA_CROSS: f64 = 0.05;
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse one kline row: `[open_time, open, high, low, close, volume,
/// close_time, quote_volume, ...]`. Numbers may arrive as JSON numbers or
/// numeric strings. Returns `None` only when the open time is unusable.
pub fn parse_kline_row(symbol: &str, row: &Value) -> Option<Bar> {
    let cells = row.as_array()?;
    let open_time = parse_millis(cells.first()?)?;
    let number = |idx: usize| cells.get(idx).and_then(parse_number);

    Some(Bar {
        symbol: symbol.to_string(),
        open_time,
        open: number(1),
        high: number(2),
        low: number(3),
        close: number(4),
        volume: number(5),
        close_time: cells.get(6).and_then(parse_millis),
        quote_volume: number(7),
    })
}

/// Parse kline rows, dropping rows without a usable open time.
pub fn parse_klines(symbol: &str, rows: &[Value]) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_kline_row(symbol, row) {
            Some(bar) => bars.push(bar),
            None => warn!(symbol, row = %row, "Dropping kline row without open time"),
        }
    }
    bars
}

// ============================================================================
// Composite Score
// ============================================================================

/// Latest indicator values feeding the composite score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreInputs {
    pub trend: Option<Trend>,
    pub rsi: Option<f64>,
    pub macd_hist: Option<f64>,
    pub volume_spike: Option<bool>,
    pub vol_ratio_5: Option<f64>,
    pub vol_ratio_10: Option<f64>,
    pub volatility: Option<f64>,
    pub ma_short: Option<f64>,
    pub ma_long: Option<f64>,
}

impl ScoreInputs {
    pub fn from_bar(bar: &EnrichedBar) -> Self {
        Self {
            trend: bar.trend,
            rsi: bar.rsi_14,
            macd_hist: bar.macd_hist,
            volume_spike: bar.volume_spike,
            vol_ratio_5: bar.vol_ratio_5,
            vol_ratio_10: bar.vol_ratio_10,
            volatility: bar.volatility,
            ma_short: bar.ma_10,
            ma_long: bar.ma_50,
        }
    }
}

fn unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(-1.0, 1.0)
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Weighted composite score in [-1, 1].
///
/// Terms (each in [-1, 1], undefined terms count as 0):
/// - trend direction
/// - RSI distance from 50, inverted so oversold reads bullish
/// - MACD histogram sign
/// - volume spike, signed by trend
/// - 5 and 10 bar volume ratios above/below 1, signed by trend
/// - ±0.5 by trend depending on whether volatility exceeds the threshold
/// - short MA above/below long MA
pub fn score_composite(inputs: &ScoreInputs) -> f64 {
    let trend = inputs.trend.map_or(0.0, Trend::value);

    let rsi = inputs.rsi.map_or(0.0, |r| unit(-(r - 50.0) / 50.0));
    let macd = inputs.macd_hist.map_or(0.0, sign);
    let spike = inputs
        .volume_spike
        .map_or(0.0, |s| if s { trend } else { 0.0 });
    let ratio = |r: Option<f64>| r.map_or(0.0, |r| unit((r - 1.0) * 2.0) * trend);
    let volatility = inputs.volatility.map_or(0.0, |v| {
        if v > VOLATILITY_THRESHOLD {
            0.5 * trend
        } else {
            -0.5 * trend
        }
    });
    let ma_cross = match (inputs.ma_short, inputs.ma_long) {
        (Some(s), Some(l)) => sign(s - l),
        _ => 0.0,
    };

    let total = weights::TREND * trend
        + weights::RSI * rsi
        + weights::MACD * macd
        + weights::VOLUME_SPIKE * spike
        + weights::VOL_RATIO_5 * ratio(inputs.vol_ratio_5)
        + weights::VOL_RATIO_10 * ratio(inputs.vol_ratio_10)
        + weights::VOLATILITY * volatility
        + weights::MA_CROSS * ma_cross;

    unit(total)
}

// ============================================================================
// Enrichment
// ============================================================================

/// Enrichment settings that vary by deployment.
#[derive(Debug, Clone, Copy)]
pub struct EnrichmentParams {
    pub momentum_period: usize,
}

impl Default for EnrichmentParams {
    fn default() -> Self {
        Self {
            momentum_period: DEFAULT_MOMENTUM_PERIOD,
        }
    }
}

/// Compute the indicator set and composite score for every bar.
///
/// `bars` must be one symbol's bars in ascending open-time order. Every output
/// value depends only on bars at or before its own position.
pub fn enrich(timeframe: Timeframe, bars: &[Bar], params: EnrichmentParams) -> Vec<EnrichedBar> {
    if bars.is_empty() {
        return Vec::new();
    }

    let closes: Vec<Option<f64>> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<Option<f64>> = bars.iter().map(|b| b.volume).collect();

    let ma_short = indicators::sma(&closes, MA_SHORT);
    let ma_long = indicators::sma(&closes, MA_LONG);
    let rsi = indicators::rsi(&closes, RSI_PERIOD);
    let macd = indicators::macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let spike = indicators::volume_spike(&volumes, VOLUME_SPIKE_MULTIPLIER, VOLUME_SPIKE_PERIOD);
    let ratio_5 = indicators::volume_ratio(&volumes, 5);
    let ratio_10 = indicators::volume_ratio(&volumes, 10);
    let volatility =
        indicators::volatility(&closes, VOLATILITY_WINDOW, timeframe.periods_per_year());
    let trend = indicators::trend(&closes, &ma_short, &ma_long, &macd.hist, &rsi);
    let momentum = if timeframe.has_momentum() {
        indicators::momentum_roc(&closes, params.momentum_period)
    } else {
        vec![None; bars.len()]
    };

    let mut observations = 0usize;
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            if bar.close.is_some() {
                observations += 1;
            }

            let mut enriched = EnrichedBar {
                bar: bar.clone(),
                timeframe,
                ma_10: ma_short[i],
                ma_50: ma_long[i],
                rsi_14: rsi[i],
                macd: macd.macd[i],
                macd_signal: macd.signal[i],
                macd_hist: macd.hist[i],
                volume_spike: spike[i],
                vol_ratio_5: ratio_5[i],
                vol_ratio_10: ratio_10[i],
                volatility: volatility[i],
                trend: trend[i],
                prob_score: 0.0,
                momentum_roc: momentum[i],
            };
            if observations >= MIN_SCORE_OBSERVATIONS {
                enriched.prob_score = score_composite(&ScoreInputs::from_bar(&enriched));
            }
            enriched
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

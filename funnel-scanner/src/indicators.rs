//! Technical indicator library.
//!
//! Every function takes a series of optional values and returns a series of
//! the same length, index-aligned with the input. `None` marks an undefined
//! value: either the position lies inside the warm-up window, or an input the
//! window depends on is itself undefined. No sentinel numbers are used.
//!
//! All functions are pure and run in a single pass (rolling windows are
//! bounded by their period).

use serde::{Deserialize, Serialize};

/// Series of optional values, aligned to bar index.
pub type Series = Vec<Option<f64>>;

// ============================================================================
// Trend
// ============================================================================

/// Composite trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bearish,
    Neutral,
    Bullish,
}

impl Trend {
    /// Signed value used by the composite score (-1, 0, 1).
    pub fn value(self) -> f64 {
        match self {
            Self::Bearish => -1.0,
            Self::Neutral => 0.0,
            Self::Bullish => 1.0,
        }
    }

    /// Integer form used in storage.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Bearish => -1,
            Self::Neutral => 0,
            Self::Bullish => 1,
        }
    }

    /// Parse the stored integer form.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            -1 => Some(Self::Bearish),
            0 => Some(Self::Neutral),
            1 => Some(Self::Bullish),
            _ => None,
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
            Self::Bullish => write!(f, "bullish"),
        }
    }
}

// ============================================================================
// Moving Averages
// ============================================================================

/// Mean of `values[end + 1 - period ..= end]`, or `None` if the window is short
/// or contains an undefined value.
fn window_mean(values: &[Option<f64>], end: usize, period: usize) -> Option<f64> {
    if period == 0 || end + 1 < period {
        return None;
    }
    let mut sum = 0.0;
    for v in &values[end + 1 - period..=end] {
        sum += (*v)?;
    }
    Some(sum / period as f64)
}

/// Simple moving average over `period` values.
pub fn sma(values: &[Option<f64>], period: usize) -> Series {
    (0..values.len())
        .map(|i| window_mean(values, i, period))
        .collect()
}

/// Exponential moving average with span weighting.
///
/// Weights decay by `1 - alpha` per position with `alpha = 2 / (span + 1)` and
/// are normalised by the sum of weights actually observed, so early values
/// are an average of what has been seen rather than being seeded with the
/// first price. Undefined inputs produce an undefined output but still age
/// the weights.
#[derive(Debug, Clone)]
pub struct Ema {
    decay: f64,
    weighted_sum: f64,
    weight_total: f64,
}

impl Ema {
    pub fn new(span: usize) -> Self {
        let alpha = 2.0 / (span as f64 + 1.0);
        Self {
            decay: 1.0 - alpha,
            weighted_sum: 0.0,
            weight_total: 0.0,
        }
    }

    /// Feed one value, return the current average.
    pub fn update(&mut self, value: Option<f64>) -> Option<f64> {
        self.weighted_sum *= self.decay;
        self.weight_total *= self.decay;
        let x = value?;
        self.weighted_sum += x;
        self.weight_total += 1.0;
        Some(self.weighted_sum / self.weight_total)
    }
}

/// EMA over a whole series.
pub fn ema(values: &[Option<f64>], span: usize) -> Series {
    let mut ema = Ema::new(span);
    values.iter().map(|v| ema.update(*v)).collect()
}

// ============================================================================
// Oscillators
// ============================================================================

/// Relative strength index.
///
/// Uses simple rolling means of the last `period` gains and losses, so the
/// first defined value is at index `period`. A window with losses of zero
/// yields 100 when there were gains and is undefined when flat.
pub fn rsi(closes: &[Option<f64>], period: usize) -> Series {
    let n = closes.len();
    let mut gains: Series = vec![None; n];
    let mut losses: Series = vec![None; n];
    for i in 1..n {
        if let (Some(prev), Some(cur)) = (closes[i - 1], closes[i]) {
            let delta = cur - prev;
            gains[i] = Some(delta.max(0.0));
            losses[i] = Some((-delta).max(0.0));
        }
    }

    (0..n)
        .map(|i| {
            if i < period {
                return None;
            }
            let gain = window_mean(&gains, i, period)?;
            let loss = window_mean(&losses, i, period)?;
            if loss == 0.0 {
                return if gain > 0.0 { Some(100.0) } else { None };
            }
            Some(100.0 - 100.0 / (1.0 + gain / loss))
        })
        .collect()
}

/// MACD line, signal line and histogram.
#[derive(Debug, Clone, Default)]
pub struct MacdSeries {
    pub macd: Series,
    pub signal: Series,
    pub hist: Series,
}

/// MACD with the usual fast/slow/signal spans.
///
/// The line is undefined for the first `slow - 1` positions; the signal line
/// and histogram for the first `slow + signal - 2`.
pub fn macd(closes: &[Option<f64>], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let raw_line: Series = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();
    let raw_signal = ema(&raw_line, signal);

    let line_warmup = slow.saturating_sub(1);
    let signal_warmup = (slow + signal).saturating_sub(2);

    let mut out = MacdSeries::default();
    for i in 0..closes.len() {
        let line = if i >= line_warmup { raw_line[i] } else { None };
        let sig = if i >= signal_warmup { raw_signal[i] } else { None };
        let hist = match (line, sig) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        };
        out.macd.push(line);
        out.signal.push(sig);
        out.hist.push(hist);
    }
    out
}

// ============================================================================
// Volume
// ============================================================================

/// Whether volume exceeds `multiplier` times its `period` rolling mean.
pub fn volume_spike(volumes: &[Option<f64>], multiplier: f64, period: usize) -> Vec<Option<bool>> {
    let avg = sma(volumes, period);
    volumes
        .iter()
        .zip(avg)
        .map(|(v, a)| Some((*v)? > a? * multiplier))
        .collect()
}

/// Volume divided by its `period` rolling mean; undefined when the mean is 0.
pub fn volume_ratio(volumes: &[Option<f64>], period: usize) -> Series {
    let avg = sma(volumes, period);
    volumes
        .iter()
        .zip(avg)
        .map(|(v, a)| {
            let a = a?;
            if a == 0.0 {
                None
            } else {
                Some((*v)? / a)
            }
        })
        .collect()
}

// ============================================================================
// Volatility & Momentum
// ============================================================================

/// Annualised realised volatility: sample standard deviation of the last
/// `window` percentage returns, scaled by `sqrt(periods_per_year)`.
pub fn volatility(closes: &[Option<f64>], window: usize, periods_per_year: f64) -> Series {
    let n = closes.len();
    let mut returns: Series = vec![None; n];
    for i in 1..n {
        if let (Some(prev), Some(cur)) = (closes[i - 1], closes[i]) {
            if prev != 0.0 {
                returns[i] = Some(cur / prev - 1.0);
            }
        }
    }

    let scale = periods_per_year.sqrt();
    (0..n)
        .map(|i| {
            if window < 2 || i < window {
                return None;
            }
            let mean = window_mean(&returns, i, window)?;
            let mut sq = 0.0;
            for r in &returns[i + 1 - window..=i] {
                let d = (*r)? - mean;
                sq += d * d;
            }
            Some((sq / (window - 1) as f64).sqrt() * scale)
        })
        .collect()
}

/// Percent rate of change against the close `period` bars earlier.
pub fn momentum_roc(closes: &[Option<f64>], period: usize) -> Series {
    (0..closes.len())
        .map(|i| {
            if period == 0 || i < period {
                return None;
            }
            let earlier = closes[i - period]?;
            if earlier == 0.0 {
                return None;
            }
            Some((closes[i]? - earlier) / earlier * 100.0)
        })
        .collect()
}

// ============================================================================
// Composite Trend
// ============================================================================

/// Four-condition trend vote.
///
/// Conditions: close above the long MA, short MA above the long MA, positive
/// MACD histogram, RSI above 50. Each bullish condition met adds 0.25 to the
/// bullish tally; each strictly opposite condition adds 0.25 to the bearish
/// tally. A tally above 0.5 (three or more votes) sets the direction.
pub fn trend(
    closes: &[Option<f64>],
    ma_short: &[Option<f64>],
    ma_long: &[Option<f64>],
    macd_hist: &[Option<f64>],
    rsi: &[Option<f64>],
) -> Vec<Option<Trend>> {
    (0..closes.len())
        .map(|i| {
            let close = closes[i]?;
            let short = *ma_short.get(i)?;
            let long = *ma_long.get(i)?;
            let hist = *macd_hist.get(i)?;
            let rsi = *rsi.get(i)?;
            let (short, long, hist, rsi) = (short?, long?, hist?, rsi?);

            let bull_votes = [close > long, short > long, hist > 0.0, rsi > 50.0];
            let bear_votes = [close < long, short < long, hist < 0.0, rsi < 50.0];
            let bull = bull_votes.iter().filter(|v| **v).count() as f64 * 0.25;
            let bear = bear_votes.iter().filter(|v| **v).count() as f64 * 0.25;

            Some(if bull > 0.5 {
                Trend::Bullish
            } else if bear > 0.5 {
                Trend::Bearish
            } else {
                Trend::Neutral
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

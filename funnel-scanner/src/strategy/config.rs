//! Strategy configuration and the built-in catalog.

use serde::{Deserialize, Serialize};

use funnel_common::validation::{Validate, ValidationError, ValidationResult};

use super::INDICATOR_COUNT;

/// Risk label attached to a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicator thresholds. Stored as JSON in the strategies table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyThresholds {
    /// RSI below this counts as oversold
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    /// Whether a volume spike may fire at all
    #[serde(default = "default_volume_spike_enabled")]
    pub volume_spike_enabled: bool,
    /// 5-bar volume ratio above this counts as high
    #[serde(default = "default_vol_ratio_min")]
    pub vol_ratio_min: f64,
    /// Annualised volatility above this counts as high
    #[serde(default = "default_high_volatility")]
    pub high_volatility: f64,
}

fn default_rsi_oversold() -> f64 {
    30.0
}
fn default_volume_spike_enabled() -> bool {
    true
}
fn default_vol_ratio_min() -> f64 {
    1.5
}
fn default_high_volatility() -> f64 {
    0.02
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            rsi_oversold: default_rsi_oversold(),
            volume_spike_enabled: default_volume_spike_enabled(),
            vol_ratio_min: default_vol_ratio_min(),
            high_volatility: default_high_volatility(),
        }
    }
}

/// A named strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    /// Fired indicators needed for a signal
    pub min_signals: usize,
    /// Composite score needed for a signal
    pub prob_threshold: f64,
    #[serde(default)]
    pub thresholds: StrategyThresholds,
    pub risk: RiskLevel,
}

impl StrategyConfig {
    /// Build and validate a strategy.
    pub fn new(
        name: impl Into<String>,
        min_signals: usize,
        prob_threshold: f64,
        risk: RiskLevel,
    ) -> ValidationResult<Self> {
        let config = Self {
            name: name.into(),
            min_signals,
            prob_threshold,
            thresholds: StrategyThresholds::default(),
            risk,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_thresholds(mut self, thresholds: StrategyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// The seeded catalog: `high_confidence`, `balanced`, `aggressive`.
    pub fn catalog() -> Vec<Self> {
        let entry = |name: &str, min_signals, prob_threshold, risk| Self {
            name: name.to_string(),
            min_signals,
            prob_threshold,
            thresholds: StrategyThresholds::default(),
            risk,
        };
        vec![
            entry("high_confidence", 5, 0.6, RiskLevel::Low),
            entry("balanced", 3, 0.5, RiskLevel::Medium),
            entry("aggressive", 2, 0.3, RiskLevel::High),
        ]
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Validate for StrategyConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "strategy.name".into(),
            });
        }
        if self.min_signals == 0 || self.min_signals > INDICATOR_COUNT {
            errors.push(invalid(
                "strategy.min_signals",
                format!("must be between 1 and {}", INDICATOR_COUNT),
            ));
        }
        if !(-1.0..=1.0).contains(&self.prob_threshold) {
            errors.push(invalid("strategy.prob_threshold", "must be within [-1, 1]"));
        }
        if !(0.0..=100.0).contains(&self.thresholds.rsi_oversold) {
            errors.push(invalid("strategy.thresholds.rsi_oversold", "must be within [0, 100]"));
        }
        if !(self.thresholds.vol_ratio_min > 0.0) {
            errors.push(invalid("strategy.thresholds.vol_ratio_min", "must be positive"));
        }
        if !(self.thresholds.high_volatility >= 0.0) {
            errors.push(invalid("strategy.thresholds.high_volatility", "must not be negative"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple(errors)),
        }
    }
}

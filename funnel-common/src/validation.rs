//! Configuration validation.
//!
//! Configuration problems are fatal: the scanner refuses to start rather than
//! silently falling back to defaults.

use std::str::FromStr;
use thiserror::Error;

use crate::config::{Config, ExchangeConfig, FunnelConfig, ObservabilityConfig};
use crate::error::{self, ResultExt};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

fn collapse(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let errors: Vec<ValidationError> = [
            self.exchange.validate(),
            self.funnel.validate(),
            self.observability.validate(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        collapse(errors)
    }

    /// Load (explicit path or default), apply env overrides, and validate.
    ///
    pub fn load_and_validate(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let config = Self::load_with_env(path).map_err(|e| error::Error::Config(format!("{:#}", e)))?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

impl Validate for ExchangeConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            errors.push(invalid("exchange.base_url", "must be an http(s) URL"));
        }
        if self.request_timeout_secs == 0 {
            errors.push(invalid("exchange.request_timeout_secs", "must be greater than 0"));
        }
        if self.quote_asset.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "exchange.quote_asset".into(),
            });
        }
        if self.require_api_key && self.api_key.as_deref().map_or(true, str::is_empty) {
            errors.push(ValidationError::MissingField {
                field: "exchange.api_key (or MEXC_API_KEY)".into(),
            });
        }

        collapse(errors)
    }
}

impl Validate for FunnelConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (field, expr) in [
            ("funnel.hourly_cron", &self.hourly_cron),
            ("funnel.refine_cron", &self.refine_cron),
            ("funnel.confirm_cron", &self.confirm_cron),
            ("funnel.sync_cron", &self.sync_cron),
        ] {
            if let Err(e) = cron::Schedule::from_str(expr) {
                errors.push(invalid(field, format!("invalid cron '{}': {}", expr, e)));
            }
        }

        if self.strategy.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "funnel.strategy".into(),
            });
        }
        if self.hourly_top_n == 0 {
            errors.push(invalid("funnel.hourly_top_n", "must be greater than 0"));
        }
        if self.refine_top_n == 0 {
            errors.push(invalid("funnel.refine_top_n", "must be greater than 0"));
        }
        if !(-1.0..=1.0).contains(&self.refine_threshold) {
            errors.push(invalid("funnel.refine_threshold", "must be within [-1, 1]"));
        }
        if self.kline_fetch_limit == 0 || self.kline_fetch_limit > 1000 {
            errors.push(invalid("funnel.kline_fetch_limit", "must be within 1..=1000"));
        }
        if self.max_kline_failures == 0 {
            errors.push(invalid("funnel.max_kline_failures", "must be greater than 0"));
        }
        if self.momentum_period == 0 {
            errors.push(invalid("funnel.momentum_period", "must be greater than 0"));
        }
        if self.snapshot_retention_hours <= 0 {
            errors.push(invalid("funnel.snapshot_retention_hours", "must be positive"));
        }
        if self.kline_retention_days <= 0 || self.backfill_days <= 0 {
            errors.push(invalid(
                "funnel.kline_retention_days",
                "retention and backfill days must be positive",
            ));
        }
        if self.min_quote_volume < 0.0 {
            errors.push(invalid("funnel.min_quote_volume", "must not be negative"));
        }
        if !(0.0..1.0).contains(&self.stop_loss_pct) {
            errors.push(invalid("funnel.stop_loss_pct", "must be within [0, 1)"));
        }
        if self.take_profit_pct < 0.0 {
            errors.push(invalid("funnel.take_profit_pct", "must not be negative"));
        }

        collapse(errors)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(
                "observability.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(invalid(
                "observability.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        Ok(())
    }
}

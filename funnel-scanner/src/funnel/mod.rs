//! The three-stage funnel.
//!
//! ```text
//!   Stage A (1h, hourly)     all active symbols ──► top 100 by composite score
//!   Stage B (15m, 15 min)    Stage A snapshot   ──► top 20 above refine threshold
//!   Stage C (5m, 5 min)      Stage B snapshot   ──► signals where momentum >= 0
//! ```
//!
//! Each stage reads the previous stage's persisted snapshot, so stages run on
//! independent schedules and survive restarts.

mod scheduler;
mod stages;

pub use scheduler::{FunnelScheduler, SchedulerState};
pub use stages::FunnelStages;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::data::{RankedCandidate, Signal};

/// A unit of funnel work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sync,
    Backfill,
    Hourly,
    Refine,
    Confirm,
}

impl Stage {
    /// Get stage name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Backfill => "backfill",
            Self::Hourly => "hourly",
            Self::Refine => "refine",
            Self::Confirm => "confirm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "backfill" => Some(Self::Backfill),
            "hourly" | "a" => Some(Self::Hourly),
            "refine" | "b" => Some(Self::Refine),
            "confirm" | "c" => Some(Self::Confirm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of one stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Symbols fully processed
    pub processed: usize,
    /// Symbols passed over (filtered, too little history, no data)
    pub skipped: usize,
    /// Symbols whose fetch, enrichment or persistence failed
    pub failures: usize,
    /// Ranked output, when the stage produces one
    pub candidates: Vec<RankedCandidate>,
    /// Symbols whose latest bar met the configured strategy (Stage A)
    pub strategy_matches: Vec<String>,
    pub signals: Vec<Signal>,
    /// Set when shutdown cut the run short
    pub interrupted: bool,
    pub duration: Duration,
}

impl StageReport {
    pub(crate) fn start(stage: Stage) -> Self {
        Self {
            stage,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            processed: 0,
            skipped: 0,
            failures: 0,
            candidates: Vec::new(),
            strategy_matches: Vec::new(),
            signals: Vec::new(),
            interrupted: false,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.duration = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        tracing::info!(
            stage = self.stage.name(),
            run_id = %self.run_id,
            processed = self.processed,
            skipped = self.skipped,
            failures = self.failures,
            candidates = self.candidates.len(),
            strategy_matches = self.strategy_matches.len(),
            signals = self.signals.len(),
            interrupted = self.interrupted,
            duration_ms = self.duration.as_millis() as u64,
            "Stage finished"
        );
        self
    }
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]: {} processed, {} skipped, {} failed, {} candidates, {} signals in {:.1}s{}",
            self.stage,
            self.run_id,
            self.processed,
            self.skipped,
            self.failures,
            self.candidates.len(),
            self.signals.len(),
            self.duration.as_secs_f64(),
            if self.interrupted { " (interrupted)" } else { "" }
        )
    }
}

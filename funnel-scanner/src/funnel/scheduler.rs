//! Cron-based scheduling for the funnel stages.
//!
//! Each stage runs in its own loop: sleep until the next cron fire time, run,
//! repeat. A `watch` channel carries shutdown; sleeps are cut short as soon as
//! it flips, while a stage already running finishes its current symbol.
//!
//! # Default Schedules (6-field cron, UTC)
//!
//! - Hourly scan:  `0 1 * * * *`    (minute 1 of every hour)
//! - Refinement:   `0 2/15 * * * *` (every 15 minutes)
//! - Confirmation: `0 3/5 * * * *`  (every 5 minutes)
//! - Universe sync: `0 30 0 * * *`  (daily at 00:30)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};

use funnel_common::config::FunnelConfig;

use super::{FunnelStages, Stage};

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler not started, or shut down
    Stopped,
    /// Scheduler running
    Running,
}

/// A parsed schedule with its stage
struct ParsedSchedule {
    stage: Stage,
    schedule: Schedule,
}

/// Runs Stage A, B, C and the universe sync on their cron schedules until
/// shutdown.
pub struct FunnelScheduler {
    stages: Arc<FunnelStages>,
    hourly: ParsedSchedule,
    refine: ParsedSchedule,
    confirm: ParsedSchedule,
    sync: ParsedSchedule,
    state: Arc<RwLock<SchedulerState>>,
    shutdown: watch::Receiver<bool>,
}

impl FunnelScheduler {
    /// Create a new scheduler
    pub fn new(
        stages: Arc<FunnelStages>,
        config: &FunnelConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let parse = |stage: Stage, expr: &str| -> Result<ParsedSchedule> {
            let schedule = Schedule::from_str(expr)
                .with_context(|| format!("Invalid {} cron: {}", stage, expr))?;
            Ok(ParsedSchedule { stage, schedule })
        };

        let hourly = parse(Stage::Hourly, &config.hourly_cron)?;
        let refine = parse(Stage::Refine, &config.refine_cron)?;
        let confirm = parse(Stage::Confirm, &config.confirm_cron)?;
        let sync = parse(Stage::Sync, &config.sync_cron)?;

        info!(
            hourly = %config.hourly_cron,
            refine = %config.refine_cron,
            confirm = %config.confirm_cron,
            sync = %config.sync_cron,
            "Scheduler configured"
        );

        Ok(Self {
            stages,
            hourly,
            refine,
            confirm,
            sync,
            state: Arc::new(RwLock::new(SchedulerState::Stopped)),
            shutdown,
        })
    }

    /// Get current scheduler state
    pub async fn get_state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Next fire time of each stage, soonest first.
    pub fn get_next_schedules(&self) -> Vec<(Stage, DateTime<Utc>)> {
        let mut next_times: Vec<_> = [&self.hourly, &self.refine, &self.confirm, &self.sync]
            .into_iter()
            .filter_map(|p| p.schedule.upcoming(Utc).next().map(|t| (p.stage, t)))
            .collect();
        next_times.sort_by_key(|(_, time)| *time);
        next_times
    }

    /// Run all stage loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        *self.state.write().await = SchedulerState::Running;
        info!("Scheduler started");

        tokio::join!(
            self.stage_loop(&self.hourly),
            self.stage_loop(&self.refine),
            self.stage_loop(&self.confirm),
            self.stage_loop(&self.sync),
        );

        *self.state.write().await = SchedulerState::Stopped;
        info!("Scheduler stopped");
        Ok(())
    }

    async fn stage_loop(&self, parsed: &ParsedSchedule) {
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(next) = parsed.schedule.upcoming(Utc).next() else {
                info!(stage = parsed.stage.name(), "No further fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!(stage = parsed.stage.name(), next = %next, "Waiting for next run");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.stages.run(parsed.stage).await {
                error!(stage = parsed.stage.name(), error = %e, "Stage run failed");
            }
        }
    }
}

//! Minimum-interval gate for API request throttling.
//!
//! The exchange penalises bursts, so every request start is spaced at least
//! `min_interval` after the previous one. The gate only orders request
//! *starts*; the HTTP call itself runs outside the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Serialises request starts so that consecutive starts are at least
/// `min_interval` apart, across every task sharing the gate.
#[derive(Debug)]
pub struct RateGate {
    /// Required spacing between request starts
    min_interval: Duration,
    /// Start instant of the most recent request
    last_start: Mutex<Option<Instant>>,
    /// Name for logging
    name: String,
}

impl RateGate {
    /// Create a new gate.
    pub fn new(name: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Create a gate from a millisecond interval.
    pub fn from_millis(name: impl Into<String>, millis: u64) -> Self {
        Self::new(name, Duration::from_millis(millis))
    }

    /// Wait until a request may start, then record the start.
    ///
    /// The wait happens while holding the lock, so concurrent callers queue
    /// behind each other and each waits at most one interval once it holds
    /// the lock.
    pub async fn acquire(&self) {
        let mut last_start = self.last_start.lock().await;

        if let Some(previous) = *last_start {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(
                    gate = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    "Rate gated, waiting"
                );
                tokio::time::sleep(wait).await;
            }
        }

        *last_start = Some(Instant::now());
    }

    /// Get the configured interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Gate shared between clients.
pub type SharedRateGate = Arc<RateGate>;

// ============================================================================
// Tests
// ============================================================================

//! Bounded, fixed-interval readiness polling.

use crate::config::PollConfig;
use crate::probe::{Probe, ProbeOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one readiness wait.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessResult {
    /// Whether the server answered before the deadline.
    pub ready: bool,

    /// Time spent waiting, in seconds.
    pub elapsed_seconds: f64,

    /// Number of probes issued.
    pub attempts: u32,
}

/// Polls a [`Probe`] until it succeeds or the maximum wait passes.
///
/// The interval is constant (no backoff) and no probe is issued once the
/// maximum wait has elapsed.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    interval: Duration,
    max_wait: Duration,
    progress_every: u32,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait,
            progress_every: 10,
        }
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(config.interval(), config.max_wait()).with_progress_every(config.progress_every)
    }

    /// Log a progress line on attempt 1, 1+N, 1+2N, ...
    pub fn with_progress_every(mut self, every: u32) -> Self {
        self.progress_every = every.max(1);
        self
    }

    pub async fn wait<P: Probe + ?Sized>(&self, probe: &P) -> ReadinessResult {
        let start = Instant::now();
        let mut attempts = 0u32;

        info!(
            max_wait_secs = self.max_wait.as_secs_f64(),
            "Waiting for server to start"
        );

        loop {
            attempts += 1;
            // An in-flight probe never outlives the wait budget.
            let budget = self.max_wait.saturating_sub(start.elapsed());
            let outcome = match tokio::time::timeout(budget, probe.probe()).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Unreachable {
                    reason: "no answer before the maximum wait".to_string(),
                },
            };
            let elapsed = start.elapsed();

            if outcome.is_reachable() {
                info!(attempts, elapsed_secs = elapsed.as_secs_f64(), "Server is up");
                return ReadinessResult {
                    ready: true,
                    elapsed_seconds: elapsed.as_secs_f64(),
                    attempts,
                };
            }

            if is_progress_attempt(attempts, self.progress_every) {
                info!(
                    attempts,
                    elapsed_secs = elapsed.as_secs(),
                    max_wait_secs = self.max_wait.as_secs(),
                    "Still waiting for server"
                );
            } else {
                debug!(attempts, ?outcome, "Server not reachable yet");
            }

            let remaining = match self.max_wait.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => break,
            };
            tokio::time::sleep(self.interval.min(remaining)).await;

            if start.elapsed() >= self.max_wait {
                break;
            }
        }

        let elapsed = start.elapsed();
        warn!(
            attempts,
            elapsed_secs = elapsed.as_secs_f64(),
            "Server did not become reachable in time"
        );
        ReadinessResult {
            ready: false,
            elapsed_seconds: elapsed.as_secs_f64(),
            attempts,
        }
    }
}

/// Progress is reported on attempt 1, 1+N, 1+2N, ...
fn is_progress_attempt(attempts: u32, every: u32) -> bool {
    attempts > 0 && (attempts - 1) % every.max(1) == 0
}

use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy after a failed launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchDecision {
    /// Budget remains: back off for `delay`, then try again.
    Retry { attempt: u32, delay: Duration },
    /// Consecutive failures reached the budget; the sequence is over.
    GiveUp,
}

/// Knobs for the per-sequence launch budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Consecutive failed launches tolerated within one sequence.
    pub max_attempts: u32,
    /// Delay after the first failed launch.
    pub initial_delay: Duration,
    /// Cap on the doubling delay.
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// Admission control for one launch sequence.
///
/// Counts consecutive failed launch attempts and hands out backoff delays.
/// Every sequence (the initial start and each reconnection after a
/// disposal) gets its own policy with a fresh budget; the counter never
/// carries over across a successful connection.
pub struct RetryPolicy {
    settings: RetrySettings,
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            attempt: 0,
        }
    }

    /// Count one failed launch and decide whether the sequence continues.
    pub fn on_failure(&mut self) -> LaunchDecision {
        self.attempt += 1;

        if self.attempt >= self.settings.max_attempts {
            warn!(
                attempts = self.attempt,
                "launch attempts exhausted for this sequence"
            );
            LaunchDecision::GiveUp
        } else {
            LaunchDecision::Retry {
                attempt: self.attempt,
                delay: self.delay_for(self.attempt),
            }
        }
    }

    /// Delay before the next attempt: `initial * 2^(failures - 1)`, capped
    /// at `max_delay`. Deterministic (no jitter) so tests can assert the
    /// exact curve through an injected clock.
    fn delay_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let initial = self.settings.initial_delay.as_millis() as u64;
        let cap = self.settings.max_delay.as_millis() as u64;
        Duration::from_millis(initial.saturating_mul(factor).min(cap))
    }

    /// Clear the counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts so far in this sequence.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

//! Reconnect backoff and the anchor open-timeout schedule.

use std::time::Duration;

/// Delay before the first reconnect attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on any reconnect delay.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Exponent cap: delays stop doubling after this many attempts.
pub const DEFAULT_BACKOFF_MAX_EXPONENT: u32 = 6;

/// Open timeouts for successive anchor connection attempts.
pub const DEFAULT_ANCHOR_TIMEOUTS: [Duration; 3] =
    [Duration::from_secs(30), Duration::from_secs(60), Duration::from_secs(120)];

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay for the first attempt
    pub base: Duration,
    /// Maximum delay
    pub ceiling: Duration,
    /// Maximum doubling exponent
    pub max_exponent: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            ceiling: DEFAULT_BACKOFF_CEILING,
            max_exponent: DEFAULT_BACKOFF_MAX_EXPONENT,
        }
    }
}

impl BackoffConfig {
    /// Delay before attempt number `attempt` (1-based).
    ///
    /// `min(ceiling, base * 2^min(max_exponent, attempt - 1))`; zero for
    /// attempt 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(self.max_exponent);
        self.base.saturating_mul(2u32.saturating_pow(exponent)).min(self.ceiling)
    }
}

/// Attempt counter for one peer's reconnection loop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    attempts: u32,
}

impl ReconnectBackoff {
    /// Fresh counter at zero attempts.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// Attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.config.delay_for(self.attempts)
    }

    /// Back to zero after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Graduated open timeouts for the anchor link; the last step repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorTimeoutSchedule {
    steps: Vec<Duration>,
}

impl Default for AnchorTimeoutSchedule {
    fn default() -> Self {
        Self { steps: DEFAULT_ANCHOR_TIMEOUTS.to_vec() }
    }
}

impl AnchorTimeoutSchedule {
    /// Custom schedule. An empty list falls back to the default.
    pub fn new(steps: Vec<Duration>) -> Self {
        if steps.is_empty() { Self::default() } else { Self { steps } }
    }

    /// Open timeout for the given attempt (0 = first dial).
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.steps.len() - 1);
        self.steps[index]
    }
}

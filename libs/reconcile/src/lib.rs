//! Revival backoff and retry accounting.
//!
//! The supervision tree converges the set of running processes to the set of
//! configured ones. When a process keeps dying, respawning it immediately
//! would spin, so revivals are spaced out by a `RevivalPolicy`. Failures the
//! tree cannot heal on its own are counted by a `RetryBudget` so they can be
//! surfaced instead of retried forever in silence.
//!
//! # Revival curve
//!
//! - The first revival waits `initial` (1s by default).
//! - Each revival grows the delay for the next one: doubling or linear, per
//!   `BackoffCurve`, never above `max` (60s by default).
//! - A process that stayed up for at least `min_uptime` is considered healthy
//!   again: its next death resets the delay to `initial`.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default first revival delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default revival delay ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default uptime after which a process counts as healthy again.
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(30);

/// Default retry limit before a failure is reported as persistent.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Policy errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Unknown backoff curve name.
    #[error("unknown backoff curve: {0} (expected 'doubling' or 'linear')")]
    UnknownCurve(String),

    /// The policy's bounds are inconsistent.
    #[error("invalid revival policy: {0}")]
    InvalidPolicy(String),
}

/// How the revival delay grows between consecutive rapid deaths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffCurve {
    /// Multiply the delay by two.
    #[default]
    Doubling,
    /// Add a fixed step to the delay.
    Linear {
        #[serde(with = "duration_ms")]
        step: Duration,
    },
}

impl fmt::Display for BackoffCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffCurve::Doubling => write!(f, "doubling"),
            BackoffCurve::Linear { step } => write!(f, "linear(+{}ms)", step.as_millis()),
        }
    }
}

impl FromStr for BackoffCurve {
    type Err = ReconcileError;

    /// Parse a curve name. Linear uses a one second step; callers that need
    /// a different step construct the variant directly.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "doubling" | "exponential" => Ok(BackoffCurve::Doubling),
            "linear" => Ok(BackoffCurve::Linear {
                step: Duration::from_secs(1),
            }),
            other => Err(ReconcileError::UnknownCurve(other.to_string())),
        }
    }
}

/// Spacing of automatic revivals for a process that keeps dying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevivalPolicy {
    /// Delay before the first revival.
    #[serde(with = "duration_ms")]
    pub initial: Duration,

    /// Ceiling for the delay.
    #[serde(with = "duration_ms")]
    pub max: Duration,

    /// Growth between consecutive revivals.
    pub curve: BackoffCurve,

    /// Uptime after which the delay resets to `initial`.
    #[serde(with = "duration_ms")]
    pub min_uptime: Duration,
}

impl Default for RevivalPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            curve: BackoffCurve::Doubling,
            min_uptime: DEFAULT_MIN_UPTIME,
        }
    }
}

impl RevivalPolicy {
    /// Check that the bounds are usable.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.initial.is_zero() {
            return Err(ReconcileError::InvalidPolicy(
                "initial delay must be positive".to_string(),
            ));
        }
        if self.max < self.initial {
            return Err(ReconcileError::InvalidPolicy(format!(
                "max delay {:?} is below initial delay {:?}",
                self.max, self.initial
            )));
        }
        Ok(())
    }

    /// Delay to use after `current` for the next consecutive revival.
    ///
    /// Never below `initial`, never above `max`, and never smaller than
    /// `current` when `current` is itself within bounds.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let current = current.max(self.initial);
        let grown = match self.curve {
            BackoffCurve::Doubling => current.saturating_mul(2),
            BackoffCurve::Linear { step } => current.saturating_add(step),
        };
        grown.min(self.max).max(self.initial.min(self.max))
    }

    /// Delay to wait before reviving a process that just died after running
    /// for `uptime`.
    pub fn delay_after_exit(&self, current: Duration, uptime: Duration) -> Duration {
        if uptime >= self.min_uptime {
            self.initial
        } else {
            current.max(self.initial).min(self.max)
        }
    }
}

/// Bounded retry accounting for a failure that recurs over time.
///
/// Failures older than `window` are forgotten. Once more than `max_retries`
/// failures fall within one window the budget is exhausted until `clear` is
/// called or the window rolls over.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    window: Duration,
    failures: u32,
    first_failure: Option<Instant>,
}

impl RetryBudget {
    /// Create a new budget.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: 0,
            first_failure: None,
        }
    }

    /// Record a failure at `now`.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        match self.first_failure {
            Some(first) if now.saturating_duration_since(first) <= self.window => {}
            _ => {
                self.failures = 0;
                self.first_failure = Some(now);
            }
        }

        self.failures += 1;
        self.failures > self.max_retries
    }

    /// Failures counted in the current window.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget all failures (on success).
    pub fn clear(&mut self) {
        self.failures = 0;
        self.first_failure = None;
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

/// Serde helpers that encode a `Duration` as integer milliseconds.
///
/// Use with `#[serde(with = "nodetree_reconcile::duration_ms")]`.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

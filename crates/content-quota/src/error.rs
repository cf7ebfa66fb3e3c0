//! Typed errors for the quota engine. Kept as `thiserror` enums rather than
//! stringly-typed failures so callers can match on kind while still getting
//! a `Display` impl suitable for logging directly.

use thiserror::Error;

use crate::quota::rules::RuleDescription;

/// A rule that is misconfigured at construction time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("at least one quota rule must be configured")]
    NoRulesConfigured,
    #[error("disk free percent rule requires a percent in 0..=100, got {0}")]
    InvalidPercent(u8),
}

/// A `BandwidthCheckerConfiguration` that failed validation.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum BandwidthConfigError {
    #[error("multiplier must be > 0, got {0}")]
    InvalidMultiplier(f64),
    #[error("history_records must be > 0, got {0}")]
    InvalidHistoryRecords(usize),
}

/// Failures surfaced through a [`crate::quota::request::ReservationTx`] or
/// from the keeper's own public methods.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("quota unsatisfiable: {0}")]
    QuotaUnsatisfiable(String),

    #[error("eviction failed: {0}")]
    EvictionFailed(String),

    /// Defensive: the reservation was granted but a post-hoc recheck still
    /// finds it above the hard limit. Failed rather than let accounting
    /// drift unbounded.
    #[error("reservation of {size} bytes still above hard limit after being granted")]
    AboveHardLimitAfterSuccess { size: u64 },

    #[error("calibration failed for rule {rule}: {reason}")]
    CalibrationFailed { rule: RuleDescription, reason: String },

    /// An internal panic inside the reservation processor was caught and
    /// converted to a per-request failure instead of killing the consumer
    /// task.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Rule(#[from] RuleError),
}

/// Failures from [`crate::bandwidth::checker::check_bandwidth_at_interval`].
#[derive(Debug, Error)]
pub enum BandwidthError<E: std::error::Error> {
    /// Observed throughput dropped below the required minimum; the copy was
    /// canceled. Callers usually retry at a higher layer.
    #[error("copy bandwidth below {required_mb_per_s:.3} MB/s (observed {observed_bytes} bytes over {elapsed:?}, interval {interval:?})")]
    Timeout {
        required_mb_per_s: f64,
        observed_bytes: u64,
        elapsed: std::time::Duration,
        interval: std::time::Duration,
    },

    /// The outer cancellation token fired; no bandwidth verdict is issued.
    #[error("bandwidth check canceled")]
    Canceled,

    /// The copy task itself failed; its error is surfaced unchanged.
    #[error(transparent)]
    Copy(E),
}

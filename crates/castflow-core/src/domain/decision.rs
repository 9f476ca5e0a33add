//! Decision model: retry or give up after a failed attempt.
//!
//! This module defines the failure classification, the Decision type (what to
//! do next) and the Decider trait (how to determine it). Deciders are pure:
//! they do not sleep, persist or schedule anything.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, JobError};
use super::retry::RetryPolicy;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureClass {
    /// Explicit server-supplied wait hint.
    RateLimited { retry_after_seconds: u64 },

    /// Connection errors, 503s, disconnects.
    Transient { attempt: u32 },

    /// Anything else; never retried.
    Fatal,
}

impl FailureClass {
    /// Classify an error raised during attempt number `attempt`.
    pub fn classify(error: &JobError, attempt: u32) -> Self {
        match error.kind() {
            ErrorKind::RateLimited => match error.rate_limit() {
                Some(signal) => FailureClass::RateLimited {
                    retry_after_seconds: signal.retry_after_seconds,
                },
                None => FailureClass::Transient { attempt },
            },
            ErrorKind::Transient => FailureClass::Transient { attempt },
            _ => FailureClass::Fatal,
        }
    }
}

/// The next action to take for a failed job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Retry the job after a delay.
    Retry { delay: Duration, reason: String },

    /// Stop retrying; the job is marked failed with its last error.
    GiveUp { reason: String },
}

impl Decision {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Decision::Retry { delay, .. } => Some(*delay),
            Decision::GiveUp { .. } => None,
        }
    }

    pub fn is_give_up(&self) -> bool {
        matches!(self, Decision::GiveUp { .. })
    }
}

/// Timing of the attempt being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptWindow {
    /// When the job first started (retry budget anchor).
    pub started_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl AttemptWindow {
    /// Elapsed time since the first start; clock skew counts as zero.
    pub fn elapsed(&self) -> Duration {
        (self.now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Trait for deciding the next action after a failure.
///
/// Implementations must be pure functions of their inputs.
pub trait Decider: Send + Sync {
    fn decide(&self, window: AttemptWindow, failure: FailureClass) -> Decision;
}

/// Default decider: rate-limit hints and exponential backoff under a time budget.
#[derive(Debug, Clone, Default)]
pub struct BudgetDecider {
    policy: RetryPolicy,
}

impl BudgetDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for BudgetDecider {
    fn decide(&self, window: AttemptWindow, failure: FailureClass) -> Decision {
        let delay = match failure {
            FailureClass::Fatal => {
                return Decision::GiveUp {
                    reason: "non-retryable failure".to_string(),
                };
            }
            FailureClass::RateLimited {
                retry_after_seconds,
            } => Duration::from_secs(retry_after_seconds),
            FailureClass::Transient { attempt } => self.policy.backoff(attempt),
        };

        let elapsed = window.elapsed();
        if !self.policy.fits_budget(elapsed, delay) {
            return Decision::GiveUp {
                reason: format!(
                    "retry budget exhausted: {:?} left, next retry needs {:?} + {:?}",
                    self.policy.time_left(elapsed),
                    delay,
                    self.policy.safety_buffer
                ),
            };
        }

        Decision::Retry {
            delay,
            reason: match failure {
                FailureClass::RateLimited { .. } => format!("rate limited, waiting {delay:?}"),
                _ => format!("transient failure, backing off {delay:?}"),
            },
        }
    }
}

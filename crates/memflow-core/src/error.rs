//! Error taxonomy, retry policy, and the sanitized failure boundary.
//!
//! # The Error Boundary Rule
//!
//! > **No raw `anyhow::Error` ever crosses a `StreamBus` publish boundary.**
//!
//! Handlers and activities use `anyhow::Result` internally for ergonomics.
//! At the point a result is published back onto a stream, it is converted
//! through [`Categorizable`] into a [`JobFailed`] event, and the raw error is
//! logged via `tracing::error!` before sanitization — exactly the shape
//! `CommandFailed::from_error` used for the in-process event bus this crate
//! grew out of, moved to the durable stream boundary instead.

use std::borrow::Cow;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad category a failure falls into, safe to surface to callers and to
/// other machines reacting to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafeErrorCategory {
    Validation,
    NotFound,
    Unauthorized,
    RateLimited,
    Transient,
    Fatal,
    InternalError,
}

impl std::fmt::Display for SafeErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafeErrorCategory::Validation => "validation_error",
            SafeErrorCategory::NotFound => "not_found",
            SafeErrorCategory::Unauthorized => "unauthorized",
            SafeErrorCategory::RateLimited => "rate_limited",
            SafeErrorCategory::Transient => "transient_error",
            SafeErrorCategory::Fatal => "fatal_error",
            SafeErrorCategory::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Implemented by anything that can cross the stream boundary as a sanitized
/// failure. Validation/NotFound may expose detail; everything else should
/// collapse to a generic, non-leaking message.
pub trait Categorizable: std::error::Error {
    fn category(&self) -> SafeErrorCategory;
    fn safe_message(&self) -> Cow<'static, str>;
}

/// The wire-level failure codes called out by the external interface:
/// 598 fatal (bypasses retry), 597 maxed-out retries, 410 interrupted.
/// Transient failures never get a wire code of their own — they are
/// retried by the stream layer and never surfaced to `handle.result()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    Fatal = 598,
    MaxedOut = 597,
    Interrupted = 410,
}

impl FailureCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// The only error shape that crosses a `StreamBus` publish boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: String,
    pub code: i32,
    pub category: SafeErrorCategory,
    pub message: String,
}

impl JobFailed {
    pub fn from_error<E: Categorizable>(job_id: impl Into<String>, code: i32, error: &E) -> Self {
        tracing::error!(error = %error, "activity failed, sanitizing before publish");
        Self {
            job_id: job_id.into(),
            code,
            category: error.category(),
            message: error.safe_message().into_owned(),
        }
    }
}

impl std::fmt::Display for JobFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job {} failed ({}, code {}): {}",
            self.job_id, self.category, self.code, self.message
        )
    }
}

/// Crate-internal error taxonomy. `Fatal`/`MaxedOut`/`Interrupted` carry
/// the wire codes from the external interface; `Collation` and
/// `GenerationalConflict` are deliberately swallowed at the call site rather
/// than retried (see the Collator's duplicate-detection contract) — they are
/// `Error` variants so they compose with `?`, not because callers should
/// ever let them surface.
#[derive(Debug, Error)]
pub enum MemFlowError {
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bypasses retry entirely (wire code 598). Unlike the other variants,
    /// the message is surfaced to the caller verbatim rather than sanitized
    /// — a fatal activity error is expected to carry caller-meaningful
    /// detail, not leak internals.
    #[error("fatal activity error: {0}")]
    Fatal(String),

    #[error("activity exhausted its retry budget after {attempts} attempts: {message}")]
    MaxedOut { attempts: u32, message: String },

    #[error("job was interrupted")]
    Interrupted,

    #[error("collation conflict: {0}")]
    Collation(String),

    #[error("generational conflict: stored generation {stored} does not match {expected}")]
    GenerationalConflict { stored: u64, expected: u64 },

    #[error("job {0} is not active")]
    InactiveJob(String),

    #[error("no state recorded for job {0}")]
    GetState(String),

    #[error("optimistic concurrency conflict")]
    StoreConflict,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl Categorizable for MemFlowError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            MemFlowError::Transient(_) => SafeErrorCategory::Transient,
            MemFlowError::Fatal(_) => SafeErrorCategory::Fatal,
            MemFlowError::MaxedOut { .. } => SafeErrorCategory::Fatal,
            MemFlowError::Interrupted => SafeErrorCategory::Fatal,
            MemFlowError::Collation(_) => SafeErrorCategory::InternalError,
            MemFlowError::GenerationalConflict { .. } => SafeErrorCategory::InternalError,
            MemFlowError::InactiveJob(_) => SafeErrorCategory::NotFound,
            MemFlowError::GetState(_) => SafeErrorCategory::NotFound,
            MemFlowError::StoreConflict => SafeErrorCategory::Transient,
            MemFlowError::Timeout(_) => SafeErrorCategory::Transient,
            MemFlowError::Backend(_) => SafeErrorCategory::InternalError,
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            MemFlowError::Transient(m) => Cow::Owned(m.clone()),
            MemFlowError::Fatal(m) => Cow::Owned(m.clone()),
            MemFlowError::MaxedOut { message, .. } => Cow::Owned(message.clone()),
            MemFlowError::Interrupted => Cow::Borrowed("job was interrupted"),
            MemFlowError::InactiveJob(_) => Cow::Borrowed("job is not active"),
            MemFlowError::GetState(_) => Cow::Borrowed("no state recorded for job"),
            MemFlowError::StoreConflict | MemFlowError::Timeout(_) => {
                Cow::Borrowed("operation timed out, retry")
            }
            _ => Cow::Borrowed("an internal error occurred"),
        }
    }
}

impl MemFlowError {
    /// `Collation` and `GenerationalConflict` are not retried and not
    /// surfaced to the caller — the event that triggered them is simply a
    /// duplicate or stale redelivery.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            MemFlowError::Collation(_) | MemFlowError::GenerationalConflict { .. }
        )
    }

    /// Only the errors the external interface surfaces to `handle.result()`
    /// carry a wire code; transient failures are retried by the stream
    /// layer and never reach a caller directly.
    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            MemFlowError::Fatal(_) => Some(FailureCode::Fatal),
            MemFlowError::MaxedOut { .. } => Some(FailureCode::MaxedOut),
            MemFlowError::Interrupted => Some(FailureCode::Interrupted),
            _ => None,
        }
    }
}

/// Retry policy governing an activity call's backoff schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub backoff_coefficient: f64,
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            backoff_coefficient: 2.0,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts already
    /// made (1-indexed). Returns `None` once the budget is exhausted.
    pub fn next_delay(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.maximum_attempts {
            return None;
        }
        let scaled = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(attempts_made as i32);
        let capped = scaled.min(self.maximum_interval.as_secs_f64()).max(0.0);
        Some(Duration::from_secs_f64(capped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_backs_off_and_caps() {
        let policy = RetryPolicy {
            maximum_attempts: 5,
            backoff_coefficient: 2.0,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(10),
        };
        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(5), None);
    }

    #[test]
    fn silent_errors_are_not_surfaced() {
        assert!(MemFlowError::Collation("dup".into()).is_silent());
        assert!(MemFlowError::GenerationalConflict {
            stored: 1,
            expected: 2
        }
        .is_silent());
        assert!(!MemFlowError::Transient("x".into()).is_silent());
    }

    #[test]
    fn failure_codes_match_external_interface() {
        assert_eq!(MemFlowError::Transient("x".into()).failure_code(), None);
        assert_eq!(
            MemFlowError::Fatal("stop-retrying-please-hot-mess".into()).failure_code(),
            Some(FailureCode::Fatal)
        );
        assert_eq!(
            MemFlowError::MaxedOut {
                attempts: 3,
                message: "x".into()
            }
            .failure_code(),
            Some(FailureCode::MaxedOut)
        );
        assert_eq!(
            MemFlowError::Interrupted.failure_code(),
            Some(FailureCode::Interrupted)
        );
    }

    #[test]
    fn fatal_and_maxed_out_messages_are_surfaced_verbatim() {
        let fatal = MemFlowError::Fatal("stop-retrying-please-hot-mess".into());
        assert_eq!(fatal.safe_message(), "stop-retrying-please-hot-mess");

        let maxed = MemFlowError::MaxedOut {
            attempts: 2,
            message: "recurring-test-error".into(),
        };
        assert_eq!(maxed.safe_message(), "recurring-test-error");
    }

    #[test]
    fn job_failed_sanitizes_internal_errors() {
        let err = MemFlowError::Backend(anyhow::anyhow!("leaked connection string: secret"));
        let failed = JobFailed::from_error("job-1", 500, &err);
        assert_eq!(failed.message, "an internal error occurred");
        assert!(!failed.message.contains("secret"));
    }
}

//! Engine error types.
//!
//! Domain errors belong to the application. The types here are the failures the
//! engine itself produces; a workflow's error union opts into each of them with a
//! `From` impl (usually `#[from]` on a `thiserror` enum).

use std::any::Any;
use thiserror::Error;

/// An operation exceeded its deadline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} timed out after {duration_ms}ms (attempt {attempt})", .name.as_deref().unwrap_or("operation"))]
pub struct TimeoutError {
    /// The deadline that elapsed, in milliseconds.
    pub duration_ms: u64,
    /// 1-based attempt the timeout happened on; 1 outside of retries.
    pub attempt: u32,
    /// Diagnostic name from the timeout configuration.
    pub name: Option<String>,
}

/// A circuit breaker rejected the call without invoking the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit '{resource}' is open")]
pub struct CircuitOpenError {
    /// Key of the protected resource.
    pub resource: String,
}

/// A failure that escaped every categorization path.
///
/// Seeing one of these means a step is missing a bridge or the workflow body
/// misused the halt signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unexpected failure: {cause}")]
pub struct UnexpectedError {
    /// Human readable description.
    pub cause: String,
}

impl UnexpectedError {
    /// Creates a new UnexpectedError.
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// A panic captured at a bridge boundary.
///
/// Handed to the mandatory error mapper; never stored in an outcome as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panic {
    message: Option<String>,
}

impl Panic {
    /// Builds a Panic from an unwinding payload.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(s) => Some(*s),
            Err(payload) => payload.downcast_ref::<&'static str>().map(|s| s.to_string()),
        };
        Self { message }
    }

    /// The panic message, when the payload was a string.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl std::fmt::Display for Panic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "panicked: {}", message),
            None => write!(f, "panicked with a non-string payload"),
        }
    }
}

/// Invalid engine configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `max_attempts` must allow at least one attempt.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    /// The delay cap is below the starting delay.
    #[error("max_delay must be >= initial_delay")]
    DelayCapBelowInitial,

    /// A circuit breaker needs a positive threshold.
    #[error("failure_threshold must be at least 1")]
    ZeroThreshold,

    /// Half-open state must admit at least one trial call.
    #[error("half_open_max must be at least 1")]
    ZeroHalfOpenTrials,

    /// Durations that must be positive.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

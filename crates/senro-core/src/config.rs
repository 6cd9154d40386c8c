//! Resilience configuration value objects.
//!
//! Every value is supplied by the caller; the engine bakes in no defaults beyond
//! the optional flags. All types deserialize from any serde format, with
//! durations written in humantime form (`"10ms"`, `"30s"`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound of the jitter factor applied to a backoff delay.
pub const JITTER_MIN: f64 = 0.5;
/// Upper bound of the jitter factor applied to a backoff delay.
pub const JITTER_MAX: f64 = 1.5;

/// Shape of the delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay every time.
    Fixed,
    /// `initial_delay * attempt`.
    Linear,
    /// `initial_delay * 2^(attempt - 1)`.
    Exponential,
}

/// Retry configuration.
///
/// The retry-eligibility predicate is attached to the policy built from this
/// config, so the config itself stays plain data.
///
/// # Examples
///
/// ```
/// use senro_core::{BackoffKind, RetryConfig};
/// use std::time::Duration;
///
/// let config = RetryConfig::exponential(5, Duration::from_millis(100), Duration::from_secs(1));
///
/// // Delays: 100ms, 200ms, 400ms, 800ms, then capped at 1s
/// assert_eq!(config.base_delay(1), Duration::from_millis(100));
/// assert_eq!(config.base_delay(3), Duration::from_millis(400));
/// assert_eq!(config.base_delay(5), Duration::from_secs(1));
/// assert_eq!(config.backoff, BackoffKind::Exponential);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first; 1 disables retrying.
    pub max_attempts: u32,
    /// Delay shape between attempts.
    pub backoff: BackoffKind,
    /// Base delay.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Randomize each delay by a factor in `[JITTER_MIN, JITTER_MAX]`.
    #[serde(default)]
    pub jitter: bool,
}

impl RetryConfig {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Fixed,
            initial_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Linearly growing delay, capped at `max_delay`.
    pub fn linear(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Linear,
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Doubling delay, capped at `max_delay`.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Exponential,
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Checks the configuration for values that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::DelayCapBelowInitial);
        }
        Ok(())
    }

    /// Delay to sleep after the given failed attempt, before jitter.
    ///
    /// `attempt` is 1-based. Arithmetic overflow saturates to `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffKind::Fixed => Some(self.initial_delay),
            BackoffKind::Linear => self.initial_delay.checked_mul(attempt),
            BackoffKind::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.initial_delay.checked_mul(factor)),
        };
        delay.map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Deadline for a single operation invocation.
///
/// # Examples
///
/// ```
/// use senro_core::TimeoutConfig;
///
/// let config = TimeoutConfig::from_millis(50).named("fetch_orders");
/// assert_eq!(config.duration_ms(), 50);
/// assert!(config.propagate_cancellation);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Wall-clock budget for the operation.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Signal cancellation to the operation when the deadline elapses.
    #[serde(default = "default_propagate_cancellation")]
    pub propagate_cancellation: bool,
    /// Diagnostic name carried into timeout errors and events.
    #[serde(default)]
    pub name: Option<String>,
}

impl TimeoutConfig {
    /// Creates a config with the given deadline.
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            propagate_cancellation: true,
            name: None,
        }
    }

    /// Creates a config with a deadline in milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Sets the diagnostic name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets whether cancellation is signalled at the deadline.
    pub fn with_cancellation(mut self, propagate: bool) -> Self {
        self.propagate_cancellation = propagate;
        self
    }

    /// The deadline in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.deadline.as_millis()).unwrap_or(u64::MAX)
    }

    /// Checks the configuration for values that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deadline.is_zero() {
            return Err(ConfigError::ZeroDuration("deadline"));
        }
        Ok(())
    }
}

fn default_propagate_cancellation() -> bool {
    true
}

/// What a success does to the failures recorded while closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessStrategy {
    /// Forget every recorded failure.
    #[default]
    Reset,
    /// Forget the oldest recorded failure.
    Decrement,
}

/// Circuit breaker configuration for one protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the circuit.
    pub failure_threshold: u32,
    /// Sliding window failures are counted in.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Cooldown before an open circuit admits trial calls.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max: u32,
    /// Effect of a success while closed.
    #[serde(default)]
    pub success_strategy: SuccessStrategy,
}

impl CircuitBreakerConfig {
    /// Creates a config; successes reset the failure count.
    pub fn new(
        failure_threshold: u32,
        window: Duration,
        reset_timeout: Duration,
        half_open_max: u32,
    ) -> Self {
        Self {
            failure_threshold,
            window,
            reset_timeout,
            half_open_max,
            success_strategy: SuccessStrategy::Reset,
        }
    }

    /// Sets the success strategy.
    pub fn with_success_strategy(mut self, strategy: SuccessStrategy) -> Self {
        self.success_strategy = strategy;
        self
    }

    /// Checks the configuration for values that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.half_open_max == 0 {
            return Err(ConfigError::ZeroHalfOpenTrials);
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroDuration("window"));
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("reset_timeout"));
        }
        Ok(())
    }
}

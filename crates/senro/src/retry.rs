//! Retry with backoff and jitter.
//!
//! Only retry operations that are idempotent, read-only, or protected by a
//! caller-supplied idempotency token. The policy cannot tell the difference;
//! retrying a non-idempotent write repeats its side effect.

use crate::sink::TracingSink;
use crate::millis;
use rand::Rng;
use senro_core::{
    AttemptOutcome, ConfigError, EventSink, Outcome, RetryConfig, StepAttempt, StepName,
    WorkflowEvent, JITTER_MAX, JITTER_MIN,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Re-invokes a failing operation according to a [`RetryConfig`].
///
/// Every failure is retryable unless a predicate is set with
/// [`retry_on`](Self::retry_on). Put circuit breakers below the policy and
/// exclude [`CircuitOpenError`](senro_core::CircuitOpenError) in the predicate
/// so an open circuit fails fast.
///
/// # Examples
///
/// ```
/// use senro::{RetryConfig, RetryPolicy};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let calls = AtomicU32::new(0);
/// let policy = RetryPolicy::new(RetryConfig::fixed(3, Duration::from_millis(1)));
///
/// let outcome: Result<u32, &str> = policy
///     .run(|| async {
///         match calls.fetch_add(1, Ordering::SeqCst) {
///             0 => Err("flaky"),
///             n => Ok(n),
///         }
///     })
///     .await;
///
/// assert_eq!(outcome, Ok(1));
/// assert_eq!(calls.load(Ordering::SeqCst), 2);
/// # });
/// ```
pub struct RetryPolicy<E> {
    config: RetryConfig,
    retry_on: Option<RetryPredicate<E>>,
    label: StepName,
    sink: Option<Arc<dyn EventSink>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            retry_on: self.retry_on.clone(),
            label: self.label.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("label", &self.label)
            .field("has_predicate", &self.retry_on.is_some())
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    /// Creates a policy that retries every failure.
    ///
    /// A `max_attempts` of 0 behaves like 1; use [`try_new`](Self::try_new) to
    /// reject it instead.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_on: None,
            label: StepName::new("operation"),
            sink: None,
        }
    }

    /// Creates a policy after validating the config.
    pub fn try_new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Only retry failures for which `predicate` returns `true`.
    pub fn retry_on<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Sets the name used in events and logs.
    pub fn named(mut self, label: impl Into<StepName>) -> Self {
        self.label = label.into();
        self
    }

    /// Sends retry events to `sink` instead of the tracing sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns `true` if `error` may be retried.
    pub fn is_retryable(&self, error: &E) -> bool {
        self.retry_on.as_ref().map_or(true, |predicate| predicate(error))
    }

    /// Delay to sleep after the given failed attempt, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.config.base_delay(attempt);
        if self.config.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Labels and routes events for a run inside a workflow, keeping any sink
    /// set explicitly.
    pub(crate) fn scoped(&self, label: StepName, sink: &Arc<dyn EventSink>) -> Self {
        let mut scoped = self.clone();
        scoped.label = label;
        if scoped.sink.is_none() {
            scoped.sink = Some(Arc::clone(sink));
        }
        scoped
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        self.drive(|_| operation(), |_| {}, |_| false).await
    }

    /// Like [`run`](Self::run), passing the 1-based attempt number to each
    /// invocation.
    pub async fn run_with_attempt<T, F, Fut>(&self, operation: F) -> Outcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        self.drive(operation, |_| {}, |_| false).await
    }

    /// Like [`run_with_attempt`](Self::run_with_attempt); a failure for which
    /// `stop` returns `true` ends the run at once, whatever the predicate says.
    pub(crate) async fn run_until<T, F, Fut, S>(&self, operation: F, stop: S) -> Outcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        S: Fn(&E) -> bool,
    {
        self.drive(operation, |_| {}, stop).await
    }

    /// Like [`run`](Self::run), also returning a record of every attempt.
    pub async fn run_with_history<T, F, Fut>(
        &self,
        mut operation: F,
    ) -> (Outcome<T, E>, Vec<StepAttempt>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        E: fmt::Display,
    {
        let mut history = Vec::new();
        let outcome = self
            .drive(
                |_| operation(),
                |report| history.push(report.into_attempt()),
                |_| false,
            )
            .await;
        (outcome, history)
    }

    async fn drive<T, F, Fut, R, S>(
        &self,
        mut operation: F,
        mut record: R,
        stop: S,
    ) -> Outcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        R: FnMut(AttemptReport<'_, E>),
        S: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let started_at = Instant::now();
            let outcome = operation(attempt).await;
            let elapsed = started_at.elapsed();

            let error = match outcome {
                Ok(value) => {
                    record(AttemptReport {
                        attempt,
                        started_at,
                        elapsed,
                        delay_before_next: None,
                        error: None,
                    });
                    if attempt > 1 {
                        debug!(step = %self.label, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = if stop(&error) {
                debug!(step = %self.label, attempt, "Failure ends the run; not retrying");
                None
            } else if !self.is_retryable(&error) {
                debug!(step = %self.label, attempt, "Failure is not retryable");
                None
            } else if attempt >= max_attempts {
                self.emit(WorkflowEvent::RetriesExhausted {
                    step: self.label.to_string(),
                    attempts: attempt,
                });
                None
            } else {
                Some(self.delay_for(attempt))
            };

            record(AttemptReport {
                attempt,
                started_at,
                elapsed,
                delay_before_next: delay,
                error: Some(&error),
            });

            let Some(delay) = delay else {
                return Err(error);
            };

            self.emit(WorkflowEvent::StepRetry {
                step: self.label.to_string(),
                attempt,
                delay_ms: millis(delay),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        match &self.sink {
            Some(sink) => sink.emit(event),
            None => TracingSink.emit(event),
        }
    }
}

struct AttemptReport<'a, E> {
    attempt: u32,
    started_at: Instant,
    elapsed: Duration,
    delay_before_next: Option<Duration>,
    error: Option<&'a E>,
}

impl<E: fmt::Display> AttemptReport<'_, E> {
    fn into_attempt(self) -> StepAttempt {
        StepAttempt {
            attempt: self.attempt,
            started_at: self.started_at.into_std(),
            elapsed: self.elapsed,
            delay_before_next: self.delay_before_next,
            outcome: match self.error {
                Some(error) => AttemptOutcome::Failed(error.to_string()),
                None => AttemptOutcome::Succeeded,
            },
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

//! Circuit breaker for protecting a failing dependency.
//!
//! # States
//! - Closed: calls pass through, failures are counted in a sliding window
//! - Open: calls are rejected without invoking the operation
//! - Half-Open: a bounded number of trial calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within window >= failure_threshold
//! Open → Half-Open: reset_timeout elapsed (checked on the next access)
//! Half-Open → Closed: half_open_max trial calls all succeeded
//! Half-Open → Open: any trial call failed (cooldown restarts)
//! ```
//!
//! All state for one resource sits behind a single mutex that is never held
//! across an await.

use crate::sink::TracingSink;
use dashmap::DashMap;
use senro_core::{
    CircuitBreakerConfig, CircuitOpenError, ConfigError, EventSink, Outcome, SuccessStrategy,
    WorkflowEvent,
};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::debug;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls are admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    // Bumped on every transition; results from older permits are ignored.
    generation: u64,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trials_admitted: u32,
    trial_successes: u32,
}

struct Shared {
    resource: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    sink: Arc<dyn EventSink>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        st: &mut BreakerState,
        to: CircuitState,
        events: &mut Vec<WorkflowEvent>,
    ) {
        let failures = u32::try_from(st.failures.len()).unwrap_or(u32::MAX);
        st.state = to;
        st.generation += 1;
        st.trials_admitted = 0;
        st.trial_successes = 0;
        let resource = self.resource.clone();
        match to {
            CircuitState::Open => {
                st.opened_at = Some(Instant::now());
                st.failures.clear();
                events.push(WorkflowEvent::CircuitOpened {
                    resource,
                    failures: failures.max(1),
                });
            }
            CircuitState::HalfOpen => {
                events.push(WorkflowEvent::CircuitHalfOpen { resource });
            }
            CircuitState::Closed => {
                st.opened_at = None;
                st.failures.clear();
                events.push(WorkflowEvent::CircuitClosed { resource });
            }
        }
    }

    fn poll_cooldown(&self, st: &mut BreakerState, events: &mut Vec<WorkflowEvent>) {
        if st.state != CircuitState::Open {
            return;
        }
        let cooled = st
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);
        if cooled {
            self.transition(st, CircuitState::HalfOpen, events);
        }
    }

    fn acquire(&self) -> Option<u64> {
        let mut events = Vec::new();
        let admitted = {
            let mut st = self.lock();
            self.poll_cooldown(&mut st, &mut events);
            match st.state {
                CircuitState::Closed => Some(st.generation),
                CircuitState::Open => None,
                CircuitState::HalfOpen if st.trials_admitted < self.config.half_open_max => {
                    st.trials_admitted += 1;
                    Some(st.generation)
                }
                CircuitState::HalfOpen => None,
            }
        };
        self.publish(events);
        admitted
    }

    fn record(&self, generation: u64, success: bool) {
        let mut events = Vec::new();
        {
            let mut st = self.lock();
            if st.generation != generation {
                debug!(resource = %self.resource, "Ignoring result from a previous circuit state");
                return;
            }
            match (st.state, success) {
                (CircuitState::Closed, true) => match self.config.success_strategy {
                    SuccessStrategy::Reset => st.failures.clear(),
                    SuccessStrategy::Decrement => {
                        st.failures.pop_front();
                    }
                },
                (CircuitState::Closed, false) => {
                    let now = Instant::now();
                    let window = self.config.window;
                    st.failures.retain(|at| now.saturating_duration_since(*at) < window);
                    st.failures.push_back(now);
                    if st.failures.len() >= self.config.failure_threshold as usize {
                        self.transition(&mut st, CircuitState::Open, &mut events);
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    st.trial_successes += 1;
                    if st.trial_successes >= self.config.half_open_max {
                        self.transition(&mut st, CircuitState::Closed, &mut events);
                    }
                }
                (CircuitState::HalfOpen, false) => {
                    self.transition(&mut st, CircuitState::Open, &mut events);
                }
                // Open admits nothing, so no permit of this generation exists.
                (CircuitState::Open, _) => {}
            }
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }
}

/// A shared gate in front of one protected resource.
///
/// Cloning is cheap and every clone observes the same state.
///
/// # Examples
///
/// ```
/// use senro::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use std::error::Error;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let breaker = CircuitBreaker::new(
///     "payment-provider",
///     CircuitBreakerConfig::new(1, Duration::from_secs(60), Duration::from_secs(30), 1),
/// );
///
/// let first: Result<(), Box<dyn Error>> = breaker
///     .call(|| async { Err("connection refused".into()) })
///     .await;
/// assert_eq!(first.unwrap_err().to_string(), "connection refused");
/// assert_eq!(breaker.state(), CircuitState::Open);
///
/// // Rejected without calling the provider.
/// let second: Result<(), Box<dyn Error>> = breaker.call(|| async { Ok(()) }).await;
/// assert_eq!(second.unwrap_err().to_string(), "circuit 'payment-provider' is open");
/// # });
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("resource", &self.inner.resource)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker reporting to the tracing sink.
    pub fn new(resource: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_sink(resource, config, Arc::new(TracingSink))
    }

    /// Creates a closed breaker reporting to `sink`.
    pub fn with_sink(
        resource: impl Into<String>,
        config: CircuitBreakerConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                resource: resource.into(),
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    generation: 0,
                    failures: VecDeque::new(),
                    opened_at: None,
                    trials_admitted: 0,
                    trial_successes: 0,
                }),
                sink,
            }),
        }
    }

    /// Creates a breaker after validating the config.
    pub fn try_new(
        resource: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(resource, config))
    }

    /// Key of the protected resource.
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state, after applying an elapsed cooldown.
    pub fn state(&self) -> CircuitState {
        let mut events = Vec::new();
        let state = {
            let mut st = self.inner.lock();
            self.inner.poll_cooldown(&mut st, &mut events);
            st.state
        };
        self.inner.publish(events);
        state
    }

    /// Asks to make one call.
    ///
    /// The returned permit must be settled with [`Permit::success`] or
    /// [`Permit::failure`]; dropping it unsettled counts as a failure.
    pub fn try_acquire(&self) -> Result<Permit, CircuitOpenError> {
        match self.inner.acquire() {
            Some(generation) => Ok(Permit {
                breaker: Arc::clone(&self.inner),
                generation,
                settled: false,
            }),
            None => Err(CircuitOpenError {
                resource: self.inner.resource.clone(),
            }),
        }
    }

    /// Invokes `operation` if the circuit admits it; every failure counts.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.call_with(operation, |_| true).await
    }

    /// Invokes `operation` if the circuit admits it; only failures for which
    /// `is_failure` returns `true` count against the circuit, others count as
    /// successes.
    pub async fn call_with<T, E, F, Fut, C>(&self, operation: F, is_failure: C) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        E: From<CircuitOpenError>,
        C: FnOnce(&E) -> bool,
    {
        let permit = self.try_acquire()?;
        let outcome = operation().await;
        match &outcome {
            Err(error) if is_failure(error) => permit.failure(),
            _ => permit.success(),
        }
        outcome
    }
}

/// Admission for one call through a [`CircuitBreaker`].
#[must_use = "an unsettled permit counts as a failure when dropped"]
pub struct Permit {
    breaker: Arc<Shared>,
    generation: u64,
    settled: bool,
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("resource", &self.breaker.resource)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Permit {
    /// Reports that the call succeeded.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, true);
    }

    /// Reports that the call failed.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, false);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.generation, false);
        }
    }
}

/// Process-lifetime map from resource key to its breaker.
///
/// Owned by the application and passed where needed.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("resources", &self.len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Breakers created by this registry report to `sink`.
    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self {
            breakers: Arc::default(),
            sink: Some(sink),
        }
    }

    /// Returns the breaker for `resource`, creating it with `config` on first use.
    ///
    /// Later calls return the existing breaker and ignore `config`.
    pub fn get_or_insert(&self, resource: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| match &self.sink {
                Some(sink) => CircuitBreaker::with_sink(resource, config, Arc::clone(sink)),
                None => CircuitBreaker::new(resource, config),
            })
            .clone()
    }

    /// Returns the breaker for `resource` if one exists.
    pub fn get(&self, resource: &str) -> Option<CircuitBreaker> {
        self.breakers.get(resource).map(|entry| entry.value().clone())
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns `true` if no resource is registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

//! Workflow engine for executing steps.
//!
//! A workflow body is an async block that calls steps through its
//! [`WorkflowContext`]. Each step yields its success value directly; a failure
//! halts the workflow, and `?` carries the [`Halt`] signal back to
//! [`Workflow::run`], which turns it into the workflow's single [`Outcome`].

use crate::circuit::CircuitBreaker;
use crate::retry::RetryPolicy;
use crate::sink::TracingSink;
use crate::timeout::TimeoutGuard;
use crate::{bridge, millis};
use futures::FutureExt;
use senro_core::{
    CircuitOpenError, EventSink, Outcome, Panic, Step, StepName, TimeoutConfig, TimeoutError,
    UnexpectedError, WorkflowEvent,
};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A named, reusable workflow runner.
///
/// # Examples
///
/// ```
/// use senro::prelude::*;
///
/// #[derive(Debug, thiserror::Error)]
/// enum SignupError {
///     #[error("email taken")]
///     EmailTaken,
///     #[error(transparent)]
///     Unexpected(#[from] UnexpectedError),
/// }
///
/// async fn reserve_email(email: &str) -> Result<String, SignupError> {
///     if email == "taken@example.com" {
///         Err(SignupError::EmailTaken)
///     } else {
///         Ok(email.to_string())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let workflow = Workflow::new("signup");
///
/// let outcome: Outcome<String, SignupError> = workflow
///     .run(|ctx| async move {
///         let email = ctx.step("reserve_email", || reserve_email("new@example.com")).await?;
///         Ok(format!("welcome {}", email))
///     })
///     .await;
/// assert_eq!(outcome.unwrap(), "welcome new@example.com");
///
/// let outcome: Outcome<String, SignupError> = workflow
///     .run(|ctx| async move {
///         ctx.step("reserve_email", || reserve_email("taken@example.com")).await
///     })
///     .await;
/// assert!(matches!(outcome, Err(SignupError::EmailTaken)));
/// # });
/// ```
#[derive(Clone)]
pub struct Workflow {
    name: Arc<str>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .finish()
    }
}

impl Workflow {
    /// Creates a workflow reporting to the tracing sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            sink: Arc::new(TracingSink),
        }
    }

    /// Sends every event of this workflow's runs to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes `body` with a fresh context and returns its single outcome.
    ///
    /// `E` is the workflow's error union. Every step converts its own error into
    /// `E`; failures that escape categorization become [`UnexpectedError`]:
    ///
    /// - a panic raised by the body outside of a bridge,
    /// - a body that swallowed a [`Halt`] and still returned a success.
    pub async fn run<T, E, F, Fut>(&self, body: F) -> Outcome<T, E>
    where
        F: FnOnce(WorkflowContext<E>) -> Fut,
        Fut: Future<Output = Result<T, Halt<E>>>,
        E: From<UnexpectedError> + fmt::Display,
    {
        let state = Arc::new(ExecutionState::default());
        let ctx = WorkflowContext {
            workflow: Arc::clone(&self.name),
            state: Arc::clone(&state),
            sink: Arc::clone(&self.sink),
            started_at: Instant::now(),
            _error: PhantomData,
        };
        let started_at = ctx.started_at;

        debug!(workflow = %self.name, "Workflow started");
        let result = AssertUnwindSafe(async move { body(ctx).await })
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(_)) if state.is_halted() => Err(E::from(UnexpectedError::new(
                "workflow body returned a success after a step halted it",
            ))),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(halt)) => Err(halt.error),
            Err(payload) => Err(E::from(UnexpectedError::new(format!(
                "workflow body {}",
                Panic::from_payload(payload)
            )))),
        };

        let steps = state.steps();
        match &outcome {
            Ok(_) => self.sink.emit(WorkflowEvent::WorkflowCompleted {
                workflow: self.name.to_string(),
                steps,
                elapsed_ms: millis(started_at.elapsed()),
            }),
            Err(error) => self.sink.emit(WorkflowEvent::WorkflowHalted {
                workflow: self.name.to_string(),
                steps,
                error: error.to_string(),
            }),
        }
        outcome
    }
}

/// Signal that a step failed and the workflow must stop.
///
/// Only a [`WorkflowContext`] creates one. Propagate it with `?`; the
/// executor unwraps it into the workflow's failure.
#[must_use = "a halted workflow must return its Halt"]
pub struct Halt<E> {
    error: E,
}

impl<E> Halt<E> {
    /// The failure that halted the workflow.
    pub fn error(&self) -> &E {
        &self.error
    }
}

impl<E: fmt::Debug> fmt::Debug for Halt<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Halt").field("error", &self.error).finish()
    }
}

#[derive(Debug, Default)]
struct ExecutionState {
    next_index: AtomicUsize,
    halted: AtomicBool,
}

impl ExecutionState {
    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn steps(&self) -> usize {
        self.next_index.load(Ordering::SeqCst)
    }
}

/// Per-execution handle passed to a workflow body.
///
/// Steps run in the order the body calls them. Once a step fails the context is
/// halted: later step calls return a [`Halt`] without invoking their operation.
///
/// The `E: From<...>` bound on each method is where the error union is checked:
/// a step whose error `E` cannot absorb does not compile.
pub struct WorkflowContext<E> {
    workflow: Arc<str>,
    state: Arc<ExecutionState>,
    sink: Arc<dyn EventSink>,
    started_at: Instant,
    _error: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for WorkflowContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow", &self.workflow)
            .field("step_index", &self.step_index())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl<E> WorkflowContext<E> {
    /// Returns the workflow name.
    pub fn workflow_name(&self) -> &str {
        &self.workflow
    }

    /// Number of steps begun so far.
    pub fn step_index(&self) -> usize {
        self.state.steps()
    }

    /// Returns `true` once a step has failed.
    pub fn is_halted(&self) -> bool {
        self.state.is_halted()
    }

    /// Time since the workflow started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// The sink this execution reports to, for primitives used directly.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }
}

impl<E> WorkflowContext<E>
where
    E: From<UnexpectedError> + fmt::Display,
{
    /// Runs `operation` as the next step.
    ///
    /// Returns the success value; on failure halts the workflow.
    pub async fn step<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
        E: From<SE>,
    {
        let name = name.into();
        let index = self.begin(&name)?;
        let started_at = Instant::now();
        match operation().await {
            Ok(value) => {
                self.succeeded(&name, index, started_at);
                Ok(value)
            }
            Err(error) => Err(self.halt(&name, index, E::from(error))),
        }
    }

    /// Runs a reusable [`Step`] as the next step.
    pub async fn run<S>(&self, step: &S) -> Result<S::Output, Halt<E>>
    where
        S: Step + ?Sized,
        E: From<S::Error>,
    {
        self.step(step.name(), || step.execute()).await
    }

    /// Runs `operation` as the next step without halting on failure.
    ///
    /// The step's own outcome is handed back so the body can decide how to
    /// recover. The outer `Err` only occurs when the workflow is already halted.
    pub async fn attempt<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        operation: F,
    ) -> Result<Outcome<T, SE>, Halt<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
    {
        let name = name.into();
        let index = self.begin(&name)?;
        let started_at = Instant::now();
        let outcome = operation().await;
        match &outcome {
            Ok(_) => self.succeeded(&name, index, started_at),
            Err(_) => debug!(
                workflow = %self.workflow,
                step = %name,
                index,
                "Step failed; outcome returned for recovery"
            ),
        }
        Ok(outcome)
    }

    /// Halts the workflow with a failure decided by the body itself.
    pub fn fail<SE>(&self, name: impl Into<StepName>, error: SE) -> Halt<E>
    where
        E: From<SE>,
    {
        let name = name.into();
        let index = self.state.next_index.fetch_add(1, Ordering::SeqCst);
        self.halt(&name, index, E::from(error))
    }

    /// Runs a possibly panicking operation as the next step.
    ///
    /// A panic is mapped by `error_mapper`; it never reaches the caller.
    pub async fn bridge<T, SE, F, Fut, M>(
        &self,
        name: impl Into<StepName>,
        operation: F,
        error_mapper: M,
    ) -> Result<T, Halt<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        M: FnOnce(Panic) -> SE,
        E: From<SE>,
    {
        self.step(name, || bridge::bridge(operation, error_mapper))
            .await
    }

    /// Runs `operation` as the next step, retrying per `policy`.
    ///
    /// `operation` must be idempotent; see [`RetryPolicy`].
    pub async fn retry<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        policy: &RetryPolicy<SE>,
        operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
        E: From<SE>,
    {
        let name = name.into();
        let policy = policy.scoped(name.clone(), &self.sink);
        self.step(name, || async move { policy.run(operation).await })
            .await
    }

    /// Runs `operation` as the next step under a deadline.
    ///
    /// On expiry the operation future is dropped and the step fails with a
    /// [`TimeoutError`].
    pub async fn with_timeout<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        config: &TimeoutConfig,
        operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
        E: From<SE> + From<TimeoutError>,
    {
        let name = name.into();
        let guard = self.guard(&name, config, 1);
        self.step(name, || async move {
            guard
                .run(async move { operation().await.map_err(E::from) })
                .await
        })
        .await
    }

    /// Runs `operation` on its own task as the next step under a deadline.
    ///
    /// See [`TimeoutGuard::run_detached`] for what happens to the abandoned
    /// operation.
    pub async fn with_timeout_detached<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        config: &TimeoutConfig,
        operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T, SE>> + Send + 'static,
        T: Send + 'static,
        SE: Send + 'static,
        E: From<SE> + From<TimeoutError> + Send + 'static,
    {
        let name = name.into();
        let guard = self.guard(&name, config, 1);
        self.step(name, || async move {
            guard
                .run_detached(|token| {
                    let work = operation(token);
                    async move { work.await.map_err(E::from) }
                })
                .await
        })
        .await
    }

    /// Runs `operation` as the next step, bounding each attempt by `timeout`
    /// and retrying per `policy`.
    ///
    /// The policy sees failures already converted into the workflow's error
    /// union, so it can tell timeouts from domain errors.
    pub async fn retry_with_timeout<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        policy: &RetryPolicy<E>,
        timeout: &TimeoutConfig,
        mut operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
        E: From<SE> + From<TimeoutError>,
    {
        let name = name.into();
        let policy = policy.scoped(name.clone(), &self.sink);
        let timeout = self.timeout_config(&name, timeout);
        let sink = Arc::clone(&self.sink);
        self.step(name, || async move {
            policy
                .run_with_attempt(|attempt| {
                    let guard = TimeoutGuard::new(timeout.clone())
                        .for_attempt(attempt)
                        .with_sink(Arc::clone(&sink));
                    let work = operation();
                    async move { guard.run(async move { work.await.map_err(E::from) }).await }
                })
                .await
        })
        .await
    }

    /// Runs `operation` as the next step behind `breaker`.
    ///
    /// An open circuit fails the step with a [`CircuitOpenError`] without
    /// invoking the operation.
    pub async fn guarded<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        breaker: &CircuitBreaker,
        operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
        E: From<SE> + From<CircuitOpenError>,
    {
        self.step(name, || {
            breaker.call(|| async move { operation().await.map_err(E::from) })
        })
        .await
    }

    /// Runs `operation` as the next step behind `breaker`, retrying per
    /// `policy`.
    ///
    /// The breaker sits below the policy: each attempt asks it for a permit,
    /// and a rejected attempt ends the step with a [`CircuitOpenError`] at once,
    /// whatever the policy's predicate says.
    pub async fn retry_guarded<T, SE, F, Fut>(
        &self,
        name: impl Into<StepName>,
        policy: &RetryPolicy<E>,
        breaker: &CircuitBreaker,
        mut operation: F,
    ) -> Result<T, Halt<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, SE>>,
        E: From<SE> + From<CircuitOpenError>,
    {
        let name = name.into();
        let policy = policy.scoped(name.clone(), &self.sink);
        self.step(name, || async move {
            let rejected = AtomicBool::new(false);
            policy
                .run_until(
                    |_| {
                        let admitted = breaker.try_acquire().map(|permit| (permit, operation()));
                        let rejected = &rejected;
                        async move {
                            match admitted {
                                Ok((permit, work)) => {
                                    let outcome = work.await.map_err(E::from);
                                    if outcome.is_ok() {
                                        permit.success();
                                    } else {
                                        permit.failure();
                                    }
                                    outcome
                                }
                                Err(open) => {
                                    rejected.store(true, Ordering::SeqCst);
                                    Err(E::from(open))
                                }
                            }
                        }
                    },
                    |_| rejected.load(Ordering::SeqCst),
                )
                .await
        })
        .await
    }

    fn begin(&self, name: &StepName) -> Result<usize, Halt<E>> {
        let index = self.state.next_index.fetch_add(1, Ordering::SeqCst);
        if self.is_halted() {
            warn!(
                workflow = %self.workflow,
                step = %name,
                "Step called after the workflow halted; not invoked"
            );
            return Err(Halt {
                error: E::from(UnexpectedError::new(format!(
                    "step '{}' called after the workflow halted",
                    name
                ))),
            });
        }
        self.sink.emit(WorkflowEvent::StepStarted {
            workflow: self.workflow.to_string(),
            step: name.to_string(),
            index,
        });
        Ok(index)
    }

    fn succeeded(&self, name: &StepName, index: usize, started_at: Instant) {
        self.sink.emit(WorkflowEvent::StepSucceeded {
            workflow: self.workflow.to_string(),
            step: name.to_string(),
            index,
            elapsed_ms: millis(started_at.elapsed()),
        });
    }

    fn halt(&self, name: &StepName, index: usize, error: E) -> Halt<E> {
        self.state.halted.store(true, Ordering::SeqCst);
        self.sink.emit(WorkflowEvent::StepFailed {
            workflow: self.workflow.to_string(),
            step: name.to_string(),
            index,
            error: error.to_string(),
        });
        Halt { error }
    }

    fn timeout_config(&self, name: &StepName, config: &TimeoutConfig) -> TimeoutConfig {
        let mut config = config.clone();
        if config.name.is_none() {
            config.name = Some(name.to_string());
        }
        config
    }

    fn guard(&self, name: &StepName, config: &TimeoutConfig, attempt: u32) -> TimeoutGuard {
        TimeoutGuard::new(self.timeout_config(name, config))
            .for_attempt(attempt)
            .with_sink(Arc::clone(&self.sink))
    }
}

//! Deadlines for single operation invocations.
//!
//! # Known limitation
//!
//! A guarded operation that is still running at its deadline is abandoned, not
//! rolled back. With [`TimeoutGuard::run`] the future is dropped, so it stops at
//! its current await point, but work it already handed to another task or
//! service carries on. With [`TimeoutGuard::run_detached`] the operation keeps
//! running on its own task until it observes its cancellation token or
//! finishes; a result that arrives late is discarded and reported as a
//! `late_completion` event. No compensating action is taken for side effects
//! of late work.

use crate::sink::TracingSink;
use futures::FutureExt;
use senro_core::{
    EventSink, Outcome, Panic, TimeoutConfig, TimeoutError, UnexpectedError, WorkflowEvent,
};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Report<T, E> = Result<thread::Result<Outcome<T, E>>, oneshot::error::RecvError>;

/// Races an operation against a deadline.
///
/// # Examples
///
/// ```
/// use senro::{TimeoutConfig, TimeoutError, TimeoutGuard};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let guard = TimeoutGuard::new(TimeoutConfig::from_millis(20));
///
/// let outcome: Result<(), TimeoutError> = guard
///     .run(async {
///         tokio::time::sleep(Duration::from_secs(5)).await;
///         Ok(())
///     })
///     .await;
///
/// assert_eq!(outcome.unwrap_err().duration_ms, 20);
/// # });
/// ```
#[derive(Clone)]
pub struct TimeoutGuard {
    config: TimeoutConfig,
    attempt: u32,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TimeoutGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("config", &self.config)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl TimeoutGuard {
    /// Creates a guard reporting to the tracing sink.
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            attempt: 1,
            sink: Arc::new(TracingSink),
        }
    }

    /// Records `attempt` in timeout errors raised by this guard.
    pub fn for_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Sends timeout events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Runs `operation`, dropping it if the deadline elapses first.
    ///
    /// Dropping the future is how cancellation reaches it; the operation's own
    /// outcome passes through unchanged when it finishes in time.
    pub async fn run<T, E, Fut>(&self, operation: Fut) -> Outcome<T, E>
    where
        Fut: Future<Output = Outcome<T, E>>,
        E: From<TimeoutError>,
    {
        match tokio::time::timeout(self.config.deadline, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.expired().into()),
        }
    }

    /// Runs `operation` on its own task and stops waiting at the deadline.
    ///
    /// The operation receives a [`CancellationToken`] that is cancelled at the
    /// deadline when `propagate_cancellation` is set. The guard returns the
    /// timeout failure immediately without waiting for the task to stop. A
    /// panic inside the operation, or a task dropped before it reports, fails
    /// with an [`UnexpectedError`].
    pub async fn run_detached<T, E, F, Fut>(&self, operation: F) -> Outcome<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TimeoutError> + From<UnexpectedError> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let work = operation(token.clone());

        let sink = Arc::clone(&self.sink);
        let step = self.label().to_string();
        let observer = token.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(work).catch_unwind().await;
            if let Err(late) = tx.send(result) {
                sink.emit(WorkflowEvent::LateCompletion {
                    step,
                    succeeded: matches!(late, Ok(Ok(_))),
                    cancelled: observer.is_cancelled(),
                });
            }
        });

        let received = tokio::time::timeout(self.config.deadline, rx).await;
        match received {
            Ok(report) => self.settle(report),
            Err(_) => {
                if self.config.propagate_cancellation {
                    token.cancel();
                } else {
                    debug!(step = self.label(), "Deadline elapsed; leaving operation running");
                }
                Err(self.expired().into())
            }
        }
    }

    fn settle<T, E>(&self, report: Report<T, E>) -> Outcome<T, E>
    where
        E: From<UnexpectedError>,
    {
        match report {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(payload)) => Err(E::from(UnexpectedError::new(format!(
                "step '{}' {}",
                self.label(),
                Panic::from_payload(payload)
            )))),
            // The runtime dropped the task before it reported.
            Err(_) => Err(E::from(UnexpectedError::new(format!(
                "step '{}' was dropped before it reported a result",
                self.label()
            )))),
        }
    }

    fn label(&self) -> &str {
        self.config.name.as_deref().unwrap_or("operation")
    }

    fn expired(&self) -> TimeoutError {
        let duration_ms = self.config.duration_ms();
        self.sink.emit(WorkflowEvent::StepTimeout {
            step: self.label().to_string(),
            duration_ms,
            attempt: self.attempt,
        });
        TimeoutError {
            duration_ms,
            attempt: self.attempt,
            name: self.config.name.clone(),
        }
    }
}

/// Runs `operation` under a deadline with the default tracing sink.
pub async fn with_timeout<T, E, Fut>(operation: Fut, config: &TimeoutConfig) -> Outcome<T, E>
where
    Fut: Future<Output = Outcome<T, E>>,
    E: From<TimeoutError>,
{
    TimeoutGuard::new(config.clone()).run(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use senro_core::MemorySink;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum LookupError {
        Missing,
        Timeout(TimeoutError),
        Unexpected(String),
    }

    impl From<TimeoutError> for LookupError {
        fn from(e: TimeoutError) -> Self {
            LookupError::Timeout(e)
        }
    }

    impl From<UnexpectedError> for LookupError {
        fn from(e: UnexpectedError) -> Self {
            LookupError::Unexpected(e.cause)
        }
    }

    async fn lookup(delay: Duration, result: Outcome<u32, LookupError>) -> Outcome<u32, LookupError> {
        tokio::time::sleep(delay).await;
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_outcome_passes_through() {
        let guard = TimeoutGuard::new(TimeoutConfig::from_millis(50));

        let ok = guard.run(lookup(Duration::from_millis(10), Ok(4))).await;
        assert_eq!(ok, Ok(4));

        let err = guard
            .run(lookup(Duration::from_millis(10), Err(LookupError::Missing)))
            .await;
        assert_eq!(err, Err(LookupError::Missing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let sink = Arc::new(MemorySink::new());
        let guard = TimeoutGuard::new(TimeoutConfig::from_millis(50).named("lookup"))
            .for_attempt(2)
            .with_sink(sink.clone());

        let outcome = guard.run(lookup(Duration::from_millis(200), Ok(4))).await;

        assert_eq!(
            outcome,
            Err(LookupError::Timeout(TimeoutError {
                duration_ms: 50,
                attempt: 2,
                name: Some("lookup".to_string()),
            }))
        );
        assert_eq!(
            sink.events(),
            vec![WorkflowEvent::StepTimeout {
                step: "lookup".to_string(),
                duration_ms: 50,
                attempt: 2,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_at_deadline() {
        let started = tokio::time::Instant::now();
        let outcome = with_timeout(
            lookup(Duration::from_secs(60), Ok(1)),
            &TimeoutConfig::from_millis(50),
        )
        .await;
        assert!(matches!(outcome, Err(LookupError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_signals_cancellation() {
        let sink = Arc::new(MemorySink::new());
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let guard = TimeoutGuard::new(TimeoutConfig::from_millis(50).named("lookup"))
            .with_sink(sink.clone());

        let outcome: Outcome<u32, LookupError> = guard
            .run_detached(move |token| async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(0)
            })
            .await;

        assert!(matches!(outcome, Err(LookupError::Timeout(_))));
        // let the abandoned task observe its token
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(observed.load(Ordering::SeqCst));
        assert!(sink.events().contains(&WorkflowEvent::LateCompletion {
            step: "lookup".to_string(),
            succeeded: true,
            cancelled: true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_late_result_is_discarded() {
        let sink = Arc::new(MemorySink::new());
        let guard = TimeoutGuard::new(
            TimeoutConfig::from_millis(50)
                .named("write")
                .with_cancellation(false),
        )
        .with_sink(sink.clone());

        let outcome: Outcome<u32, LookupError> = guard
            .run_detached(|token| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert!(!token.is_cancelled());
                Ok(9)
            })
            .await;
        assert!(matches!(outcome, Err(LookupError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            sink.names(),
            vec!["step_timeout", "late_completion"]
        );
        assert!(sink.events().contains(&WorkflowEvent::LateCompletion {
            step: "write".to_string(),
            succeeded: true,
            cancelled: false,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_panic_is_unexpected() {
        let sink = Arc::new(MemorySink::new());
        let guard = TimeoutGuard::new(TimeoutConfig::from_millis(50).named("parse"))
            .with_sink(sink.clone());

        let outcome: Outcome<u32, LookupError> = guard
            .run_detached(|_| async {
                let rows: Vec<u32> = Vec::new();
                Ok(rows[2])
            })
            .await;

        match outcome {
            Err(LookupError::Unexpected(cause)) => {
                assert!(cause.contains("parse"), "{}", cause);
                assert!(cause.contains("panicked"), "{}", cause);
            }
            other => panic!("expected an unexpected failure, got {:?}", other),
        }
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_task_is_not_a_timeout() {
        let sink = Arc::new(MemorySink::new());
        let guard = TimeoutGuard::new(TimeoutConfig::from_millis(50).named("sync"))
            .with_sink(sink.clone());
        let (tx, rx) = oneshot::channel::<thread::Result<Outcome<u32, LookupError>>>();
        drop(tx);

        let outcome = guard.settle(rx.await);

        assert!(matches!(outcome, Err(LookupError::Unexpected(_))));
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_fast_outcome_passes_through() {
        let guard = TimeoutGuard::new(TimeoutConfig::from_millis(50));
        let outcome = guard
            .run_detached(|_| lookup(Duration::from_millis(5), Err(LookupError::Missing)))
            .await;
        assert_eq!(outcome, Err(LookupError::Missing));
    }
}

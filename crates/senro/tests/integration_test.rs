use senro::prelude::*;
use senro::{CircuitState, MemorySink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, PartialEq, thiserror::Error)]
enum FetchError {
    #[error("connection reset")]
    ConnectionReset,
    #[error("user {0} not found")]
    NotFound(u32),
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("order total must be positive")]
struct InvalidTotal;

#[derive(Debug, PartialEq, thiserror::Error)]
enum ShopError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Invalid(#[from] InvalidTotal),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error(transparent)]
    Unexpected(#[from] UnexpectedError),
}

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: u32,
}

/// Fails with a connection reset until it has been called `fail_times` times.
struct FlakyUsers {
    calls: AtomicU32,
    fail_times: u32,
}

impl FlakyUsers {
    fn new(fail_times: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_times,
        }
    }

    async fn fetch_user(&self, id: u32) -> Outcome<User, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_times {
            Err(FetchError::ConnectionReset)
        } else {
            Ok(User { id })
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Order lookup that fails `fail_times` times before answering after `latency`.
struct FlakyOrders {
    calls: AtomicU32,
    fail_times: u32,
    latency: Duration,
}

impl FlakyOrders {
    fn new(fail_times: u32, latency: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_times,
            latency,
        }
    }

    async fn fetch_orders(&self, user: &User) -> Outcome<Vec<u64>, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if n < self.fail_times {
            Err(FetchError::ConnectionReset)
        } else {
            Ok(vec![u64::from(user.id) * 10, 5])
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn summarize(calls: &AtomicU32, orders: &[u64]) -> Outcome<u64, InvalidTotal> {
    calls.fetch_add(1, Ordering::SeqCst);
    match orders.iter().sum::<u64>() {
        0 => Err(InvalidTotal),
        total => Ok(total),
    }
}

fn retry_events(sink: &MemorySink) -> Vec<WorkflowEvent> {
    sink.events()
        .into_iter()
        .filter(|e| matches!(e, WorkflowEvent::StepRetry { .. }))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_order_summary_retries_flaky_orders() {
    let sink = Arc::new(MemorySink::new());
    let users = &FlakyUsers::new(0);
    let orders = &FlakyOrders::new(2, Duration::from_millis(5));
    let summaries = &AtomicU32::new(0);
    let policy = &RetryPolicy::new(RetryConfig::fixed(3, Duration::from_millis(10)));

    let outcome: Outcome<u64, ShopError> = Workflow::new("order_summary")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            let user = ctx.step("fetch_user", || users.fetch_user(1)).await?;
            let list = ctx
                .retry("fetch_orders", policy, || orders.fetch_orders(&user))
                .await?;
            ctx.step("summarize", || async { summarize(summaries, &list) })
                .await
        })
        .await;

    assert_eq!(outcome, Ok(15));
    assert_eq!(orders.calls(), 3);
    assert_eq!(summaries.load(Ordering::SeqCst), 1);
    assert_eq!(
        retry_events(&sink),
        vec![
            WorkflowEvent::StepRetry {
                step: "fetch_orders".to_string(),
                attempt: 1,
                delay_ms: 10,
            },
            WorkflowEvent::StepRetry {
                step: "fetch_orders".to_string(),
                attempt: 2,
                delay_ms: 10,
            },
        ]
    );
    assert_eq!(sink.names().last(), Some(&"workflow_completed"));
}

#[tokio::test(start_paused = true)]
async fn test_order_summary_times_out_before_summarize() {
    let sink = Arc::new(MemorySink::new());
    let users = &FlakyUsers::new(0);
    let orders = &FlakyOrders::new(0, Duration::from_millis(200));
    let summaries = &AtomicU32::new(0);
    let deadline = &TimeoutConfig::from_millis(50);

    let outcome: Outcome<u64, ShopError> = Workflow::new("order_summary")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            let user = ctx.step("fetch_user", || users.fetch_user(1)).await?;
            let list = ctx
                .with_timeout("fetch_orders", deadline, || orders.fetch_orders(&user))
                .await?;
            ctx.step("summarize", || async { summarize(summaries, &list) })
                .await
        })
        .await;

    match outcome {
        Err(ShopError::Timeout(e)) => {
            assert_eq!(e.duration_ms, 50);
            assert_eq!(e.name.as_deref(), Some("fetch_orders"));
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(summaries.load(Ordering::SeqCst), 0);
    assert!(!sink
        .events()
        .iter()
        .any(|e| matches!(e, WorkflowEvent::StepStarted { step, .. } if step == "summarize")));
}

#[tokio::test]
async fn test_unrecovered_failure_short_circuits() {
    let log = Mutex::new(Vec::new());
    let step = |name: &'static str, fail: bool| {
        let log = &log;
        move || async move {
            log.lock().unwrap().push(name);
            if fail {
                Err(FetchError::NotFound(4))
            } else {
                Ok(())
            }
        }
    };

    let outcome: Outcome<(), ShopError> = Workflow::new("checkout")
        .run(|ctx| async move {
            ctx.step("reserve", step("reserve", false)).await?;
            ctx.step("charge", step("charge", true)).await?;
            ctx.step("ship", step("ship", false)).await?;
            ctx.step("notify", step("notify", false)).await
        })
        .await;

    assert_eq!(outcome, Err(ShopError::Fetch(FetchError::NotFound(4))));
    assert_eq!(*log.lock().unwrap(), vec!["reserve", "charge"]);
}

#[tokio::test]
async fn test_error_union_keeps_each_step_error() {
    let invalid: Outcome<u64, ShopError> = Workflow::new("checkout")
        .run(|ctx| async move {
            let orders = ctx
                .step("load", || async { Ok::<_, FetchError>(Vec::<u64>::new()) })
                .await?;
            let calls = AtomicU32::new(0);
            ctx.step("summarize", || async { summarize(&calls, &orders) })
                .await
        })
        .await;
    assert_eq!(invalid, Err(ShopError::Invalid(InvalidTotal)));

    let missing: Outcome<u64, ShopError> = Workflow::new("checkout")
        .run(|ctx| async move {
            ctx.step("load", || async { Err::<u64, _>(FetchError::NotFound(9)) })
                .await
        })
        .await;
    assert_eq!(missing.unwrap_err().to_string(), "user 9 not found");
}

#[tokio::test(start_paused = true)]
async fn test_retry_wraps_circuit_breaker() {
    let sink = Arc::new(MemorySink::new());
    let breaker = &CircuitBreaker::with_sink(
        "users",
        CircuitBreakerConfig::new(2, Duration::from_secs(60), Duration::from_secs(30), 1),
        sink.clone(),
    );
    let users = &FlakyUsers::new(u32::MAX);
    let policy = &RetryPolicy::new(RetryConfig::fixed(4, Duration::from_millis(10)))
        .retry_on(|e: &ShopError| matches!(e, ShopError::Fetch(FetchError::ConnectionReset)));

    let outcome: Outcome<User, ShopError> = Workflow::new("profile")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            ctx.retry("fetch_user", policy, || {
                breaker.call(|| async { users.fetch_user(1).await.map_err(ShopError::from) })
            })
            .await
        })
        .await;

    // Two resets open the circuit; the third attempt is rejected and not retried.
    assert_eq!(
        outcome,
        Err(ShopError::CircuitOpen(CircuitOpenError {
            resource: "users".to_string(),
        }))
    );
    assert_eq!(users.calls(), 2);
    assert_eq!(retry_events(&sink).len(), 2);
    assert!(sink.names().contains(&"circuit_opened"));
}

#[tokio::test(start_paused = true)]
async fn test_guarded_step_rejects_when_open() {
    let breaker = &CircuitBreaker::new(
        "inventory",
        CircuitBreakerConfig::new(1, Duration::from_secs(60), Duration::from_secs(30), 1),
    );
    let calls = &AtomicU32::new(0);
    let reserve = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(FetchError::ConnectionReset)
    };

    let first: Outcome<(), ShopError> = Workflow::new("reserve")
        .run(|ctx| async move { ctx.guarded("reserve", breaker, reserve).await })
        .await;
    assert_eq!(first, Err(ShopError::Fetch(FetchError::ConnectionReset)));
    assert_eq!(breaker.state(), CircuitState::Open);

    let second: Outcome<(), ShopError> = Workflow::new("reserve")
        .run(|ctx| async move { ctx.guarded("reserve", breaker, reserve).await })
        .await;
    assert!(matches!(second, Err(ShopError::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bridge_turns_panic_into_failure() {
    async fn legacy_total(orders: &[u64]) -> u64 {
        assert!(!orders.is_empty(), "no orders to total");
        orders.iter().sum()
    }

    let outcome: Outcome<u64, ShopError> = Workflow::new("legacy")
        .run(|ctx| async move {
            ctx.bridge(
                "legacy_total",
                || legacy_total(&[]),
                |panic| UnexpectedError::new(panic.to_string()),
            )
            .await
        })
        .await;

    match outcome {
        Err(ShopError::Unexpected(e)) => assert!(e.to_string().contains("no orders to total")),
        other => panic!("expected mapped panic, got {:?}", other),
    }
}

#[tokio::test]
async fn test_panic_outside_step_is_unexpected() {
    let sink = Arc::new(MemorySink::new());
    let outcome: Outcome<u64, ShopError> = Workflow::new("careless")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            let orders = ctx
                .step("load", || async { Ok::<_, FetchError>(vec![1_u64]) })
                .await?;
            Ok(orders[5])
        })
        .await;

    assert!(matches!(outcome, Err(ShopError::Unexpected(_))));
    assert_eq!(sink.names().last(), Some(&"workflow_halted"));
}

#[tokio::test]
async fn test_swallowed_halt_is_unexpected() {
    let outcome: Outcome<u32, ShopError> = Workflow::new("sloppy")
        .run(|ctx| async move {
            if ctx
                .step("load", || async { Err::<u32, _>(FetchError::ConnectionReset) })
                .await
                .is_err()
            {
                return Ok(0);
            }
            Ok(1)
        })
        .await;

    assert!(matches!(outcome, Err(ShopError::Unexpected(_))));
}

#[tokio::test]
async fn test_attempt_recovers_with_fallback() {
    let users = &FlakyUsers::new(1);

    let outcome: Outcome<User, ShopError> = Workflow::new("profile")
        .run(|ctx| async move {
            match ctx.attempt("primary", || users.fetch_user(3)).await? {
                Ok(user) => Ok(user),
                Err(FetchError::ConnectionReset) => {
                    ctx.step("replica", || users.fetch_user(3)).await
                }
                Err(other) => Err(ctx.fail("primary", other)),
            }
        })
        .await;

    assert_eq!(outcome, Ok(User { id: 3 }));
    assert_eq!(users.calls(), 2);
}

struct LoadCart {
    items: Vec<u64>,
}

#[async_trait]
impl Step for LoadCart {
    type Output = Vec<u64>;
    type Error = FetchError;

    async fn execute(&self) -> Result<Self::Output, Self::Error> {
        if self.items.is_empty() {
            Err(FetchError::NotFound(0))
        } else {
            Ok(self.items.clone())
        }
    }

    fn name(&self) -> StepName {
        StepName::new("load_cart")
    }
}

#[tokio::test]
async fn test_reusable_step() {
    let sink = Arc::new(MemorySink::new());
    let cart = LoadCart {
        items: vec![3, 4],
    };

    let outcome: Outcome<u64, ShopError> = Workflow::new("cart_total")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            let items = ctx.run(&cart).await?;
            Ok(items.iter().sum())
        })
        .await;

    assert_eq!(outcome, Ok(7));
    assert!(sink.events().contains(&WorkflowEvent::StepStarted {
        workflow: "cart_total".to_string(),
        step: "load_cart".to_string(),
        index: 0,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_last_error() {
    let sink = Arc::new(MemorySink::new());
    let users = &FlakyUsers::new(u32::MAX);
    let policy = &RetryPolicy::new(RetryConfig::exponential(
        3,
        Duration::from_millis(10),
        Duration::from_millis(100),
    ));

    let started = tokio::time::Instant::now();
    let outcome: Outcome<User, ShopError> = Workflow::new("profile")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            ctx.retry("fetch_user", policy, || users.fetch_user(1))
                .await
        })
        .await;

    assert_eq!(outcome, Err(ShopError::Fetch(FetchError::ConnectionReset)));
    assert_eq!(users.calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(sink.events().contains(&WorkflowEvent::RetriesExhausted {
        step: "fetch_user".to_string(),
        attempts: 3,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_guarded_retry_fails_fast_on_open_circuit() {
    let sink = Arc::new(MemorySink::new());
    let breaker = &CircuitBreaker::with_sink(
        "users",
        CircuitBreakerConfig::new(2, Duration::from_secs(60), Duration::from_secs(30), 1),
        sink.clone(),
    );
    let users = &FlakyUsers::new(u32::MAX);
    // retries every failure, circuit rejections included
    let policy = &RetryPolicy::new(RetryConfig::fixed(5, Duration::from_secs(1)));

    let started = tokio::time::Instant::now();
    let outcome: Outcome<User, ShopError> = Workflow::new("profile")
        .with_sink(sink.clone())
        .run(|ctx| async move {
            ctx.retry_guarded("fetch_user", policy, breaker, || users.fetch_user(1))
                .await
        })
        .await;

    assert!(matches!(outcome, Err(ShopError::CircuitOpen(_))));
    assert_eq!(users.calls(), 2);
    assert_eq!(retry_events(&sink).len(), 2);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(breaker.state(), CircuitState::Open);
}

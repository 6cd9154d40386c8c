//! Checkout workflow: flaky inventory behind a circuit breaker, a payment call
//! under a deadline, and a legacy shipping label generator that may panic.
//!
//! Run with `RUST_LOG=debug cargo run --example checkout` to see every event.

use senro::prelude::*;
use senro::{CircuitBreakerRegistry, TracingSink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CheckoutError {
    #[error("inventory service unavailable")]
    InventoryUnavailable,
    #[error("card declined")]
    CardDeclined,
    #[error("label generation failed: {0}")]
    Label(String),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error(transparent)]
    Unexpected(#[from] UnexpectedError),
}

#[derive(Debug, Clone)]
struct Cart {
    sku: &'static str,
    quantity: u32,
    amount_cents: u64,
}

struct Inventory {
    calls: AtomicU32,
}

impl Inventory {
    async fn reserve(&self, cart: &Cart) -> Outcome<String, CheckoutError> {
        tokio::time::sleep(Duration::from_millis(15)).await;
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CheckoutError::InventoryUnavailable);
        }
        Ok(format!("rsv-{}-{}", cart.sku, cart.quantity))
    }
}

async fn charge(amount_cents: u64, latency: Duration) -> Outcome<String, CheckoutError> {
    tokio::time::sleep(latency).await;
    if amount_cents > 100_000 {
        return Err(CheckoutError::CardDeclined);
    }
    Ok(format!("txn-{}", amount_cents))
}

async fn legacy_label(reservation: &str) -> String {
    assert!(reservation.starts_with("rsv-"), "unknown reservation format");
    format!("LBL/{}", reservation.to_uppercase())
}

const POLICIES: &str = r#"{
    "retry": {
        "max_attempts": 3,
        "backoff": "exponential",
        "initial_delay": "20ms",
        "max_delay": "200ms",
        "jitter": true
    },
    "payment_timeout": { "deadline": "250ms" },
    "breaker": {
        "failure_threshold": 3,
        "window": "30s",
        "reset_timeout": "5s",
        "half_open_max": 1
    }
}"#;

#[derive(serde::Deserialize)]
struct Policies {
    retry: RetryConfig,
    payment_timeout: TimeoutConfig,
    breaker: CircuitBreakerConfig,
}

async fn checkout(
    cart: Cart,
    inventory: &Inventory,
    breakers: &CircuitBreakerRegistry,
    policies: &Policies,
) -> Outcome<String, CheckoutError> {
    let retry = RetryPolicy::try_new(policies.retry.clone())
        .map_err(|e| UnexpectedError::new(e.to_string()))?
        .retry_on(|e: &CheckoutError| matches!(e, CheckoutError::InventoryUnavailable));
    let breaker = breakers.get_or_insert("inventory", policies.breaker.clone());

    Workflow::new("checkout")
        .with_sink(Arc::new(TracingSink))
        .run(|ctx| async move {
            let reservation = ctx
                .retry_guarded("reserve_stock", &retry, &breaker, || inventory.reserve(&cart))
                .await?;

            let transaction = ctx
                .with_timeout("charge_card", &policies.payment_timeout, || {
                    charge(cart.amount_cents, Duration::from_millis(40))
                })
                .await?;

            let label = ctx
                .bridge(
                    "print_label",
                    || legacy_label(&reservation),
                    |panic| CheckoutError::Label(panic.to_string()),
                )
                .await?;

            Ok(format!("{} paid by {} ships as {}", reservation, transaction, label))
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let policies: Policies = serde_json::from_str(POLICIES)?;
    policies.retry.validate()?;
    policies.payment_timeout.validate()?;
    policies.breaker.validate()?;

    let inventory = Inventory {
        calls: AtomicU32::new(0),
    };
    let breakers = CircuitBreakerRegistry::new();

    let carts = [
        Cart {
            sku: "tea-01",
            quantity: 2,
            amount_cents: 2_400,
        },
        Cart {
            sku: "kettle-07",
            quantity: 1,
            amount_cents: 250_000,
        },
    ];

    for cart in carts {
        match checkout(cart.clone(), &inventory, &breakers, &policies).await {
            Ok(receipt) => println!("checkout succeeded: {}", receipt),
            Err(error) => println!("checkout of {} failed: {}", cart.sku, error),
        }
    }

    Ok(())
}

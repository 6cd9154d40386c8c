//! Railway-oriented workflow execution for async Rust.
//!
//! Steps return [`Outcome`]s. A [`Workflow`] runs them in order, stops at the
//! first failure and hands back a single outcome whose error type is the union
//! of every step's errors. Retry, timeout and circuit breaker policies wrap
//! individual steps, and every decision they make is reported as a
//! [`WorkflowEvent`].
//!
//! # Example
//!
//! ```rust
//! use senro::prelude::*;
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! enum ShopError {
//!     #[error("user not found")]
//!     UserNotFound,
//!     #[error(transparent)]
//!     Timeout(#[from] TimeoutError),
//!     #[error(transparent)]
//!     Unexpected(#[from] UnexpectedError),
//! }
//!
//! async fn fetch_user(id: u32) -> Outcome<String, ShopError> {
//!     if id == 0 {
//!         Err(ShopError::UserNotFound)
//!     } else {
//!         Ok(format!("user-{}", id))
//!     }
//! }
//!
//! async fn fetch_orders(user: &str) -> Outcome<Vec<u32>, ShopError> {
//!     Ok(vec![user.len() as u32])
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::new(RetryConfig::fixed(3, Duration::from_millis(10)));
//!     let deadline = TimeoutConfig::from_millis(500);
//!
//!     let outcome: Outcome<usize, ShopError> = Workflow::new("order_summary")
//!         .run(|ctx| async move {
//!             let user = ctx.retry("fetch_user", &policy, || fetch_user(7)).await?;
//!             let orders = ctx
//!                 .with_timeout("fetch_orders", &deadline, || fetch_orders(&user))
//!                 .await?;
//!             Ok(orders.len())
//!         })
//!         .await;
//!
//!     assert_eq!(outcome.unwrap(), 1);
//! }
//! ```

mod bridge;
mod circuit;
mod retry;
mod sink;
mod timeout;
mod workflow;

use std::time::Duration;

// Re-export core types
pub use senro_core::*;

pub use bridge::{bridge, bridge_sync};
pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, Permit};
pub use retry::RetryPolicy;
pub use sink::TracingSink;
pub use timeout::{with_timeout, TimeoutGuard};
pub use workflow::{Halt, Workflow, WorkflowContext};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        async_trait, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, EventSink,
        Halt, Outcome, OutcomeExt, Panic, RetryConfig, RetryPolicy, Step, StepName,
        TimeoutConfig, TimeoutError, UnexpectedError, Workflow, WorkflowContext, WorkflowEvent,
    };
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

//! Panic-to-Outcome bridging.
//!
//! Bridging is how an operation that may panic joins a workflow. The error
//! mapper is mandatory so every panicking boundary is categorized by its caller.
//! Panics caught anywhere else by the engine only ever become
//! [`UnexpectedError`](senro_core::UnexpectedError).

use futures::FutureExt;
use senro_core::{Outcome, Panic};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

/// Runs an async operation, turning a panic into a mapped failure.
///
/// A panic raised while building the future is caught as well as one raised
/// while polling it.
///
/// # Examples
///
/// ```
/// use senro::bridge;
///
/// # tokio_test::block_on(async {
/// let outcome: Result<u32, String> = bridge(
///     || async { "12".parse::<u32>().unwrap_or_default() },
///     |panic| panic.to_string(),
/// )
/// .await;
/// assert_eq!(outcome, Ok(12));
/// # });
/// ```
pub async fn bridge<T, E, F, Fut, M>(operation: F, error_mapper: M) -> Outcome<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
    M: FnOnce(Panic) -> E,
{
    match AssertUnwindSafe(async move { operation().await })
        .catch_unwind()
        .await
    {
        Ok(value) => Ok(value),
        Err(payload) => Err(error_mapper(Panic::from_payload(payload))),
    }
}

/// Runs a blocking operation, turning a panic into a mapped failure.
pub fn bridge_sync<T, E, F, M>(operation: F, error_mapper: M) -> Outcome<T, E>
where
    F: FnOnce() -> T,
    M: FnOnce(Panic) -> E,
{
    panic::catch_unwind(AssertUnwindSafe(operation))
        .map_err(|payload| error_mapper(Panic::from_payload(payload)))
}

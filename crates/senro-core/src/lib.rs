//! Core types for the senro workflow engine.
//!
//! This crate provides the vocabulary without runtime dependencies.
//! Library authors should depend on this crate to write reusable steps or
//! event sinks.
//!
//! # Core Types
//!
//! - [`Outcome`] - Success-or-failure value every step produces
//! - [`Step`] - Trait for reusable steps
//! - [`RetryConfig`], [`TimeoutConfig`], [`CircuitBreakerConfig`] - Resilience settings
//! - [`WorkflowEvent`] / [`EventSink`] - Observability records
//! - [`TimeoutError`], [`CircuitOpenError`], [`UnexpectedError`] - Engine failures

mod config;
mod error;
mod event;
mod outcome;
mod step;

pub use async_trait::async_trait;
pub use config::{
    BackoffKind, CircuitBreakerConfig, RetryConfig, SuccessStrategy, TimeoutConfig, JITTER_MAX,
    JITTER_MIN,
};
pub use error::{CircuitOpenError, ConfigError, Panic, TimeoutError, UnexpectedError};
pub use event::{EventSink, MemorySink, NoopSink, WorkflowEvent};
pub use outcome::{failure, success, Outcome, OutcomeExt};
pub use step::{AttemptOutcome, Step, StepAttempt, StepName};

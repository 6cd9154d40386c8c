//! Observability records.
//!
//! The engine reports what it does as plain [`WorkflowEvent`] values handed to an
//! [`EventSink`]. Which logging or tracing backend consumes them is up to the
//! sink; this crate depends on none.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};

/// A structured record of something the engine did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkflowEvent {
    /// A step is about to run.
    StepStarted {
        workflow: String,
        step: String,
        index: usize,
    },
    /// A step produced a success.
    StepSucceeded {
        workflow: String,
        step: String,
        index: usize,
        elapsed_ms: u64,
    },
    /// A step produced a failure and halted its workflow.
    StepFailed {
        workflow: String,
        step: String,
        index: usize,
        error: String,
    },
    /// An attempt failed and another one follows after `delay_ms`.
    StepRetry {
        step: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// An invocation exceeded its deadline.
    StepTimeout {
        step: String,
        duration_ms: u64,
        attempt: u32,
    },
    /// The last permitted attempt failed.
    RetriesExhausted { step: String, attempts: u32 },
    /// An operation abandoned at its deadline finished anyway; its result was dropped.
    ///
    /// `cancelled` is set when the operation was told to stop before it
    /// returned.
    LateCompletion {
        step: String,
        succeeded: bool,
        cancelled: bool,
    },
    /// A circuit stopped admitting calls.
    CircuitOpened { resource: String, failures: u32 },
    /// A circuit started admitting trial calls.
    CircuitHalfOpen { resource: String },
    /// A circuit recovered.
    CircuitClosed { resource: String },
    /// A workflow returned a success.
    WorkflowCompleted {
        workflow: String,
        steps: usize,
        elapsed_ms: u64,
    },
    /// A workflow returned a failure.
    WorkflowHalted {
        workflow: String,
        steps: usize,
        error: String,
    },
}

impl WorkflowEvent {
    /// Stable snake_case name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepSucceeded { .. } => "step_succeeded",
            WorkflowEvent::StepFailed { .. } => "step_failed",
            WorkflowEvent::StepRetry { .. } => "step_retry",
            WorkflowEvent::StepTimeout { .. } => "step_timeout",
            WorkflowEvent::RetriesExhausted { .. } => "retries_exhausted",
            WorkflowEvent::LateCompletion { .. } => "late_completion",
            WorkflowEvent::CircuitOpened { .. } => "circuit_opened",
            WorkflowEvent::CircuitHalfOpen { .. } => "circuit_half_open",
            WorkflowEvent::CircuitClosed { .. } => "circuit_closed",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow_completed",
            WorkflowEvent::WorkflowHalted { .. } => "workflow_halted",
        }
    }
}

/// Subscriber for engine events.
///
/// Called inline on the emitting task, so implementations should not block.
pub trait EventSink: Send + Sync {
    /// Receives one event.
    fn emit(&self, event: WorkflowEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: WorkflowEvent) {}
}

/// Keeps every event in memory, in emission order.
///
/// # Examples
///
/// ```
/// use senro_core::{EventSink, MemorySink, WorkflowEvent};
///
/// let sink = MemorySink::new();
/// sink.emit(WorkflowEvent::CircuitClosed { resource: "payments".to_string() });
/// assert_eq!(sink.names(), vec!["circuit_closed"]);
/// ```
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event.
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the names of every recorded event.
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(WorkflowEvent::name)
            .collect()
    }

    /// Drops every recorded event.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: WorkflowEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

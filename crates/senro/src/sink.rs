//! Event sink backed by `tracing`.

use senro_core::{EventSink, WorkflowEvent};
use tracing::{debug, info, warn};

/// Forwards engine events to `tracing` with structured fields.
///
/// This is the default sink. Nothing is printed unless the application installs
/// a subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: WorkflowEvent) {
        let name = event.name();
        match event {
            WorkflowEvent::StepStarted {
                workflow,
                step,
                index,
            } => debug!(event = name, %workflow, %step, index, "Step started"),
            WorkflowEvent::StepSucceeded {
                workflow,
                step,
                index,
                elapsed_ms,
            } => info!(
                event = name,
                %workflow,
                index,
                elapsed_ms,
                "Step '{}' completed successfully",
                step
            ),
            WorkflowEvent::StepFailed {
                workflow,
                step,
                index,
                error,
            } => warn!(event = name, %workflow, index, "Step '{}' failed: {}", step, error),
            WorkflowEvent::StepRetry {
                step,
                attempt,
                delay_ms,
            } => info!(
                event = name,
                attempt,
                delay_ms,
                "Step '{}' failed, retrying after attempt {} in {}ms",
                step,
                attempt,
                delay_ms
            ),
            WorkflowEvent::StepTimeout {
                step,
                duration_ms,
                attempt,
            } => warn!(
                event = name,
                duration_ms,
                attempt,
                "Step '{}' timed out after {}ms (attempt {})",
                step,
                duration_ms,
                attempt
            ),
            WorkflowEvent::RetriesExhausted { step, attempts } => {
                warn!(event = name, attempts, "Step '{}' failed after {} attempts", step, attempts)
            }
            WorkflowEvent::LateCompletion {
                step,
                succeeded,
                cancelled: true,
            } => info!(
                event = name,
                succeeded,
                "Step '{}' returned after it was cancelled; result discarded",
                step
            ),
            WorkflowEvent::LateCompletion {
                step,
                succeeded,
                cancelled: false,
            } => warn!(
                event = name,
                succeeded,
                "Step '{}' finished after its deadline; result discarded",
                step
            ),
            WorkflowEvent::CircuitOpened { resource, failures } => {
                warn!(event = name, %resource, failures, "Circuit opened")
            }
            WorkflowEvent::CircuitHalfOpen { resource } => {
                info!(event = name, %resource, "Circuit half-open")
            }
            WorkflowEvent::CircuitClosed { resource } => {
                info!(event = name, %resource, "Circuit closed")
            }
            WorkflowEvent::WorkflowCompleted {
                workflow,
                steps,
                elapsed_ms,
            } => info!(event = name, %workflow, steps, elapsed_ms, "Workflow completed"),
            WorkflowEvent::WorkflowHalted {
                workflow,
                steps,
                error,
            } => warn!(event = name, %workflow, steps, %error, "Workflow halted"),
            other => debug!(event = name, ?other, "Engine event"),
        }
    }
}

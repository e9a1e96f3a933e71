//! Workflow execution events
//!
//! Events are published on a broadcast channel carried by the
//! [`StepContext`](crate::StepContext). Nobody has to listen; a send with no
//! receivers is ignored.

use crate::report::Status;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Event emitted during workflow execution
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// Workflow started
    WorkflowStarted { workflow: String },
    /// Step started executing
    StepStarted { step: String },
    /// Step finished executing
    StepCompleted { step: String, status: Status },
    /// Rollback of a step or workflow started
    RollbackStarted { target: String },
    /// Rollback of a step or workflow finished
    RollbackCompleted { target: String, status: Status },
    /// Workflow completed
    WorkflowCompleted { workflow: String, status: Status },
}

/// Create an event channel with room for `capacity` pending events
pub fn event_channel(
    capacity: usize,
) -> (
    broadcast::Sender<WorkflowEvent>,
    broadcast::Receiver<WorkflowEvent>,
) {
    broadcast::channel(capacity)
}

/// Log every event received until the channel closes
pub async fn log_events(mut receiver: broadcast::Receiver<WorkflowEvent>) {
    loop {
        match receiver.recv().await {
            Ok(WorkflowEvent::WorkflowStarted { workflow }) => {
                info!(workflow = %workflow, "Workflow started")
            }
            Ok(WorkflowEvent::StepStarted { step }) => info!(step = %step, "Step started"),
            Ok(WorkflowEvent::StepCompleted { step, status }) => {
                info!(step = %step, status = %status, "Step completed")
            }
            Ok(WorkflowEvent::RollbackStarted { target }) => {
                info!(target_id = %target, "Rollback started")
            }
            Ok(WorkflowEvent::RollbackCompleted { target, status }) => {
                info!(target_id = %target, status = %status, "Rollback completed")
            }
            Ok(WorkflowEvent::WorkflowCompleted { workflow, status }) => {
                info!(workflow = %workflow, status = %status, "Workflow completed")
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event logger lagged behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

//! Step execution context
//!
//! The context is passed by reference into every step. It carries the
//! cancellation tokens, the optional event channel, free-form labels a
//! `prepare` hook may add, and the path of the runnable being executed.

use crate::events::WorkflowEvent;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Context provided to steps during execution and rollback
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Cancels forward execution
    cancel: CancellationToken,

    /// Cancels compensation; kept separate so a first interrupt still lets
    /// rollback run
    rollback_cancel: CancellationToken,

    /// Event sender for workflow events
    events: Option<broadcast::Sender<WorkflowEvent>>,

    /// Ids of the enclosing workflows, outermost first
    path: Vec<String>,

    labels: BTreeMap<String, String>,

    rolling_back: bool,
}

impl Default for StepContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StepContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            rollback_cancel: CancellationToken::new(),
            events: None,
            path: Vec::new(),
            labels: BTreeMap::new(),
            rolling_back: false,
        }
    }

    /// Set the token that cancels forward execution
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set the token that cancels rollback
    pub fn with_rollback_cancellation(mut self, token: CancellationToken) -> Self {
        self.rollback_cancel = token;
        self
    }

    /// Set the event sender
    pub fn with_events(mut self, sender: broadcast::Sender<WorkflowEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// The token governing the current phase: the rollback token while
    /// rolling back, the run token otherwise
    pub fn cancellation(&self) -> &CancellationToken {
        if self.rolling_back {
            &self.rollback_cancel
        } else {
            &self.cancel
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }

    pub fn is_rolling_back(&self) -> bool {
        self.rolling_back
    }

    /// Context for the children of the runnable `id`
    pub fn child(&self, id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.path.push(id.to_string());
        ctx
    }

    /// The same context switched into rollback mode
    pub fn for_rollback(&self) -> Self {
        let mut ctx = self.clone();
        ctx.rolling_back = true;
        ctx
    }

    /// Path of the enclosing workflows joined with `/`
    pub fn path(&self) -> String {
        self.path.join("/")
    }

    /// Full path of the runnable `id` inside this context
    pub fn path_of(&self, id: &str) -> String {
        if self.path.is_empty() {
            id.to_string()
        } else {
            format!("{}/{}", self.path(), id)
        }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

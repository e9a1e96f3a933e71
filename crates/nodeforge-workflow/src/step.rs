//! Step definition
//!
//! A [`Step`] is the atomic unit of a workflow. The work itself lives in a
//! [`StepHandler`]; the step owns the handler's [`StepState`], runs the
//! lifecycle hooks and turns the outcome into a [`Report`].

use crate::context::StepContext;
use crate::error::{Result, StepError};
use crate::events::WorkflowEvent;
use crate::report::{Metadata, Report};
use crate::state::StepState;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a handler did to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State was mutated (reported as Success)
    Changed,
    /// Nothing needed doing (reported as Skipped)
    Unchanged,
}

/// Core trait for step implementations
///
/// # Example
///
/// ```ignore
/// use nodeforge_workflow::{Metadata, Outcome, Result, StepContext, StepHandler, StepState};
/// use async_trait::async_trait;
///
/// struct DaemonReload;
///
/// #[async_trait]
/// impl StepHandler for DaemonReload {
///     async fn execute(
///         &self,
///         ctx: &StepContext,
///         _state: &mut StepState,
///         _metadata: &mut Metadata,
///     ) -> Result<Outcome> {
///         run_systemctl(ctx, "daemon-reload").await?;
///         Ok(Outcome::Changed)
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs before `execute`; may return an enriched context.
    ///
    /// A failure aborts the step before `execute` is called.
    async fn prepare(&self, ctx: &StepContext) -> Result<StepContext> {
        Ok(ctx.clone())
    }

    /// Perform the step
    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome>;

    /// Undo what `execute` recorded in `state`.
    ///
    /// Must be safe to call when `execute` never ran or changed nothing.
    async fn rollback(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        let _ = (ctx, state, metadata);
        Ok(Outcome::Unchanged)
    }
}

type Hook = Box<dyn Fn(&Report) + Send + Sync>;

/// An atomic, individually reversible unit of work
pub struct Step {
    id: String,
    handler: Box<dyn StepHandler>,
    state: StepState,
    on_failure: Option<Hook>,
    on_completion: Option<Hook>,
    executed: bool,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

impl Step {
    pub fn builder(id: impl Into<String>) -> StepBuilder {
        StepBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &StepState {
        &self.state
    }

    /// Replace the state bag, e.g. with one restored from a snapshot
    pub fn restore_state(&mut self, state: StepState) {
        self.state = state;
    }

    pub fn has_executed(&self) -> bool {
        self.executed
    }

    /// Run prepare, execute and the matching hook
    pub async fn execute(&mut self, ctx: &StepContext) -> Report {
        let path = ctx.path_of(&self.id);
        let started_at = Utc::now();
        let timer = Instant::now();

        ctx.emit(WorkflowEvent::StepStarted { step: path.clone() });
        info!(step = %path, "Executing step");

        let mut metadata = Metadata::new();
        let result = self.run(ctx, &mut metadata).await;

        let report = match result {
            Ok(Outcome::Changed) => Report::success(&self.id),
            Ok(Outcome::Unchanged) => Report::skipped(&self.id),
            Err(err) => {
                warn!(step = %path, error = %err, "Step failed");
                Report::failed(&self.id, &err)
            }
        }
        .with_metadata(metadata)
        .timed(started_at, timer.elapsed());

        if report.is_failed() {
            if let Some(hook) = &self.on_failure {
                hook(&report);
            }
        } else if let Some(hook) = &self.on_completion {
            hook(&report);
        }

        debug!(step = %path, status = %report.status, "Step finished");
        ctx.emit(WorkflowEvent::StepCompleted {
            step: path,
            status: report.status,
        });
        report
    }

    async fn run(&mut self, ctx: &StepContext, metadata: &mut Metadata) -> Result<Outcome> {
        if self.executed {
            return Err(StepError::IllegalState(format!(
                "step '{}' has already been executed in this run",
                self.id
            )));
        }
        if ctx.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        self.executed = true;

        let prepared = self.handler.prepare(ctx).await?;
        self.handler
            .execute(&prepared, &mut self.state, metadata)
            .await
    }

    /// Undo whatever the recorded state says this step changed
    pub async fn rollback(&mut self, ctx: &StepContext) -> Report {
        let ctx = ctx.for_rollback();
        let path = ctx.path_of(&self.id);
        let started_at = Utc::now();
        let timer = Instant::now();

        ctx.emit(WorkflowEvent::RollbackStarted {
            target: path.clone(),
        });
        info!(step = %path, "Rolling back step");

        let mut metadata = Metadata::new();
        let result = if ctx.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            self.handler
                .rollback(&ctx, &mut self.state, &mut metadata)
                .await
        };

        let report = match result {
            Ok(Outcome::Changed) => Report::success(&self.id),
            Ok(Outcome::Unchanged) => Report::skipped(&self.id),
            Err(err) => {
                warn!(step = %path, error = %err, "Rollback failed");
                Report::failed(&self.id, &err)
            }
        }
        .with_metadata(metadata)
        .timed(started_at, timer.elapsed());

        ctx.emit(WorkflowEvent::RollbackCompleted {
            target: path,
            status: report.status,
        });
        report
    }
}

/// Builder for [`Step`]
pub struct StepBuilder {
    id: String,
    handler: Option<Box<dyn StepHandler>>,
    on_failure: Option<Hook>,
    on_completion: Option<Hook>,
}

impl StepBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: None,
            on_failure: None,
            on_completion: None,
        }
    }

    pub fn handler(mut self, handler: impl StepHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Called with the report when execute fails
    pub fn on_failure(mut self, hook: impl Fn(&Report) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Called with the report when execute succeeds or skips
    pub fn on_completion(mut self, hook: impl Fn(&Report) + Send + Sync + 'static) -> Self {
        self.on_completion = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<Step> {
        if self.id.trim().is_empty() {
            return Err(StepError::IllegalArgument(
                "step id must not be empty".to_string(),
            ));
        }
        let handler = self.handler.ok_or_else(|| {
            StepError::IllegalArgument(format!("step '{}' has no execute handler", self.id))
        })?;

        Ok(Step {
            id: self.id,
            handler,
            state: StepState::new(),
            on_failure: self.on_failure,
            on_completion: self.on_completion,
            executed: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Always succeeds without changing anything
    pub struct NoopHandler;

    #[async_trait]
    impl StepHandler for NoopHandler {
        async fn execute(
            &self,
            _ctx: &StepContext,
            _state: &mut StepState,
            _metadata: &mut Metadata,
        ) -> Result<Outcome> {
            Ok(Outcome::Unchanged)
        }
    }

    /// Always fails with the given error
    pub struct FailingHandler {
        error: StepError,
    }

    impl FailingHandler {
        pub fn new(error: StepError) -> Self {
            Self { error }
        }
    }

    #[async_trait]
    impl StepHandler for FailingHandler {
        async fn execute(
            &self,
            _ctx: &StepContext,
            _state: &mut StepState,
            _metadata: &mut Metadata,
        ) -> Result<Outcome> {
            Err(self.error.clone())
        }
    }
}

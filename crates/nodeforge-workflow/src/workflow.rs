//! Workflow composition and execution
//!
//! A [`Workflow`] runs its children strictly in order. On the first failed
//! child it stops and, in [`ExecutionMode::RollbackOnError`], rolls back
//! every child that ran (the failed one included) in reverse order.

use crate::context::StepContext;
use crate::error::{Result, StepError, WorkflowError};
use crate::events::WorkflowEvent;
use crate::report::Report;
use crate::state::StepState;
use crate::step::Step;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{error, info, warn};

/// What a workflow does when a child fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// Stop and roll back every child that ran
    #[default]
    RollbackOnError,
    /// Stop and leave rollback to the caller
    StopOnError,
}

/// A child of a workflow
#[derive(Debug)]
pub enum Runnable {
    Step(Step),
    Workflow(Workflow),
}

impl From<Step> for Runnable {
    fn from(step: Step) -> Self {
        Runnable::Step(step)
    }
}

impl From<Workflow> for Runnable {
    fn from(workflow: Workflow) -> Self {
        Runnable::Workflow(workflow)
    }
}

impl Runnable {
    pub fn id(&self) -> &str {
        match self {
            Runnable::Step(step) => step.id(),
            Runnable::Workflow(workflow) => workflow.id(),
        }
    }

    pub fn execute<'a>(&'a mut self, ctx: &'a StepContext) -> BoxFuture<'a, Report> {
        match self {
            Runnable::Step(step) => step.execute(ctx).boxed(),
            Runnable::Workflow(workflow) => workflow.execute(ctx),
        }
    }

    pub fn rollback<'a>(&'a mut self, ctx: &'a StepContext) -> BoxFuture<'a, Report> {
        match self {
            Runnable::Step(step) => step.rollback(ctx).boxed(),
            Runnable::Workflow(workflow) => workflow.rollback(ctx),
        }
    }
}

/// Ordered composition of steps and sub-workflows
#[derive(Debug)]
pub struct Workflow {
    id: String,
    children: Vec<Runnable>,
    mode: ExecutionMode,
    /// Number of children that have been executed, the failed one included
    executed: usize,
}

impl Workflow {
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn children(&self) -> &[Runnable] {
        &self.children
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Execute every child in order
    pub fn execute<'a>(&'a mut self, ctx: &'a StepContext) -> BoxFuture<'a, Report> {
        async move {
            let path = ctx.path_of(&self.id);
            let started_at = Utc::now();
            let timer = Instant::now();

            ctx.emit(WorkflowEvent::WorkflowStarted {
                workflow: path.clone(),
            });
            info!(workflow = %path, children = self.children.len(), "Starting workflow");

            let child_ctx = ctx.child(&self.id);
            let mut reports = Vec::with_capacity(self.children.len());
            for (index, child) in self.children.iter_mut().enumerate() {
                let report = child.execute(&child_ctx).await;
                self.executed = self.executed.max(index + 1);
                let failed = report.is_failed();
                reports.push(report);
                if failed {
                    error!(workflow = %path, child = %child.id(), "Workflow child failed");
                    break;
                }
            }

            let mut report = Report::from_execution(&self.id, reports);
            if report.is_failed() && self.mode == ExecutionMode::RollbackOnError {
                warn!(workflow = %path, "Rolling back executed children");
                let rollback_ctx = child_ctx.for_rollback();
                let rollback = self
                    .rollback_children(&rollback_ctx, Some(&mut report.step_reports))
                    .await;
                report = report.with_rollback(rollback);
            }
            let report = report.timed(started_at, timer.elapsed());

            info!(workflow = %path, status = %report.status, "Workflow finished");
            ctx.emit(WorkflowEvent::WorkflowCompleted {
                workflow: path,
                status: report.status,
            });
            report
        }
        .boxed()
    }

    /// Roll back every child that ran, in reverse order.
    ///
    /// Safe to call repeatedly; a workflow that never ran reports Skipped.
    pub fn rollback<'a>(&'a mut self, ctx: &'a StepContext) -> BoxFuture<'a, Report> {
        async move {
            let path = ctx.path_of(&self.id);
            let started_at = Utc::now();
            let timer = Instant::now();

            if self.executed == 0 {
                return Report::skipped(&self.id).timed(started_at, timer.elapsed());
            }

            let ctx = ctx.for_rollback();
            ctx.emit(WorkflowEvent::RollbackStarted {
                target: path.clone(),
            });
            let report = self
                .rollback_children(&ctx.child(&self.id), None)
                .await
                .timed(started_at, timer.elapsed());
            ctx.emit(WorkflowEvent::RollbackCompleted {
                target: path,
                status: report.status,
            });
            report
        }
        .boxed()
    }

    /// Roll back `children[..executed]` in reverse. When execution reports
    /// are given, each rollback is attached to its child report, and children
    /// that already rolled themselves back are not rolled back twice.
    async fn rollback_children(
        &mut self,
        ctx: &StepContext,
        mut reports: Option<&mut Vec<Report>>,
    ) -> Report {
        let mut rollbacks = Vec::with_capacity(self.executed);
        for index in (0..self.executed).rev() {
            let existing = reports
                .as_deref()
                .and_then(|r| r.get(index))
                .and_then(|r| r.rollback.as_deref())
                .cloned();
            if let Some(existing) = existing {
                rollbacks.push(existing);
                continue;
            }

            let rollback = self.children[index].rollback(ctx).await;
            if let Some(child_report) = reports.as_deref_mut().and_then(|r| r.get_mut(index)) {
                child_report.rollback = Some(Box::new(rollback.clone()));
            }
            rollbacks.push(rollback);
        }
        Report::from_rollback(&self.id, rollbacks)
    }

    /// Capture every step's state bag keyed by its path
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let mut snapshot = WorkflowSnapshot {
            workflow: self.id.clone(),
            created_at: Utc::now(),
            executed: BTreeMap::new(),
            states: BTreeMap::new(),
        };
        self.collect(&self.id, &mut snapshot);
        snapshot
    }

    fn collect(&self, path: &str, snapshot: &mut WorkflowSnapshot) {
        snapshot.executed.insert(path.to_string(), self.executed);
        for child in &self.children {
            let child_path = format!("{}/{}", path, child.id());
            match child {
                Runnable::Step(step) => {
                    if !step.state().is_empty() {
                        snapshot.states.insert(child_path, step.state().clone());
                    }
                }
                Runnable::Workflow(workflow) => workflow.collect(&child_path, snapshot),
            }
        }
    }

    /// Rehydrate state captured by [`Workflow::snapshot`] so that a later
    /// [`Workflow::rollback`] undoes what the earlier run changed
    pub fn restore(&mut self, snapshot: &WorkflowSnapshot) -> std::result::Result<(), WorkflowError> {
        if snapshot.workflow != self.id {
            return Err(WorkflowError::SnapshotMismatch {
                expected: self.id.clone(),
                found: snapshot.workflow.clone(),
            });
        }
        let path = self.id.clone();
        self.apply(&path, snapshot);
        Ok(())
    }

    fn apply(&mut self, path: &str, snapshot: &WorkflowSnapshot) {
        self.executed = snapshot
            .executed
            .get(path)
            .copied()
            .unwrap_or(0)
            .min(self.children.len());
        for child in &mut self.children {
            let child_path = format!("{}/{}", path, child.id());
            match child {
                Runnable::Step(step) => {
                    let state = snapshot
                        .states
                        .get(&child_path)
                        .cloned()
                        .unwrap_or_default();
                    step.restore_state(state);
                }
                Runnable::Workflow(workflow) => workflow.apply(&child_path, snapshot),
            }
        }
    }
}

/// Persistable capture of a workflow's step states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    /// Id of the top-level workflow
    pub workflow: String,
    pub created_at: DateTime<Utc>,
    /// Executed-children count per workflow path
    pub executed: BTreeMap<String, usize>,
    /// State bag per step path
    pub states: BTreeMap<String, StepState>,
}

impl WorkflowSnapshot {
    /// Fold in the snapshot of an earlier run of the same workflow, so that
    /// a teardown still undoes what that run changed even when a later run
    /// found it already in place
    pub fn merge_earlier(&mut self, earlier: &WorkflowSnapshot) -> std::result::Result<(), WorkflowError> {
        if earlier.workflow != self.workflow {
            return Err(WorkflowError::SnapshotMismatch {
                expected: self.workflow.clone(),
                found: earlier.workflow.clone(),
            });
        }
        for (path, count) in &earlier.executed {
            let executed = self.executed.entry(path.clone()).or_insert(0);
            *executed = (*executed).max(*count);
        }
        for (path, state) in &earlier.states {
            self.states
                .entry(path.clone())
                .or_default()
                .merge_earlier(state);
        }
        Ok(())
    }
}

/// Builder for [`Workflow`]
pub struct WorkflowBuilder {
    id: String,
    children: Vec<Runnable>,
    mode: ExecutionMode,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            children: Vec::new(),
            mode: ExecutionMode::default(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.children.push(Runnable::Step(step));
        self
    }

    pub fn workflow(mut self, workflow: Workflow) -> Self {
        self.children.push(Runnable::Workflow(workflow));
        self
    }

    pub fn runnable(mut self, runnable: impl Into<Runnable>) -> Self {
        self.children.push(runnable.into());
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Result<Workflow> {
        if self.id.trim().is_empty() {
            return Err(StepError::IllegalArgument(
                "workflow id must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for child in &self.children {
            if !seen.insert(child.id()) {
                return Err(StepError::IllegalArgument(format!(
                    "duplicate id '{}' in workflow '{}'",
                    child.id(),
                    self.id
                )));
            }
        }

        Ok(Workflow {
            id: self.id,
            children: self.children,
            mode: self.mode,
            executed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::step::testing::{FailingHandler, NoopHandler};

    fn noop(id: &str) -> Step {
        Step::builder(id).handler(NoopHandler).build().unwrap()
    }

    fn failing(id: &str) -> Step {
        Step::builder(id)
            .handler(FailingHandler::new(StepError::Installation("boom".to_string())))
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Workflow::builder("wf")
            .step(noop("a"))
            .step(noop("a"))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);

        let err = Workflow::builder("").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[tokio::test]
    async fn test_all_skipped_is_success() {
        let mut wf = Workflow::builder("wf")
            .step(noop("a"))
            .step(noop("b"))
            .build()
            .unwrap();
        let report = wf.execute(&StepContext::new()).await;
        assert!(report.is_success());
        assert_eq!(report.step_reports.len(), 2);
        assert!(report.step_reports.iter().all(Report::is_skipped));
        assert!(report.rollback.is_none());
    }

    #[tokio::test]
    async fn test_never_ran_rollback_is_skipped() {
        let mut wf = Workflow::builder("wf").step(noop("a")).build().unwrap();
        assert!(wf.rollback(&StepContext::new()).await.is_skipped());
    }

    #[tokio::test]
    async fn test_failure_stops_and_rolls_back() {
        let mut wf = Workflow::builder("wf")
            .step(noop("a"))
            .step(failing("b"))
            .step(noop("c"))
            .build()
            .unwrap();
        let report = wf.execute(&StepContext::new()).await;

        assert!(report.is_failed());
        assert_eq!(report.error_kind(), Some(ErrorKind::Installation));
        assert_eq!(wf.executed(), 2);
        assert_eq!(report.step_reports.len(), 2);
        assert!(report.step_reports.iter().all(|r| r.rollback.is_some()));

        let rollback = report.rollback.as_deref().unwrap();
        let order: Vec<&str> = rollback.step_reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert!(rollback.is_skipped());
    }

    #[tokio::test]
    async fn test_stop_on_error_leaves_rollback_to_caller() {
        let mut wf = Workflow::builder("wf")
            .step(noop("a"))
            .step(failing("b"))
            .mode(ExecutionMode::StopOnError)
            .build()
            .unwrap();
        let report = wf.execute(&StepContext::new()).await;
        assert!(report.is_failed());
        assert!(report.rollback.is_none());
        assert_eq!(wf.executed(), 2);
    }

    #[tokio::test]
    async fn test_nested_failure_is_not_rolled_back_twice() {
        let inner = Workflow::builder("inner")
            .step(noop("x"))
            .step(failing("y"))
            .build()
            .unwrap();
        let mut outer = Workflow::builder("outer")
            .step(noop("a"))
            .workflow(inner)
            .build()
            .unwrap();

        let report = outer.execute(&StepContext::new()).await;
        assert!(report.is_failed());

        let inner_report = report.find("inner").unwrap();
        let inner_rollback = inner_report.rollback.as_deref().unwrap();
        assert_eq!(inner_rollback.step_reports.len(), 2);

        let outer_rollback = report.rollback.as_deref().unwrap();
        assert_eq!(outer_rollback.step_reports[0], *inner_rollback);
        assert_eq!(outer_rollback.step_reports[1].id, "a");
    }

    #[tokio::test]
    async fn test_merge_earlier_snapshot() {
        let mut wf = Workflow::builder("setup-kubelet")
            .step(noop("a"))
            .step(noop("b"))
            .build()
            .unwrap();
        let mut earlier = wf.snapshot();
        earlier.executed.insert("setup-kubelet".to_string(), 2);
        let mut state = StepState::new();
        state.set("alreadyInstalled", false);
        state.set("installedByThisStep", true);
        earlier.states.insert("setup-kubelet/a".to_string(), state);

        wf.execute(&StepContext::new()).await;
        let mut snapshot = wf.snapshot();
        snapshot.merge_earlier(&earlier).unwrap();
        assert_eq!(snapshot.executed.get("setup-kubelet"), Some(&2));
        assert!(snapshot.states["setup-kubelet/a"].flag("installedByThisStep"));

        let other = Workflow::builder("setup-kubeadm").build().unwrap().snapshot();
        assert!(matches!(
            snapshot.merge_earlier(&other),
            Err(WorkflowError::SnapshotMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_restore_mismatch() {
        let wf = Workflow::builder("setup-kubelet").step(noop("a")).build().unwrap();
        let snapshot = wf.snapshot();
        assert_eq!(snapshot.executed.get("setup-kubelet"), Some(&0));

        let mut other = Workflow::builder("setup-kubeadm").build().unwrap();
        assert!(matches!(
            other.restore(&snapshot),
            Err(WorkflowError::SnapshotMismatch { .. })
        ));
    }
}

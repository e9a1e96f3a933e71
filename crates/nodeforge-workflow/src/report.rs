//! Execution reports
//!
//! A [`Report`] is the result record of a single step or workflow run. It is
//! built once by the engine and handed back to the caller, who may serialize
//! it (the CLI prints it as YAML).

use crate::error::{ErrorKind, StepError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Free-form key/value metadata attached to a report
pub type Metadata = BTreeMap<String, String>;

/// Outcome status of a step, workflow or rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Something was changed
    Success,
    /// Nothing needed to be done
    Skipped,
    /// The operation failed; the report carries an error
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Skipped => f.write_str("skipped"),
            Status::Failed => f.write_str("failed"),
        }
    }
}

/// Serializable form of a [`StepError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StepError> for ReportError {
    fn from(err: &StepError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result record of a step or workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Id of the step or workflow
    pub id: String,

    pub status: Status,

    /// Present iff `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,

    /// Child reports in execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_reports: Vec<Report>,

    /// Present only when rollback was invoked for this runnable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Box<Report>>,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,
}

impl Report {
    fn new(id: impl Into<String>, status: Status) -> Self {
        Self {
            id: id.into(),
            status,
            error: None,
            metadata: Metadata::new(),
            step_reports: Vec::new(),
            rollback: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn success(id: impl Into<String>) -> Self {
        Self::new(id, Status::Success)
    }

    pub fn skipped(id: impl Into<String>) -> Self {
        Self::new(id, Status::Skipped)
    }

    pub fn failed(id: impl Into<String>, error: &StepError) -> Self {
        let mut report = Self::new(id, Status::Failed);
        report.error = Some(error.into());
        report
    }

    /// Aggregate child execution reports.
    ///
    /// Failed if any child failed (the first failure becomes the error),
    /// otherwise Success, even when every child was skipped.
    pub fn from_execution(id: impl Into<String>, children: Vec<Report>) -> Self {
        let first_error = children.iter().find_map(|r| r.error.clone());
        let mut report = match first_error {
            Some(error) => {
                let mut report = Self::new(id, Status::Failed);
                report.error = Some(error);
                report
            }
            None => Self::new(id, Status::Success),
        };
        report.step_reports = children;
        report
    }

    /// Aggregate child rollback reports.
    ///
    /// Failed if any child failed, Skipped if every child was skipped or
    /// there were no children, otherwise Success.
    pub fn from_rollback(id: impl Into<String>, children: Vec<Report>) -> Self {
        let first_error = children.iter().find_map(|r| r.error.clone());
        let mut report = if let Some(error) = first_error {
            let mut report = Self::new(id, Status::Failed);
            report.error = Some(error);
            report
        } else if children.iter().all(Report::is_skipped) {
            Self::new(id, Status::Skipped)
        } else {
            Self::new(id, Status::Success)
        };
        report.step_reports = children;
        report
    }

    /// Set the start timestamp and duration
    pub fn timed(mut self, started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        self.started_at = started_at;
        self.duration_ms = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_rollback(mut self, rollback: Report) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_skipped(&self) -> bool {
        self.status == Status::Skipped
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Find a descendant report by a `/`-separated path of ids, relative
    /// to this report
    pub fn find(&self, path: &str) -> Option<&Report> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |report, segment| {
                report.step_reports.iter().find(|child| child.id == segment)
            })
    }
}

//! Nodeforge Workflow Engine
//!
//! This crate provides the execution model used to provision a Kubernetes
//! host: atomic, reversible steps composed into ordered workflows that roll
//! back what they changed when a later step fails.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Workflow                           │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   Runnable = Step | Workflow (nested)       │    │
//! │  │   executed strictly in order                │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   StepHandler + StepState                   │    │
//! │  │   prepare | execute | rollback | hooks      │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   Report (status, error, metadata,          │    │
//! │  │   child reports, rollback report)           │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Concrete resources implement [`PairedResource`] and get the
//! detect → skip-or-act → flag → compensate behaviour from
//! [`PairedMutation`].
//!
//! # Example
//!
//! ```ignore
//! use nodeforge_workflow::{StepContext, Workflow};
//!
//! let mut workflow = Workflow::builder("setup-bind-mounts")
//!     .step(bind_mount_step("/etc/kubernetes"))
//!     .step(bind_mount_step("/var/lib/kubelet"))
//!     .build()?;
//!
//! let report = workflow.execute(&StepContext::new()).await;
//! if report.is_failed() {
//!     workflow.rollback(&StepContext::new()).await;
//! }
//! ```

pub mod context;
pub mod error;
pub mod events;
pub mod poller;
pub mod protocol;
pub mod report;
pub mod state;
pub mod step;
pub mod store;
pub mod workflow;

pub use context::*;
pub use error::*;
pub use events::*;
pub use poller::*;
pub use protocol::*;
pub use report::*;
pub use state::*;
pub use step::*;
pub use store::*;
pub use workflow::*;

pub use tokio_util::sync::CancellationToken;

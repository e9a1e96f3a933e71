//! Nodeforge provisioning steps
//!
//! Concrete [`PairedResource`](nodeforge_workflow::PairedResource)
//! implementations for everything a Kubernetes host needs, and the
//! workflows that put them in order.
//!
//! ```text
//! setup-all
//! ├── setup-kernel-modules   overlay, br_netfilter
//! ├── disable-swap           swap
//! ├── setup-bind-mounts      etc-kubernetes, var-lib-kubelet, var-run-cilium
//! ├── setup-kubelet          install, configure, enable
//! ├── setup-kubeadm          download, install, reset, download-config,
//! │                          configure
//! └── setup-alloy-stack
//!     ├── install-external-secrets
//!     ├── install-prometheus-crds   chart, wait-crds
//!     └── install-alloy             namespace, node-exporter, secret,
//!                                   config, chart, waits
//! ```
//!
//! # Example
//!
//! ```ignore
//! use nodeforge_steps::{workflows, NodeConfig, ProvisionContext};
//! use nodeforge_workflow::StepContext;
//!
//! let ctx = ProvisionContext::linux(NodeConfig::load(None).await?);
//! let mut workflow = workflows::kubelet(&ctx)?;
//! let report = workflow.execute(&StepContext::new()).await;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod steps;
pub mod workflows;

pub use config::{ConfigError, NodeConfig};
pub use context::ProvisionContext;
pub use error::{classify, HostResultExt};
pub use steps::Package;

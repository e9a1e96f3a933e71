//! Nodeforge host bindings
//!
//! Capability traits for everything a provisioning step touches outside the
//! process, each with a command-backed implementation and an in-memory fake:
//!
//! - [`SystemManager`]: systemd units, kernel modules, mounts, swap
//! - [`KubeClient`]: manifests, CRDs, pod readiness
//! - [`HelmClient`]: repositories and releases
//! - [`Installer`] / [`Configurable`]: software packages and their config
//!
//! All blocking calls take a [`CancellationToken`] and return
//! [`HostError::Cancelled`] promptly once it fires.

pub mod command;
pub mod error;
pub mod fake;
pub mod fstab;
pub mod helm;
pub mod installer;
pub mod kube;
pub mod system;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use error::{HostError, Result};
pub use fake::{FakeHelm, FakeInstaller, FakeKube, FakeRunner, FakeSystem};
pub use fstab::{Fstab, FstabEntry};
pub use helm::{ChartSpec, HelmCli, HelmClient, ReleaseInfo};
pub use installer::{sha256_hex, ConfigFile, Configurable, Installer, ReleaseBinary};
pub use kube::{KubeClient, KubectlClient, PodInfo};
pub use system::{LinuxSystem, SystemManager};

pub use tokio_util::sync::CancellationToken;

//! OS bindings: systemd, kernel modules, mounts and swap

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{HostError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Operations on the local operating system
#[async_trait]
pub trait SystemManager: Send + Sync {
    async fn enable_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()>;
    async fn disable_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()>;
    async fn start_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()>;
    async fn stop_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()>;
    async fn restart_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()>;
    async fn is_service_enabled(&self, cancel: &CancellationToken, unit: &str) -> Result<bool>;
    async fn is_service_running(&self, cancel: &CancellationToken, unit: &str) -> Result<bool>;
    async fn daemon_reload(&self, cancel: &CancellationToken) -> Result<()>;

    async fn is_module_loaded(&self, cancel: &CancellationToken, module: &str) -> Result<bool>;
    async fn load_module(&self, cancel: &CancellationToken, module: &str) -> Result<()>;
    async fn unload_module(&self, cancel: &CancellationToken, module: &str) -> Result<()>;

    async fn is_mounted(&self, cancel: &CancellationToken, target: &Path) -> Result<bool>;
    async fn bind_mount(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        target: &Path,
    ) -> Result<()>;
    async fn unmount(&self, cancel: &CancellationToken, target: &Path) -> Result<()>;

    async fn swap_active(&self, cancel: &CancellationToken) -> Result<bool>;
    async fn swap_off(&self, cancel: &CancellationToken) -> Result<()>;
    async fn swap_on(&self, cancel: &CancellationToken) -> Result<()>;
}

/// [`SystemManager`] for a systemd-based Linux host
///
/// State queries read `/proc` directly; mutations go through
/// systemctl, modprobe, mount and swapon/swapoff.
pub struct LinuxSystem {
    runner: Arc<dyn CommandRunner>,
    proc_root: PathBuf,
}

impl LinuxSystem {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Read kernel state from somewhere other than `/proc`
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    async fn read_proc(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| HostError::io(path, e))
    }

    async fn systemctl(&self, cancel: &CancellationToken, args: &[&str]) -> Result<()> {
        self.runner
            .run_checked(cancel, &CommandSpec::new("systemctl").args(args.iter().copied()))
            .await
            .map(|_| ())
    }

    async fn systemctl_probe(&self, cancel: &CancellationToken, args: &[&str]) -> Result<bool> {
        let output = self
            .runner
            .run(cancel, &CommandSpec::new("systemctl").args(args.iter().copied()))
            .await?;
        Ok(output.success())
    }
}

/// Kernel names modules with underscores in /proc/modules, while
/// modprobe accepts either separator
fn normalize_module(module: &str) -> String {
    module.replace('-', "_")
}

/// Decode the octal escapes the kernel uses for whitespace in mount paths
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[async_trait]
impl SystemManager for LinuxSystem {
    async fn enable_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        info!(unit, "Enabling service");
        self.systemctl(cancel, &["enable", unit]).await
    }

    async fn disable_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        info!(unit, "Disabling service");
        self.systemctl(cancel, &["disable", unit]).await
    }

    async fn start_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        info!(unit, "Starting service");
        self.systemctl(cancel, &["start", unit]).await
    }

    async fn stop_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        info!(unit, "Stopping service");
        self.systemctl(cancel, &["stop", unit]).await
    }

    async fn restart_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        info!(unit, "Restarting service");
        self.systemctl(cancel, &["restart", unit]).await
    }

    async fn is_service_enabled(&self, cancel: &CancellationToken, unit: &str) -> Result<bool> {
        self.systemctl_probe(cancel, &["is-enabled", "--quiet", unit])
            .await
    }

    async fn is_service_running(&self, cancel: &CancellationToken, unit: &str) -> Result<bool> {
        self.systemctl_probe(cancel, &["is-active", "--quiet", unit])
            .await
    }

    async fn daemon_reload(&self, cancel: &CancellationToken) -> Result<()> {
        self.systemctl(cancel, &["daemon-reload"]).await
    }

    async fn is_module_loaded(&self, _cancel: &CancellationToken, module: &str) -> Result<bool> {
        let modules = self.read_proc("modules").await?;
        let wanted = normalize_module(module);
        Ok(modules
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|name| name == wanted))
    }

    async fn load_module(&self, cancel: &CancellationToken, module: &str) -> Result<()> {
        info!(module, "Loading kernel module");
        self.runner
            .run_checked(cancel, &CommandSpec::new("modprobe").arg(module))
            .await
            .map(|_| ())
    }

    async fn unload_module(&self, cancel: &CancellationToken, module: &str) -> Result<()> {
        info!(module, "Unloading kernel module");
        self.runner
            .run_checked(cancel, &CommandSpec::new("modprobe").args(["-r", module]))
            .await
            .map(|_| ())
    }

    async fn is_mounted(&self, _cancel: &CancellationToken, target: &Path) -> Result<bool> {
        let mountinfo = self.read_proc("self/mountinfo").await?;
        // field 5 is the mount point
        Ok(mountinfo
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4))
            .any(|mount_point| Path::new(&unescape_mount_path(mount_point)) == target))
    }

    async fn bind_mount(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        target: &Path,
    ) -> Result<()> {
        for dir in [source, target] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| HostError::io(dir, e))?;
        }
        info!(source = %source.display(), target = %target.display(), "Bind mounting");
        self.runner
            .run_checked(
                cancel,
                &CommandSpec::new("mount").args([
                    "--bind".to_string(),
                    source.display().to_string(),
                    target.display().to_string(),
                ]),
            )
            .await
            .map(|_| ())
    }

    async fn unmount(&self, cancel: &CancellationToken, target: &Path) -> Result<()> {
        info!(target = %target.display(), "Unmounting");
        self.runner
            .run_checked(
                cancel,
                &CommandSpec::new("umount").arg(target.display().to_string()),
            )
            .await
            .map(|_| ())
    }

    async fn swap_active(&self, _cancel: &CancellationToken) -> Result<bool> {
        let swaps = self.read_proc("swaps").await?;
        // first line is the header
        let active = swaps.lines().skip(1).any(|line| !line.trim().is_empty());
        debug!(active, "Checked swap");
        Ok(active)
    }

    async fn swap_off(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Disabling swap");
        self.runner
            .run_checked(cancel, &CommandSpec::new("swapoff").arg("-a"))
            .await
            .map(|_| ())
    }

    async fn swap_on(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Enabling swap");
        self.runner
            .run_checked(cancel, &CommandSpec::new("swapon").arg("-a"))
            .await
            .map(|_| ())
    }
}

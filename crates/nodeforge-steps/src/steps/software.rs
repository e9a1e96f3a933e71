//! Software package installation
//!
//! `(installed, configured)`. Installing runs download, install and cleanup
//! as one unit; if install fails after the download, the leftover artifact
//! is cleaned up on rollback, and if cleanup fails after the install, the
//! package is uninstalled as well. Configured compares content, so a drifted
//! configuration on an installed package is rewritten.
//!
//! [`PackageDownload`] fetches the artifact as a step of its own, for
//! workflows that list download and install separately.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::{Configurable, Installer};
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Metadata, Observation, Outcome, PairedResource, Result,
    StepContext, StepHandler, StepState,
};
use std::sync::Arc;
use tracing::info;

const DOWNLOADED_BY_THIS_STEP: &str = "downloadedByThisStep";
/// Set between a successful install and the end of `apply_first`
const INSTALLED_PENDING_CLEANUP: &str = "installedPendingCleanup";

/// An installable package with configuration of its own
pub trait Package: Installer + Configurable {}

impl<T: Installer + Configurable> Package for T {}

pub struct SoftwarePackage {
    package: Arc<dyn Package>,
    download: bool,
}

impl SoftwarePackage {
    pub fn new(package: Arc<dyn Package>) -> Self {
        Self {
            package,
            download: true,
        }
    }

    /// Install from an artifact fetched by an earlier [`PackageDownload`]
    pub fn predownloaded(mut self) -> Self {
        self.download = false;
        self
    }
}

#[async_trait]
impl PairedResource for SoftwarePackage {
    fn describe(&self) -> String {
        format!("package {}", self.package.name())
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Installed"), Axis::new("Configured"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let cancel = ctx.cancellation();
        let installed = self
            .package
            .is_installed(cancel)
            .await
            .kind(ErrorKind::IllegalState)?;
        let configured = self
            .package
            .is_configured(cancel)
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(Observation::new(installed, configured))
    }

    async fn apply_first(&self, ctx: &StepContext, state: &mut StepState) -> Result<()> {
        let cancel = ctx.cancellation();
        if self.download {
            self.package
                .download(cancel)
                .await
                .kind(ErrorKind::Download)?;
            state.set(DOWNLOADED_BY_THIS_STEP, true);
        }

        self.package
            .install(cancel)
            .await
            .kind(ErrorKind::Installation)?;
        state.set(INSTALLED_PENDING_CLEANUP, true);
        self.package
            .cleanup(cancel)
            .await
            .kind(ErrorKind::Cleanup)?;
        state.remove(DOWNLOADED_BY_THIS_STEP);
        state.remove(INSTALLED_PENDING_CLEANUP);
        Ok(())
    }

    async fn apply_second(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.package
            .configure(ctx.cancellation())
            .await
            .kind(ErrorKind::Configuration)
    }

    async fn revert_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        self.package
            .uninstall(ctx.cancellation())
            .await
            .kind(ErrorKind::Installation)?;
        Ok(Compensation::Reverted)
    }

    async fn revert_second(
        &self,
        ctx: &StepContext,
        _state: &mut StepState,
    ) -> Result<Compensation> {
        self.package
            .remove_configuration(ctx.cancellation())
            .await
            .kind(ErrorKind::Configuration)?;
        Ok(Compensation::Reverted)
    }

    async fn compensate_partial(&self, ctx: &StepContext, state: &mut StepState) -> Result<bool> {
        let cancel = ctx.cancellation();
        let mut undone = false;
        if state.flag(INSTALLED_PENDING_CLEANUP) {
            self.package
                .uninstall(cancel)
                .await
                .kind(ErrorKind::Installation)?;
            state.remove(INSTALLED_PENDING_CLEANUP);
            info!(package = self.package.name(), "Uninstalled after failed cleanup");
            undone = true;
        }
        if state.flag(DOWNLOADED_BY_THIS_STEP) {
            self.package
                .cleanup(cancel)
                .await
                .kind(ErrorKind::Cleanup)?;
            state.remove(DOWNLOADED_BY_THIS_STEP);
            info!(package = self.package.name(), "Removed leftover download");
            undone = true;
        }
        Ok(undone)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("package".to_string(), self.package.name().to_string());
    }
}

/// Fetch a package's artifact unless the package is already installed.
/// Rollback removes the artifact if this step fetched it.
pub struct PackageDownload {
    package: Arc<dyn Package>,
}

impl PackageDownload {
    pub fn new(package: Arc<dyn Package>) -> Self {
        Self { package }
    }
}

#[async_trait]
impl StepHandler for PackageDownload {
    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        metadata.insert("package".to_string(), self.package.name().to_string());
        let cancel = ctx.cancellation();
        let installed = self
            .package
            .is_installed(cancel)
            .await
            .kind(ErrorKind::IllegalState)?;
        metadata.insert("alreadyInstalled".to_string(), installed.to_string());
        if installed {
            return Ok(Outcome::Unchanged);
        }

        self.package
            .download(cancel)
            .await
            .kind(ErrorKind::Download)?;
        state.set(DOWNLOADED_BY_THIS_STEP, true);
        metadata.insert(DOWNLOADED_BY_THIS_STEP.to_string(), "true".to_string());
        Ok(Outcome::Changed)
    }

    async fn rollback(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        _metadata: &mut Metadata,
    ) -> Result<Outcome> {
        if !state.flag(DOWNLOADED_BY_THIS_STEP) {
            return Ok(Outcome::Unchanged);
        }
        self.package
            .cleanup(ctx.cancellation())
            .await
            .kind(ErrorKind::Cleanup)?;
        state.remove(DOWNLOADED_BY_THIS_STEP);
        Ok(Outcome::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_host::FakeInstaller;
    use nodeforge_workflow::{paired_step, Step};

    #[tokio::test]
    async fn test_fresh_install_and_rollback() {
        let kubelet = Arc::new(FakeInstaller::new("kubelet"));
        let mut step = paired_step("install-kubelet", SoftwarePackage::new(kubelet.clone())).unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert!(report.is_success());
        assert!(kubelet.installed() && kubelet.configured());
        assert!(!kubelet.downloaded());
        assert!(!step.state().contains(DOWNLOADED_BY_THIS_STEP));

        assert!(step.rollback(&ctx).await.is_success());
        assert!(!kubelet.installed() && !kubelet.configured());
        assert_eq!(
            kubelet.journal(),
            vec![
                "download kubelet",
                "install kubelet",
                "cleanup kubelet",
                "configure kubelet",
                "remove_configuration kubelet",
                "uninstall kubelet",
            ]
        );
    }

    #[tokio::test]
    async fn test_drifted_configuration_is_rewritten() {
        let kubelet = Arc::new(
            FakeInstaller::new("kubelet")
                .with_installed(true)
                .with_configured(true),
        );
        kubelet.drift();
        let mut step = paired_step("install-kubelet", SoftwarePackage::new(kubelet.clone())).unwrap();

        let report = step.execute(&StepContext::new()).await;
        assert!(report.is_success());
        assert_eq!(report.metadata["alreadyInstalled"], "true");
        assert_eq!(report.metadata["configuredByThisStep"], "true");
        assert_eq!(kubelet.journal(), vec!["configure kubelet"]);
    }

    #[tokio::test]
    async fn test_failed_install_cleans_download_on_rollback() {
        let kubeadm = Arc::new(FakeInstaller::new("kubeadm"));
        kubeadm.fail_on("install");
        let mut step = paired_step("install-kubeadm", SoftwarePackage::new(kubeadm.clone())).unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Installation));
        assert!(kubeadm.downloaded());
        assert!(!step.state().contains("installedByThisStep"));

        let rollback = step.rollback(&ctx).await;
        assert!(rollback.is_success());
        assert_eq!(rollback.metadata["partialCompensated"], "true");
        assert!(!kubeadm.downloaded());
    }

    #[tokio::test]
    async fn test_failed_cleanup_uninstalls_on_rollback() {
        let kubelet = Arc::new(FakeInstaller::new("kubelet"));
        kubelet.fail_on("cleanup");
        let mut step = paired_step("install-kubelet", SoftwarePackage::new(kubelet.clone())).unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Cleanup));
        assert!(kubelet.installed() && kubelet.downloaded());
        assert!(step.state().flag(INSTALLED_PENDING_CLEANUP));

        kubelet.clear_failures();
        let rollback = step.rollback(&ctx).await;
        assert!(rollback.is_success());
        assert_eq!(rollback.metadata["partialCompensated"], "true");
        assert!(!kubelet.installed() && !kubelet.downloaded());
        assert_eq!(
            kubelet.journal(),
            vec![
                "download kubelet",
                "install kubelet",
                "uninstall kubelet",
                "cleanup kubelet",
            ]
        );
        assert!(step.rollback(&ctx).await.is_skipped());
    }

    #[tokio::test]
    async fn test_download_failure_kind() {
        let kubeadm = Arc::new(FakeInstaller::new("kubeadm"));
        kubeadm.fail_on("download");
        let mut step = paired_step("install-kubeadm", SoftwarePackage::new(kubeadm.clone())).unwrap();

        let report = step.execute(&StepContext::new()).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Download));
        assert!(step.rollback(&StepContext::new()).await.is_skipped());
    }

    #[tokio::test]
    async fn test_separate_download_then_install() {
        let kubeadm = Arc::new(FakeInstaller::new("kubeadm"));
        let ctx = StepContext::new();
        let mut download = Step::builder("download-kubeadm")
            .handler(PackageDownload::new(kubeadm.clone()))
            .build()
            .unwrap();
        let mut install = paired_step(
            "install-kubeadm",
            SoftwarePackage::new(kubeadm.clone()).predownloaded(),
        )
        .unwrap();

        assert!(download.execute(&ctx).await.is_success());
        assert!(kubeadm.downloaded());
        assert!(install.execute(&ctx).await.is_success());
        assert!(kubeadm.installed() && !kubeadm.downloaded());

        assert!(install.rollback(&ctx).await.is_success());
        assert!(download.rollback(&ctx).await.is_success());
        assert!(download.rollback(&ctx).await.is_skipped());
        assert_eq!(
            kubeadm.journal(),
            vec![
                "download kubeadm",
                "install kubeadm",
                "cleanup kubeadm",
                "configure kubeadm",
                "remove_configuration kubeadm",
                "uninstall kubeadm",
                "cleanup kubeadm",
            ]
        );
    }

    #[tokio::test]
    async fn test_download_skipped_when_installed() {
        let kubeadm = Arc::new(FakeInstaller::new("kubeadm").with_installed(true));
        let mut download = Step::builder("download-kubeadm")
            .handler(PackageDownload::new(kubeadm.clone()))
            .build()
            .unwrap();
        let report = download.execute(&StepContext::new()).await;
        assert!(report.is_skipped());
        assert_eq!(report.metadata["alreadyInstalled"], "true");
        assert!(kubeadm.journal().is_empty());
    }
}

//! Reset of prior kubeadm state
//!
//! Runs on every execution: it wipes whatever a previous (possibly failed)
//! run left behind, so it has no already-done branch and nothing to roll
//! back.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::{CommandRunner, CommandSpec};
use nodeforge_workflow::{
    ErrorKind, Metadata, Outcome, Result, StepContext, StepError, StepHandler, StepState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct KubeadmReset {
    runner: Arc<dyn CommandRunner>,
    kubeadm: PathBuf,
    /// Files removed after the reset, e.g. the staged configuration
    stale_files: Vec<PathBuf>,
}

impl KubeadmReset {
    pub fn new(runner: Arc<dyn CommandRunner>, kubeadm: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            kubeadm: kubeadm.into(),
            stale_files: Vec::new(),
        }
    }

    pub fn remove(mut self, path: impl Into<PathBuf>) -> Self {
        self.stale_files.push(path.into());
        self
    }
}

#[async_trait]
impl StepHandler for KubeadmReset {
    async fn execute(
        &self,
        ctx: &StepContext,
        _state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        let spec = CommandSpec::new(self.kubeadm.display().to_string())
            .args(["reset", "--force"]);
        self.runner
            .run_checked(ctx.cancellation(), &spec)
            .await
            .kind(ErrorKind::Cleanup)?;

        let mut removed = 0;
        for path in &self.stale_files {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StepError::Cleanup(format!("{}: {}", path.display(), e)));
                }
            }
        }
        metadata.insert("staleFilesRemoved".to_string(), removed.to_string());
        info!(removed, "Reset prior kubeadm state");
        Ok(Outcome::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_host::FakeRunner;
    use nodeforge_workflow::Step;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_runs_every_time_and_never_rolls_back() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("kubeadm-config.yaml.latest");
        std::fs::write(&staged, "corrupted").unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = StepContext::new();

        for expected_removed in ["1", "0"] {
            let mut step = Step::builder("reset-prior-state")
                .handler(KubeadmReset::new(runner.clone(), "/usr/local/bin/kubeadm").remove(&staged))
                .build()
                .unwrap();
            let report = step.execute(&ctx).await;
            assert!(report.is_success());
            assert_eq!(report.metadata["staleFilesRemoved"], expected_removed);
            assert!(step.rollback(&ctx).await.is_skipped());
        }
        assert!(!staged.exists());
        assert_eq!(
            runner.journal(),
            vec![
                "/usr/local/bin/kubeadm reset --force",
                "/usr/local/bin/kubeadm reset --force"
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_failure_is_cleanup_error() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail_on("kubeadm");
        let mut step = Step::builder("reset-prior-state")
            .handler(KubeadmReset::new(runner, "kubeadm"))
            .build()
            .unwrap();
        let report = step.execute(&StepContext::new()).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Cleanup));
    }
}

//! Persistent bind mounts
//!
//! `(mounted, inFstab)` for a target directory backed by a source directory
//! under the configured mount root. Directories created for the mount are
//! removed again on rollback as long as they are empty.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::{Fstab, FstabEntry, SystemManager};
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Metadata, Observation, PairedResource, Result, StepContext,
    StepError, StepState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Directories this step created, outermost first per path
const CREATED_DIRS: &str = "createdDirs";

pub struct BindMount {
    system: Arc<dyn SystemManager>,
    fstab: Fstab,
    source: PathBuf,
    target: PathBuf,
}

impl BindMount {
    pub fn new(
        system: Arc<dyn SystemManager>,
        fstab: Fstab,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            system,
            fstab,
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// Create `path` and its missing parents, returning the ones that did not
/// exist yet, outermost first
async fn ensure_dir(path: &Path) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for dir in path.ancestors() {
        if dir.as_os_str().is_empty() || tokio::fs::try_exists(dir).await.unwrap_or(false) {
            break;
        }
        missing.push(dir.display().to_string());
    }
    missing.reverse();
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| StepError::Installation(format!("{}: {}", path.display(), e)))?;
    Ok(missing)
}

/// Remove the directories recorded in `state`, innermost first. Anything
/// no longer empty stays.
async fn remove_created_dirs(state: &mut StepState) -> bool {
    let Some(dirs) = state.get_as::<Vec<PathBuf>>(CREATED_DIRS) else {
        return false;
    };
    state.remove(CREATED_DIRS);
    let mut removed = false;
    for dir in dirs.iter().rev() {
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(dir = %dir.display(), error = %e, "Leaving directory in place"),
        }
    }
    removed
}

#[async_trait]
impl PairedResource for BindMount {
    fn describe(&self) -> String {
        format!("bind mount {}", self.target.display())
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Mounted"), Axis::new("InFstab"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let mounted = self
            .system
            .is_mounted(ctx.cancellation(), &self.target)
            .await
            .kind(ErrorKind::IllegalState)?;
        let in_fstab = self
            .fstab
            .has_mount_point(&self.target)
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(Observation::new(mounted, in_fstab))
    }

    async fn apply_first(&self, ctx: &StepContext, state: &mut StepState) -> Result<()> {
        let mut created = ensure_dir(&self.source).await?;
        state.set(CREATED_DIRS, created.clone());
        created.extend(ensure_dir(&self.target).await?);
        state.set(CREATED_DIRS, created);
        self.system
            .bind_mount(ctx.cancellation(), &self.source, &self.target)
            .await
            .kind(ErrorKind::Installation)
    }

    async fn apply_second(&self, _ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.fstab
            .add_entry(&FstabEntry::bind(&self.source, &self.target))
            .await
            .kind(ErrorKind::Configuration)
    }

    async fn revert_first(&self, ctx: &StepContext, state: &mut StepState) -> Result<Compensation> {
        self.system
            .unmount(ctx.cancellation(), &self.target)
            .await
            .kind(ErrorKind::Installation)?;
        remove_created_dirs(state).await;
        Ok(Compensation::Reverted)
    }

    async fn revert_second(
        &self,
        _ctx: &StepContext,
        _state: &mut StepState,
    ) -> Result<Compensation> {
        self.fstab
            .remove_mount_point(&self.target)
            .await
            .kind(ErrorKind::Configuration)?;
        Ok(Compensation::Reverted)
    }

    async fn compensate_partial(&self, _ctx: &StepContext, state: &mut StepState) -> Result<bool> {
        Ok(remove_created_dirs(state).await)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("source".to_string(), self.source.display().to_string());
        metadata.insert("target".to_string(), self.target.display().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_host::FakeSystem;
    use nodeforge_workflow::paired_step;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rollback_removes_created_dirs() {
        let dir = tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(&fstab, "").unwrap();
        std::fs::create_dir_all(dir.path().join("var/lib")).unwrap();
        let source = dir.path().join("mounts/var/lib/kubelet");
        let target = dir.path().join("var/lib/kubelet");
        let system = Arc::new(FakeSystem::new());
        let mut step = paired_step(
            "var-lib-kubelet",
            BindMount::new(system.clone(), Fstab::new(&fstab), &source, &target),
        )
        .unwrap();
        let ctx = StepContext::new();

        assert!(step.execute(&ctx).await.is_success());
        assert!(source.is_dir() && target.is_dir());

        assert!(step.rollback(&ctx).await.is_success());
        assert!(!target.exists());
        assert!(!dir.path().join("mounts").exists());
        assert!(dir.path().join("var/lib").is_dir());
        assert!(!system.mounted(&target));
    }

    #[tokio::test]
    async fn test_rollback_keeps_dirs_with_content() {
        let dir = tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(&fstab, "").unwrap();
        let source = dir.path().join("mounts/etc/kubernetes");
        let target = dir.path().join("etc/kubernetes");
        let mut step = paired_step(
            "etc-kubernetes",
            BindMount::new(Arc::new(FakeSystem::new()), Fstab::new(&fstab), &source, &target),
        )
        .unwrap();
        let ctx = StepContext::new();

        assert!(step.execute(&ctx).await.is_success());
        std::fs::write(source.join("admin.conf"), "apiVersion: v1\n").unwrap();

        assert!(step.rollback(&ctx).await.is_success());
        assert!(source.join("admin.conf").exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_failed_mount_removes_created_dirs() {
        let dir = tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(&fstab, "").unwrap();
        let source = dir.path().join("mounts/var/run/cilium");
        let target = dir.path().join("var/run/cilium");
        let system = Arc::new(FakeSystem::new());
        system.fail_on("bind_mount");
        let mut step = paired_step(
            "var-run-cilium",
            BindMount::new(system.clone(), Fstab::new(&fstab), &source, &target),
        )
        .unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Installation));
        assert!(target.is_dir());

        let rollback = step.rollback(&ctx).await;
        assert!(rollback.is_success());
        assert_eq!(rollback.metadata["partialCompensated"], "true");
        assert!(!dir.path().join("mounts").exists());
        assert!(!dir.path().join("var").exists());
    }
}

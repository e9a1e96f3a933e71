//! Rendered configuration files
//!
//! `(present, current)`: current means the file's SHA-256 matches the
//! rendered content. Overwriting a stale file keeps its previous content in
//! the step state, so rollback puts it back byte for byte.

use async_trait::async_trait;
use nodeforge_host::sha256_hex;
use nodeforge_workflow::{
    Axis, Compensation, Metadata, Observation, PairedResource, Result, StepContext, StepError,
    StepState,
};
use std::path::{Path, PathBuf};
use tokio::fs;

const PREVIOUS_CONTENT: &str = "previousContent";

pub struct RenderedFile {
    path: PathBuf,
    content: String,
}

impl RenderedFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, e: std::io::Error) -> StepError {
        StepError::Configuration(format!("{}: {}", self.path.display(), e))
    }

    async fn write(&self, content: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| self.error(e))?;
        }
        fs::write(&self.path, content)
            .await
            .map_err(|e| self.error(e))
    }
}

#[async_trait]
impl PairedResource for RenderedFile {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Present"), Axis::new("Current"))
    }

    async fn observe(&self, _ctx: &StepContext) -> Result<Observation> {
        match fs::read(&self.path).await {
            Ok(on_disk) => Ok(Observation::new(
                true,
                sha256_hex(&on_disk) == sha256_hex(self.content.as_bytes()),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Observation::default()),
            Err(e) => Err(self.error(e)),
        }
    }

    async fn apply_first(&self, _ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.write(&self.content).await
    }

    async fn apply_second(&self, _ctx: &StepContext, state: &mut StepState) -> Result<()> {
        let previous = fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.error(e))?;
        state.set(PREVIOUS_CONTENT, previous);
        self.write(&self.content).await
    }

    async fn revert_first(&self, _ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(Compensation::Reverted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Compensation::Reverted),
            Err(e) => Err(self.error(e)),
        }
    }

    async fn revert_second(&self, _ctx: &StepContext, state: &mut StepState) -> Result<Compensation> {
        let Some(previous) = state.get_as::<String>(PREVIOUS_CONTENT) else {
            return Err(StepError::IllegalState(format!(
                "no previous content recorded for {}",
                self.path.display()
            )));
        };
        self.write(&previous).await?;
        state.remove(PREVIOUS_CONTENT);
        Ok(Compensation::Reverted)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("path".to_string(), self.path.display().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_workflow::paired_step;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_stale_file_restored_on_rollback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("var/lib/kubelet/config.yaml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "cgroupDriver: cgroupfs\n").unwrap();

        let mut step =
            paired_step("configure-kubelet", RenderedFile::new(&path, "cgroupDriver: systemd\n"))
                .unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert!(report.is_success());
        assert_eq!(report.metadata["alreadyPresent"], "true");
        assert_eq!(report.metadata["currentByThisStep"], "true");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cgroupDriver: systemd\n");

        assert!(step.rollback(&ctx).await.is_success());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cgroupDriver: cgroupfs\n");
    }

    #[tokio::test]
    async fn test_new_file_removed_on_rollback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kubeadm-config.yaml");
        let mut step = paired_step("download-config", RenderedFile::new(&path, "kind: x\n")).unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert_eq!(report.metadata["presentByThisStep"], "true");
        assert!(!report.metadata.contains_key("currentByThisStep"));

        assert!(step.rollback(&ctx).await.is_success());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_current_file_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "a: b\n").unwrap();
        let mut step = paired_step("configure", RenderedFile::new(&path, "a: b\n")).unwrap();
        assert!(step.execute(&StepContext::new()).await.is_skipped());
    }
}

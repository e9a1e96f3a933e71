//! Kernel module loading and persistence
//!
//! `(loaded, persisted)`: loaded is read from the running kernel, persisted
//! means `<modules-load.d>/<module>.conf` names the module. Other lines in
//! that file are left alone.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::SystemManager;
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Metadata, Observation, PairedResource, Result, StepContext,
    StepError, StepState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

const CONF_CREATED: &str = "confCreatedByThisStep";

pub struct KernelModule {
    system: Arc<dyn SystemManager>,
    module: String,
    conf_path: PathBuf,
}

impl KernelModule {
    pub fn new(system: Arc<dyn SystemManager>, module: impl Into<String>, load_dir: &Path) -> Self {
        let module = module.into();
        Self {
            system,
            conf_path: load_dir.join(format!("{}.conf", module)),
            module,
        }
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    async fn read_conf(&self) -> std::io::Result<Option<String>> {
        match fs::read_to_string(&self.conf_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn names_module(&self, line: &str) -> bool {
        line.trim() == self.module
    }

    async fn is_persisted(&self) -> Result<bool> {
        let content = self.read_conf().await.map_err(|e| {
            StepError::IllegalState(format!("cannot read {}: {}", self.conf_path.display(), e))
        })?;
        Ok(content.is_some_and(|c| c.lines().any(|line| self.names_module(line))))
    }

    fn configuration_error(&self, e: std::io::Error) -> StepError {
        StepError::Configuration(format!("{}: {}", self.conf_path.display(), e))
    }
}

#[async_trait]
impl PairedResource for KernelModule {
    fn describe(&self) -> String {
        format!("kernel module {}", self.module)
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Loaded"), Axis::new("Persisted"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let loaded = self
            .system
            .is_module_loaded(ctx.cancellation(), &self.module)
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(Observation::new(loaded, self.is_persisted().await?))
    }

    async fn apply_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.system
            .load_module(ctx.cancellation(), &self.module)
            .await
            .kind(ErrorKind::Installation)
    }

    async fn apply_second(&self, _ctx: &StepContext, state: &mut StepState) -> Result<()> {
        if let Some(dir) = self.conf_path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| self.configuration_error(e))?;
        }
        let existing = self
            .read_conf()
            .await
            .map_err(|e| self.configuration_error(e))?;
        state.set(CONF_CREATED, existing.is_none());

        let mut content = existing.unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&self.module);
        content.push('\n');
        fs::write(&self.conf_path, content)
            .await
            .map_err(|e| self.configuration_error(e))
    }

    async fn revert_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        self.system
            .unload_module(ctx.cancellation(), &self.module)
            .await
            .kind(ErrorKind::Installation)?;
        Ok(Compensation::Reverted)
    }

    async fn revert_second(
        &self,
        _ctx: &StepContext,
        state: &mut StepState,
    ) -> Result<Compensation> {
        let created = state
            .remove(CONF_CREATED)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let Some(content) = self
            .read_conf()
            .await
            .map_err(|e| self.configuration_error(e))?
        else {
            return Ok(Compensation::Reverted);
        };

        let kept: Vec<&str> = content
            .lines()
            .filter(|line| !self.names_module(line))
            .collect();
        if created && kept.iter().all(|line| line.trim().is_empty()) {
            match fs::remove_file(&self.conf_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.configuration_error(e)),
            }
        } else {
            let mut rest = kept.join("\n");
            if !rest.is_empty() {
                rest.push('\n');
            }
            fs::write(&self.conf_path, rest)
                .await
                .map_err(|e| self.configuration_error(e))?;
        }
        Ok(Compensation::Reverted)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("module".to_string(), self.module.clone());
    }
}

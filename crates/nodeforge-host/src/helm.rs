//! Helm client bindings

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{HostError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An installed release as reported by `helm list`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    /// `<chart>-<version>`, e.g. `alloy-0.9.2`
    pub chart: String,
    #[serde(default)]
    pub app_version: String,
    pub status: String,
}

/// A chart to install or upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub release: String,
    pub namespace: String,
    /// Repository alias, e.g. `grafana`
    pub repo_name: String,
    pub repo_url: String,
    /// Chart name inside the repository, e.g. `alloy`
    pub chart: String,
    pub version: String,
    /// Values document passed to `--values`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
}

impl ChartSpec {
    /// The `chart` column `helm list` shows for this spec
    pub fn chart_label(&self) -> String {
        format!("{}-{}", self.chart, self.version)
    }

    /// Whether an installed release already matches this spec
    pub fn is_satisfied_by(&self, release: &ReleaseInfo) -> bool {
        release.chart == self.chart_label() && release.status == "deployed"
    }
}

/// Operations against Helm
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// The installed release `name` in `namespace`, if any
    async fn release(
        &self,
        cancel: &CancellationToken,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ReleaseInfo>>;

    async fn add_repo(&self, cancel: &CancellationToken, name: &str, url: &str) -> Result<()>;

    /// Install the chart, or upgrade it when the release exists
    async fn deploy_chart(&self, cancel: &CancellationToken, chart: &ChartSpec) -> Result<()>;

    async fn uninstall_chart(
        &self,
        cancel: &CancellationToken,
        name: &str,
        namespace: &str,
    ) -> Result<()>;
}

/// [`HelmClient`] backed by the `helm` CLI
pub struct HelmCli {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: Option<PathBuf>,
    timeout: String,
}

impl HelmCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            kubeconfig: None,
            timeout: "10m".to_string(),
        }
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Timeout passed to `helm upgrade --wait`, in Helm duration syntax
    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = timeout.into();
        self
    }

    fn helm(&self) -> CommandSpec {
        let spec = CommandSpec::new("helm");
        match &self.kubeconfig {
            Some(path) => spec.arg(format!("--kubeconfig={}", path.display())),
            None => spec,
        }
    }
}

#[async_trait]
impl HelmClient for HelmCli {
    async fn release(
        &self,
        cancel: &CancellationToken,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ReleaseInfo>> {
        let spec = self.helm().args([
            "list".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "--filter".to_string(),
            format!("^{}$", name),
            "-o".to_string(),
            "json".to_string(),
        ]);
        let output = self.runner.run_checked(cancel, &spec).await?;
        let releases: Vec<ReleaseInfo> =
            serde_json::from_str(&output.stdout).map_err(|e| HostError::Parse {
                command: spec.to_string(),
                reason: e.to_string(),
            })?;
        debug!(release = name, found = releases.len(), "Queried release");
        Ok(releases.into_iter().find(|r| r.name == name))
    }

    async fn add_repo(&self, cancel: &CancellationToken, name: &str, url: &str) -> Result<()> {
        info!(repo = name, url, "Adding Helm repository");
        self.runner
            .run_checked(
                cancel,
                &self
                    .helm()
                    .args(["repo", "add", "--force-update", name, url]),
            )
            .await?;
        self.runner
            .run_checked(cancel, &self.helm().args(["repo", "update", name]))
            .await?;
        Ok(())
    }

    async fn deploy_chart(&self, cancel: &CancellationToken, chart: &ChartSpec) -> Result<()> {
        info!(
            release = %chart.release,
            chart = %chart.chart_label(),
            namespace = %chart.namespace,
            "Deploying Helm chart"
        );
        let mut spec = self.helm().args([
            "upgrade".to_string(),
            "--install".to_string(),
            chart.release.clone(),
            format!("{}/{}", chart.repo_name, chart.chart),
            "--version".to_string(),
            chart.version.clone(),
            "--namespace".to_string(),
            chart.namespace.clone(),
            "--create-namespace".to_string(),
            "--wait".to_string(),
            "--timeout".to_string(),
            self.timeout.clone(),
        ]);
        if let Some(values) = &chart.values {
            spec = spec.args(["--values", "-"]).stdin(values.clone());
        }
        self.runner.run_checked(cancel, &spec).await?;
        Ok(())
    }

    async fn uninstall_chart(
        &self,
        cancel: &CancellationToken,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        info!(release = name, namespace, "Uninstalling Helm release");
        self.runner
            .run_checked(
                cancel,
                &self
                    .helm()
                    .args(["uninstall", name, "--namespace", namespace, "--wait"]),
            )
            .await?;
        Ok(())
    }
}

//! Helm releases
//!
//! `(installed, upToDate)`. Only a fresh install is reversible: upgrading a
//! release that existed before the run is recorded but kept on rollback,
//! since uninstalling would destroy state the run did not create.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::{ChartSpec, HelmClient};
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Metadata, Observation, PairedResource, Result, StepContext,
    StepState,
};
use std::sync::Arc;
use tracing::warn;

const PREVIOUS_CHART: &str = "previousChart";

pub struct HelmRelease {
    helm: Arc<dyn HelmClient>,
    chart: ChartSpec,
}

impl HelmRelease {
    pub fn new(helm: Arc<dyn HelmClient>, chart: ChartSpec) -> Self {
        Self { helm, chart }
    }

    async fn deploy(&self, ctx: &StepContext) -> Result<()> {
        let cancel = ctx.cancellation();
        self.helm
            .add_repo(cancel, &self.chart.repo_name, &self.chart.repo_url)
            .await
            .kind(ErrorKind::Download)?;
        self.helm
            .deploy_chart(cancel, &self.chart)
            .await
            .kind(ErrorKind::Installation)
    }
}

#[async_trait]
impl PairedResource for HelmRelease {
    fn describe(&self) -> String {
        format!("release {}/{}", self.chart.namespace, self.chart.release)
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Installed"), Axis::new("UpToDate"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let release = self
            .helm
            .release(ctx.cancellation(), &self.chart.release, &self.chart.namespace)
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(match release {
            Some(release) => Observation::new(true, self.chart.is_satisfied_by(&release)),
            None => Observation::default(),
        })
    }

    async fn apply_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.deploy(ctx).await
    }

    async fn apply_second(&self, ctx: &StepContext, state: &mut StepState) -> Result<()> {
        let previous = self
            .helm
            .release(ctx.cancellation(), &self.chart.release, &self.chart.namespace)
            .await
            .kind(ErrorKind::IllegalState)?;
        if let Some(previous) = previous {
            state.set(PREVIOUS_CHART, previous.chart);
        }
        self.deploy(ctx).await
    }

    async fn revert_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        self.helm
            .uninstall_chart(ctx.cancellation(), &self.chart.release, &self.chart.namespace)
            .await
            .kind(ErrorKind::Installation)?;
        Ok(Compensation::Reverted)
    }

    async fn revert_second(
        &self,
        _ctx: &StepContext,
        state: &mut StepState,
    ) -> Result<Compensation> {
        let previous = state
            .get_as::<String>(PREVIOUS_CHART)
            .unwrap_or_else(|| "unknown".to_string());
        warn!(
            release = %self.chart.release,
            previous = %previous,
            current = %self.chart.chart_label(),
            "Keeping upgraded release"
        );
        Ok(Compensation::Retained)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("release".to_string(), self.chart.release.clone());
        metadata.insert("chart".to_string(), self.chart.chart_label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_host::FakeHelm;
    use nodeforge_workflow::paired_step;

    fn node_exporter() -> ChartSpec {
        ChartSpec {
            release: "node-exporter".to_string(),
            namespace: "monitoring".to_string(),
            repo_name: "prometheus-community".to_string(),
            repo_url: "https://prometheus-community.github.io/helm-charts".to_string(),
            chart: "prometheus-node-exporter".to_string(),
            version: "4.43.1".to_string(),
            values: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_install_is_uninstalled() {
        let helm = Arc::new(FakeHelm::new());
        let mut step =
            paired_step("install-node-exporter", HelmRelease::new(helm.clone(), node_exporter()))
                .unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert!(report.is_success());
        assert_eq!(report.metadata["chart"], "prometheus-node-exporter-4.43.1");
        assert!(helm.installed("node-exporter", "monitoring").is_some());
        assert!(helm.repos().contains_key("prometheus-community"));

        assert!(step.rollback(&ctx).await.is_success());
        assert!(helm.installed("node-exporter", "monitoring").is_none());
    }

    #[tokio::test]
    async fn test_upgrade_is_retained() {
        let helm = Arc::new(FakeHelm::new().with_release(
            "node-exporter",
            "monitoring",
            "prometheus-node-exporter-4.40.0",
        ));
        let mut step =
            paired_step("install-node-exporter", HelmRelease::new(helm.clone(), node_exporter()))
                .unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert!(report.is_success());
        assert_eq!(report.metadata["alreadyInstalled"], "true");
        assert_eq!(report.metadata["upToDateByThisStep"], "true");
        assert_eq!(
            step.state().get_as::<String>(PREVIOUS_CHART).as_deref(),
            Some("prometheus-node-exporter-4.40.0")
        );

        let rollback = step.rollback(&ctx).await;
        assert!(rollback.is_skipped());
        assert_eq!(rollback.metadata["UpToDateRetained"], "true");
        assert_eq!(
            helm.installed("node-exporter", "monitoring").unwrap().chart,
            "prometheus-node-exporter-4.43.1"
        );
        assert!(!helm.journal().iter().any(|call| call.starts_with("uninstall")));
    }

    #[tokio::test]
    async fn test_deploy_failure() {
        let helm = Arc::new(FakeHelm::new());
        helm.fail_on("deploy_chart");
        let mut step =
            paired_step("install-node-exporter", HelmRelease::new(helm.clone(), node_exporter()))
                .unwrap();

        let report = step.execute(&StepContext::new()).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Installation));
        assert!(step.rollback(&StepContext::new()).await.is_skipped());
    }
}

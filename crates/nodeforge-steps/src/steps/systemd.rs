//! systemd service enablement
//!
//! `(enabled, running)`. Starting waits until systemd reports the unit
//! active, bounded by the service poller.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::SystemManager;
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Metadata, Observation, PairedResource, Poller, Result,
    StepContext, StepState,
};
use std::sync::Arc;
use tracing::debug;

pub struct SystemdService {
    system: Arc<dyn SystemManager>,
    unit: String,
    poller: Poller,
}

impl SystemdService {
    pub fn new(system: Arc<dyn SystemManager>, unit: impl Into<String>, poller: Poller) -> Self {
        Self {
            system,
            unit: unit.into(),
            poller,
        }
    }
}

#[async_trait]
impl PairedResource for SystemdService {
    fn describe(&self) -> String {
        format!("service {}", self.unit)
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Enabled"), Axis::new("Running"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let cancel = ctx.cancellation();
        let enabled = self
            .system
            .is_service_enabled(cancel, &self.unit)
            .await
            .kind(ErrorKind::IllegalState)?;
        let running = self
            .system
            .is_service_running(cancel, &self.unit)
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(Observation::new(enabled, running))
    }

    async fn apply_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        let cancel = ctx.cancellation();
        // the unit file may have been written by an earlier step
        self.system
            .daemon_reload(cancel)
            .await
            .kind(ErrorKind::Configuration)?;
        self.system
            .enable_service(cancel, &self.unit)
            .await
            .kind(ErrorKind::Configuration)
    }

    async fn apply_second(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        let cancel = ctx.cancellation();
        self.system
            .start_service(cancel, &self.unit)
            .await
            .kind(ErrorKind::Installation)?;

        let system = &self.system;
        let unit = self.unit.as_str();
        self.poller
            .wait(cancel, move || async move {
                match system.is_service_running(cancel, unit).await {
                    Ok(running) => running,
                    Err(e) => {
                        debug!(unit, error = %e, "Service state unknown, retrying");
                        false
                    }
                }
            })
            .await?;
        Ok(())
    }

    async fn revert_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        self.system
            .disable_service(ctx.cancellation(), &self.unit)
            .await
            .kind(ErrorKind::Configuration)?;
        Ok(Compensation::Reverted)
    }

    async fn revert_second(
        &self,
        ctx: &StepContext,
        _state: &mut StepState,
    ) -> Result<Compensation> {
        self.system
            .stop_service(ctx.cancellation(), &self.unit)
            .await
            .kind(ErrorKind::Installation)?;
        Ok(Compensation::Reverted)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("unit".to_string(), self.unit.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_host::FakeSystem;
    use nodeforge_workflow::paired_step;
    use std::time::Duration;

    fn poller() -> Poller {
        Poller::new(Duration::from_secs(5), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_enabled_but_stopped() {
        let system = Arc::new(FakeSystem::new().with_service("kubelet.service", true, false));
        let mut step = paired_step(
            "enable-kubelet",
            SystemdService::new(system.clone(), "kubelet.service", poller()),
        )
        .unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert!(report.is_success());
        assert_eq!(report.metadata["runningByThisStep"], "true");
        assert_eq!(system.journal(), vec!["start_service kubelet.service"]);

        assert!(step.rollback(&ctx).await.is_success());
        assert!(system.service_enabled("kubelet.service"));
        assert!(!system.service_running("kubelet.service"));
    }

    #[tokio::test]
    async fn test_fresh_service_reverts_in_reverse() {
        let system = Arc::new(FakeSystem::new());
        let mut step = paired_step(
            "enable-kubelet",
            SystemdService::new(system.clone(), "kubelet.service", poller()),
        )
        .unwrap();
        let ctx = StepContext::new();

        assert!(step.execute(&ctx).await.is_success());
        assert!(step.rollback(&ctx).await.is_success());
        assert_eq!(
            system.journal(),
            vec![
                "daemon_reload",
                "enable_service kubelet.service",
                "start_service kubelet.service",
                "stop_service kubelet.service",
                "disable_service kubelet.service",
            ]
        );
    }
}

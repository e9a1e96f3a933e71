//! Swap disabling
//!
//! `(disabled, disabledInFstab)`. Swap lines in fstab are commented out
//! rather than deleted; the original lines are kept in the step state so
//! rollback restores exactly those lines.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::{Fstab, SystemManager};
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Observation, PairedResource, Result, StepContext, StepState,
};
use std::sync::Arc;
use tracing::warn;

const COMMENTED_LINES: &str = "commentedLines";

pub struct Swap {
    system: Arc<dyn SystemManager>,
    fstab: Fstab,
}

impl Swap {
    pub fn new(system: Arc<dyn SystemManager>, fstab: Fstab) -> Self {
        Self { system, fstab }
    }
}

#[async_trait]
impl PairedResource for Swap {
    fn describe(&self) -> String {
        "swap".to_string()
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Disabled"), Axis::new("DisabledInFstab"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let active = self
            .system
            .swap_active(ctx.cancellation())
            .await
            .kind(ErrorKind::IllegalState)?;
        let in_fstab = self
            .fstab
            .has_active_swap()
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(Observation::new(!active, !in_fstab))
    }

    async fn apply_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.system
            .swap_off(ctx.cancellation())
            .await
            .kind(ErrorKind::Configuration)
    }

    async fn apply_second(&self, _ctx: &StepContext, state: &mut StepState) -> Result<()> {
        let commented = self
            .fstab
            .comment_swap()
            .await
            .kind(ErrorKind::Configuration)?;
        state.set(COMMENTED_LINES, commented);
        Ok(())
    }

    async fn revert_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        self.system
            .swap_on(ctx.cancellation())
            .await
            .kind(ErrorKind::Configuration)?;
        Ok(Compensation::Reverted)
    }

    async fn revert_second(&self, _ctx: &StepContext, state: &mut StepState) -> Result<Compensation> {
        let lines: Vec<String> = state.get_as(COMMENTED_LINES).unwrap_or_default();
        let restored = self
            .fstab
            .uncomment(&lines)
            .await
            .kind(ErrorKind::Configuration)?;
        if restored < lines.len() {
            warn!(
                expected = lines.len(),
                restored,
                "Some swap lines were changed since they were commented out"
            );
        }
        state.remove(COMMENTED_LINES);
        Ok(Compensation::Reverted)
    }
}

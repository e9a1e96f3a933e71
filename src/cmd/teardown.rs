use super::Target;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use nodeforge_steps::ProvisionContext;
use nodeforge_workflow::{FileStateStore, Report, StateStore, StepContext};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct TeardownArgs {
    /// What to undo; must match an earlier `setup` target
    #[arg(value_enum)]
    pub target: Target,
}

/// Roll back the changes recorded by the last setup of the same target
pub async fn run_teardown(
    args: TeardownArgs,
    provision: &ProvisionContext,
    ctx: &StepContext,
) -> Result<Report> {
    let mut workflow = args.target.workflow(provision)?;
    let store = FileStateStore::new(&provision.config.state_dir);

    let Some(snapshot) = store.load(workflow.id()).await? else {
        warn!(workflow = %workflow.id(), "No recorded setup, nothing to tear down");
        return Ok(Report::skipped(workflow.id()));
    };
    workflow
        .restore(&snapshot)
        .wrap_err("Recorded state does not match this workflow")?;

    info!(workflow = %workflow.id(), recorded_at = %snapshot.created_at, "Starting teardown");
    let report = workflow.rollback(ctx).await;

    if report.is_failed() {
        // keep the record so the teardown can be retried
        warn!(workflow = %workflow.id(), "Teardown failed, keeping the recorded state");
    } else {
        store.delete(workflow.id()).await?;
    }
    Ok(report)
}

use super::{changed_anything, Target};
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use nodeforge_steps::ProvisionContext;
use nodeforge_workflow::{FileStateStore, Report, StateStore, StepContext};
use tracing::info;

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// What to provision
    #[arg(value_enum)]
    pub target: Target,
}

/// Execute the target's workflow and record what it changed for teardown
pub async fn run_setup(
    args: SetupArgs,
    provision: &ProvisionContext,
    ctx: &StepContext,
) -> Result<Report> {
    let mut workflow = args.target.workflow(provision)?;
    let store = FileStateStore::new(&provision.config.state_dir);

    info!(workflow = %workflow.id(), "Starting setup");
    let report = workflow.execute(ctx).await;

    // a failed run has already rolled itself back, and a run that changed
    // nothing has nothing to add to an existing record
    let previous = store.load(workflow.id()).await?;
    match previous {
        Some(_) if report.is_failed() || !changed_anything(&report) => {
            info!(workflow = %workflow.id(), "Keeping the previously recorded state");
        }
        previous => {
            // what earlier runs changed stays reversible after a rerun
            let mut snapshot = workflow.snapshot();
            if let Some(earlier) = &previous {
                snapshot.merge_earlier(earlier)?;
            }
            store
                .save(&snapshot)
                .await
                .wrap_err("Failed to record workflow state")?;
            info!(
                workflow = %workflow.id(),
                dir = %store.dir().display(),
                merged = previous.is_some(),
                "Recorded workflow state for teardown"
            );
        }
    }

    Ok(report)
}

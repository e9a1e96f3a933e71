//! Subcommands

pub mod setup;
pub mod teardown;

use clap::ValueEnum;
use color_eyre::eyre::{Result, WrapErr};
use nodeforge_steps::{workflows, ProvisionContext};
use nodeforge_workflow::{Report, Workflow};
use std::path::Path;

/// Part of the host to set up or tear down
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    KernelModules,
    BindMounts,
    Swap,
    Kubelet,
    Kubeadm,
    Alloy,
    All,
}

impl Target {
    pub fn workflow(self, ctx: &ProvisionContext) -> nodeforge_workflow::Result<Workflow> {
        match self {
            Target::KernelModules => workflows::kernel_modules(ctx),
            Target::BindMounts => workflows::bind_mounts(ctx),
            Target::Swap => workflows::disable_swap(ctx),
            Target::Kubelet => workflows::kubelet(ctx),
            Target::Kubeadm => workflows::kubeadm(ctx),
            Target::Alloy => workflows::alloy_stack(ctx),
            Target::All => workflows::all(ctx),
        }
    }
}

/// Print the report as YAML, to `output` when given
pub async fn write_report(report: &Report, output: Option<&Path>) -> Result<()> {
    let yaml = serde_yaml::to_string(report).wrap_err("Failed to serialize report")?;
    match output {
        Some(path) => tokio::fs::write(path, yaml)
            .await
            .wrap_err_with(|| format!("Failed to write report to {}", path.display())),
        None => {
            print!("{}", yaml);
            Ok(())
        }
    }
}

/// Whether any leaf of the report changed something
pub fn changed_anything(report: &Report) -> bool {
    if report.step_reports.is_empty() {
        report.is_success()
    } else {
        report.step_reports.iter().any(changed_anything)
    }
}

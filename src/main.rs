// Main binary that provisions the local host
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use nodeforge_steps::{NodeConfig, ProvisionContext};
use nodeforge_workflow::{event_channel, log_events, StepContext};
use std::io::stderr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;
use cmd::setup::SetupArgs;
use cmd::teardown::TeardownArgs;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Idempotent, reversible provisioning of a Kubernetes host",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - debug logs and every execution event
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Configuration file (defaults to /etc/nodeforge/config.yaml when present)
    #[arg(short, long, global = true, env = "NODEFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Write the YAML report to this file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring a part of the host into the provisioned state
    Setup(SetupArgs),
    /// Undo what the last recorded setup run changed
    Teardown(TeardownArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG wins; otherwise our crates at info (debug with --verbose)
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nodeforge={level},nodeforge_workflow={level},nodeforge_host={level},nodeforge_steps={level},reqwest=warn,hyper=warn,rustls=warn",
            level = level
        ))
    });
    // stdout is reserved for the report
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let config = NodeConfig::load(cli.config.as_deref()).await?;
    let provision = ProvisionContext::linux(config);

    let cancel = CancellationToken::new();
    let rollback_cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone(), rollback_cancel.clone());

    let mut ctx = StepContext::new()
        .with_cancellation(cancel)
        .with_rollback_cancellation(rollback_cancel);
    if cli.verbose {
        let (events, receiver) = event_channel(256);
        tokio::spawn(log_events(receiver));
        ctx = ctx.with_events(events);
    }

    let report = match cli.command {
        Commands::Setup(args) => cmd::setup::run_setup(args, &provision, &ctx).await?,
        Commands::Teardown(args) => cmd::teardown::run_teardown(args, &provision, &ctx).await?,
    };

    cmd::write_report(&report, cli.output.as_deref()).await?;

    if report.is_failed() {
        if let Some(err) = &report.error {
            error!(kind = ?err.kind, "{} failed: {}", report.id, err.message);
        }
        std::process::exit(1);
    }
    Ok(())
}

/// First Ctrl+C cancels the run, which rolls back what already ran.
/// A second one cancels the rollback too.
fn spawn_interrupt_handler(cancel: CancellationToken, rollback_cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Could not listen for Ctrl+C");
            return;
        }
        warn!("Interrupted, rolling back. Press Ctrl+C again to abort the rollback");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Aborting rollback");
            rollback_cancel.cancel();
        }
    });
}

//! Task Settlement Server
//!
//! HTTP API for the task marketplace lifecycle, plus reconciliation and
//! audit commands.

use anyhow::{Result, bail};
use clap::Parser;
use std::net::SocketAddr;
use task_settlement::api::{self, AppState};
use task_settlement::app::App;
use task_settlement::cli::{ChainArg, Cli, Command, ReconcileArgs};
use task_settlement::config::{ChainMode, Config, ConfigLoader};
use task_settlement::lifecycle::ReconcileOutcome;
use task_settlement::logging::{self, LogTarget};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut loader = match &cli.config {
        Some(path) => ConfigLoader::load_file(std::path::Path::new(path))?,
        None => ConfigLoader::load()?,
    };
    if let Some(path) = loader.config_path() {
        info!(path = %path.display(), "loaded configuration");
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.into();
    }
    if let Some(chain) = cli.chain {
        config.chain.mode = match chain {
            ChainArg::Memory => ChainMode::Memory,
            ChainArg::Rpc => ChainMode::Rpc,
        };
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    let config = loader.into_config();

    match cli.command {
        Some(Command::Reconcile(args)) => run_reconcile(&config, args).await,
        Some(Command::Audit) => run_audit(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    let app = App::from_config(&config)?;
    if config.chain.mode == ChainMode::Memory {
        warn!("chain mode is memory: escrow and stake state live only in this process");
    }

    let ip = config.server.bind.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);

    let state = AppState::new(app.lifecycle, app.blobs).with_ledger(app.ledger);
    let (shutdown_tx, bound_addr) = api::start_server(state, addr).await?;
    info!("Serving on http://{}", bound_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    Ok(())
}

async fn run_reconcile(config: &Config, args: ReconcileArgs) -> Result<()> {
    let app = App::from_config(config)?;
    let actions = app.lifecycle.reconcile(args.dry_run).await?;

    if actions.is_empty() {
        println!("No stale settlements.");
        return Ok(());
    }

    let mut unresolved = 0;
    for action in &actions {
        println!("{}", serde_json::to_string(action)?);
        if matches!(
            action.outcome,
            ReconcileOutcome::NeedsAttention { .. } | ReconcileOutcome::Failed { .. }
        ) {
            unresolved += 1;
        }
    }

    println!(
        "{} stale settlement(s), {} need attention{}",
        actions.len(),
        unresolved,
        if args.dry_run { " (dry run)" } else { "" }
    );

    if unresolved > 0 {
        bail!("{} settlement(s) could not be reconciled", unresolved);
    }
    Ok(())
}

fn run_audit(config: &Config) -> Result<()> {
    let app = App::from_config(config)?;
    let reports = app.lifecycle.audit_all()?;

    let divergent: Vec<_> = reports.iter().filter(|r| !r.is_consistent()).collect();
    for report in &divergent {
        println!("{}", serde_json::to_string(report)?);
    }
    println!(
        "Audited {} task(s), {} divergent",
        reports.len(),
        divergent.len()
    );

    if !divergent.is_empty() {
        bail!("{} task(s) diverge from their event log", divergent.len());
    }
    Ok(())
}

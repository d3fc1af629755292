//! CLI command definitions for task-settlement.
//!
//! The main entry point is the `Cli` struct which contains subcommands.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Chain backend selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChainArg {
    /// In-process ledger
    Memory,
    /// JSON-RPC node
    Rpc,
}

/// Task settlement server and maintenance tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Chain backend (overrides config)
    #[arg(long, value_enum, global = true)]
    pub chain: Option<ChainArg>,

    /// HTTP port (overrides config)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP API (default if no subcommand given)
    Serve,

    /// Repair settlements whose final write never landed
    Reconcile(ReconcileArgs),

    /// Replay every task's event log and report divergence
    Audit,
}

#[derive(Args, Debug, Default)]
pub struct ReconcileArgs {
    /// Report what would be repaired without writing anything
    #[arg(long)]
    pub dry_run: bool,
}

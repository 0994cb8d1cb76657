//! Reconcile a target system with a declarative desired-state document.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use reconciler::cli::{self, AuditRequest, RunRequest};
use reconciler::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "reconciler",
    version,
    about = "Idempotent desired-state reconciler"
)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true, default_value = "reconciler.toml")]
    config: PathBuf,
    /// Debug-level diagnostics.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Errors only.
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Also append diagnostics to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge the target with the desired state.
    Run(RunArgs),
    /// List available steps in execution order.
    Steps,
    /// Validate config, desired state and step plan without touching a target.
    Check {
        /// Desired-state file; defaults to `spec_path` from the config.
        #[arg(long)]
        spec: Option<PathBuf>,
    },
    /// Replay an export against the target and report drift.
    Audit {
        /// Export artifact written by `run`.
        export: PathBuf,
    },
    /// Point the config at a new target IP address (backs up the old file).
    SetAddress {
        /// New target IP address.
        address: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Desired-state file; defaults to `spec_path` from the config.
    #[arg(long)]
    spec: Option<PathBuf>,
    /// Run only this step and the steps it depends on.
    #[arg(long)]
    step: Option<String>,
    /// Resolve everything but write nothing.
    #[arg(long)]
    dry_run: bool,
    /// Export path; defaults to a timestamped file in `export.dir`.
    #[arg(long, conflicts_with = "no_export")]
    export: Option<PathBuf>,
    /// Do not write an export artifact.
    #[arg(long)]
    no_export: bool,
}

fn main() {
    let cli = Cli::parse();
    let level = logging::level_for(cli.verbose, cli.quiet);
    if let Err(err) = logging::init(level, cli.log_file.as_deref()) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cli::run(
            &cli.config,
            &RunRequest {
                spec: args.spec,
                step: args.step,
                dry_run: args.dry_run,
                export: args.export,
                no_export: args.no_export,
            },
        ),
        Command::Steps => cli::list_steps(&cli.config),
        Command::Check { spec } => cli::check(&cli.config, spec.as_deref()),
        Command::Audit { export } => cli::audit(
            &cli.config,
            &AuditRequest {
                export,
                ..AuditRequest::default()
            },
        ),
        Command::SetAddress { address } => cli::set_address(&cli.config, &address),
    }
}

//! Validate a reconciler export against a target.
//!
//! Replays every converged item of an export artifact through the same item
//! resolver the run used and reports what is missing or has drifted.

use std::path::PathBuf;

use clap::Parser;
use reconciler::cli::{self, AuditRequest};
use reconciler::{exit_codes, logging};

#[derive(Parser)]
#[command(name = "audit", version, about = "Validate a reconciler export against a target")]
struct Cli {
    /// Export artifact written by `reconciler run`.
    export: PathBuf,
    /// Configuration file (TOML).
    #[arg(long, default_value = "reconciler.toml")]
    config: PathBuf,
    /// Target state file to audit; defaults to `target.state_file` from the config.
    #[arg(long)]
    target_state: Option<PathBuf>,
    /// Also write the audit report as JSON.
    #[arg(long)]
    json: Option<PathBuf>,
    /// Debug-level diagnostics.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(logging::level_for(cli.verbose, false), None) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
    let request = AuditRequest {
        export: cli.export,
        target_state: cli.target_state,
        json: cli.json,
    };
    match cli::audit(&cli.config, &request) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

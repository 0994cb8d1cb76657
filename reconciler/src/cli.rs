//! CLI command implementations. Each returns the process exit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::audit::{audit_report, render_audit_summary};
use crate::core::report::{RunReport, Verdict, render_summary};
use crate::exit_codes;
use crate::io::config::{ReconcilerConfig, load_config, set_target_address};
use crate::io::desired::{load_desired_state, missing_files};
use crate::io::export::{default_export_path, load_export, write_export};
use crate::io::local_target::LocalTarget;
use crate::io::write_json;
use crate::orchestrator::{Orchestrator, RunOptions};

/// Options for `reconciler run`.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub spec: Option<PathBuf>,
    pub step: Option<String>,
    pub dry_run: bool,
    pub export: Option<PathBuf>,
    pub no_export: bool,
}

/// Run all steps (or one step and its dependencies) and export the report.
pub fn run(config_path: &Path, request: &RunRequest) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let steps = cfg.step_definitions();
    let spec_path = request.spec.clone().unwrap_or_else(|| cfg.spec_path.clone());
    let loaded = load_desired_state(&spec_path, &steps)?;
    let client = LocalTarget::open(&cfg.target.state_file)?;
    let orchestrator = Orchestrator::from_definitions(steps);

    let options = RunOptions {
        dry_run: request.dry_run,
        selection: request.step.clone(),
        target: cfg.declared_target(),
        spec_digest: Some(loaded.digest.clone()),
    };
    let result = orchestrator
        .run(&loaded.spec, &client, &options)
        .context("plan run")?;

    print!("{}", render_summary(&result.report));
    if !request.no_export {
        let path = export_path(&cfg, request, &result.report);
        write_export(&path, &result.report)?;
        println!("export: {}", path.display());
    }
    Ok(exit_code(result.report.verdict()))
}

/// Print available steps in execution order.
pub fn list_steps(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let plan = Orchestrator::from_definitions(cfg.step_definitions())
        .plan()
        .context("plan steps")?;
    for step in plan {
        let after = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after: {})", step.depends_on.join(", "))
        };
        println!("{}: {}{after}", step.id, step.description);
    }
    Ok(exit_codes::OK)
}

/// Validate config, desired state and step plan without touching a target.
pub fn check(config_path: &Path, spec: Option<&Path>) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let steps = cfg.step_definitions();
    let spec_path = spec.map_or_else(|| cfg.spec_path.clone(), Path::to_path_buf);
    let loaded = load_desired_state(&spec_path, &steps)?;
    let orchestrator = Orchestrator::from_definitions(steps.clone());
    orchestrator
        .check(&loaded.spec, None)
        .with_context(|| format!("check {}", spec_path.display()))?;

    let base = spec_path.parent().unwrap_or(Path::new(""));
    let missing = missing_files(&loaded.spec, &steps, base);
    println!(
        "check: categories={} items={} steps={}",
        loaded.spec.categories.len(),
        loaded.spec.item_count(),
        steps.len()
    );
    for warning in &missing {
        warn!(%warning, "referenced file missing");
        println!("warning: {warning}");
    }
    debug!(digest = %loaded.digest, "desired state digest");
    if missing.is_empty() {
        println!("check: ok");
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::WARNINGS)
    }
}

/// Options for an audit pass.
#[derive(Debug, Clone, Default)]
pub struct AuditRequest {
    pub export: PathBuf,
    /// Audit this target state file instead of the configured one.
    pub target_state: Option<PathBuf>,
    /// Also write the audit report as JSON.
    pub json: Option<PathBuf>,
}

/// Replay an export against the target and report drift.
pub fn audit(config_path: &Path, request: &AuditRequest) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let artifact = load_export(&request.export)?;
    let state_file = request
        .target_state
        .clone()
        .unwrap_or_else(|| cfg.target.state_file.clone());
    let client = LocalTarget::open(&state_file)?;
    info!(
        export = %request.export.display(),
        run_id = %artifact.metadata.run_id,
        target = %state_file.display(),
        "auditing export"
    );
    let audit = audit_report(&artifact.report, &client);
    print!("{}", render_audit_summary(&audit));
    if let Some(path) = &request.json {
        write_json(path, &audit)?;
        println!("audit: report={}", path.display());
    }
    Ok(if !audit.success() {
        exit_codes::FAILED
    } else if !audit.warnings.is_empty() {
        exit_codes::WARNINGS
    } else {
        exit_codes::OK
    })
}

/// Rewrite `target.address` in the config, keeping a backup of the old file.
pub fn set_address(config_path: &Path, address: &str) -> Result<i32> {
    let backup = set_target_address(config_path, address)?;
    println!("set-address: target.address={}", address.trim());
    if let Some(backup) = backup {
        println!("set-address: backup={}", backup.display());
    }
    Ok(exit_codes::OK)
}

pub fn exit_code(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Success => exit_codes::OK,
        Verdict::Warnings => exit_codes::WARNINGS,
        Verdict::Failed => exit_codes::FAILED,
    }
}

fn export_path(cfg: &ReconcilerConfig, request: &RunRequest, report: &RunReport) -> PathBuf {
    match &request.export {
        Some(path) => path.clone(),
        None => default_export_path(&cfg.export.dir, &cfg.export.prefix, report.started_at),
    }
}

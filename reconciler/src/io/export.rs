//! Export artifact: the persisted form of a run report.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::report::{RunCounts, RunReport};
use crate::core::types::{StepStatus, TargetIdentity};

pub const FORMAT_VERSION: u32 = 1;
const EXPORT_SCHEMA: &str = include_str!("../../schemas/export.v1.schema.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub format_version: u32,
    pub metadata: ExportMetadata,
    pub report: RunReport,
}

/// Summary block readable without walking the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub target: TargetIdentity,
    pub dry_run: bool,
    pub selection: Option<String>,
    pub spec_digest: Option<String>,
    pub counts: RunCounts,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: String,
    pub status: StepStatus,
    pub counts: RunCounts,
}

impl ExportArtifact {
    pub fn from_report(report: &RunReport) -> Self {
        let metadata = ExportMetadata {
            run_id: report.run_id.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            target: report.target.clone(),
            dry_run: report.dry_run,
            selection: report.selection.clone(),
            spec_digest: report.spec_digest.clone(),
            counts: report.counts(),
            steps: report
                .steps
                .iter()
                .map(|outcome| StepSummary {
                    id: outcome.step.id.clone(),
                    status: outcome.status,
                    counts: RunCounts::for_step(outcome),
                })
                .collect(),
        };
        Self {
            format_version: FORMAT_VERSION,
            metadata,
            report: report.clone(),
        }
    }
}

/// `<dir>/<prefix>_<YYYY-mm-dd_HH-MM-SS>.json`
pub fn default_export_path(dir: &Path, prefix: &str, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("{prefix}_{}.json", at.format("%Y-%m-%d_%H-%M-%S")))
}

/// Atomically write the export artifact for `report`.
pub fn write_export(path: &Path, report: &RunReport) -> Result<()> {
    let artifact = ExportArtifact::from_report(report);
    crate::io::write_json(path, &artifact)
        .with_context(|| format!("write export {}", path.display()))?;
    info!(path = %path.display(), run_id = %report.run_id, "export written");
    Ok(())
}

/// Load and schema-validate an export artifact.
pub fn load_export(path: &Path) -> Result<ExportArtifact> {
    if !path.exists() {
        let similar = similar_exports(path);
        if similar.is_empty() {
            bail!("export file not found: {}", path.display());
        }
        bail!(
            "export file not found: {}\navailable exports:\n- {}",
            path.display(),
            similar.join("\n- ")
        );
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let instance: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    validate_schema(&instance).with_context(|| format!("validate {}", path.display()))?;
    let artifact: ExportArtifact = serde_json::from_value(instance)
        .with_context(|| format!("parse {} as export v{FORMAT_VERSION}", path.display()))?;
    debug!(path = %path.display(), run_id = %artifact.metadata.run_id, "export loaded");
    Ok(artifact)
}

/// Validate against the bundled JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(EXPORT_SCHEMA).context("parse export schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile export schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// JSON files next to `path`, sorted by name.
fn similar_exports(path: &Path) -> Vec<String> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|candidate| candidate.extension().is_some_and(|ext| ext == "json"))
        .map(|candidate| candidate.display().to_string())
        .collect();
    names.sort();
    names
}

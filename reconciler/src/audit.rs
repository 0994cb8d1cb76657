//! Validation pass: replay a finished run report against a target.
//!
//! Every item the run converged is resolved again with the key policy the run
//! recorded, so the audit uses exactly the equality that decided not to write.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capability::{CapabilityClient, Scope};
use crate::core::matching::KeyPolicy;
use crate::core::normalize::FieldDiffs;
use crate::core::report::{IdLookup, RunReport};
use crate::core::types::{ItemResult, RemoteId, StepOutcome, TargetIdentity};
use crate::resolver::{Resolution, resolve};
use crate::step::apply_references;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Passed,
    Missing,
    Mismatch,
    Error,
    Skipped,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Passed => "passed",
            AuditStatus::Missing => "missing",
            AuditStatus::Mismatch => "mismatch",
            AuditStatus::Error => "error",
            AuditStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step: String,
    pub category: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub status: AuditStatus,
    pub remote_id: Option<RemoteId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "FieldDiffs::is_empty")]
    pub diff: FieldDiffs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCounts {
    pub passed: usize,
    pub missing: usize,
    pub mismatch: usize,
    pub error: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Run the audited report came from.
    pub run_id: String,
    pub target: TargetIdentity,
    pub entries: Vec<AuditEntry>,
    pub warnings: Vec<String>,
}

impl AuditReport {
    pub fn counts(&self) -> AuditCounts {
        let mut counts = AuditCounts::default();
        for entry in &self.entries {
            match entry.status {
                AuditStatus::Passed => counts.passed += 1,
                AuditStatus::Missing => counts.missing += 1,
                AuditStatus::Mismatch => counts.mismatch += 1,
                AuditStatus::Error => counts.error += 1,
                AuditStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// True iff nothing is missing, mismatched or unreadable.
    pub fn success(&self) -> bool {
        let counts = self.counts();
        counts.missing == 0 && counts.mismatch == 0 && counts.error == 0
    }
}

/// Ids observed on the audited target, for reference substitution.
#[derive(Default)]
struct AuditIds {
    found: Vec<(String, String, KeyPolicy, RemoteId)>,
}

impl AuditIds {
    fn record(&mut self, category: &str, key: &str, policy: KeyPolicy, id: RemoteId) {
        self.found
            .push((category.to_string(), key.to_string(), policy, id));
    }
}

impl IdLookup for AuditIds {
    fn remote_id(&self, category: &str, key: &str) -> Option<RemoteId> {
        self.found
            .iter()
            .find(|(found_category, found_key, policy, _)| {
                found_category == category && policy.keys_equal(found_key, key)
            })
            .map(|(_, _, _, id)| id.clone())
    }
}

/// Replay `report` against `client`.
#[instrument(skip_all, fields(run_id = %report.run_id))]
pub fn audit_report(report: &RunReport, client: &dyn CapabilityClient) -> AuditReport {
    let mut audit = AuditReport {
        run_id: report.run_id.clone(),
        target: client.identity(),
        entries: Vec::new(),
        warnings: Vec::new(),
    };
    let mut ids = AuditIds::default();

    for outcome in report.steps.iter().filter(|o| !o.items.is_empty()) {
        let category = outcome.step.category.as_str();
        if !client.supports(category) {
            warn!(step = %outcome.step.id, category, "category not supported by target");
            audit.warnings.push(format!(
                "{} ({category}): category not supported by target; {} items not checked",
                outcome.step.id,
                outcome.items.len()
            ));
            audit.entries.extend(outcome.items.iter().map(|item| {
                entry(outcome, item, AuditStatus::Skipped, None, "category not supported")
            }));
            continue;
        }

        let mut parent_id: Option<(String, RemoteId)> = None;
        for item in &outcome.items {
            let audited = audit_item(outcome, item, client, &mut ids, &mut parent_id);
            debug!(
                category = %audited.category,
                key = %audited.key,
                status = audited.status.as_str(),
                "item audited"
            );
            audit.entries.push(audited);
        }
        info!(step = %outcome.step.id, items = outcome.items.len(), "step audited");
    }
    audit
}

fn audit_item(
    outcome: &StepOutcome,
    item: &ItemResult,
    client: &dyn CapabilityClient,
    ids: &mut AuditIds,
    parent_id: &mut Option<(String, RemoteId)>,
) -> AuditEntry {
    let step = &outcome.step;
    let is_child = item.parent.is_some();
    if !is_child {
        *parent_id = None;
    }
    if item.status.is_failure() || item.status.is_dry_run() {
        let reason = format!("not converged by the run ({})", item.status.as_str());
        return entry(outcome, item, AuditStatus::Skipped, None, &reason);
    }

    let (scope, policy, desired) = if let Some(parent_key) = &item.parent {
        let Some((_, id)) = parent_id.as_ref().filter(|(key, _)| key == parent_key) else {
            let reason = format!("parent '{parent_key}' is not present");
            return entry(outcome, item, AuditStatus::Missing, None, &reason);
        };
        let kind = item
            .category
            .split_once('/')
            .map_or(item.category.as_str(), |(_, kind)| kind);
        let policy = step
            .children
            .get(kind)
            .map_or(KeyPolicy::CaseSensitive, |child| child.key_policy);
        (Scope::child(&item.category, id), policy, item.fields.clone())
    } else {
        let desired = match apply_references(
            &item.category,
            &item.key,
            &item.fields,
            &step.references,
            &*ids,
            false,
        ) {
            Ok(desired) => desired,
            Err(err) => return entry(outcome, item, AuditStatus::Error, None, &err.to_string()),
        };
        (Scope::top(&item.category), step.key_policy, desired)
    };

    let audited = match resolve(client, &scope, &item.key, policy, &desired) {
        Ok(Resolution::Absent) => entry(outcome, item, AuditStatus::Missing, None, "not found"),
        Ok(Resolution::Match { id }) => {
            entry(outcome, item, AuditStatus::Passed, Some(id), "present and matching")
        }
        Ok(Resolution::Differ { id, diff }) => {
            let names: Vec<&str> = diff.keys().map(String::as_str).collect();
            let message = format!("fields differ: {}", names.join(", "));
            let mut audited = entry(outcome, item, AuditStatus::Mismatch, Some(id), &message);
            audited.diff = diff;
            audited
        }
        Err(err) => entry(outcome, item, AuditStatus::Error, None, &err.to_string()),
    };

    if !is_child
        && let Some(id) = &audited.remote_id
    {
        ids.record(&item.category, &item.key, policy, id.clone());
        *parent_id = Some((item.key.clone(), id.clone()));
    }
    audited
}

fn entry(
    outcome: &StepOutcome,
    item: &ItemResult,
    status: AuditStatus,
    remote_id: Option<RemoteId>,
    message: &str,
) -> AuditEntry {
    AuditEntry {
        step: outcome.step.id.clone(),
        category: item.category.clone(),
        key: item.key.clone(),
        parent: item.parent.clone(),
        status,
        remote_id,
        message: message.to_string(),
        diff: FieldDiffs::new(),
    }
}

/// Human-readable audit summary.
pub fn render_audit_summary(audit: &AuditReport) -> String {
    let mut out = String::new();
    let counts = audit.counts();
    let _ = writeln!(out, "audit: run={} target={}", audit.run_id, audit.target);
    let _ = writeln!(
        out,
        "audit: passed={} missing={} mismatch={} error={} skipped={}",
        counts.passed, counts.missing, counts.mismatch, counts.error, counts.skipped
    );
    for entry in &audit.entries {
        let label = match &entry.parent {
            Some(parent) => format!("{} '{parent}/{}'", entry.category, entry.key),
            None => format!("{} '{}'", entry.category, entry.key),
        };
        match entry.status {
            AuditStatus::Passed | AuditStatus::Skipped => {}
            AuditStatus::Mismatch => {
                let _ = writeln!(out, "mismatch: {label}");
                for (field, diff) in &entry.diff {
                    let actual = diff
                        .actual
                        .as_ref()
                        .map_or_else(|| "<missing>".to_string(), ToString::to_string);
                    let _ = writeln!(out, "  {field}: desired={} actual={actual}", diff.desired);
                }
            }
            status => {
                let _ = writeln!(out, "{}: {label}: {}", status.as_str(), entry.message);
            }
        }
    }
    for warning in &audit.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    let result = if audit.success() { "passed" } else { "failed" };
    let _ = writeln!(out, "audit: result={result}");
    out
}

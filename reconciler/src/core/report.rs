//! Run report: the append-only record of one orchestration run.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{ItemResult, ItemStatus, RemoteId, StepOutcome, StepStatus, TargetIdentity};

/// Appended to every failure line of the summary.
const MANUAL_ACTION_HINT: &str = "manual action may be needed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub target: TargetIdentity,
    pub dry_run: bool,
    /// Step requested with single-step selection, if any.
    pub selection: Option<String>,
    /// SHA-256 of the desired-state document the run was driven by.
    pub spec_digest: Option<String>,
    pub steps: Vec<StepOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub created: usize,
    pub already_exists: usize,
    pub updated: usize,
    pub failed: usize,
    pub dry_run: usize,
    pub warnings: usize,
}

impl RunCounts {
    pub fn for_items<'a>(items: impl IntoIterator<Item = &'a ItemResult>) -> Self {
        let mut counts = RunCounts::default();
        for item in items {
            match item.status {
                ItemStatus::Created => counts.created += 1,
                ItemStatus::AlreadyExists => counts.already_exists += 1,
                ItemStatus::Updated => counts.updated += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::DryRunWouldCreate | ItemStatus::DryRunWouldUpdate => {
                    counts.dry_run += 1;
                }
            }
        }
        counts
    }

    /// Counts for one step; a step skipped for lack of an endpoint is a warning.
    pub fn for_step(outcome: &StepOutcome) -> Self {
        let mut counts = RunCounts::for_items(&outcome.items);
        if outcome.status == StepStatus::SkippedNoEndpoint {
            counts.warnings += 1;
        }
        counts
    }

    fn add(&mut self, other: RunCounts) {
        self.created += other.created;
        self.already_exists += other.already_exists;
        self.updated += other.updated;
        self.failed += other.failed;
        self.dry_run += other.dry_run;
        self.warnings += other.warnings;
    }
}

/// Overall classification of a run, mapped to a process exit code by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Warnings,
    Failed,
}

/// A failure or warning, tied to the step and (when item-level) the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub step: String,
    pub category: String,
    pub key: Option<String>,
    pub message: String,
}

/// Look up the remote id an item was given, by category and natural key.
pub trait IdLookup {
    fn remote_id(&self, category: &str, key: &str) -> Option<RemoteId>;
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>, target: TargetIdentity) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            finished_at: None,
            target,
            dry_run: false,
            selection: None,
            spec_digest: None,
            steps: Vec::new(),
        }
    }

    /// Append a finished step outcome. Outcomes are never rewritten.
    pub fn push(&mut self, outcome: StepOutcome) {
        self.steps.push(outcome);
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|outcome| outcome.step.id == step_id)
    }

    pub fn counts(&self) -> RunCounts {
        let mut total = RunCounts::default();
        for outcome in &self.steps {
            total.add(RunCounts::for_step(outcome));
        }
        total
    }

    pub fn success(&self) -> bool {
        self.steps
            .iter()
            .all(|outcome| outcome.status != StepStatus::Failed)
    }

    pub fn verdict(&self) -> Verdict {
        if !self.success() {
            Verdict::Failed
        } else if self.counts().warnings > 0 {
            Verdict::Warnings
        } else {
            Verdict::Success
        }
    }

    pub fn warnings(&self) -> Vec<Notice> {
        self.steps
            .iter()
            .filter(|outcome| outcome.status == StepStatus::SkippedNoEndpoint)
            .map(|outcome| Notice {
                step: outcome.step.id.clone(),
                category: outcome.step.category.clone(),
                key: None,
                message: "category not supported by target; skipped".to_string(),
            })
            .collect()
    }

    /// Item failures, plus step-level errors of steps that produced none.
    pub fn failures(&self) -> Vec<Notice> {
        let mut notices = Vec::new();
        for outcome in self.steps.iter().filter(|o| o.status == StepStatus::Failed) {
            let before = notices.len();
            notices.extend(outcome.failed_items().map(|item| Notice {
                step: outcome.step.id.clone(),
                category: item.category.clone(),
                key: Some(item.key.clone()),
                message: item.message.clone(),
            }));
            if notices.len() == before {
                notices.push(Notice {
                    step: outcome.step.id.clone(),
                    category: outcome.step.category.clone(),
                    key: None,
                    message: outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string()),
                });
            }
        }
        notices
    }
}

impl IdLookup for RunReport {
    fn remote_id(&self, category: &str, key: &str) -> Option<RemoteId> {
        self.steps
            .iter()
            .filter(|outcome| outcome.step.category == category)
            .flat_map(|outcome| {
                let policy = outcome.step.key_policy;
                outcome.items.iter().filter(move |item| {
                    item.parent.is_none()
                        && item.category == category
                        && policy.keys_equal(&item.key, key)
                })
            })
            .find_map(|item| item.remote_id.clone())
    }
}

/// Human-readable run summary. Warnings and failures are listed separately.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { " dry_run=true" } else { "" };
    let _ = writeln!(out, "run: id={} target={}{mode}", report.run_id, report.target);
    if let Some(selection) = &report.selection {
        let _ = writeln!(out, "run: selection={selection}");
    }
    for outcome in &report.steps {
        let counts = RunCounts::for_items(&outcome.items);
        let _ = write!(out, "step: {} status={}", outcome.step.id, outcome.status.as_str());
        if !outcome.items.is_empty() {
            let _ = write!(
                out,
                " created={} already_exists={} updated={} failed={}",
                counts.created, counts.already_exists, counts.updated, counts.failed
            );
            if counts.dry_run > 0 {
                let _ = write!(out, " dry_run={}", counts.dry_run);
            }
        }
        let _ = writeln!(out, " duration_ms={}", outcome.duration_ms);
    }

    let totals = report.counts();
    let _ = writeln!(
        out,
        "totals: created={} already_exists={} updated={} failed={} dry_run={} warnings={}",
        totals.created,
        totals.already_exists,
        totals.updated,
        totals.failed,
        totals.dry_run,
        totals.warnings
    );
    for warning in report.warnings() {
        let _ = writeln!(out, "warning: {} ({}): {}", warning.step, warning.category, warning.message);
    }
    for failure in report.failures() {
        match &failure.key {
            Some(_) => {
                let _ = writeln!(
                    out,
                    "failure: {}: {} ({MANUAL_ACTION_HINT})",
                    failure.step, failure.message
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "failure: {} ({}): {} ({MANUAL_ACTION_HINT})",
                    failure.step, failure.category, failure.message
                );
            }
        }
    }
    let verdict = match report.verdict() {
        Verdict::Success => "success",
        Verdict::Warnings => "success_with_warnings",
        Verdict::Failed => "failed",
    };
    let _ = writeln!(out, "result: {verdict}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matching::KeyPolicy;
    use crate::core::types::{BlockedBy, FieldMap, StepDefinition};

    fn item(category: &str, key: &str, status: ItemStatus, id: Option<&str>) -> ItemResult {
        ItemResult {
            category: category.to_string(),
            key: key.to_string(),
            parent: None,
            status,
            remote_id: id.map(RemoteId::new),
            message: String::new(),
            fields: FieldMap::new(),
            changed_fields: Vec::new(),
        }
    }

    fn outcome(def: StepDefinition, status: StepStatus, items: Vec<ItemResult>) -> StepOutcome {
        StepOutcome {
            items,
            ..StepOutcome::not_run(def, status)
        }
    }

    fn report() -> RunReport {
        let started = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        RunReport::new("run-test", started, TargetIdentity::default())
    }

    #[test]
    fn counts_and_verdicts() {
        let mut report = report();
        report.push(outcome(
            StepDefinition::new("configure-groups", "subject_groups"),
            StepStatus::Succeeded,
            vec![
                item("subject_groups", "VIP", ItemStatus::Created, Some("g1")),
                item("subject_groups", "Staff", ItemStatus::AlreadyExists, Some("g2")),
            ],
        ));
        assert_eq!(report.verdict(), Verdict::Success);

        report.push(StepOutcome::not_run(
            StepDefinition::new("configure-rancher", "rancher_env"),
            StepStatus::SkippedNoEndpoint,
        ));
        assert_eq!(report.verdict(), Verdict::Warnings);

        let mut failed = item("devices", "Lobby", ItemStatus::Failed, None);
        failed.message = "devices 'Lobby': create failed: rejected by target: bad url".to_string();
        report.push(outcome(
            StepDefinition::new("configure-devices", "devices"),
            StepStatus::Failed,
            vec![failed],
        ));
        assert_eq!(report.verdict(), Verdict::Failed);

        let counts = report.counts();
        assert_eq!(counts.created, 1);
        assert_eq!(counts.already_exists, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.warnings, 1);
    }

    #[test]
    fn failures_include_blocked_steps() {
        let mut report = report();
        let mut blocked = StepOutcome::not_run(
            StepDefinition::new("configure-inquiries", "inquiries"),
            StepStatus::Failed,
        );
        blocked.error = Some("blocked by dependency 'configure-devices': boom".to_string());
        blocked.blocked_by = Some(BlockedBy {
            dependency: "configure-devices".to_string(),
            root_cause: "boom".to_string(),
        });
        report.push(blocked);

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, None);
        assert!(failures[0].message.contains("configure-devices"));
    }

    #[test]
    fn lookup_uses_recorded_key_policy() {
        let mut report = report();
        report.push(outcome(
            StepDefinition::new("configure-groups", "subject_groups")
                .keyed_by("name", KeyPolicy::PluralTolerant),
            StepStatus::Succeeded,
            vec![item("subject_groups", "Visitors", ItemStatus::Created, Some("g7"))],
        ));
        assert_eq!(
            report.remote_id("subject_groups", "visitor"),
            Some(RemoteId::new("g7"))
        );
        assert_eq!(report.remote_id("subject_groups", "staff"), None);
        assert_eq!(report.remote_id("devices", "Visitors"), None);
    }

    #[test]
    fn summary_separates_warnings_from_failures() {
        let mut report = report();
        report.push(StepOutcome::not_run(
            StepDefinition::new("configure-rancher", "rancher_env"),
            StepStatus::SkippedNoEndpoint,
        ));
        let summary = render_summary(&report);
        assert!(summary.contains("warning: configure-rancher (rancher_env)"));
        assert!(!summary.contains("failure:"));
        assert!(summary.ends_with("result: success_with_warnings\n"));
    }

    #[test]
    fn summary_flags_failures_for_manual_action() {
        let mut report = report();
        let mut failed = item("devices", "Lobby", ItemStatus::Failed, None);
        failed.message = "devices 'Lobby': update failed: timed out: 30s".to_string();
        report.push(outcome(
            StepDefinition::new("configure-devices", "devices"),
            StepStatus::Failed,
            vec![failed],
        ));
        let mut blocked = StepOutcome::not_run(
            StepDefinition::new("configure-inquiries", "inquiries"),
            StepStatus::Failed,
        );
        blocked.error = Some("blocked by dependency 'configure-devices'".to_string());
        report.push(blocked);

        let summary = render_summary(&report);
        assert!(summary.contains(
            "failure: configure-devices: devices 'Lobby': update failed: timed out: 30s (manual action may be needed)\n"
        ));
        assert!(summary.contains(
            "failure: configure-inquiries (inquiries): blocked by dependency 'configure-devices' (manual action may be needed)\n"
        ));
        assert!(summary.ends_with("result: failed\n"));
    }
}

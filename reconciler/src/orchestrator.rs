//! Orchestrator: runs registered steps in dependency order.
//!
//! Per step: `pending -> running -> succeeded | failed | skipped_by_selection
//! | skipped_no_endpoint`. No retries inside a run; re-running the whole spec
//! is safe because steps are idempotent.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::capability::{CapabilityClient, NegotiatedCapabilities};
use crate::core::graph::{check_references, dependency_closure, execution_order};
use crate::core::invariants::validate_spec;
use crate::core::report::RunReport;
use crate::core::types::{
    BlockedBy, DesiredStateSpec, StepDefinition, StepOutcome, StepStatus, TargetIdentity,
};
use crate::error::{PlanError, StepError};
use crate::step::{CategoryStep, Step, StepContext};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Run only this step and its transitive dependencies.
    pub selection: Option<String>,
    /// Declared target identity; fields left unset are taken from the client.
    pub target: TargetIdentity,
    pub spec_digest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    /// True iff no step ended `failed`.
    pub success: bool,
    pub report: RunReport,
}

#[derive(Default)]
pub struct Orchestrator {
    steps: Vec<Box<dyn Step>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = StepDefinition>) -> Self {
        let mut orchestrator = Self::new();
        for definition in definitions {
            orchestrator.register(CategoryStep::new(definition));
        }
        orchestrator
    }

    pub fn register(&mut self, step: impl Step + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn definitions(&self) -> Vec<StepDefinition> {
        self.steps
            .iter()
            .map(|step| step.definition().clone())
            .collect()
    }

    /// Step definitions in execution order.
    pub fn plan(&self) -> Result<Vec<StepDefinition>, PlanError> {
        let definitions = self.definitions();
        let order = execution_order(&definitions)?;
        Ok(order.into_iter().map(|i| definitions[i].clone()).collect())
    }

    /// Check the step graph, the selection and the desired state without running.
    pub fn check(
        &self,
        spec: &DesiredStateSpec,
        selection: Option<&str>,
    ) -> Result<Vec<usize>, PlanError> {
        let definitions = self.definitions();
        let order = execution_order(&definitions)?;
        check_references(&definitions)?;
        if let Some(selection) = selection {
            dependency_closure(&definitions, selection)?;
        }
        let errors = validate_spec(spec, &definitions);
        if !errors.is_empty() {
            return Err(PlanError::InvalidSpec(errors));
        }
        Ok(order)
    }

    /// Execute a run. Only plan errors abort; step and item failures are
    /// recorded in the returned report.
    #[instrument(skip_all, fields(dry_run = options.dry_run, selection = ?options.selection))]
    pub fn run(
        &self,
        spec: &DesiredStateSpec,
        client: &dyn CapabilityClient,
        options: &RunOptions,
    ) -> Result<RunResult, PlanError> {
        let order = self.check(spec, options.selection.as_deref())?;
        let definitions = self.definitions();
        let closure: Option<HashSet<String>> = match &options.selection {
            Some(selection) => Some(dependency_closure(&definitions, selection)?),
            None => None,
        };
        let selected = |id: &str| closure.as_ref().is_none_or(|closure| closure.contains(id));

        let capabilities = NegotiatedCapabilities::negotiate(
            client,
            order
                .iter()
                .map(|&i| &definitions[i])
                .filter(|def| selected(&def.id)),
        );

        let started_at = Utc::now();
        let mut report = RunReport::new(
            run_id(started_at),
            started_at,
            options.target.clone().or(client.identity()),
        );
        report.dry_run = options.dry_run;
        report.selection = options.selection.clone();
        report.spec_digest = options.spec_digest.clone();
        info!(run_id = %report.run_id, target = %report.target, steps = order.len(), "run started");

        for &index in &order {
            let step = self.steps[index].as_ref();
            let outcome = self.run_step(step, spec, client, &capabilities, &report, &selected);
            report.push(outcome);
        }

        report.finish(Utc::now());
        let success = report.success();
        let counts = report.counts();
        info!(
            run_id = %report.run_id,
            success,
            created = counts.created,
            updated = counts.updated,
            already_exists = counts.already_exists,
            failed = counts.failed,
            warnings = counts.warnings,
            "run finished"
        );
        Ok(RunResult { success, report })
    }

    fn run_step(
        &self,
        step: &dyn Step,
        spec: &DesiredStateSpec,
        client: &dyn CapabilityClient,
        capabilities: &NegotiatedCapabilities,
        report: &RunReport,
        selected: &dyn Fn(&str) -> bool,
    ) -> StepOutcome {
        let def = step.definition();
        if !selected(&def.id) {
            debug!(step = %def.id, "skipped by selection");
            return StepOutcome::not_run(def.clone(), StepStatus::SkippedBySelection);
        }

        if let Some(blocker) = def
            .depends_on
            .iter()
            .filter_map(|dep| report.outcome(dep))
            .find(|outcome| !outcome.status.permits_dependents())
        {
            let err = StepError::DependencyBlocked {
                step: def.id.clone(),
                dependency: blocker.step.id.clone(),
                root_cause: root_cause(blocker),
            };
            warn!(step = %def.id, dependency = %blocker.step.id, "blocked by failed dependency");
            let mut outcome = StepOutcome::not_run(def.clone(), StepStatus::Failed);
            outcome.error = Some(err.to_string());
            outcome.blocked_by = Some(BlockedBy {
                dependency: blocker.step.id.clone(),
                root_cause: root_cause(blocker),
            });
            return outcome;
        }

        if !capabilities.supports(&def.category) {
            warn!(step = %def.id, category = %def.category, "category not supported by target");
            return StepOutcome::not_run(def.clone(), StepStatus::SkippedNoEndpoint);
        }

        let items = spec.items(&def.category);
        debug!(step = %def.id, items = items.len(), status = StepStatus::Running.as_str(), "step running");
        let ctx = StepContext {
            client,
            dry_run: report.dry_run,
            ids: report,
        };
        let started = Instant::now();
        let result = step.execute(items, &ctx);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut outcome = StepOutcome::not_run(def.clone(), StepStatus::Succeeded);
        outcome.duration_ms = duration_ms;
        match result {
            Ok(results) => {
                outcome.items = results;
                let failed = outcome.failed_items().count();
                if failed > 0 {
                    outcome.status = StepStatus::Failed;
                    outcome.error = Some(format!(
                        "{failed} of {} items failed",
                        outcome.items.len()
                    ));
                }
            }
            Err(err) => {
                outcome.status = StepStatus::Failed;
                outcome.error = Some(err.to_string());
            }
        }
        info!(
            step = %def.id,
            status = outcome.status.as_str(),
            items = outcome.items.len(),
            duration_ms,
            "step finished"
        );
        outcome
    }
}

fn run_id(at: DateTime<Utc>) -> String {
    format!("run-{}", at.format("%Y%m%d_%H%M%S"))
}

/// The original failure behind a failed step, following blocked chains.
fn root_cause(outcome: &StepOutcome) -> String {
    if let Some(blocked) = &outcome.blocked_by {
        return blocked.root_cause.clone();
    }
    let detail = outcome
        .failed_items()
        .next()
        .map(|item| item.message.clone())
        .or_else(|| outcome.error.clone())
        .unwrap_or_else(|| "step failed".to_string());
    format!("step '{}' failed: {detail}", outcome.step.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ItemResult, ItemSpec};
    use crate::error::CapabilityError;
    use crate::test_support::{FakeTarget, spec};

    struct BrokenStep(StepDefinition);

    impl Step for BrokenStep {
        fn definition(&self) -> &StepDefinition {
            &self.0
        }

        fn execute(
            &self,
            _items: &[ItemSpec],
            _ctx: &StepContext<'_>,
        ) -> Result<Vec<ItemResult>, StepError> {
            Err(StepError::Setup {
                step: self.0.id.clone(),
                message: "upload directory missing".to_string(),
            })
        }
    }

    #[test]
    fn blocked_chain_keeps_root_cause() {
        let target = FakeTarget::new();
        target.fail_create("device_groups", "Entrances", CapabilityError::Timeout("30s".into()));
        let orchestrator = Orchestrator::from_definitions([
            StepDefinition::new("configure-device-groups", "device_groups"),
            StepDefinition::new("configure-devices", "devices").after("configure-device-groups"),
            StepDefinition::new("configure-inquiries", "inquiries").after("configure-devices"),
        ]);
        let spec = spec(vec![
            ("device_groups", vec![ItemSpec::new("Entrances")]),
            ("devices", vec![ItemSpec::new("Lobby")]),
        ]);

        let result = orchestrator
            .run(&spec, &target, &RunOptions::default())
            .expect("run");

        assert!(!result.success);
        let inquiries = result.report.outcome("configure-inquiries").expect("outcome");
        assert_eq!(inquiries.status, StepStatus::Failed);
        let blocked = inquiries.blocked_by.as_ref().expect("blocked");
        assert_eq!(blocked.dependency, "configure-devices");
        assert!(blocked.root_cause.starts_with("step 'configure-device-groups' failed"));
        assert!(blocked.root_cause.contains("timed out: 30s"));
        assert_eq!(target.item_calls("devices"), 0);
    }

    #[test]
    fn setup_failure_fails_step_without_aborting_run() {
        let target = FakeTarget::new();
        let mut orchestrator = Orchestrator::new();
        orchestrator.register(BrokenStep(StepDefinition::new("upload-files", "files")));
        orchestrator.register(CategoryStep::new(StepDefinition::new("set-kv-params", "kv_parameters")));
        let spec = spec(vec![("kv_parameters", vec![ItemSpec::new("retention_days")])]);

        let result = orchestrator
            .run(&spec, &target, &RunOptions::default())
            .expect("run");

        assert!(!result.success);
        let files = result.report.outcome("upload-files").expect("outcome");
        assert_eq!(files.status, StepStatus::Failed);
        assert!(files.error.as_deref().is_some_and(|e| e.contains("upload directory missing")));
        let kv = result.report.outcome("set-kv-params").expect("outcome");
        assert_eq!(kv.status, StepStatus::Succeeded);
    }

    #[test]
    fn invalid_spec_aborts_before_any_call() {
        let target = FakeTarget::new();
        let orchestrator =
            Orchestrator::from_definitions([StepDefinition::new("configure-devices", "devices")]);
        let spec = spec(vec![("cameras", vec![ItemSpec::new("Lobby")])]);

        let err = orchestrator
            .run(&spec, &target, &RunOptions::default())
            .expect_err("invalid");
        assert!(matches!(err, PlanError::InvalidSpec(_)));
        assert!(target.calls().is_empty());
    }

    #[test]
    fn unknown_selection_is_a_plan_error() {
        let target = FakeTarget::new();
        let orchestrator =
            Orchestrator::from_definitions([StepDefinition::new("configure-devices", "devices")]);
        let options = RunOptions {
            selection: Some("configure-cameras".to_string()),
            ..RunOptions::default()
        };
        let err = orchestrator
            .run(&DesiredStateSpec::default(), &target, &options)
            .expect_err("unknown step");
        assert_eq!(err, PlanError::UnknownStep("configure-cameras".to_string()));
    }

    #[test]
    fn unsupported_category_is_a_warning_and_dependents_run() {
        let target = FakeTarget::new().with_identity("10.1.1.4", "2.6.0");
        target.unsupported("device_groups");
        let orchestrator = Orchestrator::from_definitions([
            StepDefinition::new("configure-device-groups", "device_groups"),
            StepDefinition::new("configure-devices", "devices").after("configure-device-groups"),
        ]);
        let spec = spec(vec![("devices", vec![ItemSpec::new("Lobby")])]);
        let options = RunOptions {
            target: TargetIdentity {
                address: None,
                version: Some("2.8".to_string()),
            },
            ..RunOptions::default()
        };

        let result = orchestrator.run(&spec, &target, &options).expect("run");

        assert!(result.success);
        let groups = result.report.outcome("configure-device-groups").expect("outcome");
        assert_eq!(groups.status, StepStatus::SkippedNoEndpoint);
        assert_eq!(target.item_calls("device_groups"), 0);
        let devices = result.report.outcome("configure-devices").expect("outcome");
        assert_eq!(devices.status, StepStatus::Succeeded);
        assert_eq!(result.report.counts().warnings, 1);
        assert_eq!(result.report.target.address.as_deref(), Some("10.1.1.4"));
        assert_eq!(result.report.target.version.as_deref(), Some("2.8"));
    }
}

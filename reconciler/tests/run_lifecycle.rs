//! Engine-level run scenarios against the in-memory fake target.
//!
//! Each test drives `Orchestrator::run` over the built-in step catalog and
//! checks the recorded outcomes and the calls the target received.

use reconciler::audit::{AuditStatus, audit_report};
use reconciler::catalog::builtin_steps;
use reconciler::core::report::Verdict;
use reconciler::core::types::{DesiredStateSpec, ItemSpec, ItemStatus, StepStatus};
use reconciler::error::CapabilityError;
use reconciler::orchestrator::{Orchestrator, RunOptions, RunResult};
use reconciler::test_support::{FakeTarget, fields, spec};
use serde_json::json;

fn site() -> DesiredStateSpec {
    spec(vec![
        ("user_groups", vec![ItemSpec::new("ops")]),
        (
            "users",
            vec![
                ItemSpec::new("alice")
                    .with_field("group", "ops")
                    .with_field("role", "admin"),
            ],
        ),
        ("subject_groups", vec![ItemSpec::new("VIP")]),
        (
            "subjects",
            vec![
                ItemSpec::new("Jane Doe")
                    .with_field("group", "VIP")
                    .with_child("images", ItemSpec::new("jane-1.jpg"))
                    .with_child("images", ItemSpec::new("jane-2.jpg")),
            ],
        ),
        ("device_groups", vec![ItemSpec::new("Lobby")]),
        (
            "devices",
            vec![
                ItemSpec::new("cam-1")
                    .with_field("group", "Lobby")
                    .with_field("threshold", 0.5),
            ],
        ),
        (
            "inquiries",
            vec![ItemSpec::new("case-7").with_field("priority", 101)],
        ),
    ])
}

fn run(target: &FakeTarget, options: &RunOptions) -> RunResult {
    Orchestrator::from_definitions(builtin_steps())
        .run(&site(), target, options)
        .expect("run")
}

fn status(result: &RunResult, step: &str) -> StepStatus {
    result.report.outcome(step).expect("outcome").status
}

#[test]
fn second_run_performs_no_writes() {
    let target = FakeTarget::new();
    let first = run(&target, &RunOptions::default());
    assert!(first.success);
    assert_eq!(first.report.counts().created, 9);

    target.clear_calls();
    let second = run(&target, &RunOptions::default());
    assert!(second.success);
    assert_eq!(target.writes(), 0);
    let counts = second.report.counts();
    assert_eq!(counts.created, 0);
    assert_eq!(counts.already_exists, 9);
}

#[test]
fn references_carry_ids_recorded_earlier_in_the_run() {
    let target = FakeTarget::new();
    run(&target, &RunOptions::default());

    let group = target.entity("user_groups", "ops").expect("group");
    let user = target.entity("users", "alice").expect("user");
    assert_eq!(user.fields.get("group"), Some(&json!(group.id.as_str())));

    let subject = target.entity("subjects", "Jane Doe").expect("subject");
    let images = target.entities("subjects/images");
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(|image| image.parent.as_ref() == Some(&subject.id)));
}

#[test]
fn stringly_typed_target_values_are_not_rewritten() {
    let target = FakeTarget::new();
    let lobby = target.seed("device_groups", "Lobby", fields(&[]));
    target.seed(
        "devices",
        "CAM-1",
        fields(&[
            ("group", json!(lobby.as_str())),
            ("threshold", json!("0.5")),
        ]),
    );

    let result = run(&target, &RunOptions::default());
    let devices = result.report.outcome("configure-devices").expect("devices");
    assert_eq!(devices.items[0].status, ItemStatus::AlreadyExists);
    assert_eq!(target.entities("devices").len(), 1);
}

#[test]
fn dry_run_reports_intent_without_writing() {
    let target = FakeTarget::new();
    target.seed("device_groups", "Lobby", fields(&[("site", json!("hq"))]));

    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let result = run(&target, &options);
    assert_eq!(target.writes(), 0);
    assert!(result.report.dry_run);
    assert_eq!(result.report.verdict(), Verdict::Success);

    let groups = result.report.outcome("configure-device-groups").expect("groups");
    assert_eq!(groups.items[0].status, ItemStatus::AlreadyExists);
    let users = result.report.outcome("configure-accounts").expect("users");
    assert_eq!(users.items[0].status, ItemStatus::DryRunWouldCreate);
    let subjects = result.report.outcome("populate-watchlist").expect("subjects");
    assert!(
        subjects
            .items
            .iter()
            .all(|item| item.status == ItemStatus::DryRunWouldCreate)
    );
    assert_eq!(target.item_calls("subjects/images"), 0);
}

#[test]
fn failed_dependency_blocks_the_whole_chain() {
    let target = FakeTarget::new();
    target.fail_create(
        "device_groups",
        "Lobby",
        CapabilityError::Rejected("quota exceeded".to_string()),
    );

    let result = run(&target, &RunOptions::default());
    assert!(!result.success);
    assert_eq!(result.report.verdict(), Verdict::Failed);
    assert_eq!(status(&result, "configure-device-groups"), StepStatus::Failed);

    let devices = result.report.outcome("configure-devices").expect("devices");
    assert_eq!(devices.status, StepStatus::Failed);
    assert!(devices.items.is_empty());
    let blocked = devices.blocked_by.as_ref().expect("blocked");
    assert_eq!(blocked.dependency, "configure-device-groups");

    let inquiries = result.report.outcome("configure-inquiries").expect("inquiries");
    let blocked = inquiries.blocked_by.as_ref().expect("blocked");
    assert_eq!(blocked.dependency, "configure-devices");
    assert!(blocked.root_cause.contains("configure-device-groups"));
    assert!(blocked.root_cause.contains("quota exceeded"));
    assert_eq!(target.item_calls("devices"), 0);
    assert_eq!(target.item_calls("inquiries"), 0);

    assert_eq!(status(&result, "configure-accounts"), StepStatus::Succeeded);
    assert_eq!(status(&result, "populate-watchlist"), StepStatus::Succeeded);
}

#[test]
fn selection_runs_only_the_step_and_its_dependencies() {
    let target = FakeTarget::new();
    let options = RunOptions {
        selection: Some("configure-accounts".to_string()),
        ..RunOptions::default()
    };
    let result = run(&target, &options);
    assert!(result.success);
    assert_eq!(result.report.selection.as_deref(), Some("configure-accounts"));
    assert_eq!(status(&result, "configure-user-groups"), StepStatus::Succeeded);
    assert_eq!(status(&result, "configure-accounts"), StepStatus::Succeeded);
    assert_eq!(status(&result, "configure-devices"), StepStatus::SkippedBySelection);
    assert_eq!(status(&result, "populate-watchlist"), StepStatus::SkippedBySelection);
    assert_eq!(target.item_calls("devices"), 0);
    assert_eq!(target.item_calls("subjects"), 0);
}

#[test]
fn audit_of_a_clean_run_passes_then_finds_drift() {
    let target = FakeTarget::new();
    let result = run(&target, &RunOptions::default());

    let clean = audit_report(&result.report, &target);
    assert!(clean.success());
    assert_eq!(clean.counts().passed, 9);

    target.set_field("devices", "cam-1", "threshold", json!(0.9));
    target.remove("subjects", "Jane Doe");
    let drifted = audit_report(&result.report, &target);
    assert!(!drifted.success());
    let counts = drifted.counts();
    assert_eq!(counts.mismatch, 1);
    assert_eq!(counts.missing, 3);

    let device = drifted
        .entries
        .iter()
        .find(|entry| entry.category == "devices")
        .expect("device entry");
    assert_eq!(device.status, AuditStatus::Mismatch);
    assert!(device.diff.contains_key("threshold"));
}

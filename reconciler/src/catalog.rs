//! Built-in steps for the appliance, and merging of configured overrides.

use crate::core::matching::KeyPolicy;
use crate::core::types::{ChildDefinition, StepDefinition};

/// The default step catalog, in registration order.
pub fn builtin_steps() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new("set-kv-params", "kv_parameters")
            .describe("Set key/value system parameters")
            .keyed_by("key", KeyPolicy::CaseSensitive),
        StepDefinition::new("configure-system", "system_settings")
            .describe("Apply system settings sections")
            .keyed_by("section", KeyPolicy::CaseSensitive),
        StepDefinition::new("configure-groups", "subject_groups")
            .describe("Create watch-list subject groups")
            .keyed_by("name", KeyPolicy::PluralTolerant),
        StepDefinition::new("configure-device-groups", "device_groups")
            .describe("Create camera groups"),
        StepDefinition::new("configure-user-groups", "user_groups")
            .describe("Create user groups"),
        StepDefinition::new("configure-accounts", "users")
            .describe("Create user accounts")
            .after("configure-user-groups")
            .keyed_by("username", KeyPolicy::CaseSensitive)
            .reference("group", "user_groups"),
        StepDefinition::new("populate-watchlist", "subjects")
            .describe("Add watch-list subjects and their images")
            .after("configure-groups")
            .reference("group", "subject_groups")
            .child("images", ChildDefinition::default()),
        StepDefinition::new("configure-devices", "devices")
            .describe("Create cameras")
            .after("configure-device-groups")
            .reference("group", "device_groups"),
        StepDefinition::new("configure-inquiries", "inquiries")
            .describe("Create inquiry cases")
            .after("configure-devices"),
        StepDefinition::new("upload-mass-import", "mass_import")
            .describe("Upload mass-import archives")
            .after("configure-groups")
            .keyed_by("file", KeyPolicy::CaseSensitive),
        StepDefinition::new("configure-rancher", "rancher_env")
            .describe("Set orchestration workload environment variables")
            .keyed_by("name", KeyPolicy::CaseSensitive),
        StepDefinition::new("upload-files", "files")
            .describe("Copy files to the appliance")
            .keyed_by("path", KeyPolicy::CaseSensitive),
    ]
}

/// Apply configured step definitions: same id replaces, new id appends.
pub fn merge_steps(
    builtin: Vec<StepDefinition>,
    overrides: &[StepDefinition],
) -> Vec<StepDefinition> {
    let mut steps = builtin;
    for step in overrides {
        match steps.iter_mut().find(|existing| existing.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::execution_order;

    #[test]
    fn builtin_catalog_is_a_valid_graph() {
        let steps = builtin_steps();
        let order = execution_order(&steps).expect("order");
        let position = |id: &str| {
            order
                .iter()
                .position(|&i| steps[i].id == id)
                .expect("step present")
        };
        assert!(position("configure-groups") < position("populate-watchlist"));
        assert!(position("configure-devices") < position("configure-inquiries"));
        assert!(position("configure-user-groups") < position("configure-accounts"));
    }

    #[test]
    fn every_reference_points_at_a_dependency() {
        let steps = builtin_steps();
        for step in &steps {
            for category in step.references.values() {
                let owner = steps
                    .iter()
                    .find(|other| &other.category == category)
                    .expect("referenced category has a step");
                assert!(step.depends_on.contains(&owner.id), "{} -> {}", step.id, owner.id);
            }
        }
    }

    #[test]
    fn overrides_replace_by_id_and_append_new_steps() {
        let overrides = vec![
            StepDefinition::new("configure-devices", "devices")
                .after("configure-device-groups")
                .keyed_by("name", KeyPolicy::CaseSensitive),
            StepDefinition::new("configure-floors", "floors"),
        ];
        let merged = merge_steps(builtin_steps(), &overrides);
        assert_eq!(merged.len(), builtin_steps().len() + 1);
        let devices = merged
            .iter()
            .find(|step| step.id == "configure-devices")
            .expect("devices");
        assert_eq!(devices.key_policy, KeyPolicy::CaseSensitive);
        assert_eq!(merged.last().map(|s| s.id.as_str()), Some("configure-floors"));
    }
}

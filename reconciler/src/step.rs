//! Steps: converge one resource category against the target.
//!
//! A step resolves every declared item, then creates what is absent and
//! updates only the differing fields of what is present. Item failures are
//! recorded on the item and never stop sibling items.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::{CapabilityClient, Scope, child_category};
use crate::core::matching::KeyPolicy;
use crate::core::report::IdLookup;
use crate::core::types::{FieldMap, ItemResult, ItemSpec, ItemStatus, RemoteId, StepDefinition};
use crate::error::{ItemError, Operation, StepError};
use crate::resolver::{Resolution, resolve};

/// What a step may use while executing.
pub struct StepContext<'a> {
    pub client: &'a dyn CapabilityClient,
    pub dry_run: bool,
    /// Remote ids recorded by earlier steps of the same run.
    pub ids: &'a dyn IdLookup,
}

pub trait Step {
    fn definition(&self) -> &StepDefinition;

    /// Converge `items`. An `Err` means the step could not start at all.
    fn execute(
        &self,
        items: &[ItemSpec],
        ctx: &StepContext<'_>,
    ) -> Result<Vec<ItemResult>, StepError>;
}

/// The generic step: everything it needs is in its [`StepDefinition`].
#[derive(Debug, Clone)]
pub struct CategoryStep {
    definition: StepDefinition,
}

impl CategoryStep {
    pub fn new(definition: StepDefinition) -> Self {
        Self { definition }
    }
}

impl Step for CategoryStep {
    fn definition(&self) -> &StepDefinition {
        &self.definition
    }

    fn execute(
        &self,
        items: &[ItemSpec],
        ctx: &StepContext<'_>,
    ) -> Result<Vec<ItemResult>, StepError> {
        let def = &self.definition;
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let parent = converge(
                ctx,
                Target {
                    scope: Scope::top(&def.category),
                    parent_key: None,
                    policy: def.key_policy,
                    references: &def.references,
                },
                item,
            );
            let parent_status = parent.status;
            let parent_id = parent.remote_id.clone();
            results.push(parent);

            for (kind, children) in &item.children {
                let category = child_category(&def.category, kind);
                let policy = def
                    .children
                    .get(kind)
                    .map_or(KeyPolicy::CaseSensitive, |child| child.key_policy);
                for child in children {
                    let result = match (&parent_id, parent_status) {
                        (_, ItemStatus::DryRunWouldCreate) => item_result(
                            &category,
                            child,
                            Some(item.key.as_str()),
                            ItemStatus::DryRunWouldCreate,
                            None,
                            "would create (parent would be created)".to_string(),
                        ),
                        (Some(parent_id), status) if !status.is_failure() => converge(
                            ctx,
                            Target {
                                scope: Scope::child(&category, parent_id),
                                parent_key: Some(item.key.as_str()),
                                policy,
                                references: &BTreeMap::new(),
                            },
                            child,
                        ),
                        _ => item_result(
                            &category,
                            child,
                            Some(item.key.as_str()),
                            ItemStatus::Failed,
                            None,
                            format!(
                                "{category} '{}': parent '{}' did not converge",
                                child.key, item.key
                            ),
                        ),
                    };
                    results.push(result);
                }
            }
        }
        Ok(results)
    }
}

struct Target<'a> {
    scope: Scope<'a>,
    parent_key: Option<&'a str>,
    policy: KeyPolicy,
    references: &'a BTreeMap<String, String>,
}

/// Resolve and converge a single item.
fn converge(ctx: &StepContext<'_>, target: Target<'_>, item: &ItemSpec) -> ItemResult {
    let category = target.scope.category;
    let finish = |status: ItemStatus, id: Option<RemoteId>, message: String| {
        if status.is_failure() {
            warn!(category, key = %item.key, %message, "item failed");
        } else {
            debug!(category, key = %item.key, status = status.as_str(), "item converged");
        }
        item_result(category, item, target.parent_key, status, id, message)
    };

    let desired = match apply_references(
        category,
        &item.key,
        &item.fields,
        target.references,
        ctx.ids,
        ctx.dry_run,
    ) {
        Ok(desired) => desired,
        Err(err) => return finish(ItemStatus::Failed, None, err.to_string()),
    };

    let resolution = match resolve(ctx.client, &target.scope, &item.key, target.policy, &desired) {
        Ok(resolution) => resolution,
        Err(err) => return finish(ItemStatus::Failed, None, err.to_string()),
    };

    match resolution {
        Resolution::Match { id } => finish(
            ItemStatus::AlreadyExists,
            Some(id),
            "already exists".to_string(),
        ),
        Resolution::Absent if ctx.dry_run => {
            finish(ItemStatus::DryRunWouldCreate, None, "would create".to_string())
        }
        Resolution::Absent => match ctx.client.create(&target.scope, &item.key, &desired) {
            Ok(id) => finish(ItemStatus::Created, Some(id), "created".to_string()),
            Err(source) => {
                let err = ItemError::Convergence {
                    category: category.to_string(),
                    key: item.key.clone(),
                    operation: Operation::Create,
                    source,
                };
                finish(ItemStatus::Failed, None, err.to_string())
            }
        },
        Resolution::Differ { id, diff } => {
            let changed: FieldMap = diff
                .keys()
                .filter_map(|name| Some((name.clone(), desired.get(name)?.clone())))
                .collect();
            let names: Vec<String> = changed.keys().cloned().collect();
            let mut result = if ctx.dry_run {
                finish(
                    ItemStatus::DryRunWouldUpdate,
                    Some(id),
                    format!("would update {}", names.join(", ")),
                )
            } else {
                match ctx.client.update(&target.scope, &id, &changed) {
                    Ok(()) => finish(
                        ItemStatus::Updated,
                        Some(id),
                        format!("updated {}", names.join(", ")),
                    ),
                    Err(source) => {
                        let err = ItemError::Convergence {
                            category: category.to_string(),
                            key: item.key.clone(),
                            operation: Operation::Update,
                            source,
                        };
                        finish(ItemStatus::Failed, Some(id), err.to_string())
                    }
                }
            };
            result.changed_fields = names;
            result
        }
    }
}

fn item_result(
    category: &str,
    item: &ItemSpec,
    parent: Option<&str>,
    status: ItemStatus,
    remote_id: Option<RemoteId>,
    message: String,
) -> ItemResult {
    ItemResult {
        category: category.to_string(),
        key: item.key.clone(),
        parent: parent.map(str::to_string),
        status,
        remote_id,
        message,
        fields: item.fields.clone(),
        changed_fields: Vec::new(),
    }
}

/// Replace reference fields (natural keys of items in another category)
/// with the remote ids `ids` knows for them.
///
/// A string field or an array of strings is substituted. In dry-run an
/// unknown reference keeps its declared value, since the referenced item
/// may only be "would create".
pub fn apply_references(
    category: &str,
    key: &str,
    fields: &FieldMap,
    references: &BTreeMap<String, String>,
    ids: &dyn IdLookup,
    dry_run: bool,
) -> Result<FieldMap, ItemError> {
    let mut desired = fields.clone();
    for (field, target_category) in references {
        let Some(value) = desired.get_mut(field) else {
            continue;
        };
        let substitute = |declared: &mut Value| -> Result<(), ItemError> {
            let Value::String(target_key) = declared else {
                return Ok(());
            };
            match ids.remote_id(target_category, target_key) {
                Some(id) => *declared = Value::String(id.0),
                None if dry_run => {}
                None => {
                    return Err(ItemError::UnresolvedReference {
                        category: category.to_string(),
                        key: key.to_string(),
                        field: field.clone(),
                        target_category: target_category.clone(),
                        target_key: target_key.clone(),
                    });
                }
            }
            Ok(())
        };
        match value {
            Value::Array(entries) => {
                for entry in entries.iter_mut() {
                    substitute(entry)?;
                }
            }
            other => substitute(other)?,
        }
    }
    Ok(desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChildDefinition;
    use crate::error::CapabilityError;
    use crate::test_support::{FakeTarget, fields};
    use serde_json::json;

    struct NoIds;

    impl IdLookup for NoIds {
        fn remote_id(&self, _category: &str, _key: &str) -> Option<RemoteId> {
            None
        }
    }

    struct Ids(Vec<(&'static str, &'static str, &'static str)>);

    impl IdLookup for Ids {
        fn remote_id(&self, category: &str, key: &str) -> Option<RemoteId> {
            self.0
                .iter()
                .find(|(c, k, _)| *c == category && *k == key)
                .map(|(_, _, id)| RemoteId::new(*id))
        }
    }

    fn ctx<'a>(client: &'a FakeTarget, ids: &'a dyn IdLookup, dry_run: bool) -> StepContext<'a> {
        StepContext {
            client,
            dry_run,
            ids,
        }
    }

    fn statuses(results: &[ItemResult]) -> Vec<(&str, ItemStatus)> {
        results
            .iter()
            .map(|result| (result.key.as_str(), result.status))
            .collect()
    }

    #[test]
    fn one_failing_create_does_not_stop_siblings() {
        let target = FakeTarget::new();
        target.seed("devices", "Gate", FieldMap::new());
        target.fail_create(
            "devices",
            "Lobby",
            CapabilityError::Rejected("rtsp url in use".into()),
        );
        let step = CategoryStep::new(StepDefinition::new("configure-devices", "devices"));
        let items = vec![
            ItemSpec::new("Entrance"),
            ItemSpec::new("Lobby"),
            ItemSpec::new("gate"),
        ];

        let results = step.execute(&items, &ctx(&target, &NoIds, false)).expect("execute");

        assert_eq!(
            statuses(&results),
            vec![
                ("Entrance", ItemStatus::Created),
                ("Lobby", ItemStatus::Failed),
                ("gate", ItemStatus::AlreadyExists),
            ]
        );
        assert!(results[1].message.contains("devices 'Lobby'"));
        assert!(results[1].message.contains("rtsp url in use"));
    }

    #[test]
    fn update_sends_only_differing_fields() {
        let target = FakeTarget::new();
        target.seed(
            "devices",
            "Lobby",
            fields(&[("threshold", json!("0.5")), ("enabled", json!(false))]),
        );
        let step = CategoryStep::new(StepDefinition::new("configure-devices", "devices"));
        let items = vec![
            ItemSpec::new("Lobby")
                .with_field("threshold", 0.5)
                .with_field("enabled", true),
        ];

        let results = step.execute(&items, &ctx(&target, &NoIds, false)).expect("execute");

        assert_eq!(results[0].status, ItemStatus::Updated);
        assert_eq!(results[0].changed_fields, vec!["enabled".to_string()]);
        let stored = target.entity("devices", "Lobby").expect("entity");
        assert_eq!(stored.fields["enabled"], json!(true));
        assert_eq!(stored.fields["threshold"], json!("0.5"));
    }

    #[test]
    fn dry_run_reports_differing_items_without_updating() {
        let target = FakeTarget::new();
        let noa = target.seed("subjects", "Noa", fields(&[("watch", json!(false))]));
        target.seed_child(
            "subjects/images",
            &noa,
            "noa.jpg",
            fields(&[("primary", json!(false))]),
        );
        let step = CategoryStep::new(
            StepDefinition::new("populate-watchlist", "subjects")
                .child("images", ChildDefinition::default()),
        );
        let items = vec![
            ItemSpec::new("Noa")
                .with_field("watch", true)
                .with_child("images", ItemSpec::new("noa.jpg").with_field("primary", true)),
        ];

        let results = step.execute(&items, &ctx(&target, &NoIds, true)).expect("execute");

        assert_eq!(
            statuses(&results),
            vec![
                ("Noa", ItemStatus::DryRunWouldUpdate),
                ("noa.jpg", ItemStatus::DryRunWouldUpdate),
            ]
        );
        assert_eq!(results[0].remote_id.as_ref(), Some(&noa));
        assert_eq!(results[0].changed_fields, vec!["watch".to_string()]);
        assert_eq!(results[0].message, "would update watch");
        assert_eq!(results[1].changed_fields, vec!["primary".to_string()]);
        assert_eq!(target.writes(), 0);
        let stored = target.entity("subjects", "Noa").expect("entity");
        assert_eq!(stored.fields["watch"], json!(false));
    }

    #[test]
    fn failing_update_fails_only_that_item() {
        let target = FakeTarget::new();
        target.seed("devices", "Lobby", fields(&[("enabled", json!(false))]));
        target.seed("devices", "Dock", fields(&[("enabled", json!(true))]));
        target.fail_updates(
            "devices",
            CapabilityError::Unauthorized("token expired".into()),
        );
        let step = CategoryStep::new(StepDefinition::new("configure-devices", "devices"));
        let items = vec![
            ItemSpec::new("Lobby").with_field("enabled", true),
            ItemSpec::new("Gate").with_field("enabled", true),
            ItemSpec::new("Dock").with_field("enabled", true),
        ];

        let results = step.execute(&items, &ctx(&target, &NoIds, false)).expect("execute");

        assert_eq!(
            statuses(&results),
            vec![
                ("Lobby", ItemStatus::Failed),
                ("Gate", ItemStatus::Created),
                ("Dock", ItemStatus::AlreadyExists),
            ]
        );
        assert_eq!(
            results[0].message,
            "devices 'Lobby': update failed: unauthorized: token expired"
        );
        assert_eq!(results[0].changed_fields, vec!["enabled".to_string()]);
        let stored = target.entity("devices", "Lobby").expect("entity");
        assert_eq!(stored.fields["enabled"], json!(false));
    }

    #[test]
    fn children_follow_their_parent() {
        let target = FakeTarget::new();
        target.fail_create("subjects", "Noa", CapabilityError::Timeout("30s".into()));
        let def = StepDefinition::new("populate-watchlist", "subjects")
            .child("images", ChildDefinition::default());
        let step = CategoryStep::new(def);
        let items = vec![
            ItemSpec::new("Dana")
                .with_child("images", ItemSpec::new("dana-1.jpg"))
                .with_child("images", ItemSpec::new("dana-2.jpg")),
            ItemSpec::new("Noa").with_child("images", ItemSpec::new("noa.jpg")),
        ];

        let results = step.execute(&items, &ctx(&target, &NoIds, false)).expect("execute");

        assert_eq!(
            statuses(&results),
            vec![
                ("Dana", ItemStatus::Created),
                ("dana-1.jpg", ItemStatus::Created),
                ("dana-2.jpg", ItemStatus::Created),
                ("Noa", ItemStatus::Failed),
                ("noa.jpg", ItemStatus::Failed),
            ]
        );
        assert_eq!(results[1].category, "subjects/images");
        assert_eq!(results[1].parent.as_deref(), Some("Dana"));
        let dana = results[0].remote_id.clone().expect("id");
        let images = target.entities("subjects/images");
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|image| image.parent.as_ref() == Some(&dana)));
        assert_eq!(target.item_calls("subjects/images"), 4);
    }

    #[test]
    fn dry_run_never_writes_and_skips_child_queries_under_new_parent() {
        let target = FakeTarget::new();
        let def = StepDefinition::new("populate-watchlist", "subjects")
            .child("images", ChildDefinition::default());
        let step = CategoryStep::new(def);
        let items = vec![ItemSpec::new("Dana").with_child("images", ItemSpec::new("a.jpg"))];

        let results = step.execute(&items, &ctx(&target, &NoIds, true)).expect("execute");

        assert_eq!(
            statuses(&results),
            vec![
                ("Dana", ItemStatus::DryRunWouldCreate),
                ("a.jpg", ItemStatus::DryRunWouldCreate),
            ]
        );
        assert_eq!(target.writes(), 0);
        assert_eq!(target.item_calls("subjects/images"), 0);
    }

    #[test]
    fn references_are_replaced_by_recorded_ids() {
        let target = FakeTarget::new();
        let def = StepDefinition::new("configure-devices", "devices")
            .reference("group", "device_groups");
        let step = CategoryStep::new(def);
        let ids = Ids(vec![("device_groups", "Entrances", "17")]);
        let items = vec![ItemSpec::new("Lobby").with_field("group", "Entrances")];

        let results = step.execute(&items, &ctx(&target, &ids, false)).expect("execute");

        assert_eq!(results[0].status, ItemStatus::Created);
        assert_eq!(results[0].fields["group"], json!("Entrances"));
        let stored = target.entity("devices", "Lobby").expect("entity");
        assert_eq!(stored.fields["group"], json!("17"));

        let again = step.execute(&items, &ctx(&target, &ids, false)).expect("execute");
        assert_eq!(again[0].status, ItemStatus::AlreadyExists);
    }

    #[test]
    fn unresolved_reference_fails_only_outside_dry_run() {
        let target = FakeTarget::new();
        let def = StepDefinition::new("configure-accounts", "users")
            .reference("group", "user_groups");
        let step = CategoryStep::new(def);
        let items = vec![ItemSpec::new("ops").with_field("group", "Operators")];

        let results = step.execute(&items, &ctx(&target, &NoIds, false)).expect("execute");
        assert_eq!(results[0].status, ItemStatus::Failed);
        assert!(results[0].message.contains("user_groups 'Operators'"));
        assert_eq!(target.writes(), 0);

        let results = step.execute(&items, &ctx(&target, &NoIds, true)).expect("execute");
        assert_eq!(results[0].status, ItemStatus::DryRunWouldCreate);
    }
}

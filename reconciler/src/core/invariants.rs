//! Semantic checks on a desired-state document before a run starts.

use std::collections::{HashMap, HashSet};

use crate::core::matching::KeyPolicy;
use crate::core::types::{DesiredStateSpec, ItemSpec, StepDefinition};

/// Check invariants the loader cannot express:
/// - every category is converged by a registered step, and appears once
/// - natural keys are non-empty and unique within their category
/// - child kinds are declared by the step, children have no children
///
/// Uniqueness uses the category's own key policy, so two names that would
/// resolve to the same remote entity are rejected.
pub fn validate_spec(spec: &DesiredStateSpec, steps: &[StepDefinition]) -> Vec<String> {
    let mut errors = Vec::new();
    let by_category: HashMap<&str, &StepDefinition> = steps
        .iter()
        .map(|step| (step.category.as_str(), step))
        .collect();

    let mut seen_categories = HashSet::new();
    for category in &spec.categories {
        let name = category.category.as_str();
        if !seen_categories.insert(name) {
            errors.push(format!("{name}: category declared more than once"));
        }
        let Some(step) = by_category.get(name) else {
            errors.push(format!("{name}: no step converges this category"));
            continue;
        };
        check_keys(name, &category.items, step.key_policy, &mut errors);
        for item in &category.items {
            check_children(name, item, step, &mut errors);
        }
    }
    errors
}

fn check_keys(path: &str, items: &[ItemSpec], policy: KeyPolicy, errors: &mut Vec<String>) {
    for (position, item) in items.iter().enumerate() {
        if item.key.trim().is_empty() {
            errors.push(format!("{path}[{position}]: natural key is empty"));
            continue;
        }
        let duplicate = items[..position]
            .iter()
            .any(|earlier| policy.keys_equal(&earlier.key, &item.key));
        if duplicate {
            errors.push(format!("{path}: duplicate key '{}'", item.key));
        }
    }
}

fn check_children(category: &str, item: &ItemSpec, step: &StepDefinition, errors: &mut Vec<String>) {
    for (kind, children) in &item.children {
        let path = format!("{category}/{}/{kind}", item.key);
        let Some(child) = step.children.get(kind) else {
            errors.push(format!("{path}: step '{}' declares no child kind '{kind}'", step.id));
            continue;
        };
        check_keys(&path, children, child.key_policy, errors);
        for grandchild in children.iter().filter(|c| !c.children.is_empty()) {
            errors.push(format!("{path}/{}: children cannot be nested further", grandchild.key));
        }
    }
}

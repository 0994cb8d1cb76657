//! Step dependency graph: validation, execution order, selection closure.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::types::StepDefinition;
use crate::error::PlanError;

/// Validate step ids and dependencies, and return a topological execution
/// order as indices into `steps`.
///
/// Among steps whose dependencies are satisfied, the one registered first
/// runs first, so the order is deterministic.
pub fn execution_order(steps: &[StepDefinition]) -> Result<Vec<usize>, PlanError> {
    let index = index_by_id(steps)?;

    let mut pending: Vec<usize> = vec![0; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (position, step) in steps.iter().enumerate() {
        let mut seen = HashSet::new();
        for dependency in &step.depends_on {
            if dependency == &step.id {
                return Err(PlanError::DependencyCycle(vec![
                    step.id.clone(),
                    step.id.clone(),
                ]));
            }
            let Some(&dep_position) = index.get(dependency.as_str()) else {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            };
            if seen.insert(dep_position) {
                pending[position] += 1;
                dependents[dep_position].push(position);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < steps.len() {
        let done: HashSet<usize> = order.iter().copied().collect();
        return Err(PlanError::DependencyCycle(find_cycle(steps, &index, &done)));
    }
    Ok(order)
}

/// The step named `target` plus every step it transitively depends on.
pub fn dependency_closure(
    steps: &[StepDefinition],
    target: &str,
) -> Result<HashSet<String>, PlanError> {
    let by_id: HashMap<&str, &StepDefinition> =
        steps.iter().map(|step| (step.id.as_str(), step)).collect();
    if !by_id.contains_key(target) {
        return Err(PlanError::UnknownStep(target.to_string()));
    }

    let mut closure = HashSet::new();
    let mut stack = vec![target.to_string()];
    while let Some(id) = stack.pop() {
        if !closure.insert(id.clone()) {
            continue;
        }
        if let Some(step) = by_id.get(id.as_str()) {
            stack.extend(step.depends_on.iter().cloned());
        }
    }
    Ok(closure)
}

/// Every referenced category must be converged by a step in the referencing
/// step's dependency closure, so its ids are recorded before they are needed.
pub fn check_references(steps: &[StepDefinition]) -> Result<(), PlanError> {
    for step in steps {
        if step.references.is_empty() {
            continue;
        }
        let closure = dependency_closure(steps, &step.id)?;
        for (field, category) in &step.references {
            let ordered = steps.iter().any(|owner| {
                &owner.category == category && owner.id != step.id && closure.contains(&owner.id)
            });
            if !ordered {
                return Err(PlanError::UnorderedReference {
                    step: step.id.clone(),
                    field: field.clone(),
                    category: category.clone(),
                });
            }
        }
    }
    Ok(())
}

fn index_by_id(steps: &[StepDefinition]) -> Result<HashMap<&str, usize>, PlanError> {
    let mut index = HashMap::new();
    for (position, step) in steps.iter().enumerate() {
        if index.insert(step.id.as_str(), position).is_some() {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }
    Ok(index)
}

/// Walk unfinished dependencies from the first unfinished step until a step
/// repeats. Every unfinished step has at least one unfinished dependency.
fn find_cycle(
    steps: &[StepDefinition],
    index: &HashMap<&str, usize>,
    done: &HashSet<usize>,
) -> Vec<String> {
    let Some(start) = (0..steps.len()).find(|i| !done.contains(i)) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = steps[current]
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep.as_str()).copied())
            .find(|dep| !done.contains(dep));
        let Some(next) = next else {
            break;
        };
        if let Some(first) = path.iter().position(|&seen| seen == next) {
            let mut cycle: Vec<String> = path[first..]
                .iter()
                .map(|&i| steps[i].id.clone())
                .collect();
            cycle.push(steps[next].id.clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(|i| steps[i].id.clone()).collect()
}

//! Error taxonomy for the reconciliation engine.
//!
//! Item-level errors are captured on the `ItemResult` they belong to and
//! step-level errors on the `StepOutcome`. Only [`PlanError`] aborts a run.

use std::fmt;

use thiserror::Error;

/// Failure reported by a capability client (transport layer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rejected by target: {0}")]
    Rejected(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("create"),
            Operation::Update => f.write_str("update"),
        }
    }
}

/// Failure of a single item. Always names the category and natural key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("{category} '{key}': existence check failed: {source}")]
    Resolution {
        category: String,
        key: String,
        source: CapabilityError,
    },
    #[error("{category} '{key}': {operation} failed: {source}")]
    Convergence {
        category: String,
        key: String,
        operation: Operation,
        source: CapabilityError,
    },
    #[error(
        "{category} '{key}': field '{field}' refers to {target_category} '{target_key}', which has no remote id in this run"
    )]
    UnresolvedReference {
        category: String,
        key: String,
        field: String,
        target_category: String,
        target_key: String,
    },
}

/// Failure of a whole step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("blocked by dependency '{dependency}': {root_cause}")]
    DependencyBlocked {
        step: String,
        dependency: String,
        root_cause: String,
    },
    #[error("step '{step}' setup failed: {message}")]
    Setup { step: String, message: String },
}

/// Programming or input errors that abort a run before any step executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("unknown step '{0}'")]
    UnknownStep(String),
    #[error(
        "step '{step}' resolves field '{field}' against '{category}', which no step it depends on converges"
    )]
    UnorderedReference {
        step: String,
        field: String,
        category: String,
    },
    #[error("invalid desired state:\n- {}", .0.join("\n- "))]
    InvalidSpec(Vec<String>),
}

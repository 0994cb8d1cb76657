//! Shared deterministic types for the reconciliation engine.
//!
//! These types are plain values: no I/O, deterministic field ordering, and
//! serde derives so a finished run can be exported and later replayed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::matching::KeyPolicy;

/// Field name → desired (or observed) value.
pub type FieldMap = BTreeMap<String, Value>;

/// Identifier assigned by the target system to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One desired entity, keyed by its natural key within a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub key: String,
    #[serde(default)]
    pub fields: FieldMap,
    /// Nested children grouped by kind (e.g. `images` under a subject).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<ItemSpec>>,
}

impl ItemSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: FieldMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, kind: impl Into<String>, child: ItemSpec) -> Self {
        self.children.entry(kind.into()).or_default().push(child);
        self
    }
}

/// Ordered items declared for one resource category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySpec {
    pub category: String,
    pub items: Vec<ItemSpec>,
}

/// The full declarative input for a run. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredStateSpec {
    pub categories: Vec<CategorySpec>,
}

impl DesiredStateSpec {
    pub fn new(categories: Vec<CategorySpec>) -> Self {
        Self { categories }
    }

    /// Items declared for `category`, or an empty slice.
    pub fn items(&self, category: &str) -> &[ItemSpec] {
        self.categories
            .iter()
            .find(|spec| spec.category == category)
            .map(|spec| spec.items.as_slice())
            .unwrap_or(&[])
    }

    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|spec| spec.items.len()).sum()
    }
}

/// Key policy and key field for one child kind of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildDefinition {
    pub key_field: String,
    pub key_policy: KeyPolicy,
}

impl Default for ChildDefinition {
    fn default() -> Self {
        Self {
            key_field: "path".to_string(),
            key_policy: KeyPolicy::CaseSensitive,
        }
    }
}

/// Static description of a step: what it converges and what it waits for.
///
/// Recorded verbatim in every [`StepOutcome`] so an exported report can be
/// replayed without the configuration that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default)]
    pub key_policy: KeyPolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ChildDefinition>,
    /// Field name → category whose natural keys the field refers to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, String>,
}

fn default_key_field() -> String {
    "name".to_string()
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            description: String::new(),
            depends_on: Vec::new(),
            key_field: default_key_field(),
            key_policy: KeyPolicy::default(),
            children: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn keyed_by(mut self, key_field: impl Into<String>, policy: KeyPolicy) -> Self {
        self.key_field = key_field.into();
        self.key_policy = policy;
        self
    }

    pub fn child(mut self, kind: impl Into<String>, child: ChildDefinition) -> Self {
        self.children.insert(kind.into(), child);
        self
    }

    pub fn reference(mut self, field: impl Into<String>, category: impl Into<String>) -> Self {
        self.references.insert(field.into(), category.into());
        self
    }
}

/// Lifecycle of a step during a run. Only terminal states are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    SkippedBySelection,
    SkippedNoEndpoint,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// True if dependents of a step in this state may run.
    pub fn permits_dependents(self) -> bool {
        self.is_terminal() && self != StepStatus::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::SkippedBySelection => "skipped_by_selection",
            StepStatus::SkippedNoEndpoint => "skipped_no_endpoint",
        }
    }
}

/// Per-item outcome recorded by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Created,
    AlreadyExists,
    Updated,
    Failed,
    DryRunWouldCreate,
    DryRunWouldUpdate,
}

impl ItemStatus {
    pub fn is_failure(self) -> bool {
        self == ItemStatus::Failed
    }

    pub fn is_dry_run(self) -> bool {
        matches!(
            self,
            ItemStatus::DryRunWouldCreate | ItemStatus::DryRunWouldUpdate
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Created => "created",
            ItemStatus::AlreadyExists => "already_exists",
            ItemStatus::Updated => "updated",
            ItemStatus::Failed => "failed",
            ItemStatus::DryRunWouldCreate => "dry_run_would_create",
            ItemStatus::DryRunWouldUpdate => "dry_run_would_update",
        }
    }
}

/// Result of evaluating one [`ItemSpec`] (or one of its children).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Category the item was converged in; children use `<category>/<kind>`.
    pub category: String,
    pub key: String,
    /// Natural key of the parent item, for children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub status: ItemStatus,
    pub remote_id: Option<RemoteId>,
    pub message: String,
    /// Declared desired values (before reference substitution).
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

/// Names the failed step that blocked a dependent, and the original failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedBy {
    pub dependency: String,
    pub root_cause: String,
}

/// Outcome of one step in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: StepDefinition,
    pub status: StepStatus,
    pub items: Vec<ItemResult>,
    pub duration_ms: u64,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<BlockedBy>,
}

impl StepOutcome {
    /// Outcome for a step that never ran.
    pub fn not_run(step: StepDefinition, status: StepStatus) -> Self {
        Self {
            step,
            status,
            items: Vec::new(),
            duration_ms: 0,
            error: None,
            blocked_by: None,
        }
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|item| item.status.is_failure())
    }
}

/// Identity of the target system a run (or audit) talked to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub address: Option<String>,
    pub version: Option<String>,
}

impl TargetIdentity {
    /// Fill unset fields of `self` from `other`.
    pub fn or(self, other: TargetIdentity) -> TargetIdentity {
        TargetIdentity {
            address: self.address.or(other.address),
            version: self.version.or(other.version),
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.address.as_deref().unwrap_or("unknown");
        match &self.version {
            Some(version) => write!(f, "{address} (version {version})"),
            None => write!(f, "{address} (version unknown)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_for_missing_category_is_empty() {
        let spec = DesiredStateSpec::new(vec![CategorySpec {
            category: "devices".to_string(),
            items: vec![ItemSpec::new("lobby")],
        }]);
        assert_eq!(spec.items("devices").len(), 1);
        assert!(spec.items("subjects").is_empty());
        assert_eq!(spec.item_count(), 1);
    }

    #[test]
    fn only_failed_blocks_dependents() {
        assert!(StepStatus::Succeeded.permits_dependents());
        assert!(StepStatus::SkippedBySelection.permits_dependents());
        assert!(StepStatus::SkippedNoEndpoint.permits_dependents());
        assert!(!StepStatus::Failed.permits_dependents());
        assert!(!StepStatus::Running.permits_dependents());
        assert!(!StepStatus::Pending.permits_dependents());
    }

    #[test]
    fn step_definition_defaults_from_toml() {
        let def: StepDefinition = toml::from_str(
            r#"
id = "configure-devices"
category = "devices"
depends_on = ["configure-device-groups"]
"#,
        )
        .expect("parse");
        assert_eq!(def.key_field, "name");
        assert_eq!(def.key_policy, KeyPolicy::CaseInsensitive);
        assert!(def.children.is_empty());
    }

    #[test]
    fn target_identity_prefers_declared_values() {
        let declared = TargetIdentity {
            address: None,
            version: Some("2.8".to_string()),
        };
        let detected = TargetIdentity {
            address: Some("10.0.0.5".to_string()),
            version: Some("2.6".to_string()),
        };
        let merged = declared.or(detected);
        assert_eq!(merged.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(merged.version.as_deref(), Some("2.8"));
    }
}

//! Test-only helpers: an in-memory target with call recording and failure
//! injection, plus small builders for specs and workspaces.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::capability::{CapabilityClient, ExistenceResult, Scope};
use crate::core::matching::{KeyMatcher, KeyPolicy};
use crate::core::types::{
    CategorySpec, DesiredStateSpec, FieldMap, ItemSpec, RemoteId, TargetIdentity,
};
use crate::error::CapabilityError;
use crate::io::local_target::{StoredEntity, TargetState};

/// A call made against a [`FakeTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Supports(String),
    Exists { category: String, key: String },
    Create { category: String, key: String },
    Update { category: String, id: String },
}

impl Call {
    pub fn category(&self) -> &str {
        match self {
            Call::Supports(category)
            | Call::Exists { category, .. }
            | Call::Create { category, .. }
            | Call::Update { category, .. } => category,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Call::Create { .. } | Call::Update { .. })
    }
}

/// In-memory capability client.
#[derive(Debug, Default)]
pub struct FakeTarget {
    state: RefCell<TargetState>,
    calls: RefCell<Vec<Call>>,
    unsupported: RefCell<BTreeSet<String>>,
    failing_exists: RefCell<BTreeMap<String, CapabilityError>>,
    failing_creates: RefCell<Vec<(String, String, CapabilityError)>>,
    failing_updates: RefCell<BTreeMap<String, CapabilityError>>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(self, address: &str, version: &str) -> Self {
        self.state.borrow_mut().identity = TargetIdentity {
            address: Some(address.to_string()),
            version: Some(version.to_string()),
        };
        self
    }

    /// Add an entity directly, bypassing call recording.
    pub fn seed(&self, category: &str, key: &str, fields: FieldMap) -> RemoteId {
        self.state
            .borrow_mut()
            .insert(&Scope::top(category), key, &fields)
    }

    pub fn seed_child(
        &self,
        category: &str,
        parent: &RemoteId,
        key: &str,
        fields: FieldMap,
    ) -> RemoteId {
        self.state
            .borrow_mut()
            .insert(&Scope::child(category, parent), key, &fields)
    }

    /// Overwrite a field on a stored top-level entity (external drift).
    pub fn set_field(&self, category: &str, key: &str, field: &str, value: Value) {
        let mut state = self.state.borrow_mut();
        if let Some(entity) = state
            .entities
            .get_mut(category)
            .and_then(|entities| entities.iter_mut().find(|e| e.key == key))
        {
            entity.fields.insert(field.to_string(), value);
        }
    }

    /// Remove a stored top-level entity (external deletion).
    pub fn remove(&self, category: &str, key: &str) {
        if let Some(entities) = self.state.borrow_mut().entities.get_mut(category) {
            entities.retain(|entity| entity.key != key);
        }
    }

    pub fn unsupported(&self, category: &str) {
        self.unsupported.borrow_mut().insert(category.to_string());
    }

    pub fn fail_exists(&self, category: &str, err: CapabilityError) {
        self.failing_exists
            .borrow_mut()
            .insert(category.to_string(), err);
    }

    pub fn fail_create(&self, category: &str, key: &str, err: CapabilityError) {
        self.failing_creates
            .borrow_mut()
            .push((category.to_string(), key.to_string(), err));
    }

    pub fn fail_updates(&self, category: &str, err: CapabilityError) {
        self.failing_updates
            .borrow_mut()
            .insert(category.to_string(), err);
    }

    pub fn entity(&self, category: &str, key: &str) -> Option<StoredEntity> {
        let matcher = KeyMatcher::new(key, KeyPolicy::CaseSensitive);
        self.state
            .borrow()
            .entities
            .get(category)?
            .iter()
            .find(|entity| matcher.matches(&entity.key))
            .cloned()
    }

    pub fn entities(&self, category: &str) -> Vec<StoredEntity> {
        self.state
            .borrow()
            .entities
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn writes(&self) -> usize {
        self.calls.borrow().iter().filter(|call| call.is_write()).count()
    }

    /// Existence queries and writes touching `category` or its child kinds.
    pub fn item_calls(&self, category: &str) -> usize {
        let prefix = format!("{category}/");
        self.calls
            .borrow()
            .iter()
            .filter(|call| !matches!(call, Call::Supports(_)))
            .filter(|call| call.category() == category || call.category().starts_with(&prefix))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl CapabilityClient for FakeTarget {
    fn supports(&self, category: &str) -> bool {
        self.record(Call::Supports(category.to_string()));
        !self.unsupported.borrow().contains(category)
    }

    fn exists(
        &self,
        scope: &Scope<'_>,
        matcher: &KeyMatcher,
    ) -> Result<ExistenceResult, CapabilityError> {
        self.record(Call::Exists {
            category: scope.category.to_string(),
            key: matcher.key().to_string(),
        });
        if let Some(err) = self.failing_exists.borrow().get(scope.category) {
            return Err(err.clone());
        }
        Ok(self.state.borrow().lookup(scope, matcher))
    }

    fn create(
        &self,
        scope: &Scope<'_>,
        key: &str,
        fields: &FieldMap,
    ) -> Result<RemoteId, CapabilityError> {
        self.record(Call::Create {
            category: scope.category.to_string(),
            key: key.to_string(),
        });
        let injected = self
            .failing_creates
            .borrow()
            .iter()
            .find(|(category, failing_key, _)| category == scope.category && failing_key == key)
            .map(|(_, _, err)| err.clone());
        if let Some(err) = injected {
            return Err(err);
        }
        Ok(self.state.borrow_mut().insert(scope, key, fields))
    }

    fn update(
        &self,
        scope: &Scope<'_>,
        id: &RemoteId,
        changed: &FieldMap,
    ) -> Result<(), CapabilityError> {
        self.record(Call::Update {
            category: scope.category.to_string(),
            id: id.to_string(),
        });
        if let Some(err) = self.failing_updates.borrow().get(scope.category) {
            return Err(err.clone());
        }
        self.state.borrow_mut().update(scope, id, changed)
    }

    fn identity(&self) -> TargetIdentity {
        self.state.borrow().identity.clone()
    }
}

/// Build a field map from `(name, value)` pairs.
pub fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

/// Build a desired-state spec from `(category, items)` pairs.
pub fn spec(categories: Vec<(&str, Vec<ItemSpec>)>) -> DesiredStateSpec {
    DesiredStateSpec::new(
        categories
            .into_iter()
            .map(|(category, items)| CategorySpec {
                category: category.to_string(),
                items,
            })
            .collect(),
    )
}

/// A temporary directory holding reconciler input files.
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` under the workspace and return the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write fixture");
        path
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

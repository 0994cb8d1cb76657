//! File-backed target: a JSON document standing in for the appliance.
//!
//! Used by the CLI when no network transport is configured, and as the shared
//! entity store behind the test fake.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::{CapabilityClient, ExistenceResult, RemoteEntity, Scope};
use crate::core::matching::KeyMatcher;
use crate::core::types::{FieldMap, RemoteId, TargetIdentity};
use crate::error::CapabilityError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub id: RemoteId,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RemoteId>,
    #[serde(default)]
    pub fields: FieldMap,
}

impl StoredEntity {
    fn to_remote(&self) -> RemoteEntity {
        RemoteEntity {
            id: self.id.clone(),
            key: self.key.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Persisted target contents (`target.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetState {
    pub identity: TargetIdentity,
    /// Supported categories; `None` means every category is supported.
    pub supported: Option<Vec<String>>,
    pub entities: BTreeMap<String, Vec<StoredEntity>>,
    pub next_id: u64,
}

impl TargetState {
    pub fn supports(&self, category: &str) -> bool {
        let parent = category.split_once('/').map_or(category, |(parent, _)| parent);
        match &self.supported {
            None => true,
            Some(list) => list.iter().any(|c| c == parent),
        }
    }

    pub fn find(&self, scope: &Scope<'_>, matcher: &KeyMatcher) -> Option<&StoredEntity> {
        self.entities
            .get(scope.category)?
            .iter()
            .filter(|entity| entity.parent.as_ref() == scope.parent)
            .find(|entity| matcher.matches(&entity.key))
    }

    pub fn lookup(&self, scope: &Scope<'_>, matcher: &KeyMatcher) -> ExistenceResult {
        match self.find(scope, matcher) {
            Some(entity) => ExistenceResult::Present(entity.to_remote()),
            None => ExistenceResult::Absent,
        }
    }

    pub fn insert(&mut self, scope: &Scope<'_>, key: &str, fields: &FieldMap) -> RemoteId {
        self.next_id += 1;
        let id = RemoteId::new(self.next_id.to_string());
        self.entities
            .entry(scope.category.to_string())
            .or_default()
            .push(StoredEntity {
                id: id.clone(),
                key: key.trim().to_string(),
                parent: scope.parent.cloned(),
                fields: fields.clone(),
            });
        id
    }

    /// Merge `changed` into the entity with `id`.
    pub fn update(
        &mut self,
        scope: &Scope<'_>,
        id: &RemoteId,
        changed: &FieldMap,
    ) -> Result<(), CapabilityError> {
        let entity = self
            .entities
            .get_mut(scope.category)
            .and_then(|entities| {
                entities
                    .iter_mut()
                    .find(|entity| &entity.id == id && entity.parent.as_ref() == scope.parent)
            })
            .ok_or_else(|| {
                CapabilityError::Rejected(format!("no {} entity with id {id}", scope.category))
            })?;
        for (name, value) in changed {
            entity.fields.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

/// Capability client over a [`TargetState`] file. Every write is persisted.
#[derive(Debug)]
pub struct LocalTarget {
    path: PathBuf,
    state: RefCell<TargetState>,
}

impl LocalTarget {
    /// Open the target file; a missing file is an empty target.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse target state {}", path.display()))?
        } else {
            debug!(path = %path.display(), "target state missing, starting empty");
            TargetState::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: RefCell::new(state),
        })
    }

    pub fn state(&self) -> TargetState {
        self.state.borrow().clone()
    }

    /// Apply `change` to a copy of the state, persist the copy, and only then
    /// make it current. A failed write leaves the in-memory view untouched.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut TargetState) -> Result<T, CapabilityError>,
    ) -> Result<T, CapabilityError> {
        let mut next = self.state.borrow().clone();
        let value = change(&mut next)?;
        crate::io::write_json(&self.path, &next)
            .map_err(|err| CapabilityError::Unreachable(format!("{err:#}")))?;
        *self.state.borrow_mut() = next;
        Ok(value)
    }
}

impl CapabilityClient for LocalTarget {
    fn supports(&self, category: &str) -> bool {
        self.state.borrow().supports(category)
    }

    fn exists(
        &self,
        scope: &Scope<'_>,
        matcher: &KeyMatcher,
    ) -> Result<ExistenceResult, CapabilityError> {
        Ok(self.state.borrow().lookup(scope, matcher))
    }

    fn create(
        &self,
        scope: &Scope<'_>,
        key: &str,
        fields: &FieldMap,
    ) -> Result<RemoteId, CapabilityError> {
        self.commit(|state| Ok(state.insert(scope, key, fields)))
    }

    fn update(
        &self,
        scope: &Scope<'_>,
        id: &RemoteId,
        changed: &FieldMap,
    ) -> Result<(), CapabilityError> {
        self.commit(|state| state.update(scope, id, changed))
    }

    fn identity(&self) -> TargetIdentity {
        self.state.borrow().identity.clone()
    }
}

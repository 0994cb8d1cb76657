//! Capability client abstraction.
//!
//! The [`CapabilityClient`] trait decouples reconciliation from the transport
//! that reaches the target (REST, GraphQL, file transfer, orchestration API).
//! Tests use an in-memory fake; the CLI ships a file-backed target.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::matching::KeyMatcher;
use crate::core::types::{FieldMap, RemoteId, StepDefinition, TargetIdentity};
use crate::error::CapabilityError;

/// Where an entity lives: a category, and for children the parent's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope<'a> {
    pub category: &'a str,
    pub parent: Option<&'a RemoteId>,
}

impl<'a> Scope<'a> {
    pub fn top(category: &'a str) -> Self {
        Self {
            category,
            parent: None,
        }
    }

    pub fn child(category: &'a str, parent: &'a RemoteId) -> Self {
        Self {
            category,
            parent: Some(parent),
        }
    }
}

/// Category name for a child kind, e.g. `subjects/images`.
pub fn child_category(category: &str, kind: &str) -> String {
    format!("{category}/{kind}")
}

/// An entity as observed on the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: RemoteId,
    pub key: String,
    #[serde(default)]
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExistenceResult {
    Absent,
    Present(RemoteEntity),
}

/// Transport-specific adapter to the target system.
///
/// `exists` must be side-effect free. Equality of natural keys is decided by
/// the [`KeyMatcher`], never by the client.
pub trait CapabilityClient {
    fn supports(&self, category: &str) -> bool;

    fn exists(
        &self,
        scope: &Scope<'_>,
        matcher: &KeyMatcher,
    ) -> Result<ExistenceResult, CapabilityError>;

    fn create(
        &self,
        scope: &Scope<'_>,
        key: &str,
        fields: &FieldMap,
    ) -> Result<RemoteId, CapabilityError>;

    fn update(
        &self,
        scope: &Scope<'_>,
        id: &RemoteId,
        changed: &FieldMap,
    ) -> Result<(), CapabilityError>;

    /// Address and version as detected by the client.
    fn identity(&self) -> TargetIdentity {
        TargetIdentity::default()
    }
}

/// Categories the target supports, checked once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    supported: BTreeSet<String>,
}

impl NegotiatedCapabilities {
    pub fn negotiate<'a>(
        client: &dyn CapabilityClient,
        steps: impl IntoIterator<Item = &'a StepDefinition>,
    ) -> Self {
        let mut supported = BTreeSet::new();
        let mut seen = BTreeSet::new();
        for step in steps {
            let category = step.category.as_str();
            if !seen.insert(category) {
                continue;
            }
            let ok = client.supports(category);
            debug!(category, supported = ok, "capability checked");
            if ok {
                supported.insert(category.to_string());
            }
        }
        Self { supported }
    }

    /// Child kinds (`category/kind`) follow their parent category.
    pub fn supports(&self, category: &str) -> bool {
        let parent = category.split_once('/').map_or(category, |(parent, _)| parent);
        self.supported.contains(parent)
    }
}

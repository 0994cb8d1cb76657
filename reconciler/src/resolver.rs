//! Item resolver: existence and equivalence of one desired item.
//!
//! Convergence and audit both call [`resolve`], so "nothing to write" and
//! "still valid" are decided by the same rules.

use tracing::{debug, instrument};

use crate::capability::{CapabilityClient, ExistenceResult, Scope};
use crate::core::matching::{KeyMatcher, KeyPolicy};
use crate::core::normalize::{FieldDiffs, diff_fields};
use crate::core::types::{FieldMap, RemoteId};
use crate::error::{CapabilityError, ItemError};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Absent,
    Match { id: RemoteId },
    Differ { id: RemoteId, diff: FieldDiffs },
}

/// Resolve `key` in `scope` and compare the entity against `desired`.
///
/// A failing existence query is an error, never "absent".
#[instrument(level = "debug", skip_all, fields(category = scope.category, key = key))]
pub fn resolve(
    client: &dyn CapabilityClient,
    scope: &Scope<'_>,
    key: &str,
    policy: KeyPolicy,
    desired: &FieldMap,
) -> Result<Resolution, ItemError> {
    let matcher = KeyMatcher::new(key, policy);
    let resolution_error = |source: CapabilityError| ItemError::Resolution {
        category: scope.category.to_string(),
        key: key.to_string(),
        source,
    };

    let entity = match client.exists(scope, &matcher).map_err(resolution_error)? {
        ExistenceResult::Absent => {
            debug!("absent");
            return Ok(Resolution::Absent);
        }
        ExistenceResult::Present(entity) => entity,
    };
    if !matcher.matches(&entity.key) {
        return Err(resolution_error(CapabilityError::Malformed(format!(
            "lookup returned '{}' which does not match the requested key",
            entity.key
        ))));
    }

    let diff = diff_fields(desired, &entity.fields);
    debug!(id = %entity.id, differing = diff.len(), "present");
    if diff.is_empty() {
        Ok(Resolution::Match { id: entity.id })
    } else {
        Ok(Resolution::Differ {
            id: entity.id,
            diff,
        })
    }
}

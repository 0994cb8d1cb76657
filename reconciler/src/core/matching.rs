//! Natural-key matching policies.
//!
//! Human-entered names match case-insensitively; machine identifiers (emails,
//! UUIDs, file paths) match exactly. The policy is chosen per category.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Exact comparison after trimming surrounding whitespace.
    CaseSensitive,
    /// Trimmed, case-folded comparison.
    #[default]
    CaseInsensitive,
    /// Case-insensitive, and treats `group`/`groups`/`boxes`/`box` as equal.
    PluralTolerant,
}

impl KeyPolicy {
    pub fn keys_equal(self, left: &str, right: &str) -> bool {
        let left = left.trim();
        let right = right.trim();
        match self {
            KeyPolicy::CaseSensitive => left == right,
            KeyPolicy::CaseInsensitive => left.to_lowercase() == right.to_lowercase(),
            KeyPolicy::PluralTolerant => {
                let left = left.to_lowercase();
                let right = right.to_lowercase();
                left == right || plural_of(&left, &right) || plural_of(&right, &left)
            }
        }
    }
}

/// True if `plural` is `singular` + `s` or `singular` + `es`.
fn plural_of(singular: &str, plural: &str) -> bool {
    match plural.strip_prefix(singular) {
        Some(suffix) => !singular.is_empty() && (suffix == "s" || suffix == "es"),
        None => false,
    }
}

/// A natural key bound to the policy it must be compared with.
///
/// Capability clients enumerate candidates and ask the matcher; they never
/// decide key equality on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatcher {
    key: String,
    policy: KeyPolicy,
}

impl KeyMatcher {
    pub fn new(key: impl Into<String>, policy: KeyPolicy) -> Self {
        Self {
            key: key.into(),
            policy,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.policy.keys_equal(&self.key, candidate)
    }
}

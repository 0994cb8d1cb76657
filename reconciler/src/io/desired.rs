//! Desired-state loader: YAML document → [`DesiredStateSpec`].
//!
//! The document is a mapping of category → items. Items are mappings (the
//! step's key field names the item) or bare scalar keys. A category may also
//! be a mapping of key → value, which becomes one item per key with the value
//! stored as field `value` (or as the fields, when the value is a mapping).
//!
//! ```yaml
//! kv_parameters:
//!   retention_days: 30
//! subjects:
//!   - name: Dana
//!     group: VIP
//!     images:
//!       - images/dana.jpg
//! ```

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::types::{CategorySpec, DesiredStateSpec, FieldMap, ItemSpec, StepDefinition};

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("braced variable regex"));
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Z_][A-Z0-9_]*)").expect("bare variable regex"));

const INQUIRY_CATEGORY: &str = "inquiries";
const PRIORITY_FIELD: &str = "priority";
const PRIORITY_HIGH: i64 = 1;
const PRIORITY_MEDIUM: i64 = 101;
const PRIORITY_LOW: i64 = 201;

/// A parsed desired-state document.
#[derive(Debug, Clone)]
pub struct LoadedSpec {
    pub spec: DesiredStateSpec,
    /// SHA-256 (hex) of the raw document.
    pub digest: String,
}

/// Load a desired-state document, substituting variables from the process
/// environment.
pub fn load_desired_state(path: &Path, steps: &[StepDefinition]) -> Result<LoadedSpec> {
    load_desired_state_with(path, steps, &|name| std::env::var(name).ok())
}

pub fn load_desired_state_with(
    path: &Path,
    steps: &[StepDefinition],
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<LoadedSpec> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read desired state {}", path.display()))?;
    let spec = parse_desired_state(&raw, steps, lookup)
        .with_context(|| format!("parse desired state {}", path.display()))?;
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    debug!(
        path = %path.display(),
        categories = spec.categories.len(),
        items = spec.item_count(),
        %digest,
        "desired state loaded"
    );
    Ok(LoadedSpec { spec, digest })
}

pub fn parse_desired_state(
    raw: &str,
    steps: &[StepDefinition],
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<DesiredStateSpec> {
    let document: serde_yaml::Value = serde_yaml::from_str(raw).context("parse yaml")?;
    let mapping = match document {
        serde_yaml::Value::Null => return Ok(DesiredStateSpec::default()),
        serde_yaml::Value::Mapping(mapping) => mapping,
        _ => bail!("document root must be a mapping of category to items"),
    };

    let mut categories = Vec::with_capacity(mapping.len());
    for (name, value) in mapping {
        let Some(category) = name.as_str().map(str::to_string) else {
            bail!("category names must be strings");
        };
        let step = steps.iter().find(|step| step.category == category);
        let mut items = match value {
            // Walk the YAML mapping itself; converting it to a JSON object
            // would sort the keys.
            serde_yaml::Value::Mapping(entries) => entries
                .into_iter()
                .map(|(key, value)| {
                    let key = scalar_key(&to_json(&key, lookup)?)?;
                    let item = keyed_item(key.clone(), to_json(&value, lookup)?, step)
                        .with_context(|| format!("{category}.{key}"))?;
                    Ok(item)
                })
                .collect::<Result<Vec<_>>>()?,
            other => parse_items(&category, to_json(&other, lookup)?, step)?,
        };
        if category == INQUIRY_CATEGORY {
            for item in &mut items {
                normalize_priority(&mut item.fields);
            }
        }
        categories.push(CategorySpec { category, items });
    }
    Ok(DesiredStateSpec::new(categories))
}

fn to_json(value: &serde_yaml::Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Value> {
    let mut value = serde_json::to_value(value).context("convert to json")?;
    substitute_in_value(&mut value, lookup);
    Ok(value)
}

fn parse_items(category: &str, value: Value, step: Option<&StepDefinition>) -> Result<Vec<ItemSpec>> {
    let key_field = step.map_or("name", |step| step.key_field.as_str());
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(entries) => entries
            .into_iter()
            .enumerate()
            .map(|(position, entry)| {
                parse_item(entry, key_field, step)
                    .with_context(|| format!("{category}[{position}]"))
            })
            .collect(),
        _ => bail!("{category}: expected a list or mapping of items"),
    }
}

/// One item of a mapping-form category. A scalar value becomes field `value`.
fn keyed_item(key: String, value: Value, step: Option<&StepDefinition>) -> Result<ItemSpec> {
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => Map::from_iter([("value".to_string(), other)]),
    };
    let children = take_children(&mut fields, step)?;
    Ok(ItemSpec {
        key,
        fields: fields.into_iter().collect(),
        children,
    })
}

fn parse_item(entry: Value, key_field: &str, step: Option<&StepDefinition>) -> Result<ItemSpec> {
    let mut fields = match entry {
        Value::Object(fields) => fields,
        scalar => return Ok(ItemSpec::new(scalar_key(&scalar)?)),
    };
    let key = fields
        .remove(key_field)
        .ok_or_else(|| anyhow!("missing key field '{key_field}'"))?;
    let key = scalar_key(&key).with_context(|| format!("key field '{key_field}'"))?;
    let children = take_children(&mut fields, step)?;
    Ok(ItemSpec {
        key,
        fields: fields.into_iter().collect(),
        children,
    })
}

/// Move the step's declared child kinds out of `fields`.
fn take_children(
    fields: &mut Map<String, Value>,
    step: Option<&StepDefinition>,
) -> Result<std::collections::BTreeMap<String, Vec<ItemSpec>>> {
    let mut children = std::collections::BTreeMap::new();
    let Some(step) = step else {
        return Ok(children);
    };
    for (kind, definition) in &step.children {
        let Some(value) = fields.remove(kind) else {
            continue;
        };
        let entries = match value {
            Value::Null => Vec::new(),
            Value::Array(entries) => entries,
            _ => bail!("'{kind}' must be a list"),
        };
        let parsed = entries
            .into_iter()
            .enumerate()
            .map(|(position, entry)| {
                parse_item(entry, &definition.key_field, None)
                    .with_context(|| format!("{kind}[{position}]"))
            })
            .collect::<Result<Vec<_>>>()?;
        children.insert(kind.clone(), parsed);
    }
    Ok(children)
}

fn scalar_key(value: &Value) -> Result<String> {
    match value {
        Value::String(key) => Ok(key.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => bail!("natural key must be a string or number"),
    }
}

/// Map inquiry priority names to appliance values (low=201, medium=101,
/// high=1). Numbers are clamped to 1..=201; anything else is medium.
fn normalize_priority(fields: &mut FieldMap) {
    let priority = match fields.get(PRIORITY_FIELD) {
        None | Some(Value::Null) => PRIORITY_MEDIUM,
        Some(Value::Number(number)) => clamp_priority(number.as_f64()),
        Some(Value::String(raw)) => match raw.trim().to_lowercase().as_str() {
            "low" => PRIORITY_LOW,
            "medium" => PRIORITY_MEDIUM,
            "high" => PRIORITY_HIGH,
            other => clamp_priority(other.parse::<f64>().ok().filter(|n| n.is_finite())),
        },
        Some(_) => PRIORITY_MEDIUM,
    };
    fields.insert(PRIORITY_FIELD.to_string(), Value::from(priority));
}

fn clamp_priority(number: Option<f64>) -> i64 {
    match number {
        Some(number) => (number.round() as i64).clamp(PRIORITY_HIGH, PRIORITY_LOW),
        None => PRIORITY_MEDIUM,
    }
}

fn substitute_in_value(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(raw) => *raw = substitute_env(raw, lookup),
        Value::Array(items) => {
            for item in items {
                substitute_in_value(item, lookup);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_in_value(item, lookup);
            }
        }
        _ => {}
    }
}

/// Replace `${NAME}` and then `$NAME` with values from `lookup`. Unknown
/// variables are left as written.
pub fn substitute_env(raw: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let braced = BRACED_VAR.replace_all(raw, |caps: &Captures<'_>| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });
    BARE_VAR
        .replace_all(&braced, |caps: &Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// File paths named by items (`path`/`file` keys and fields, image children),
/// resolved against `base`, that do not exist.
pub fn missing_files(spec: &DesiredStateSpec, steps: &[StepDefinition], base: &Path) -> Vec<String> {
    let mut missing = Vec::new();
    let mut check = |label: String, raw: &str| {
        let path = base.join(raw);
        if !path.exists() {
            missing.push(format!("{label}: file not found: {}", path.display()));
        }
    };
    for category in &spec.categories {
        let step = steps.iter().find(|step| step.category == category.category);
        let key_is_path = step.is_some_and(|step| is_path_field(&step.key_field));
        for item in &category.items {
            let label = format!("{} '{}'", category.category, item.key);
            if key_is_path {
                check(label.clone(), &item.key);
            }
            for (name, value) in &item.fields {
                if let (true, Value::String(raw)) = (is_path_field(name), value) {
                    check(format!("{label}.{name}"), raw);
                }
            }
            for (kind, children) in &item.children {
                let child_key_is_path = step
                    .and_then(|step| step.children.get(kind))
                    .is_some_and(|child| is_path_field(&child.key_field));
                if child_key_is_path {
                    for child in children {
                        check(format!("{label}/{kind}"), &child.key);
                    }
                }
            }
        }
    }
    missing
}

fn is_path_field(name: &str) -> bool {
    matches!(name, "path" | "file" | "file_path")
}

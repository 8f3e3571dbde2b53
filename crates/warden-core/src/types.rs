use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Tenant identifier. Every call into the runtime is scoped to one company.
pub type CompanyId = Uuid;

/// Identifier of a human (or the system actor) acting on a run.
pub type UserId = Uuid;

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Unique identifier for a planned forward step.
pub type RunStepId = Uuid;

/// Unique identifier for a playbook.
pub type PlaybookId = Uuid;

/// Unique identifier for an immutable playbook version.
pub type PlaybookVersionId = Uuid;

/// The actor recorded when the runtime approves a run on its own.
pub const SYSTEM_ACTOR: UserId = Uuid::nil();

/// Key of the scope field carrying the size of the whole entity population.
pub const TOTAL_ENTITIES_KEY: &str = "total_entities";

/// The target descriptor of a run, e.g. `{"entity_ids": [..], "currency": "EUR"}`.
///
/// Array fields named `entity_ids` or ending in `_ids` are entity lists and
/// drive blast radius and canary sampling. Everything else is opaque context
/// available to step templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunScope(pub Map<String, Value>);

impl RunScope {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a scope from any JSON value. Non-object values are kept under `value`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                Self(map)
            }
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Keys of the entity id lists, in map order.
    pub fn id_list_keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, v)| v.is_array() && is_id_list_key(k))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Number of entities the scope references; 1 when it has no id lists.
    pub fn entity_count(&self) -> u64 {
        let lists = self.id_list_keys();
        if lists.is_empty() {
            return 1;
        }
        lists
            .iter()
            .filter_map(|k| self.0.get(*k).and_then(Value::as_array))
            .map(|a| a.len() as u64)
            .sum()
    }

    /// Size of the whole population, if the caller supplied one.
    pub fn total_entities(&self) -> Option<u64> {
        self.0.get(TOTAL_ENTITIES_KEY).and_then(Value::as_u64)
    }

    /// Resolve a dotted path such as `customer.region` inside the scope.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Whether this scope was narrowed to a canary sample.
    pub fn is_canary(&self) -> bool {
        self.0.get("canary").and_then(Value::as_bool).unwrap_or(false)
    }

    /// A copy holding `n` entities in total and flagged `canary`. Id lists
    /// are filled in map order; lists past the budget come back empty.
    pub fn sampled(&self, n: usize) -> Self {
        let mut map = self.0.clone();
        let mut budget = n;
        for key in self.id_list_keys() {
            if let Some(Value::Array(items)) = map.get_mut(key) {
                items.truncate(budget);
                budget -= items.len();
            }
        }
        map.insert("canary".into(), Value::Bool(true));
        Self(map)
    }

    /// Stable hex digest of the scope's canonical JSON form.
    pub fn fingerprint(&self) -> String {
        content_hash(&self.as_value())
    }
}

fn is_id_list_key(key: &str) -> bool {
    key == "entity_ids" || key.ends_with("_ids")
}

/// BLAKE3 hex digest of a JSON value in canonical (sorted-key) form.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    blake3::hash(canonical.to_string().as_bytes())
        .to_hex()
        .to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

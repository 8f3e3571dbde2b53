use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::policy::GuardOverrides;
use crate::types::{CompanyId, RunId, UserId};

/// What an action touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EffectClass {
    Read,
    /// Side effect on a named resource, written `write:<resource>`.
    Write(String),
}

impl EffectClass {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

impl fmt::Display for EffectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write(resource) => write!(f, "write:{resource}"),
        }
    }
}

impl TryFrom<String> for EffectClass {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "read" {
            return Ok(Self::Read);
        }
        match s.strip_prefix("write:") {
            Some(resource) if !resource.is_empty() => Ok(Self::Write(resource.to_string())),
            _ => Err(format!("invalid effect class '{s}'")),
        }
    }
}

impl From<EffectClass> for String {
    fn from(effect: EffectClass) -> Self {
        effect.to_string()
    }
}

/// Minimal input contract: required top-level fields of the input object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContract {
    #[serde(default)]
    pub required: Vec<String>,
}

impl InputContract {
    pub fn required(fields: &[&str]) -> Self {
        Self {
            required: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Errors for every required field that is absent or null.
    pub fn check(&self, input: &Value) -> Vec<String> {
        let Some(obj) = input.as_object() else {
            return vec!["input must be a JSON object".into()];
        };
        self.required
            .iter()
            .filter(|f| obj.get(f.as_str()).is_none_or(Value::is_null))
            .map(|f| format!("missing required field '{f}'"))
            .collect()
    }
}

/// Catalog entry for an action, e.g. "ap.payment.dispatch".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub input_contract: InputContract,
    pub effect: EffectClass,
    /// The action may only ever run in dry-run mode.
    #[serde(default)]
    pub dry_run_only: bool,
    /// Guard hints layered into the effective policy of any run using this action.
    #[serde(default)]
    pub default_guards: GuardOverrides,
}

/// Who is running an action, for which tenant, and whether it may have effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub company_id: CompanyId,
    pub actor_id: UserId,
    pub run_id: RunId,
    pub dry_run: bool,
    /// Fired when the run is cancelled; long-running handlers may poll it.
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

/// The result of executing an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub output: Value,
    /// Action-reported figures, e.g. {"dispatched": 12.0}.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl ActionOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// Trait implemented by every concrete domain action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn descriptor(&self) -> &ActionDescriptor;

    /// Extra validation beyond the input contract. Returns human-readable errors.
    fn validate(&self, _input: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Perform the action. Errors are reported as step failures, not propagated.
    async fn execute(&self, input: &Value, ctx: &ActionContext) -> crate::Result<ActionOutcome>;
}

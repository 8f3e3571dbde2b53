use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::GuardOverrides;
use crate::types::{CompanyId, PlaybookId, PlaybookVersionId};

/// A named, versioned automation for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub id: PlaybookId,
    pub company_id: CompanyId,
    /// Stable lookup code, e.g. "ar.dunning.weekly".
    pub code: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One step of a published playbook, before scope binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub action_code: String,
    /// Input with `{{scope.field}}` placeholders.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_check: Option<OutcomeCheck>,
}

/// An immutable published version. Never mutated; superseded by a higher number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookVersion {
    pub id: PlaybookVersionId,
    pub playbook_id: PlaybookId,
    pub version: u32,
    pub steps: Vec<StepTemplate>,
    #[serde(default)]
    pub guards: GuardOverrides,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl PlaybookVersion {
    /// Digest over steps and guards; identical content hashes identically.
    pub fn compute_hash(steps: &[StepTemplate], guards: &GuardOverrides) -> String {
        let body = serde_json::json!({ "steps": steps, "guards": guards });
        crate::types::content_hash(&body)
    }
}

/// A post-step verification: look up `metric` and compare it to `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCheck {
    pub metric: String,
    pub threshold: Threshold,
}

/// Either `{op, value}` or a bare numeric ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Ceiling(f64),
    Compare(Comparison),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Comparison {
    Lt { value: f64 },
    Gt { value: f64 },
    Eq { value: f64 },
    Between { value: (f64, f64) },
}

impl Threshold {
    pub fn passes(&self, observed: f64) -> bool {
        match self {
            Self::Ceiling(max) => observed <= *max,
            Self::Compare(Comparison::Lt { value }) => observed < *value,
            Self::Compare(Comparison::Gt { value }) => observed > *value,
            Self::Compare(Comparison::Eq { value }) => (observed - value).abs() < f64::EPSILON,
            Self::Compare(Comparison::Between { value: (lo, hi) }) => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                observed >= lo && observed <= hi
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Ceiling(max) => format!("<= {max}"),
            Self::Compare(Comparison::Lt { value }) => format!("< {value}"),
            Self::Compare(Comparison::Gt { value }) => format!("> {value}"),
            Self::Compare(Comparison::Eq { value }) => format!("== {value}"),
            Self::Compare(Comparison::Between { value: (lo, hi) }) => {
                format!("between {lo} and {hi}")
            }
        }
    }
}

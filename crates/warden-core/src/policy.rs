use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::CompanyId;

/// What a guard policy applies to: every playbook of a tenant, or one playbook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GuardScope {
    Global,
    Playbook(String),
}

impl GuardScope {
    pub fn playbook(code: impl Into<String>) -> Self {
        Self::Playbook(code.into())
    }
}

impl fmt::Display for GuardScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Playbook(code) => write!(f, "playbook:{code}"),
        }
    }
}

impl FromStr for GuardScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Self::Global);
        }
        match s.strip_prefix("playbook:") {
            Some(code) if !code.is_empty() => Ok(Self::Playbook(code.to_string())),
            _ => Err(format!("invalid guard scope '{s}', expected 'global' or 'playbook:<code>'")),
        }
    }
}

impl TryFrom<String> for GuardScope {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GuardScope> for String {
    fn from(scope: GuardScope) -> Self {
        scope.to_string()
    }
}

/// Whether failed runs replay inverse actions on their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    #[default]
    Automatic,
    /// Halt and mark the run failed; an operator undoes the effects.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastRadiusOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entities: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_entities: Option<u64>,
}

/// A partial guard policy. Every field is independently optional so layers
/// can override just what they care about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blast_radius: Option<BlastRadiusOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_dual_control: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_policy: Option<RollbackPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_sec: Option<u64>,
}

impl GuardOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A stored policy: exactly one per (company, scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardPolicy {
    pub company_id: CompanyId,
    pub scope: GuardScope,
    #[serde(flatten)]
    pub guards: GuardOverrides,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastRadiusLimits {
    pub max_entities: Option<u64>,
    pub max_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryPolicy {
    pub sample_percent: f64,
    pub min_entities: u64,
}

impl CanaryPolicy {
    /// Entities a canary sample of `entity_count` must contain.
    pub fn sample_size(&self, entity_count: u64) -> u64 {
        let pct = self.sample_percent.clamp(0.0, 100.0);
        let sampled = (entity_count as f64 * pct / 100.0).ceil() as u64;
        sampled.max(self.min_entities).min(entity_count)
    }
}

/// The fully resolved policy a run is planned and executed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub max_concurrent: u32,
    pub blast_radius: BlastRadiusLimits,
    pub requires_dual_control: bool,
    pub canary: Option<CanaryPolicy>,
    pub rollback_policy: RollbackPolicy,
    pub timeout_sec: u64,
    pub cooldown_sec: u64,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            blast_radius: BlastRadiusLimits {
                max_entities: Some(100),
                max_percent: Some(10.0),
            },
            requires_dual_control: false,
            canary: None,
            rollback_policy: RollbackPolicy::Automatic,
            timeout_sec: 900,
            cooldown_sec: 3600,
        }
    }
}

impl EffectivePolicy {
    /// Overlay one layer. Nested objects merge field by field.
    pub fn overlay(&mut self, layer: &GuardOverrides) {
        if let Some(v) = layer.max_concurrent {
            self.max_concurrent = v.max(1);
        }
        if let Some(br) = &layer.blast_radius {
            if br.max_entities.is_some() {
                self.blast_radius.max_entities = br.max_entities;
            }
            if br.max_percent.is_some() {
                self.blast_radius.max_percent = br.max_percent;
            }
        }
        if let Some(v) = layer.requires_dual_control {
            self.requires_dual_control = v;
        }
        if let Some(c) = &layer.canary {
            let base = self.canary.clone().unwrap_or(CanaryPolicy {
                sample_percent: 10.0,
                min_entities: 1,
            });
            self.canary = Some(CanaryPolicy {
                sample_percent: c.sample_percent.unwrap_or(base.sample_percent),
                min_entities: c.min_entities.unwrap_or(base.min_entities),
            });
        }
        if let Some(v) = layer.rollback_policy {
            self.rollback_policy = v;
        }
        if let Some(v) = layer.timeout_sec {
            self.timeout_sec = v;
        }
        if let Some(v) = layer.cooldown_sec {
            self.cooldown_sec = v;
        }
    }
}

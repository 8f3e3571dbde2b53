use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::policy::EffectivePolicy;
use crate::types::{CompanyId, PlaybookId, PlaybookVersionId, RunId, RunScope, RunStepId, UserId};

/// Run lifecycle.
///
/// ```text
/// queued ──► approved ──► running ──► succeeded | failed | rolled_back | cancelled
///   │           │
///   └──► cancelled ◄──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Approved,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        Self::Queued,
        Self::Approved,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::RolledBack,
        Self::Cancelled,
    ];

    /// Statuses that still hold a claim on the (playbook, scope) pair.
    pub const IN_FLIGHT: [RunStatus; 3] = [Self::Queued, Self::Approved, Self::Running];

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Approved)
                | (Queued, Cancelled)
                | (Approved, Running)
                | (Approved, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, RolledBack)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::RolledBack | Self::Cancelled
        )
    }

    pub fn is_in_flight(self) -> bool {
        Self::IN_FLIGHT.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Rule,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Rule => "rule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "rule" => Some(Self::Rule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Who asked for the run, who decided, and why approval was needed at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub required: bool,
    pub dual_control: bool,
    pub reason: Option<String>,
    pub requested_by: UserId,
    pub approved_by: Option<UserId>,
    pub decision: Option<ApprovalDecision>,
    pub decided_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// Snapshot of the blast radius check taken at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastRadiusEvaluation {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub entity_count: u64,
    pub percentage: f64,
}

/// Aggregates computed when a run leaves `running`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub entity_count: u64,
    pub steps_total: u32,
    pub steps_passed: u32,
    pub steps_failed: u32,
    pub outcome_failures: u32,
    pub rollback_count: u32,
    pub rollback_failures: u32,
    pub p50_step_ms: u64,
    pub p95_step_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Who or what ended a run early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub actor: UserId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One supervised execution of a playbook version against a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub company_id: CompanyId,
    pub playbook_id: PlaybookId,
    pub playbook_code: String,
    pub playbook_version_id: PlaybookVersionId,
    pub trigger: Trigger,
    pub status: RunStatus,
    /// Scope the forward steps execute against (the canary sample when `canary`).
    pub scope: RunScope,
    /// Scope originally requested by the caller.
    pub requested_scope: RunScope,
    pub dry_run: bool,
    pub canary: bool,
    pub blast_radius: BlastRadiusEvaluation,
    /// Guards resolved at plan time; execution enforces these.
    pub policy: EffectivePolicy,
    pub approval: ApprovalRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<Cancellation>,
    pub metrics: RunMetrics,
    /// Digest of (version, requested scope); equal keys mean duplicate runs.
    pub dedupe_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A planned forward step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: RunStepId,
    pub run_id: RunId,
    pub ordinal: u32,
    pub action_code: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_check: Option<crate::playbook::OutcomeCheck>,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub rolled_back: bool,
}

impl RunStep {
    pub fn pending(run_id: RunId, ordinal: u32, action_code: &str, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            ordinal,
            action_code: action_code.to_string(),
            input,
            outcome_check: None,
            status: StepStatus::Pending,
            output: None,
            error: None,
            duration_ms: None,
            rolled_back: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RollbackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An inverse action replayed for one forward step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub id: Uuid,
    pub run_id: RunId,
    pub run_step_id: RunStepId,
    pub action_code: String,
    pub input: Value,
    pub status: RollbackStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

use thiserror::Error;

use crate::run::{BlastRadiusEvaluation, RunStatus};
use crate::types::RunId;

/// Unified error type for the entire Warden runtime.
#[derive(Error, Debug)]
pub enum WardenError {
    // ── Guard errors ───────────────────────────────────────────
    /// Blast radius, concurrency, cooldown or dry-run rule rejected the request.
    #[error("policy violation: {rule}: {reason}")]
    PolicyViolation {
        rule: String,
        reason: String,
        /// Set when the blast radius check rejected the scope.
        evaluation: Option<Box<BlastRadiusEvaluation>>,
    },

    /// Dual-control self approval and similar actor errors.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate run: an in-flight run {existing} already targets this scope")]
    DuplicateRun { existing: RunId },

    // ── Run lifecycle errors ───────────────────────────────────
    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("input validation failed for {action}: {}", errors.join("; "))]
    Validation { action: String, errors: Vec<String> },

    // ── Action errors ──────────────────────────────────────────
    #[error("action execution failed: {action}: {reason}")]
    ActionExecution { action: String, reason: String },

    #[error("action timed out: {action} after {after_secs}s")]
    Timeout { action: String, after_secs: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error("rollback partially failed for run {run_id}: {failed} step(s) failed")]
    RollbackPartialFailure { run_id: RunId, failed: usize },

    // ── Infrastructure errors ──────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    pub fn policy(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            rule: rule.into(),
            reason: reason.into(),
            evaluation: None,
        }
    }

    /// A blast radius rejection carrying the verdict that caused it.
    pub fn blast_radius(evaluation: BlastRadiusEvaluation) -> Self {
        Self::PolicyViolation {
            rule: "blast_radius".into(),
            reason: evaluation.reason.clone().unwrap_or_default(),
            evaluation: Some(Box::new(evaluation)),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the same caller may retry the same request later.
    ///
    /// Concurrency and cooldown denials clear with time; blast radius,
    /// dual control and validation failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PolicyViolation { rule, .. } => rule == "concurrency" || rule == "cooldown",
            Self::Timeout { .. } | Self::Storage(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;

//! Catalog of executable actions.
//!
//! Handlers are registered by exact action code at startup; there is no
//! prefix matching. Each registration may carry an inverse used by rollback.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use warden_core::{ActionContext, ActionDescriptor, ActionHandler, ActionOutcome, WardenError};

/// Derives the inverse action's input from the forward step's output.
pub type InverseDerivation = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// How to undo an action: which action to call and how to build its input.
#[derive(Clone)]
pub struct InverseSpec {
    pub action_code: String,
    derive: InverseDerivation,
}

impl InverseSpec {
    pub fn new(
        action_code: impl Into<String>,
        derive: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            action_code: action_code.into(),
            derive: Arc::new(derive),
        }
    }

    pub fn derive_input(&self, forward_output: &Value) -> Option<Value> {
        (self.derive)(forward_output)
    }
}

impl std::fmt::Debug for InverseSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InverseSpec")
            .field("action_code", &self.action_code)
            .finish_non_exhaustive()
    }
}

/// A concrete inverse call, ready to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseAction {
    pub action_code: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Per-action execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStats {
    pub invocations: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

struct Registration {
    handler: Arc<dyn ActionHandler>,
    inverse: Option<InverseSpec>,
}

pub struct ActionRegistry {
    actions: HashMap<String, Registration>,
    stats: DashMap<String, ActionStats>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Register an irreversible action. Re-registering a code replaces it.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.insert(handler, None);
    }

    pub fn register_with_inverse(&mut self, handler: Arc<dyn ActionHandler>, inverse: InverseSpec) {
        self.insert(handler, Some(inverse));
    }

    fn insert(&mut self, handler: Arc<dyn ActionHandler>, inverse: Option<InverseSpec>) {
        let code = handler.descriptor().code.clone();
        if self.actions.contains_key(&code) {
            warn!(action = %code, "replacing registered action");
        }
        debug!(action = %code, reversible = inverse.is_some(), "registered action");
        self.actions.insert(code, Registration { handler, inverse });
    }

    pub fn contains(&self, code: &str) -> bool {
        self.actions.contains_key(code)
    }

    pub fn descriptor(&self, code: &str) -> Option<&ActionDescriptor> {
        self.actions.get(code).map(|r| r.handler.descriptor())
    }

    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    /// Check `input` against the action's contract and its own validation.
    pub fn validate_input(&self, code: &str, input: &Value) -> ValidationReport {
        let Some(reg) = self.actions.get(code) else {
            return ValidationReport {
                valid: false,
                errors: vec![format!("unknown action '{code}'")],
            };
        };
        let mut errors = reg.handler.descriptor().input_contract.check(input);
        errors.extend(reg.handler.validate(input));
        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Run an action and record its statistics.
    pub async fn execute(
        &self,
        code: &str,
        input: &Value,
        ctx: &ActionContext,
    ) -> warden_core::Result<ActionOutcome> {
        let reg = self
            .actions
            .get(code)
            .ok_or_else(|| WardenError::not_found("action", code))?;

        if reg.handler.descriptor().dry_run_only && !ctx.dry_run {
            return Err(WardenError::policy(
                "dry_run_only",
                format!("action '{code}' may only run as a dry run"),
            ));
        }

        let started = Instant::now();
        let result = reg.handler.execute(input, ctx).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let mut stats = self.stats.entry(code.to_string()).or_default();
        stats.invocations += 1;
        stats.total_duration_ms += elapsed;
        if result.is_err() {
            stats.failures += 1;
        }
        drop(stats);

        debug!(action = code, elapsed_ms = elapsed, ok = result.is_ok(), "action executed");
        result
    }

    /// The inverse call for a forward step, if the action is reversible and
    /// the derivation accepts this output.
    pub fn get_inverse(&self, code: &str, forward_output: &Value) -> Option<InverseAction> {
        let spec = self.actions.get(code)?.inverse.as_ref()?;
        let input = spec.derive_input(forward_output)?;
        Some(InverseAction {
            action_code: spec.action_code.clone(),
            input,
        })
    }

    pub fn stats(&self, code: &str) -> Option<ActionStats> {
        self.stats.get(code).map(|s| s.clone())
    }

    pub fn stats_snapshot(&self) -> HashMap<String, ActionStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

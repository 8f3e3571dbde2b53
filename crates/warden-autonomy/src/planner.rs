use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};
use uuid::Uuid;

use warden_core::{
    BlastRadiusEvaluation, CompanyId, EffectivePolicy, GuardOverrides, GuardScope, Playbook,
    PlaybookStore, PlaybookVersion, RunId, RunScope, RunStep, RunStore, Trigger, UserId,
    WardenError, content_hash,
};

use crate::guard::{GuardPolicyResolver, check_cooldown, evaluate_blast_radius};
use crate::registry::ActionRegistry;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*scope\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
        .expect("placeholder pattern is valid")
});

/// What a caller asks the planner for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub playbook_code: String,
    /// Latest version when absent.
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub scope: RunScope,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_trigger")]
    pub trigger: Trigger,
}

fn default_trigger() -> Trigger {
    Trigger::Manual
}

impl PlanRequest {
    pub fn new(playbook_code: &str, scope: RunScope) -> Self {
        Self {
            playbook_code: playbook_code.to_string(),
            version: None,
            scope,
            dry_run: false,
            trigger: Trigger::Manual,
        }
    }
}

/// A fully resolved, not yet persisted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub run_id: RunId,
    pub company_id: CompanyId,
    pub requested_by: UserId,
    pub playbook: Playbook,
    pub version: PlaybookVersion,
    pub trigger: Trigger,
    pub dry_run: bool,
    pub policy: EffectivePolicy,
    pub blast_radius: BlastRadiusEvaluation,
    pub requested_scope: RunScope,
    /// Scope the steps were bound to: the canary sample when `canary`.
    pub scope: RunScope,
    pub canary: bool,
    pub steps: Vec<RunStep>,
    pub requires_approval: bool,
    pub approval_reason: Option<String>,
    pub dedupe_key: String,
}

pub struct RunPlanner {
    playbooks: Arc<dyn PlaybookStore>,
    runs: Arc<dyn RunStore>,
    resolver: Arc<GuardPolicyResolver>,
    registry: Arc<ActionRegistry>,
}

impl RunPlanner {
    pub fn new(
        playbooks: Arc<dyn PlaybookStore>,
        runs: Arc<dyn RunStore>,
        resolver: Arc<GuardPolicyResolver>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            playbooks,
            runs,
            resolver,
            registry,
        }
    }

    /// Resolve, guard and bind a playbook against a scope.
    ///
    /// Blast radius, cooldown and dry-run-only violations are hard errors: no
    /// run is created.
    pub fn plan_run(
        &self,
        company_id: CompanyId,
        user_id: UserId,
        request: &PlanRequest,
    ) -> warden_core::Result<Plan> {
        let playbook = self
            .playbooks
            .playbook_by_code(company_id, &request.playbook_code)?
            .ok_or_else(|| WardenError::not_found("playbook", &request.playbook_code))?;

        let version = self
            .playbooks
            .playbook_version(playbook.id, request.version)?
            .ok_or_else(|| {
                let v = request
                    .version
                    .map_or_else(|| "latest".to_string(), |v| v.to_string());
                WardenError::not_found("playbook version", format!("{}@{v}", playbook.code))
            })?;

        let mut hints: Vec<&GuardOverrides> = Vec::with_capacity(version.steps.len() + 1);
        for step in &version.steps {
            let descriptor = self
                .registry
                .descriptor(&step.action_code)
                .ok_or_else(|| WardenError::not_found("action", &step.action_code))?;
            if descriptor.dry_run_only && !request.dry_run {
                return Err(WardenError::policy(
                    "dry_run_only",
                    format!("action '{}' may only be planned as a dry run", descriptor.code),
                ));
            }
            if !descriptor.default_guards.is_empty() {
                hints.push(&descriptor.default_guards);
            }
        }
        hints.push(&version.guards);

        let policy = self.resolver.resolve(
            company_id,
            &GuardScope::playbook(playbook.code.clone()),
            &hints,
        );

        let blast_radius = evaluate_blast_radius(&request.scope, &policy);
        if !blast_radius.allowed {
            warn!(
                %company_id,
                playbook = %playbook.code,
                entities = blast_radius.entity_count,
                reason = blast_radius.reason.as_deref().unwrap_or_default(),
                "blast radius rejected plan"
            );
            return Err(WardenError::blast_radius(blast_radius));
        }

        if !request.dry_run {
            let last = self.runs.last_started_at(company_id, playbook.id)?;
            check_cooldown(last, &policy, Utc::now()).into_result()?;
        }

        let (scope, canary) = canary_scope(&request.scope, &policy);

        let run_id = Uuid::new_v4();
        let mut steps = Vec::with_capacity(version.steps.len());
        for (ordinal, template) in version.steps.iter().enumerate() {
            let input = render_template(&template.input, &scope);
            let report = self.registry.validate_input(&template.action_code, &input);
            if !report.valid {
                return Err(WardenError::Validation {
                    action: template.action_code.clone(),
                    errors: report.errors,
                });
            }
            let mut step = RunStep::pending(run_id, ordinal as u32, &template.action_code, input);
            step.outcome_check = template.outcome_check.clone();
            steps.push(step);
        }

        let (requires_approval, approval_reason) =
            self.approval_requirement(&policy, &steps, request.dry_run, canary);

        let dedupe_key = content_hash(&json!({
            "version": version.id,
            "scope": request.scope.as_value(),
            "dry_run": request.dry_run,
        }));

        info!(
            %company_id,
            %run_id,
            playbook = %playbook.code,
            version = version.version,
            steps = steps.len(),
            canary,
            requires_approval,
            "run planned"
        );

        Ok(Plan {
            run_id,
            company_id,
            requested_by: user_id,
            playbook,
            version,
            trigger: request.trigger,
            dry_run: request.dry_run,
            policy,
            blast_radius,
            requested_scope: request.scope.clone(),
            scope,
            canary,
            steps,
            requires_approval,
            approval_reason,
            dedupe_key,
        })
    }

    fn approval_requirement(
        &self,
        policy: &EffectivePolicy,
        steps: &[RunStep],
        dry_run: bool,
        canary: bool,
    ) -> (bool, Option<String>) {
        let mut reasons = Vec::new();
        if policy.requires_dual_control {
            reasons.push("dual control required by policy".to_string());
        }
        if !dry_run {
            let writes: Vec<String> = steps
                .iter()
                .filter_map(|s| self.registry.descriptor(&s.action_code))
                .filter(|d| d.effect.is_write())
                .map(|d| format!("{} ({})", d.code, d.effect))
                .collect();
            if !writes.is_empty() {
                reasons.push(format!("writes via {}", writes.join(", ")));
            }
        }
        if canary {
            reasons.push("canary run".to_string());
        }
        if reasons.is_empty() {
            (false, None)
        } else {
            (true, Some(reasons.join("; ")))
        }
    }
}

/// Narrow `scope` to the policy's canary sample when that sample is smaller.
pub fn canary_scope(scope: &RunScope, policy: &EffectivePolicy) -> (RunScope, bool) {
    let Some(canary) = &policy.canary else {
        return (scope.clone(), false);
    };
    if scope.id_list_keys().is_empty() {
        return (scope.clone(), false);
    }
    let count = scope.entity_count();
    let size = canary.sample_size(count);
    if size >= count {
        return (scope.clone(), false);
    }
    (scope.sampled(size as usize), true)
}

/// Substitute `{{scope.path}}` placeholders throughout a JSON template.
///
/// A string that is exactly one placeholder takes the scope value verbatim
/// (arrays stay arrays); placeholders embedded in text are interpolated.
/// Placeholders that do not resolve are left as they are.
pub fn render_template(template: &Value, scope: &RunScope) -> Value {
    match template {
        Value::String(s) => render_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_template(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_template(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, scope: &RunScope) -> Value {
    if let Some(caps) = PLACEHOLDER.captures(s) {
        let whole = caps.get(0).map(|m| m.as_str().len()) == Some(s.len());
        if whole {
            if let Some(value) = scope.lookup(&caps[1]) {
                return value.clone();
            }
            return Value::String(s.to_string());
        }
    }
    let rendered = PLACEHOLDER.replace_all(s, |caps: &regex::Captures<'_>| {
        match scope.lookup(&caps[1]) {
            Some(Value::String(v)) => v.clone(),
            Some(v) => v.to_string(),
            None => caps[0].to_string(),
        }
    });
    Value::String(rendered.into_owned())
}

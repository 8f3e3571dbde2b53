//! Inbound API of the runtime.
//!
//! [`RunService`] wires the planner, approval workflow, executor and
//! outcome manager over one set of stores, and is what hosts (the CLI, an
//! HTTP layer, a rule engine) talk to.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use warden_config::WardenConfig;
use warden_core::{
    ApprovalDecision, CompanyId, EffectivePolicy, EventSink, GuardOverrides, GuardPolicyStore,
    GuardScope, Pagination, Playbook, PlaybookStore, PlaybookVersion, RollbackStep, Run, RunFilter,
    RunId, RunStep, RunStore, StepTemplate, UserId, WardenError,
};

use crate::approval::ApprovalWorkflow;
use crate::executor::{RunExecutor, RunTokens};
use crate::guard::{ConcurrencyCheck, GuardPolicyResolver, check_concurrency};
use crate::memory::InMemoryStore;
use crate::outcome::{MetricsSource, OutcomeManager};
use crate::planner::{Plan, PlanRequest, RunPlanner};
use crate::registry::{ActionRegistry, ActionStats};

/// The three persistence seams, usually backed by one object.
#[derive(Clone)]
pub struct Stores {
    pub policies: Arc<dyn GuardPolicyStore>,
    pub playbooks: Arc<dyn PlaybookStore>,
    pub runs: Arc<dyn RunStore>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: GuardPolicyStore + PlaybookStore + RunStore + 'static,
    {
        Self {
            policies: store.clone(),
            playbooks: store.clone(),
            runs: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::shared(Arc::new(InMemoryStore::new()))
    }
}

pub struct RunService {
    stores: Stores,
    registry: Arc<ActionRegistry>,
    resolver: Arc<GuardPolicyResolver>,
    planner: RunPlanner,
    approvals: ApprovalWorkflow,
    executor: RunExecutor,
    outcomes: Arc<OutcomeManager>,
}

impl RunService {
    pub fn new(
        config: &WardenConfig,
        stores: Stores,
        registry: ActionRegistry,
        metrics: Arc<dyn MetricsSource>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let registry = Arc::new(registry);
        let resolver = Arc::new(GuardPolicyResolver::new(
            stores.policies.clone(),
            config.guard.to_policy(),
        ));
        let tokens = Arc::new(RunTokens::new());
        let outcomes = Arc::new(OutcomeManager::new(metrics, events.clone()));

        let planner = RunPlanner::new(
            stores.playbooks.clone(),
            stores.runs.clone(),
            resolver.clone(),
            registry.clone(),
        );
        let approvals = ApprovalWorkflow::new(
            stores.runs.clone(),
            events.clone(),
            tokens.clone(),
            config.runtime.duplicate_runs,
            config.runtime.auto_approve_when_not_required,
        );
        let executor = RunExecutor::new(
            stores.runs.clone(),
            registry.clone(),
            outcomes.clone(),
            events,
            tokens,
            Duration::from_secs(config.runtime.rollback_step_timeout_sec),
        );

        info!(
            actions = registry.codes().len(),
            duplicate_runs = ?config.runtime.duplicate_runs,
            "run service ready"
        );

        Self {
            stores,
            registry,
            resolver,
            planner,
            approvals,
            executor,
            outcomes,
        }
    }

    // ── Playbooks ──────────────────────────────────────────────

    /// Publish a new immutable version of a playbook after checking every
    /// step names a registered action.
    pub fn publish_playbook(
        &self,
        company_id: CompanyId,
        code: &str,
        name: &str,
        steps: Vec<StepTemplate>,
        guards: GuardOverrides,
    ) -> warden_core::Result<PlaybookVersion> {
        for step in &steps {
            if !self.registry.contains(&step.action_code) {
                return Err(WardenError::not_found("action", &step.action_code));
            }
        }

        publish_version(self.stores.playbooks.as_ref(), company_id, code, name, steps, guards)
    }

    // ── Run lifecycle ──────────────────────────────────────────

    pub fn plan_run(
        &self,
        company_id: CompanyId,
        user_id: UserId,
        request: &PlanRequest,
    ) -> warden_core::Result<Plan> {
        self.planner.plan_run(company_id, user_id, request)
    }

    pub fn request_approval(&self, plan: &Plan) -> warden_core::Result<Run> {
        self.approvals.request_approval(plan)
    }

    /// Plan and queue in one call.
    pub fn submit(
        &self,
        company_id: CompanyId,
        user_id: UserId,
        request: &PlanRequest,
    ) -> warden_core::Result<Run> {
        let plan = self.plan_run(company_id, user_id, request)?;
        self.request_approval(&plan)
    }

    pub fn approve_run(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        approver: UserId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> warden_core::Result<Run> {
        self.approvals
            .approve_run(company_id, run_id, approver, decision, note)
    }

    pub fn cancel_run(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        actor: UserId,
        reason: &str,
    ) -> warden_core::Result<Run> {
        self.approvals.cancel_run(company_id, run_id, actor, reason)
    }

    pub async fn execute_run(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Run> {
        self.executor.execute_run(company_id, run_id).await
    }

    pub fn attest_run(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        actor: UserId,
        statement: &str,
    ) -> warden_core::Result<()> {
        let run = self.get_run(company_id, run_id)?;
        self.outcomes
            .record_attestation(company_id, run.id, actor, statement);
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn get_run(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Run> {
        self.stores
            .runs
            .get_run(company_id, run_id)?
            .ok_or_else(|| WardenError::not_found("run", run_id))
    }

    pub fn list_runs(
        &self,
        company_id: CompanyId,
        filter: &RunFilter,
        page: Pagination,
    ) -> warden_core::Result<Vec<Run>> {
        self.stores.runs.list_runs(company_id, filter, page)
    }

    pub fn run_steps(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Vec<RunStep>> {
        let run = self.get_run(company_id, run_id)?;
        self.stores.runs.run_steps(run.id)
    }

    pub fn rollback_steps(
        &self,
        company_id: CompanyId,
        run_id: RunId,
    ) -> warden_core::Result<Vec<RollbackStep>> {
        let run = self.get_run(company_id, run_id)?;
        self.stores.runs.rollback_steps(run.id)
    }

    /// The policy a playbook would currently run under, before playbook-version guards.
    pub fn resolve_policy(&self, company_id: CompanyId, scope: &GuardScope) -> EffectivePolicy {
        self.resolver.resolve(company_id, scope, &[])
    }

    pub fn check_concurrency(
        &self,
        company_id: CompanyId,
        policy: &EffectivePolicy,
    ) -> warden_core::Result<ConcurrencyCheck> {
        check_concurrency(self.stores.runs.as_ref(), company_id, policy)
    }

    pub fn action_stats(&self) -> std::collections::HashMap<String, ActionStats> {
        self.registry.stats_snapshot()
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }
}

/// Append an immutable version of a playbook, creating the playbook on first
/// publish. Identical content returns the current latest version.
///
/// Action codes are not checked here; hosts without handlers (the CLI) rely
/// on plan-time validation instead.
pub fn publish_version(
    playbooks: &dyn PlaybookStore,
    company_id: CompanyId,
    code: &str,
    name: &str,
    steps: Vec<StepTemplate>,
    guards: GuardOverrides,
) -> warden_core::Result<PlaybookVersion> {
    if steps.is_empty() {
        return Err(WardenError::Validation {
            action: code.to_string(),
            errors: vec!["a playbook needs at least one step".into()],
        });
    }

    let playbook = match playbooks.playbook_by_code(company_id, code)? {
        Some(p) => p,
        None => {
            let p = Playbook {
                id: Uuid::new_v4(),
                company_id,
                code: code.to_string(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            playbooks.insert_playbook(&p)?;
            info!(%company_id, playbook = code, "playbook created");
            p
        }
    };

    let hash = PlaybookVersion::compute_hash(&steps, &guards);
    let latest = playbooks.playbook_version(playbook.id, None)?;
    if let Some(latest) = &latest {
        if latest.content_hash == hash {
            return Ok(latest.clone());
        }
    }

    let version = PlaybookVersion {
        id: Uuid::new_v4(),
        playbook_id: playbook.id,
        version: latest.map_or(1, |v| v.version + 1),
        steps,
        guards,
        content_hash: hash,
        created_at: Utc::now(),
    };
    playbooks.insert_version(&version)?;
    info!(%company_id, playbook = code, version = version.version, "playbook version published");
    Ok(version)
}

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use warden_config::DuplicateRunPolicy;
use warden_core::{
    ApprovalDecision, ApprovalRecord, Cancellation, CompanyId, CreateRun, EventSink, OutboxEvent,
    Run, RunId, RunMetrics, RunStatus, RunStore, SYSTEM_ACTOR, UserId, WardenError, topics,
};

use crate::executor::RunTokens;
use crate::planner::Plan;

/// Drives runs through `queued`, `approved` and `cancelled`.
///
/// Every transition is a compare-and-set against the stored status and
/// emits exactly one outbox event.
pub struct ApprovalWorkflow {
    runs: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
    tokens: Arc<RunTokens>,
    duplicate_runs: DuplicateRunPolicy,
    auto_approve: bool,
}

impl ApprovalWorkflow {
    pub fn new(
        runs: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
        tokens: Arc<RunTokens>,
        duplicate_runs: DuplicateRunPolicy,
        auto_approve: bool,
    ) -> Self {
        Self {
            runs,
            events,
            tokens,
            duplicate_runs,
            auto_approve,
        }
    }

    /// Persist a plan as a `queued` run.
    ///
    /// With auto-approval enabled and no approval required, the run is
    /// approved by the system actor straight away.
    pub fn request_approval(&self, plan: &Plan) -> warden_core::Result<Run> {
        let now = Utc::now();
        let run = Run {
            id: plan.run_id,
            company_id: plan.company_id,
            playbook_id: plan.playbook.id,
            playbook_code: plan.playbook.code.clone(),
            playbook_version_id: plan.version.id,
            trigger: plan.trigger,
            status: RunStatus::Queued,
            scope: plan.scope.clone(),
            requested_scope: plan.requested_scope.clone(),
            dry_run: plan.dry_run,
            canary: plan.canary,
            blast_radius: plan.blast_radius.clone(),
            policy: plan.policy.clone(),
            approval: ApprovalRecord {
                required: plan.requires_approval,
                dual_control: plan.policy.requires_dual_control,
                reason: plan.approval_reason.clone(),
                requested_by: plan.requested_by,
                approved_by: None,
                decision: None,
                decided_at: None,
                note: None,
            },
            cancellation: None,
            metrics: RunMetrics::default(),
            dedupe_key: plan.dedupe_key.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };

        let dedupe = self.duplicate_runs != DuplicateRunPolicy::Allow;
        match self.runs.create_run(&run, &plan.steps, dedupe)? {
            CreateRun::Created => {}
            CreateRun::Duplicate(existing) => {
                if self.duplicate_runs == DuplicateRunPolicy::ReuseExisting {
                    info!(run_id = %existing.id, status = %existing.status, "reusing in-flight run");
                    return Ok(*existing);
                }
                warn!(existing = %existing.id, playbook = %run.playbook_code, "duplicate run rejected");
                return Err(WardenError::DuplicateRun {
                    existing: existing.id,
                });
            }
        }

        self.emit(
            &run,
            topics::RUN_QUEUED,
            json!({
                "requires_approval": run.approval.required,
                "reason": run.approval.reason,
                "requested_by": run.approval.requested_by,
                "canary": run.canary,
                "dry_run": run.dry_run,
            }),
        );
        info!(
            run_id = %run.id,
            playbook = %run.playbook_code,
            requires_approval = run.approval.required,
            "run queued"
        );

        if !run.approval.required && self.auto_approve {
            return self.decide(run, SYSTEM_ACTOR, ApprovalDecision::Approve, Some("auto-approved".into()));
        }
        Ok(run)
    }

    /// Record a decision on a queued run.
    ///
    /// Under dual control the requester may not approve their own run.
    /// A rejection cancels the run.
    pub fn approve_run(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        approver: UserId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> warden_core::Result<Run> {
        let run = self.load(company_id, run_id)?;
        let target = target_status(decision);
        if run.status != RunStatus::Queued {
            return Err(WardenError::InvalidTransition {
                from: run.status,
                to: target,
            });
        }
        if decision == ApprovalDecision::Approve
            && run.approval.dual_control
            && approver == run.approval.requested_by
        {
            warn!(%run_id, %approver, "self-approval under dual control refused");
            return Err(WardenError::Forbidden(format!(
                "run {run_id} requires dual control: approver must differ from requester"
            )));
        }
        self.decide(run, approver, decision, note)
    }

    fn decide(
        &self,
        mut run: Run,
        approver: UserId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> warden_core::Result<Run> {
        let now = Utc::now();
        let target = target_status(decision);
        run.status = target;
        run.updated_at = now;
        run.approval.approved_by = Some(approver);
        run.approval.decision = Some(decision);
        run.approval.decided_at = Some(now);
        run.approval.note = note;
        if decision == ApprovalDecision::Reject {
            run.cancellation = Some(Cancellation {
                actor: approver,
                reason: run
                    .approval
                    .note
                    .clone()
                    .unwrap_or_else(|| "approval rejected".into()),
                at: now,
            });
        }

        self.compare_and_set(&run, RunStatus::Queued, target)?;

        let topic = match decision {
            ApprovalDecision::Approve => topics::RUN_APPROVED,
            ApprovalDecision::Reject => topics::RUN_REJECTED,
        };
        self.emit(
            &run,
            topic,
            json!({
                "actor": approver,
                "note": run.approval.note,
            }),
        );
        info!(run_id = %run.id, %approver, decision = ?decision, "approval decided");
        Ok(run)
    }

    /// Cancel a queued, approved or running run.
    ///
    /// A running run is marked `cancelled` at once and its in-flight action
    /// is interrupted; the executor then rolls back what already succeeded.
    pub fn cancel_run(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        actor: UserId,
        reason: &str,
    ) -> warden_core::Result<Run> {
        let mut run = self.load(company_id, run_id)?;
        let from = run.status;
        if !from.can_transition_to(RunStatus::Cancelled) {
            return Err(WardenError::InvalidTransition {
                from,
                to: RunStatus::Cancelled,
            });
        }

        let now = Utc::now();
        run.status = RunStatus::Cancelled;
        run.updated_at = now;
        run.cancellation = Some(Cancellation {
            actor,
            reason: reason.to_string(),
            at: now,
        });
        if from != RunStatus::Running {
            run.finished_at = Some(now);
        }
        self.compare_and_set(&run, from, RunStatus::Cancelled)?;

        let interrupted = from == RunStatus::Running && self.tokens.cancel(run_id);
        self.emit(
            &run,
            topics::RUN_CANCELLED,
            json!({
                "actor": actor,
                "reason": reason,
                "from": from,
                "interrupted": interrupted,
            }),
        );
        info!(%run_id, %actor, %from, interrupted, "run cancelled");
        Ok(run)
    }

    fn load(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Run> {
        self.runs
            .get_run(company_id, run_id)?
            .ok_or_else(|| WardenError::not_found("run", run_id))
    }

    fn compare_and_set(&self, run: &Run, from: RunStatus, to: RunStatus) -> warden_core::Result<()> {
        if self.runs.transition_run(run, &[from])? {
            return Ok(());
        }
        let current = self
            .runs
            .get_run(run.company_id, run.id)?
            .map_or(from, |r| r.status);
        Err(WardenError::InvalidTransition { from: current, to })
    }

    fn emit(&self, run: &Run, topic: &str, extra: serde_json::Value) {
        let mut payload = json!({
            "run_id": run.id,
            "playbook_code": run.playbook_code,
            "status": run.status,
        });
        if let (Some(base), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            base.extend(extra);
        }
        let event = OutboxEvent::new(run.company_id, topic, run.id, payload);
        if let Err(e) = self.events.emit(event) {
            warn!(run_id = %run.id, topic, error = %e, "failed to emit run event");
        }
    }
}

fn target_status(decision: ApprovalDecision) -> RunStatus {
    match decision {
        ApprovalDecision::Approve => RunStatus::Approved,
        ApprovalDecision::Reject => RunStatus::Cancelled,
    }
}

//! Supervised, sequential execution of an approved run.
//!
//! The executor owns a run from `approved` until it reaches a terminal
//! status. Action failures, failed outcome checks, deadline expiry and
//! cancellation all end in rollback and a terminal status; none of them
//! escape [`RunExecutor::execute_run`] as errors.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_core::{
    ActionContext, CompanyId, EventSink, OutboxEvent, RollbackPolicy, Run, RunId, RunMetrics,
    RunStatus, RunStep, RunStore, SlotClaim, StepStatus, WardenError, topics,
};

use crate::outcome::{OutcomeManager, OutcomeResult, StepVerification};
use crate::registry::ActionRegistry;
use crate::rollback::{RollbackEngine, RollbackReport};

/// Cancellation tokens of the runs currently executing in this process.
#[derive(Default)]
pub struct RunTokens {
    tokens: DashMap<RunId, CancellationToken>,
}

impl RunTokens {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(run_id, token.clone());
        token
    }

    fn release(&self, run_id: RunId) {
        self.tokens.remove(&run_id);
    }

    /// Fire the token of a live run. Returns `false` when the run is not
    /// executing here.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, run_id: RunId) -> bool {
        self.tokens.contains_key(&run_id)
    }
}

/// Why forward progress stopped.
enum Halt {
    Failed(String),
    Cancelled,
}

pub struct RunExecutor {
    runs: Arc<dyn RunStore>,
    registry: Arc<ActionRegistry>,
    outcomes: Arc<OutcomeManager>,
    rollback: RollbackEngine,
    events: Arc<dyn EventSink>,
    tokens: Arc<RunTokens>,
}

impl RunExecutor {
    pub fn new(
        runs: Arc<dyn RunStore>,
        registry: Arc<ActionRegistry>,
        outcomes: Arc<OutcomeManager>,
        events: Arc<dyn EventSink>,
        tokens: Arc<RunTokens>,
        rollback_step_timeout: Duration,
    ) -> Self {
        let rollback = RollbackEngine::new(registry.clone(), runs.clone(), rollback_step_timeout);
        Self {
            runs,
            registry,
            outcomes,
            rollback,
            events,
            tokens,
        }
    }

    /// Execute an approved run to completion and return it in its terminal state.
    ///
    /// Errors only for a missing run, a run that is not `approved`, a
    /// concurrency denial, or a store that cannot record the failure.
    pub async fn execute_run(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Run> {
        let mut run = self
            .runs
            .get_run(company_id, run_id)?
            .ok_or_else(|| WardenError::not_found("run", run_id))?;

        if run.status != RunStatus::Approved {
            return Err(WardenError::InvalidTransition {
                from: run.status,
                to: RunStatus::Running,
            });
        }

        let started_at = Utc::now();
        let claim = self
            .runs
            .claim_run_slot(company_id, run_id, run.policy.max_concurrent, started_at)?;
        match claim {
            SlotClaim::Claimed => {}
            SlotClaim::AtCapacity { running } => {
                warn!(%company_id, %run_id, running, "no free run slot");
                return Err(WardenError::policy(
                    "concurrency",
                    format!(
                        "{running} run(s) already running, limit is {}",
                        run.policy.max_concurrent
                    ),
                ));
            }
            SlotClaim::NotClaimable { status } => {
                return Err(WardenError::InvalidTransition {
                    from: status,
                    to: RunStatus::Running,
                });
            }
        }

        // Only the claimant registers. A cancel landing between the claim and
        // here is caught by the status check before the first step.
        let token = self.tokens.register(run_id);

        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        run.updated_at = started_at;
        info!(%company_id, %run_id, playbook = %run.playbook_code, canary = run.canary, "run started");

        let result = self.drive(&mut run, &token).await;
        self.tokens.release(run_id);

        match result {
            Ok(()) => Ok(run),
            Err(e) => self.fail_unexpectedly(run, e),
        }
    }

    async fn drive(&self, run: &mut Run, token: &CancellationToken) -> warden_core::Result<()> {
        let mut steps = self.runs.run_steps(run.id)?;
        let ctx = ActionContext {
            company_id: run.company_id,
            actor_id: run.approval.approved_by.unwrap_or(run.approval.requested_by),
            run_id: run.id,
            dry_run: run.dry_run,
            cancellation: token.clone(),
        };
        let timeout = Duration::from_secs(run.policy.timeout_sec);
        let deadline = Instant::now() + timeout;

        let mut verifications = Vec::with_capacity(steps.len());
        let mut outcome_failures = 0u32;
        let mut halt = None;
        let mut halted_at = steps.len();

        for (index, step) in steps.iter_mut().enumerate() {
            if token.is_cancelled() || !self.still_running(run)? {
                halt = Some(Halt::Cancelled);
                halted_at = index;
                break;
            }

            step.status = StepStatus::Running;
            self.runs.update_step(step)?;
            debug!(run_id = %run.id, step = step.ordinal, action = %step.action_code, "step started");

            let remaining = deadline.saturating_duration_since(Instant::now());
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(WardenError::Cancelled),
                r = tokio::time::timeout(remaining, self.registry.execute(&step.action_code, &step.input, &ctx)) => {
                    r.unwrap_or_else(|_| Err(WardenError::Timeout {
                        action: step.action_code.clone(),
                        after_secs: timeout.as_secs(),
                    }))
                }
            };
            step.duration_ms = Some(started.elapsed().as_millis() as u64);

            let cancelled = matches!(result, Err(WardenError::Cancelled));
            match result {
                Ok(outcome) => {
                    step.status = StepStatus::Succeeded;
                    step.output = Some(outcome.output);
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(e.to_string());
                    warn!(run_id = %run.id, step = step.ordinal, action = %step.action_code, error = %e, "step failed");
                }
            }
            self.runs.update_step(step)?;

            if cancelled {
                halt = Some(Halt::Cancelled);
                halted_at = index;
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let check = tokio::time::timeout(remaining, self.outcomes.check_outcome(run.company_id, step))
                .await
                .unwrap_or_else(|_| {
                    OutcomeResult::fail(format!("outcome check timed out after {}s", timeout.as_secs()))
                });
            let passed = check.passed;
            let reason = check.reason.clone();
            verifications.push(StepVerification {
                run_step_id: step.id,
                ordinal: step.ordinal,
                action_code: step.action_code.clone(),
                result: check,
            });

            if !passed {
                if step.status == StepStatus::Succeeded {
                    outcome_failures += 1;
                }
                halt = Some(Halt::Failed(
                    reason.unwrap_or_else(|| format!("step {} failed", step.ordinal)),
                ));
                halted_at = index;
                break;
            }
        }

        if halt.is_none() && !self.still_running(run)? {
            halt = Some(Halt::Cancelled);
        }

        // The halting step itself is never compensated, even when its action
        // succeeded and only the outcome check failed.
        let mut report = RollbackReport::default();
        if halt.is_some() {
            if run.policy.rollback_policy == RollbackPolicy::Automatic {
                let ctx = ActionContext {
                    cancellation: CancellationToken::new(),
                    ..ctx.clone()
                };
                report = self.rollback.rollback(run, &mut steps[..halted_at], &ctx).await;
            } else {
                info!(run_id = %run.id, "manual rollback policy, leaving effects in place");
            }
        }

        let mut metrics = compute_metrics(run, &steps, outcome_failures, &report);
        let terminal = match &halt {
            None => RunStatus::Succeeded,
            Some(Halt::Cancelled) => RunStatus::Cancelled,
            Some(Halt::Failed(_)) if report.attempted > 0 => RunStatus::RolledBack,
            Some(Halt::Failed(_)) => RunStatus::Failed,
        };
        if let Some(Halt::Failed(reason)) = &halt {
            metrics.error = Some(reason.clone());
        }

        let now = Utc::now();
        run.metrics = metrics;
        run.finished_at = Some(now);
        run.updated_at = now;

        if terminal == RunStatus::Cancelled || !self.finish(run, terminal)? {
            self.annotate_cancelled(run)?;
        }

        self.outcomes.record_verification(run, &verifications);
        Ok(())
    }

    /// Whether the stored run is still `running`. A cancel issued by another
    /// process only changes the stored status.
    fn still_running(&self, run: &Run) -> warden_core::Result<bool> {
        let stored = self.runs.get_run(run.company_id, run.id)?;
        Ok(stored.is_some_and(|r| r.status == RunStatus::Running))
    }

    /// Move `running → terminal` and emit the completion event. Returns
    /// `false` if the run was cancelled underneath us.
    fn finish(&self, run: &mut Run, terminal: RunStatus) -> warden_core::Result<bool> {
        run.status = terminal;
        if !self.runs.transition_run(run, &[RunStatus::Running])? {
            return Ok(false);
        }
        self.emit_completed(run);
        info!(
            run_id = %run.id,
            status = %run.status,
            steps_passed = run.metrics.steps_passed,
            rollbacks = run.metrics.rollback_count,
            "run finished"
        );
        Ok(true)
    }

    /// Attach metrics to a run that `cancel_run` already moved to `cancelled`.
    fn annotate_cancelled(&self, run: &mut Run) -> warden_core::Result<()> {
        let stored = self
            .runs
            .get_run(run.company_id, run.id)?
            .ok_or_else(|| WardenError::not_found("run", run.id))?;
        run.status = stored.status;
        run.cancellation = stored.cancellation;
        run.approval = stored.approval;
        if !self.runs.transition_run(run, &[stored.status])? {
            warn!(run_id = %run.id, "run changed while recording cancellation metrics");
        }
        info!(run_id = %run.id, status = %run.status, rollbacks = run.metrics.rollback_count, "run stopped");
        Ok(())
    }

    /// Last resort for errors that escaped the step loop (typically storage).
    fn fail_unexpectedly(&self, mut run: Run, err: WardenError) -> warden_core::Result<Run> {
        error!(run_id = %run.id, error = %err, "run aborted by unexpected error");
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.metrics.error = Some(err.to_string());
        run.finished_at = Some(now);
        run.updated_at = now;
        if self.runs.transition_run(&run, &[RunStatus::Running])? {
            self.emit_completed(&run);
        }
        Ok(run)
    }

    fn emit_completed(&self, run: &Run) {
        let event = OutboxEvent::new(
            run.company_id,
            topics::RUN_COMPLETED,
            run.id,
            json!({
                "run_id": run.id,
                "playbook_code": run.playbook_code,
                "status": run.status,
                "canary": run.canary,
                "dry_run": run.dry_run,
                "metrics": run.metrics,
            }),
        );
        if let Err(e) = self.events.emit(event) {
            warn!(run_id = %run.id, error = %e, "failed to emit completion event");
        }
    }
}

fn compute_metrics(
    run: &Run,
    steps: &[RunStep],
    outcome_failures: u32,
    report: &RollbackReport,
) -> RunMetrics {
    let mut durations: Vec<u64> = steps.iter().filter_map(|s| s.duration_ms).collect();
    durations.sort_unstable();
    RunMetrics {
        entity_count: run.scope.entity_count(),
        steps_total: steps.len() as u32,
        steps_passed: steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count() as u32,
        steps_failed: steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count() as u32,
        outcome_failures,
        rollback_count: report.attempted,
        rollback_failures: report.failed,
        p50_step_ms: percentile(&durations, 50.0),
        p95_step_ms: percentile(&durations, 95.0),
        error: None,
    }
}

/// Nearest-rank percentile of an ascending slice; 0 when empty.
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

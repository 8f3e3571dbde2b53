use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_core::{
    ActionContext, RollbackStatus, RollbackStep, Run, RunStep, RunStore, StepStatus, WardenError,
};

use crate::registry::ActionRegistry;

/// Tally of one rollback pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Inverse calls made (each has a tracked rollback step).
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Forward steps with no usable inverse.
    pub skipped: u32,
}

/// Replays inverse actions for executed forward steps, newest first.
///
/// Best effort: a failing inverse is recorded and logged, never retried, and
/// does not stop the remaining steps from being rolled back.
pub struct RollbackEngine {
    registry: Arc<ActionRegistry>,
    runs: Arc<dyn RunStore>,
    step_timeout: Duration,
}

impl RollbackEngine {
    pub fn new(registry: Arc<ActionRegistry>, runs: Arc<dyn RunStore>, step_timeout: Duration) -> Self {
        Self {
            registry,
            runs,
            step_timeout,
        }
    }

    /// Roll back every succeeded step in `executed` (forward order), in reverse.
    pub async fn rollback(
        &self,
        run: &Run,
        executed: &mut [RunStep],
        ctx: &ActionContext,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();

        for step in executed.iter_mut().rev() {
            if step.status != StepStatus::Succeeded {
                continue;
            }
            let output = step.output.clone().unwrap_or(Value::Null);
            let Some(inverse) = self.registry.get_inverse(&step.action_code, &output) else {
                debug!(run_id = %run.id, action = %step.action_code, "no inverse, skipping");
                report.skipped += 1;
                continue;
            };

            let mut rb = RollbackStep {
                id: Uuid::new_v4(),
                run_id: run.id,
                run_step_id: step.id,
                action_code: inverse.action_code.clone(),
                input: inverse.input.clone(),
                status: RollbackStatus::Running,
                output: None,
                error: None,
                created_at: Utc::now(),
            };
            report.attempted += 1;
            if let Err(e) = self.runs.insert_rollback_step(&rb) {
                warn!(run_id = %run.id, error = %e, "failed to record rollback step");
            }

            let result = match tokio::time::timeout(
                self.step_timeout,
                self.registry.execute(&inverse.action_code, &inverse.input, ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(WardenError::Timeout {
                    action: inverse.action_code.clone(),
                    after_secs: self.step_timeout.as_secs(),
                }),
            };

            match result {
                Ok(outcome) => {
                    rb.status = RollbackStatus::Succeeded;
                    rb.output = Some(outcome.output);
                    step.rolled_back = true;
                    if let Err(e) = self.runs.update_step(step) {
                        warn!(run_id = %run.id, step = step.ordinal, error = %e, "failed to flag step rolled back");
                    }
                    report.succeeded += 1;
                    info!(
                        run_id = %run.id,
                        step = step.ordinal,
                        inverse = %rb.action_code,
                        "step rolled back"
                    );
                }
                Err(e) => {
                    rb.status = RollbackStatus::Failed;
                    rb.error = Some(e.to_string());
                    report.failed += 1;
                    warn!(
                        run_id = %run.id,
                        step = step.ordinal,
                        inverse = %rb.action_code,
                        error = %e,
                        "rollback step failed"
                    );
                }
            }

            if let Err(e) = self.runs.update_rollback_step(&rb) {
                warn!(run_id = %run.id, error = %e, "failed to update rollback step");
            }
        }

        if report.failed > 0 {
            let partial = WardenError::RollbackPartialFailure {
                run_id: run.id,
                failed: report.failed as usize,
            };
            warn!(run_id = %run.id, "{partial}");
        }
        report
    }
}

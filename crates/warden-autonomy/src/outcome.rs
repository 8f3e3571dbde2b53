use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use warden_core::{
    CompanyId, EventSink, OutboxEvent, Run, RunId, RunStep, RunStepId, StepStatus, UserId, topics,
};

/// Where live domain metrics come from (ledgers, queues, reconciliations).
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// `Ok(None)` means no data yet, which outcome checks read as zero.
    async fn get_metric_value(
        &self,
        company_id: CompanyId,
        metric: &str,
        as_of: DateTime<Utc>,
    ) -> warden_core::Result<Option<f64>>;
}

/// A metrics source backed by a map, settable at runtime.
#[derive(Default)]
pub struct StaticMetrics {
    values: RwLock<HashMap<(CompanyId, String), f64>>,
}

impl StaticMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, company_id: CompanyId, metric: &str, value: f64) {
        self.values.write().insert((company_id, metric.to_string()), value);
    }
}

#[async_trait]
impl MetricsSource for StaticMetrics {
    async fn get_metric_value(
        &self,
        company_id: CompanyId,
        metric: &str,
        _as_of: DateTime<Utc>,
    ) -> warden_core::Result<Option<f64>> {
        Ok(self.values.read().get(&(company_id, metric.to_string())).copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
}

impl OutcomeResult {
    pub(crate) fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            metric: None,
            observed: None,
        }
    }

    pub(crate) fn fail(reason: String) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
            metric: None,
            observed: None,
        }
    }
}

/// The check result recorded for one step in the verification fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepVerification {
    pub run_step_id: RunStepId,
    pub ordinal: u32,
    pub action_code: String,
    pub result: OutcomeResult,
}

pub struct OutcomeManager {
    metrics: Arc<dyn MetricsSource>,
    events: Arc<dyn EventSink>,
}

impl OutcomeManager {
    pub fn new(metrics: Arc<dyn MetricsSource>, events: Arc<dyn EventSink>) -> Self {
        Self { metrics, events }
    }

    /// Decide whether the run may continue past `step`.
    pub async fn check_outcome(&self, company_id: CompanyId, step: &RunStep) -> OutcomeResult {
        if step.status == StepStatus::Failed {
            return OutcomeResult::fail(format!(
                "step {} ({}) failed: {}",
                step.ordinal,
                step.action_code,
                step.error.as_deref().unwrap_or("unknown error")
            ));
        }

        let Some(check) = &step.outcome_check else {
            return OutcomeResult::pass();
        };

        let observed = match self
            .metrics
            .get_metric_value(company_id, &check.metric, Utc::now())
            .await
        {
            Ok(value) => value.unwrap_or(0.0),
            Err(e) => {
                warn!(metric = %check.metric, error = %e, "metric source unavailable");
                return OutcomeResult {
                    metric: Some(check.metric.clone()),
                    ..OutcomeResult::fail(format!("metric '{}' unavailable: {e}", check.metric))
                };
            }
        };

        let passed = check.threshold.passes(observed);
        debug!(metric = %check.metric, observed, passed, "outcome check");
        OutcomeResult {
            passed,
            reason: (!passed).then(|| {
                format!(
                    "metric '{}' = {} violates threshold {}",
                    check.metric,
                    observed,
                    check.threshold.describe()
                )
            }),
            metric: Some(check.metric.clone()),
            observed: Some(observed),
        }
    }

    /// Append the verification fact for a finished run. Never fails.
    pub fn record_verification(&self, run: &Run, results: &[StepVerification]) {
        let passed = results.iter().all(|r| r.result.passed);
        let event = OutboxEvent::new(
            run.company_id,
            topics::VERIFICATION_COMPLETED,
            run.id,
            json!({
                "run_id": run.id,
                "status": run.status,
                "passed": passed,
                "checks": results,
            }),
        );
        if let Err(e) = self.events.emit(event) {
            warn!(run_id = %run.id, error = %e, "failed to record verification");
        } else {
            info!(run_id = %run.id, passed, "verification recorded");
        }
    }

    /// Append an attestation by `actor` about a run. Never fails.
    pub fn record_attestation(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        actor: UserId,
        statement: &str,
    ) {
        let event = OutboxEvent::new(
            company_id,
            topics::ATTESTATION_RECORDED,
            run_id,
            json!({
                "run_id": run_id,
                "actor": actor,
                "statement": statement,
            }),
        );
        if let Err(e) = self.events.emit(event) {
            warn!(%run_id, error = %e, "failed to record attestation");
        } else {
            info!(%run_id, %actor, "attestation recorded");
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use warden_core::{
    BlastRadiusEvaluation, CompanyId, EffectivePolicy, GuardOverrides, GuardPolicyStore,
    GuardScope, RunScope, RunStore, WardenError,
};

/// Merges the stored global policy, the stored playbook policy and any
/// in-line guard layers into one effective policy.
pub struct GuardPolicyResolver {
    store: Arc<dyn GuardPolicyStore>,
    fallback: EffectivePolicy,
}

impl GuardPolicyResolver {
    pub fn new(store: Arc<dyn GuardPolicyStore>, fallback: EffectivePolicy) -> Self {
        Self { store, fallback }
    }

    pub fn fallback(&self) -> &EffectivePolicy {
        &self.fallback
    }

    /// Resolve the policy for `scope`.
    ///
    /// Order: fallback → stored global → stored playbook policy (when `scope` is a
    /// playbook) → each of `layers` in order. A missing or unreadable policy is
    /// skipped; resolution never fails.
    pub fn resolve(
        &self,
        company_id: CompanyId,
        scope: &GuardScope,
        layers: &[&GuardOverrides],
    ) -> EffectivePolicy {
        let mut policy = self.fallback.clone();

        self.overlay_stored(&mut policy, company_id, &GuardScope::Global);
        if matches!(scope, GuardScope::Playbook(_)) {
            self.overlay_stored(&mut policy, company_id, scope);
        }
        for layer in layers {
            policy.overlay(layer);
        }

        debug!(%company_id, %scope, ?policy, "resolved guard policy");
        policy
    }

    fn overlay_stored(&self, policy: &mut EffectivePolicy, company_id: CompanyId, scope: &GuardScope) {
        match self.store.get_policy(company_id, scope) {
            Ok(Some(stored)) => policy.overlay(&stored.guards),
            Ok(None) => {}
            Err(e) => {
                warn!(%company_id, %scope, error = %e, "failed to read guard policy, skipping layer");
            }
        }
    }
}

/// Deterministic and side-effect free: the same scope and policy always give
/// the same verdict.
pub fn evaluate_blast_radius(scope: &RunScope, policy: &EffectivePolicy) -> BlastRadiusEvaluation {
    let entity_count = scope.entity_count();
    let percentage = match scope.total_entities() {
        Some(total) if total > 0 => entity_count as f64 / total as f64 * 100.0,
        _ => 0.0,
    };

    let mut reason = None;
    if let Some(max) = policy.blast_radius.max_entities {
        if entity_count > max {
            reason = Some(format!("{entity_count} entities exceeds maxEntities {max}"));
        }
    }
    if reason.is_none() {
        if let Some(max) = policy.blast_radius.max_percent {
            if percentage > max {
                reason = Some(format!("{percentage:.2}% of entities exceeds maxPercent {max}%"));
            }
        }
    }

    BlastRadiusEvaluation {
        allowed: reason.is_none(),
        reason,
        entity_count,
        percentage,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyCheck {
    pub allowed: bool,
    pub current_running: u32,
    pub max_concurrent: u32,
}

impl ConcurrencyCheck {
    pub fn from_count(current_running: u32, policy: &EffectivePolicy) -> Self {
        Self {
            allowed: current_running < policy.max_concurrent,
            current_running,
            max_concurrent: policy.max_concurrent,
        }
    }

    pub fn into_result(self) -> warden_core::Result<()> {
        if self.allowed {
            return Ok(());
        }
        Err(WardenError::policy(
            "concurrency",
            format!(
                "{} run(s) already running, limit is {}",
                self.current_running, self.max_concurrent
            ),
        ))
    }
}

/// Advisory read of how many runs the tenant has in `running`.
///
/// Execution does not rely on this; it claims a slot atomically through
/// [`RunStore::claim_run_slot`].
pub fn check_concurrency(
    runs: &dyn RunStore,
    company_id: CompanyId,
    policy: &EffectivePolicy,
) -> warden_core::Result<ConcurrencyCheck> {
    let current = runs.count_running(company_id)?;
    let check = ConcurrencyCheck::from_count(current, policy);
    if !check.allowed {
        info!(%company_id, current, max = policy.max_concurrent, "concurrency limit reached");
    }
    Ok(check)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownCheck {
    pub allowed: bool,
    pub remaining_sec: u64,
}

impl CooldownCheck {
    pub fn into_result(self) -> warden_core::Result<()> {
        if self.allowed {
            return Ok(());
        }
        Err(WardenError::policy(
            "cooldown",
            format!("playbook is cooling down for another {}s", self.remaining_sec),
        ))
    }
}

/// Deny while less than `cooldown_sec` has elapsed since `last_run`.
pub fn check_cooldown(
    last_run: Option<DateTime<Utc>>,
    policy: &EffectivePolicy,
    now: DateTime<Utc>,
) -> CooldownCheck {
    let Some(last) = last_run else {
        return CooldownCheck {
            allowed: true,
            remaining_sec: 0,
        };
    };
    let elapsed = (now - last).num_seconds().max(0) as u64;
    if elapsed < policy.cooldown_sec {
        CooldownCheck {
            allowed: false,
            remaining_sec: policy.cooldown_sec - elapsed,
        }
    } else {
        CooldownCheck {
            allowed: true,
            remaining_sec: 0,
        }
    }
}

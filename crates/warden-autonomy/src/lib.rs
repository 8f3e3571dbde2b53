//! # warden-autonomy
//!
//! The guarded autonomy execution runtime. Resolves layered guard policies,
//! plans playbook runs against a scope (blast radius, canary sampling,
//! template binding), routes them through dual-control approval, executes
//! steps one at a time under a deadline with outcome checks, and rolls back
//! through registered inverse actions when a run goes wrong.

pub mod approval;
pub mod executor;
pub mod guard;
pub mod memory;
pub mod outcome;
pub mod planner;
pub mod registry;
pub mod rollback;
pub mod service;

pub use approval::ApprovalWorkflow;
pub use executor::{RunExecutor, RunTokens, percentile};
pub use guard::{
    ConcurrencyCheck, CooldownCheck, GuardPolicyResolver, check_concurrency, check_cooldown,
    evaluate_blast_radius,
};
pub use memory::InMemoryStore;
pub use outcome::{MetricsSource, OutcomeManager, OutcomeResult, StaticMetrics, StepVerification};
pub use planner::{Plan, PlanRequest, RunPlanner, canary_scope, render_template};
pub use registry::{ActionRegistry, ActionStats, InverseAction, InverseSpec, ValidationReport};
pub use rollback::{RollbackEngine, RollbackReport};
pub use service::{RunService, Stores, publish_version};

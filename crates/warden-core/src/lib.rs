//! # warden-core
//!
//! Core types, traits, and primitives for the Warden guarded autonomy runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! runs and their state machine, guard policies, playbooks, the action trait,
//! outbox events, and the persistence seams.

pub mod action;
pub mod error;
pub mod event;
pub mod playbook;
pub mod policy;
pub mod run;
pub mod store;
pub mod types;

pub use action::{ActionContext, ActionDescriptor, ActionHandler, ActionOutcome, EffectClass, InputContract};
pub use error::{Result, WardenError};
pub use event::{EventSink, Outbox, OutboxEvent, topics};
pub use playbook::{Comparison, OutcomeCheck, Playbook, PlaybookVersion, StepTemplate, Threshold};
pub use policy::{
    BlastRadiusLimits, BlastRadiusOverride, CanaryOverride, CanaryPolicy, EffectivePolicy,
    GuardOverrides, GuardPolicy, GuardScope, RollbackPolicy,
};
pub use run::{
    ApprovalDecision, ApprovalRecord, BlastRadiusEvaluation, Cancellation, RollbackStatus,
    RollbackStep, Run, RunMetrics, RunStatus, RunStep, StepStatus, Trigger,
};
pub use store::{CreateRun, GuardPolicyStore, Pagination, PlaybookStore, RunFilter, RunStore, SlotClaim};
pub use types::*;

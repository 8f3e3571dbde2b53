//! Persistence seams. The runtime only ever talks to storage through these
//! traits; `warden-autonomy` ships an in-memory implementation and
//! `warden-store` a SQLite one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::playbook::{Playbook, PlaybookVersion};
use crate::policy::{GuardPolicy, GuardScope};
use crate::run::{RollbackStep, Run, RunStatus, RunStep, Trigger};
use crate::types::{CompanyId, PlaybookId, PlaybookVersionId, RunId};

/// Read side used by the guard resolver, plus the admin upsert.
pub trait GuardPolicyStore: Send + Sync {
    fn get_policy(&self, company_id: CompanyId, scope: &GuardScope) -> Result<Option<GuardPolicy>>;

    /// Insert or replace the single policy for `(company, scope)`.
    fn put_policy(&self, policy: &GuardPolicy) -> Result<()>;
}

pub trait PlaybookStore: Send + Sync {
    fn playbook_by_code(&self, company_id: CompanyId, code: &str) -> Result<Option<Playbook>>;

    fn insert_playbook(&self, playbook: &Playbook) -> Result<()>;

    /// A specific version, or the latest when `version` is `None`.
    fn playbook_version(
        &self,
        playbook_id: PlaybookId,
        version: Option<u32>,
    ) -> Result<Option<PlaybookVersion>>;

    fn version_by_id(&self, id: PlaybookVersionId) -> Result<Option<PlaybookVersion>>;

    /// Fails with `Storage` if the version number is already taken.
    fn insert_version(&self, version: &PlaybookVersion) -> Result<()>;
}

/// Outcome of persisting a freshly planned run.
#[derive(Debug, Clone)]
pub enum CreateRun {
    Created,
    /// An in-flight run with the same dedupe key already exists.
    Duplicate(Box<Run>),
}

/// Outcome of trying to move an approved run into `running`.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotClaim {
    Claimed,
    AtCapacity { running: u32 },
    NotClaimable { status: RunStatus },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub playbook_code: Option<String>,
    pub trigger: Option<Trigger>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.status.is_none_or(|s| s == run.status)
            && self
                .playbook_code
                .as_deref()
                .is_none_or(|c| c == run.playbook_code)
            && self.trigger.is_none_or(|t| t == run.trigger)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

pub trait RunStore: Send + Sync {
    /// Persist a run with its planned steps. With `dedupe`, the duplicate check
    /// and the insert happen atomically.
    fn create_run(&self, run: &Run, steps: &[RunStep], dedupe: bool) -> Result<CreateRun>;

    fn get_run(&self, company_id: CompanyId, run_id: RunId) -> Result<Option<Run>>;

    /// Compare-and-set: write `run` only if the stored status is one of `expected`.
    /// Returns `false` when the stored status did not match.
    fn transition_run(&self, run: &Run, expected: &[RunStatus]) -> Result<bool>;

    /// Atomically move `approved → running` while the tenant has fewer than
    /// `max_concurrent` running runs.
    fn claim_run_slot(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        max_concurrent: u32,
        started_at: DateTime<Utc>,
    ) -> Result<SlotClaim>;

    fn count_running(&self, company_id: CompanyId) -> Result<u32>;

    /// Start time of the most recent non-dry run of a playbook.
    fn last_started_at(
        &self,
        company_id: CompanyId,
        playbook_id: PlaybookId,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Newest first.
    fn list_runs(
        &self,
        company_id: CompanyId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>>;

    /// Forward steps ordered by ordinal.
    fn run_steps(&self, run_id: RunId) -> Result<Vec<RunStep>>;

    fn update_step(&self, step: &RunStep) -> Result<()>;

    fn insert_rollback_step(&self, step: &RollbackStep) -> Result<()>;

    fn update_rollback_step(&self, step: &RollbackStep) -> Result<()>;

    /// Rollback steps in the order they were created.
    fn rollback_steps(&self, run_id: RunId) -> Result<Vec<RollbackStep>>;
}

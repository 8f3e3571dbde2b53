use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use warden_core::{
    CompanyId, CreateRun, GuardPolicy, GuardPolicyStore, GuardScope, Pagination, Playbook,
    PlaybookId, PlaybookStore, PlaybookVersion, PlaybookVersionId, RollbackStep, Run, RunFilter,
    RunId, RunStatus, RunStep, RunStore, SlotClaim, WardenError,
};

#[derive(Default)]
struct State {
    policies: HashMap<(CompanyId, GuardScope), GuardPolicy>,
    playbooks: HashMap<PlaybookId, Playbook>,
    versions: HashMap<PlaybookVersionId, PlaybookVersion>,
    runs: HashMap<RunId, Run>,
    steps: HashMap<RunId, Vec<RunStep>>,
    rollbacks: HashMap<RunId, Vec<RollbackStep>>,
}

/// Process-local store behind a single lock, so every multi-record
/// operation is atomic. Used by tests and embedders without a database.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GuardPolicyStore for InMemoryStore {
    fn get_policy(
        &self,
        company_id: CompanyId,
        scope: &GuardScope,
    ) -> warden_core::Result<Option<GuardPolicy>> {
        Ok(self.state.lock().policies.get(&(company_id, scope.clone())).cloned())
    }

    fn put_policy(&self, policy: &GuardPolicy) -> warden_core::Result<()> {
        self.state
            .lock()
            .policies
            .insert((policy.company_id, policy.scope.clone()), policy.clone());
        Ok(())
    }
}

impl PlaybookStore for InMemoryStore {
    fn playbook_by_code(
        &self,
        company_id: CompanyId,
        code: &str,
    ) -> warden_core::Result<Option<Playbook>> {
        Ok(self
            .state
            .lock()
            .playbooks
            .values()
            .find(|p| p.company_id == company_id && p.code == code)
            .cloned())
    }

    fn insert_playbook(&self, playbook: &Playbook) -> warden_core::Result<()> {
        let mut state = self.state.lock();
        if state
            .playbooks
            .values()
            .any(|p| p.company_id == playbook.company_id && p.code == playbook.code)
        {
            return Err(WardenError::Storage(format!(
                "playbook '{}' already exists",
                playbook.code
            )));
        }
        state.playbooks.insert(playbook.id, playbook.clone());
        Ok(())
    }

    fn playbook_version(
        &self,
        playbook_id: PlaybookId,
        version: Option<u32>,
    ) -> warden_core::Result<Option<PlaybookVersion>> {
        let state = self.state.lock();
        let mut candidates = state.versions.values().filter(|v| v.playbook_id == playbook_id);
        let found = match version {
            Some(n) => candidates.find(|v| v.version == n),
            None => candidates.max_by_key(|v| v.version),
        };
        Ok(found.cloned())
    }

    fn version_by_id(&self, id: PlaybookVersionId) -> warden_core::Result<Option<PlaybookVersion>> {
        Ok(self.state.lock().versions.get(&id).cloned())
    }

    fn insert_version(&self, version: &PlaybookVersion) -> warden_core::Result<()> {
        let mut state = self.state.lock();
        if state
            .versions
            .values()
            .any(|v| v.playbook_id == version.playbook_id && v.version == version.version)
        {
            return Err(WardenError::Storage(format!(
                "version {} already exists",
                version.version
            )));
        }
        state.versions.insert(version.id, version.clone());
        Ok(())
    }
}

impl RunStore for InMemoryStore {
    fn create_run(&self, run: &Run, steps: &[RunStep], dedupe: bool) -> warden_core::Result<CreateRun> {
        let mut state = self.state.lock();
        if dedupe {
            let existing = state.runs.values().find(|r| {
                r.company_id == run.company_id
                    && r.dedupe_key == run.dedupe_key
                    && r.status.is_in_flight()
            });
            if let Some(existing) = existing {
                return Ok(CreateRun::Duplicate(Box::new(existing.clone())));
            }
        }
        if state.runs.contains_key(&run.id) {
            return Err(WardenError::Storage(format!("run {} already exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        state.steps.insert(run.id, steps.to_vec());
        Ok(CreateRun::Created)
    }

    fn get_run(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Option<Run>> {
        Ok(self
            .state
            .lock()
            .runs
            .get(&run_id)
            .filter(|r| r.company_id == company_id)
            .cloned())
    }

    fn transition_run(&self, run: &Run, expected: &[RunStatus]) -> warden_core::Result<bool> {
        let mut state = self.state.lock();
        let Some(stored) = state.runs.get_mut(&run.id) else {
            return Err(WardenError::not_found("run", run.id));
        };
        if stored.company_id != run.company_id || !expected.contains(&stored.status) {
            return Ok(false);
        }
        *stored = run.clone();
        Ok(true)
    }

    fn claim_run_slot(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        max_concurrent: u32,
        started_at: DateTime<Utc>,
    ) -> warden_core::Result<SlotClaim> {
        let mut state = self.state.lock();
        let running = state
            .runs
            .values()
            .filter(|r| r.company_id == company_id && r.status == RunStatus::Running)
            .count() as u32;
        let Some(run) = state
            .runs
            .get_mut(&run_id)
            .filter(|r| r.company_id == company_id)
        else {
            return Err(WardenError::not_found("run", run_id));
        };
        if run.status != RunStatus::Approved {
            return Ok(SlotClaim::NotClaimable { status: run.status });
        }
        if running >= max_concurrent {
            return Ok(SlotClaim::AtCapacity { running });
        }
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        run.updated_at = started_at;
        Ok(SlotClaim::Claimed)
    }

    fn count_running(&self, company_id: CompanyId) -> warden_core::Result<u32> {
        Ok(self
            .state
            .lock()
            .runs
            .values()
            .filter(|r| r.company_id == company_id && r.status == RunStatus::Running)
            .count() as u32)
    }

    fn last_started_at(
        &self,
        company_id: CompanyId,
        playbook_id: PlaybookId,
    ) -> warden_core::Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .runs
            .values()
            .filter(|r| r.company_id == company_id && r.playbook_id == playbook_id && !r.dry_run)
            .filter_map(|r| r.started_at)
            .max())
    }

    fn list_runs(
        &self,
        company_id: CompanyId,
        filter: &RunFilter,
        page: Pagination,
    ) -> warden_core::Result<Vec<Run>> {
        let state = self.state.lock();
        let mut runs: Vec<&Run> = state
            .runs
            .values()
            .filter(|r| r.company_id == company_id && filter.matches(r))
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(runs
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn run_steps(&self, run_id: RunId) -> warden_core::Result<Vec<RunStep>> {
        let mut steps = self.state.lock().steps.get(&run_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.ordinal);
        Ok(steps)
    }

    fn update_step(&self, step: &RunStep) -> warden_core::Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .steps
            .get_mut(&step.run_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.id == step.id))
            .ok_or_else(|| WardenError::not_found("run step", step.id))?;
        *slot = step.clone();
        Ok(())
    }

    fn insert_rollback_step(&self, step: &RollbackStep) -> warden_core::Result<()> {
        self.state
            .lock()
            .rollbacks
            .entry(step.run_id)
            .or_default()
            .push(step.clone());
        Ok(())
    }

    fn update_rollback_step(&self, step: &RollbackStep) -> warden_core::Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .rollbacks
            .get_mut(&step.run_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.id == step.id))
            .ok_or_else(|| WardenError::not_found("rollback step", step.id))?;
        *slot = step.clone();
        Ok(())
    }

    fn rollback_steps(&self, run_id: RunId) -> warden_core::Result<Vec<RollbackStep>> {
        Ok(self
            .state
            .lock()
            .rollbacks
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

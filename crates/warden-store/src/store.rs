use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use warden_core::{
    CompanyId, CreateRun, EventSink, GuardPolicy, GuardPolicyStore, GuardScope, OutboxEvent,
    Pagination, Playbook, PlaybookId, PlaybookStore, PlaybookVersion, PlaybookVersionId,
    RollbackStep, Run, RunFilter, RunId, RunStatus, RunStep, RunStore, SlotClaim, WardenError,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS guard_policies (
        company_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        guards TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (company_id, scope)
    );

    CREATE TABLE IF NOT EXISTS playbooks (
        id TEXT PRIMARY KEY,
        company_id TEXT NOT NULL,
        code TEXT NOT NULL,
        data TEXT NOT NULL,
        UNIQUE(company_id, code)
    );

    CREATE TABLE IF NOT EXISTS playbook_versions (
        id TEXT PRIMARY KEY,
        playbook_id TEXT NOT NULL REFERENCES playbooks(id),
        version INTEGER NOT NULL,
        data TEXT NOT NULL,
        UNIQUE(playbook_id, version)
    );

    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        company_id TEXT NOT NULL,
        playbook_id TEXT NOT NULL,
        playbook_code TEXT NOT NULL,
        trigger TEXT NOT NULL,
        status TEXT NOT NULL,
        dry_run INTEGER NOT NULL,
        dedupe_key TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS run_steps (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        ordinal INTEGER NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS rollback_steps (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        run_id TEXT NOT NULL REFERENCES runs(id),
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outbox_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        company_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        key TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_company_status ON runs(company_id, status);
    CREATE INDEX IF NOT EXISTS idx_runs_dedupe ON runs(company_id, dedupe_key);
    CREATE INDEX IF NOT EXISTS idx_runs_playbook ON runs(company_id, playbook_id);
    CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id, ordinal);
    CREATE INDEX IF NOT EXISTS idx_rollback_steps_run ON rollback_steps(run_id);
    CREATE INDEX IF NOT EXISTS idx_outbox_company_topic ON outbox_events(company_id, topic);
";

/// SQLite persistence for every runtime seam: policies, playbooks, runs,
/// steps, rollback steps and the durable outbox.
///
/// Entities are stored as JSON documents next to the columns that queries
/// filter on. Multi-record operations run inside `IMMEDIATE` transactions so
/// they stay atomic even when several processes share one database file.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

fn storage(e: rusqlite::Error) -> WardenError {
    WardenError::Storage(e.to_string())
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> warden_core::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WardenError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn to_json<T: Serialize>(value: &T) -> warden_core::Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(data: &str) -> warden_core::Result<T> {
    Ok(serde_json::from_str(data)?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<String>) -> warden_core::Result<Vec<T>> {
    rows.iter().map(|d| from_json(d)).collect()
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> warden_core::Result<Self> {
        info!(?path, "opening run store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && path != Path::new(":memory:") {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(storage)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> warden_core::Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Outbox events of a tenant, oldest first, optionally for one topic.
    pub fn outbox_events(
        &self,
        company_id: CompanyId,
        topic: Option<&str>,
        limit: usize,
    ) -> warden_core::Result<Vec<OutboxEvent>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id, topic, key, payload, created_at FROM outbox_events
                 WHERE company_id = ?1 AND (?2 IS NULL OR topic = ?2)
                 ORDER BY seq
                 LIMIT ?3",
            )
            .map_err(storage)?;

        let rows = stmt
            .query_map(params![company_id.to_string(), topic, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;

        rows.into_iter()
            .map(|(id, topic, key, payload, created_at)| {
                Ok(OutboxEvent {
                    id: id
                        .parse()
                        .map_err(|e| WardenError::Storage(format!("bad event id '{id}': {e}")))?,
                    company_id,
                    topic,
                    key,
                    payload: from_json(&payload)?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    fn write_run(conn: &Connection, run: &Run) -> warden_core::Result<()> {
        conn.execute(
            "UPDATE runs SET status = ?2, started_at = ?3, data = ?4 WHERE id = ?1",
            params![
                run.id.to_string(),
                run.status.as_str(),
                run.started_at.as_ref().map(ts),
                to_json(run)?,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn load_run(conn: &Connection, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Option<Run>> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM runs WHERE id = ?1 AND company_id = ?2",
                params![run_id.to_string(), company_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn count_running_in(conn: &Connection, company_id: CompanyId) -> warden_core::Result<u32> {
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE company_id = ?1 AND status = 'running'",
                params![company_id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage)?;
        Ok(n as u32)
    }
}

impl GuardPolicyStore for SqliteStore {
    fn get_policy(&self, company_id: CompanyId, scope: &GuardScope) -> warden_core::Result<Option<GuardPolicy>> {
        let db = self.db.lock();
        let row: Option<(String, String)> = db
            .query_row(
                "SELECT guards, updated_at FROM guard_policies WHERE company_id = ?1 AND scope = ?2",
                params![company_id.to_string(), scope.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage)?;

        let Some((guards, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(GuardPolicy {
            company_id,
            scope: scope.clone(),
            guards: from_json(&guards)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    fn put_policy(&self, policy: &GuardPolicy) -> warden_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO guard_policies (company_id, scope, guards, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(company_id, scope) DO UPDATE SET
                guards = excluded.guards,
                updated_at = excluded.updated_at",
            params![
                policy.company_id.to_string(),
                policy.scope.to_string(),
                to_json(&policy.guards)?,
                ts(&policy.updated_at),
            ],
        )
        .map_err(storage)?;
        debug!(company_id = %policy.company_id, scope = %policy.scope, "guard policy stored");
        Ok(())
    }
}

impl PlaybookStore for SqliteStore {
    fn playbook_by_code(&self, company_id: CompanyId, code: &str) -> warden_core::Result<Option<Playbook>> {
        let db = self.db.lock();
        let data: Option<String> = db
            .query_row(
                "SELECT data FROM playbooks WHERE company_id = ?1 AND code = ?2",
                params![company_id.to_string(), code],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn insert_playbook(&self, playbook: &Playbook) -> warden_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO playbooks (id, company_id, code, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                playbook.id.to_string(),
                playbook.company_id.to_string(),
                playbook.code,
                to_json(playbook)?,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn playbook_version(
        &self,
        playbook_id: PlaybookId,
        version: Option<u32>,
    ) -> warden_core::Result<Option<PlaybookVersion>> {
        let db = self.db.lock();
        let data: Option<String> = match version {
            Some(n) => db.query_row(
                "SELECT data FROM playbook_versions WHERE playbook_id = ?1 AND version = ?2",
                params![playbook_id.to_string(), n],
                |row| row.get::<_, String>(0),
            ),
            None => db.query_row(
                "SELECT data FROM playbook_versions WHERE playbook_id = ?1 ORDER BY version DESC LIMIT 1",
                params![playbook_id.to_string()],
                |row| row.get::<_, String>(0),
            ),
        }
        .optional()
        .map_err(storage)?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn version_by_id(&self, id: PlaybookVersionId) -> warden_core::Result<Option<PlaybookVersion>> {
        let db = self.db.lock();
        let data: Option<String> = db
            .query_row(
                "SELECT data FROM playbook_versions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn insert_version(&self, version: &PlaybookVersion) -> warden_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO playbook_versions (id, playbook_id, version, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                version.id.to_string(),
                version.playbook_id.to_string(),
                version.version,
                to_json(version)?,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run: &Run, steps: &[RunStep], dedupe: bool) -> warden_core::Result<CreateRun> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        if dedupe {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT data FROM runs
                     WHERE company_id = ?1 AND dedupe_key = ?2
                       AND status IN ('queued', 'approved', 'running')
                     ORDER BY created_at
                     LIMIT 1",
                    params![run.company_id.to_string(), run.dedupe_key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            if let Some(existing) = existing {
                return Ok(CreateRun::Duplicate(Box::new(from_json(&existing)?)));
            }
        }

        tx.execute(
            "INSERT INTO runs (id, company_id, playbook_id, playbook_code, trigger, status,
                               dry_run, dedupe_key, created_at, started_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id.to_string(),
                run.company_id.to_string(),
                run.playbook_id.to_string(),
                run.playbook_code,
                run.trigger.as_str(),
                run.status.as_str(),
                run.dry_run,
                run.dedupe_key,
                ts(&run.created_at),
                run.started_at.as_ref().map(ts),
                to_json(run)?,
            ],
        )
        .map_err(storage)?;

        for step in steps {
            tx.execute(
                "INSERT INTO run_steps (id, run_id, ordinal, data) VALUES (?1, ?2, ?3, ?4)",
                params![step.id.to_string(), run.id.to_string(), step.ordinal, to_json(step)?],
            )
            .map_err(storage)?;
        }

        tx.commit().map_err(storage)?;
        Ok(CreateRun::Created)
    }

    fn get_run(&self, company_id: CompanyId, run_id: RunId) -> warden_core::Result<Option<Run>> {
        let db = self.db.lock();
        Self::load_run(&db, company_id, run_id)
    }

    fn transition_run(&self, run: &Run, expected: &[RunStatus]) -> warden_core::Result<bool> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE id = ?1 AND company_id = ?2",
                params![run.id.to_string(), run.company_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        let Some(current) = current else {
            return Err(WardenError::not_found("run", run.id));
        };
        if !expected.iter().any(|s| s.as_str() == current) {
            return Ok(false);
        }

        Self::write_run(&tx, run)?;
        tx.commit().map_err(storage)?;
        Ok(true)
    }

    fn claim_run_slot(
        &self,
        company_id: CompanyId,
        run_id: RunId,
        max_concurrent: u32,
        started_at: DateTime<Utc>,
    ) -> warden_core::Result<SlotClaim> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        let Some(mut run) = Self::load_run(&tx, company_id, run_id)? else {
            return Err(WardenError::not_found("run", run_id));
        };
        if run.status != RunStatus::Approved {
            return Ok(SlotClaim::NotClaimable { status: run.status });
        }
        let running = Self::count_running_in(&tx, company_id)?;
        if running >= max_concurrent {
            return Ok(SlotClaim::AtCapacity { running });
        }

        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        run.updated_at = started_at;
        Self::write_run(&tx, &run)?;
        tx.commit().map_err(storage)?;
        Ok(SlotClaim::Claimed)
    }

    fn count_running(&self, company_id: CompanyId) -> warden_core::Result<u32> {
        let db = self.db.lock();
        Self::count_running_in(&db, company_id)
    }

    fn last_started_at(
        &self,
        company_id: CompanyId,
        playbook_id: PlaybookId,
    ) -> warden_core::Result<Option<DateTime<Utc>>> {
        let db = self.db.lock();
        let latest: Option<String> = db
            .query_row(
                "SELECT MAX(started_at) FROM runs
                 WHERE company_id = ?1 AND playbook_id = ?2 AND dry_run = 0",
                params![company_id.to_string(), playbook_id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage)?;
        latest.as_deref().map(parse_ts).transpose()
    }

    fn list_runs(
        &self,
        company_id: CompanyId,
        filter: &RunFilter,
        page: Pagination,
    ) -> warden_core::Result<Vec<Run>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT data FROM runs
                 WHERE company_id = ?1
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR playbook_code = ?3)
                   AND (?4 IS NULL OR trigger = ?4)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?5 OFFSET ?6",
            )
            .map_err(storage)?;

        let rows = stmt
            .query_map(
                params![
                    company_id.to_string(),
                    filter.status.map(RunStatus::as_str),
                    filter.playbook_code,
                    filter.trigger.map(|t| t.as_str()),
                    page.limit as i64,
                    page.offset as i64,
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        decode_all(rows)
    }

    fn run_steps(&self, run_id: RunId) -> warden_core::Result<Vec<RunStep>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT data FROM run_steps WHERE run_id = ?1 ORDER BY ordinal")
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        decode_all(rows)
    }

    fn update_step(&self, step: &RunStep) -> warden_core::Result<()> {
        let db = self.db.lock();
        let changed = db
            .execute(
                "UPDATE run_steps SET data = ?2 WHERE id = ?1",
                params![step.id.to_string(), to_json(step)?],
            )
            .map_err(storage)?;
        if changed == 0 {
            return Err(WardenError::not_found("run step", step.id));
        }
        Ok(())
    }

    fn insert_rollback_step(&self, step: &RollbackStep) -> warden_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO rollback_steps (id, run_id, data) VALUES (?1, ?2, ?3)",
            params![step.id.to_string(), step.run_id.to_string(), to_json(step)?],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn update_rollback_step(&self, step: &RollbackStep) -> warden_core::Result<()> {
        let db = self.db.lock();
        let changed = db
            .execute(
                "UPDATE rollback_steps SET data = ?2 WHERE id = ?1",
                params![step.id.to_string(), to_json(step)?],
            )
            .map_err(storage)?;
        if changed == 0 {
            return Err(WardenError::not_found("rollback step", step.id));
        }
        Ok(())
    }

    fn rollback_steps(&self, run_id: RunId) -> warden_core::Result<Vec<RollbackStep>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT data FROM rollback_steps WHERE run_id = ?1 ORDER BY seq")
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        decode_all(rows)
    }
}

impl EventSink for SqliteStore {
    fn emit(&self, event: OutboxEvent) -> warden_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO outbox_events (id, company_id, topic, key, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.company_id.to_string(),
                event.topic,
                event.key,
                to_json(&event.payload)?,
                ts(&event.created_at),
            ],
        )
        .map_err(storage)?;
        debug!(topic = %event.topic, key = %event.key, "outbox event stored");
        Ok(())
    }
}

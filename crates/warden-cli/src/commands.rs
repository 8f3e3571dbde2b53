use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use warden_autonomy::{ActionRegistry, RunService, StaticMetrics, Stores, publish_version};
use warden_config::{ConfigLoader, LoggingConfig, WardenConfig};
use warden_core::{
    ApprovalDecision, CompanyId, GuardOverrides, GuardPolicy, GuardPolicyStore, GuardScope,
    Pagination, Run, RunFilter, RunStatus, StepTemplate, WardenError,
};
use warden_store::SqliteStore;

/// 🛡️ Warden, guarded autonomy for back-office playbooks
#[derive(Parser)]
#[command(name = "warden", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to warden.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Tenant to act on
    #[arg(long, global = true, env = "WARDEN_COMPANY")]
    company: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration and report warnings
    Doctor,
    /// Publish a playbook version from a TOML or JSON file
    Publish {
        /// Playbook definition file
        file: PathBuf,
    },
    /// Inspect or change guard policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// List runs, newest first
    Runs {
        /// Only runs in this status
        #[arg(short, long, value_parser = parse_status)]
        status: Option<RunStatus>,
        /// Only runs of this playbook code
        #[arg(short, long)]
        playbook: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one run with its steps and rollback steps
    Show {
        run_id: Uuid,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Approve a queued run
    Approve {
        run_id: Uuid,
        /// Approving user
        #[arg(long = "as")]
        actor: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject a queued run
    Reject {
        run_id: Uuid,
        /// Rejecting user
        #[arg(long = "as")]
        actor: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Cancel a run that has not finished
    Cancel {
        run_id: Uuid,
        /// Cancelling user
        #[arg(long = "as")]
        actor: Uuid,
        #[arg(short, long)]
        reason: String,
    },
    /// Print outbox events, oldest first
    Outbox {
        /// Only events with this topic, e.g. ops.run.completed
        #[arg(short, long)]
        topic: Option<String>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the stored override and the policy it resolves to
    Get {
        /// Playbook code; the tenant-wide policy when omitted
        #[arg(short, long)]
        playbook: Option<String>,
    },
    /// Replace the stored override with a JSON document
    Set {
        /// Playbook code; the tenant-wide policy when omitted
        #[arg(short, long)]
        playbook: Option<String>,
        /// e.g. '{"max_concurrent": 2, "blast_radius": {"maxEntities": 50}}'
        guards: String,
    },
}

fn parse_status(s: &str) -> std::result::Result<RunStatus, String> {
    RunStatus::parse(s).ok_or_else(|| {
        let valid: Vec<&str> = RunStatus::ALL.iter().map(|st| st.as_str()).collect();
        format!("unknown status `{s}`, expected one of: {}", valid.join(", "))
    })
}

fn guard_scope(playbook: Option<String>) -> GuardScope {
    playbook.map_or(GuardScope::Global, GuardScope::Playbook)
}

/// A playbook definition as written by operators.
#[derive(Debug, Deserialize)]
pub struct PlaybookFile {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guards: GuardOverrides,
    pub steps: Vec<StepTemplate>,
}

impl PlaybookFile {
    /// Parse a `.json` file as JSON and anything else as TOML.
    pub fn load(path: &Path) -> warden_core::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|e| e == "json") {
            Ok(serde_json::from_str(&raw)?)
        } else {
            toml::from_str(&raw)
                .map_err(|e| WardenError::Config(format!("{}: {e}", path.display())))
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
fn init_logging(logging: &LoggingConfig, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

impl Cli {
    pub async fn run(self) -> warden_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(config.logging.level.as_str())
        };
        init_logging(&config.logging, log_level);

        let company = self.company;
        match self.command {
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Doctor => Self::cmd_doctor(&config, config_loader.path()),
            Commands::Publish { file } => Self::cmd_publish(&config, require(company)?, &file),
            Commands::Policy { action } => Self::cmd_policy(&config, require(company)?, action),
            Commands::Runs {
                status,
                playbook,
                limit,
                offset,
                json,
            } => {
                let filter = RunFilter {
                    status,
                    playbook_code: playbook,
                    trigger: None,
                };
                Self::cmd_runs(&config, require(company)?, &filter, Pagination { limit, offset }, json)
            }
            Commands::Show { run_id, json } => Self::cmd_show(&config, require(company)?, run_id, json),
            Commands::Approve { run_id, actor, note } => {
                Self::cmd_decide(&config, require(company)?, run_id, actor, ApprovalDecision::Approve, note)
            }
            Commands::Reject { run_id, actor, note } => {
                Self::cmd_decide(&config, require(company)?, run_id, actor, ApprovalDecision::Reject, note)
            }
            Commands::Cancel {
                run_id,
                actor,
                reason,
            } => Self::cmd_cancel(&config, require(company)?, run_id, actor, &reason),
            Commands::Outbox { topic, limit, json } => {
                Self::cmd_outbox(&config, require(company)?, topic.as_deref(), limit, json)
            }
        }
    }

    fn cmd_config(config: &WardenConfig, json: bool) -> warden_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| WardenError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_doctor(config: &WardenConfig, path: &Path) -> warden_core::Result<()> {
        println!("🩺 Checking {}", path.display());
        let warnings = config.validate().map_err(WardenError::Config)?;
        if warnings.is_empty() {
            println!("✅ No issues found");
        }
        for w in &warnings {
            println!("{w}");
        }
        Ok(())
    }

    fn cmd_publish(config: &WardenConfig, company: CompanyId, file: &Path) -> warden_core::Result<()> {
        let def = PlaybookFile::load(file)?;
        let store = open_store(config)?;
        let name = def.name.clone().unwrap_or_else(|| def.code.clone());
        let version = publish_version(store.as_ref(), company, &def.code, &name, def.steps, def.guards)?;
        println!(
            "✅ {} v{} ({} step(s), hash {})",
            def.code,
            version.version,
            version.steps.len(),
            &version.content_hash[..12.min(version.content_hash.len())]
        );
        Ok(())
    }

    fn cmd_policy(config: &WardenConfig, company: CompanyId, action: PolicyAction) -> warden_core::Result<()> {
        let store = open_store(config)?;
        match action {
            PolicyAction::Get { playbook } => {
                let scope = guard_scope(playbook);
                match store.get_policy(company, &scope)? {
                    Some(stored) => {
                        println!("Stored override for {scope} (updated {}):", stored.updated_at);
                        println!("{}", serde_json::to_string_pretty(&stored.guards)?);
                    }
                    None => println!("No stored override for {scope}."),
                }
                let effective = service(config, store).resolve_policy(company, &scope);
                println!("Effective policy:");
                println!("{}", serde_json::to_string_pretty(&effective)?);
            }
            PolicyAction::Set { playbook, guards } => {
                let scope = guard_scope(playbook);
                let guards: GuardOverrides = serde_json::from_str(&guards)?;
                store.put_policy(&GuardPolicy {
                    company_id: company,
                    scope: scope.clone(),
                    guards,
                    updated_at: Utc::now(),
                })?;
                println!("✅ Stored policy for {scope}");
            }
        }
        Ok(())
    }

    fn cmd_runs(
        config: &WardenConfig,
        company: CompanyId,
        filter: &RunFilter,
        page: Pagination,
        json: bool,
    ) -> warden_core::Result<()> {
        let svc = service(config, open_store(config)?);
        let runs = svc.list_runs(company, filter, page)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&runs)?);
            return Ok(());
        }
        if runs.is_empty() {
            println!("No runs.");
        }
        for run in &runs {
            print_run_line(run);
        }
        Ok(())
    }

    fn cmd_show(config: &WardenConfig, company: CompanyId, run_id: Uuid, json: bool) -> warden_core::Result<()> {
        let svc = service(config, open_store(config)?);
        let run = svc.get_run(company, run_id)?;
        let steps = svc.run_steps(company, run_id)?;
        let rollbacks = svc.rollback_steps(company, run_id)?;

        if json {
            let doc = serde_json::json!({ "run": run, "steps": steps, "rollback_steps": rollbacks });
            println!("{}", serde_json::to_string_pretty(&doc)?);
            return Ok(());
        }

        print_run_line(&run);
        println!("   Requested by: {}", run.approval.requested_by);
        if let Some(reason) = &run.approval.reason {
            println!("   Approval:     {reason}");
        }
        if let Some(by) = run.approval.approved_by {
            println!("   Decided by:   {by}");
        }
        if let Some(c) = &run.cancellation {
            println!("   Cancelled by: {} ({})", c.actor, c.reason);
        }
        if let Some(err) = &run.metrics.error {
            println!("   Error:        {err}");
        }
        println!(
            "   Steps:        {}/{} passed, p50 {}ms, p95 {}ms",
            run.metrics.steps_passed, run.metrics.steps_total, run.metrics.p50_step_ms, run.metrics.p95_step_ms
        );
        println!();
        for step in &steps {
            let undone = if step.rolled_back { " (rolled back)" } else { "" };
            println!("  #{} {:<9} {}{undone}", step.ordinal, step.status.as_str(), step.action_code);
            if let Some(err) = &step.error {
                println!("       {err}");
            }
        }
        if !rollbacks.is_empty() {
            println!();
            println!("  Rollback:");
            for rb in &rollbacks {
                println!("    {:<9} {}", rb.status.as_str(), rb.action_code);
            }
        }
        Ok(())
    }

    fn cmd_decide(
        config: &WardenConfig,
        company: CompanyId,
        run_id: Uuid,
        actor: Uuid,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> warden_core::Result<()> {
        let svc = service(config, open_store(config)?);
        let run = svc.approve_run(company, run_id, actor, decision, note)?;
        println!("✅ Run {} is now {}", run.id, run.status);
        Ok(())
    }

    fn cmd_cancel(
        config: &WardenConfig,
        company: CompanyId,
        run_id: Uuid,
        actor: Uuid,
        reason: &str,
    ) -> warden_core::Result<()> {
        let svc = service(config, open_store(config)?);
        let run = svc.cancel_run(company, run_id, actor, reason)?;
        println!("✅ Run {} cancelled", run.id);
        Ok(())
    }

    fn cmd_outbox(
        config: &WardenConfig,
        company: CompanyId,
        topic: Option<&str>,
        limit: usize,
        json: bool,
    ) -> warden_core::Result<()> {
        let store = open_store(config)?;
        for event in store.outbox_events(company, topic, limit)? {
            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!("{}  {:<28} {}", event.created_at.format("%Y-%m-%d %H:%M:%S"), event.topic, event.payload);
            }
        }
        Ok(())
    }
}

fn require(company: Option<CompanyId>) -> warden_core::Result<CompanyId> {
    company.ok_or_else(|| WardenError::Config("no tenant given, pass --company or set WARDEN_COMPANY".into()))
}

fn open_store(config: &WardenConfig) -> warden_core::Result<Arc<SqliteStore>> {
    debug!(path = %config.storage.path.display(), "opening database");
    Ok(Arc::new(SqliteStore::open(&config.storage.path)?))
}

/// A service over the database with no action handlers: enough for every
/// read, approval and cancellation.
fn service(config: &WardenConfig, store: Arc<SqliteStore>) -> RunService {
    RunService::new(
        config,
        Stores::shared(store.clone()),
        ActionRegistry::new(),
        Arc::new(StaticMetrics::new()),
        store,
    )
}

fn print_run_line(run: &Run) {
    let mut flags = Vec::new();
    if run.dry_run {
        flags.push("dry-run");
    }
    if run.canary {
        flags.push("canary");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };
    println!(
        "{}  {:<11} {:<24} {:>5} entities  {}{flags}",
        run.id,
        run.status.as_str(),
        run.playbook_code,
        run.blast_radius.entity_count,
        run.created_at.format("%Y-%m-%d %H:%M"),
    );
}

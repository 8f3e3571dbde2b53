use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use warden_core::{BlastRadiusLimits, EffectivePolicy, RollbackPolicy};

/// Root configuration, mapped to `warden.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub guard: GuardConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

// ── Guard ──────────────────────────────────────────────────────

/// Fallback global policy, used when a tenant has no stored global policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Maximum runs a tenant may have in `running` at once.
    pub max_concurrent: u32,
    /// Maximum entities a single run may touch.
    pub max_entities: Option<u64>,
    /// Maximum share (0-100) of the tenant's population a single run may touch.
    pub max_percent: Option<f64>,
    /// Require approver != requester.
    pub requires_dual_control: bool,
    /// Wall-clock budget for the forward steps of a run.
    pub timeout_sec: u64,
    /// Minimum gap between two runs of the same playbook.
    pub cooldown_sec: u64,
    pub rollback_policy: RollbackPolicy,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let p = EffectivePolicy::default();
        Self {
            max_concurrent: p.max_concurrent,
            max_entities: p.blast_radius.max_entities,
            max_percent: p.blast_radius.max_percent,
            requires_dual_control: p.requires_dual_control,
            timeout_sec: p.timeout_sec,
            cooldown_sec: p.cooldown_sec,
            rollback_policy: p.rollback_policy,
        }
    }
}

impl GuardConfig {
    pub fn to_policy(&self) -> EffectivePolicy {
        EffectivePolicy {
            max_concurrent: self.max_concurrent.max(1),
            blast_radius: BlastRadiusLimits {
                max_entities: self.max_entities,
                max_percent: self.max_percent,
            },
            requires_dual_control: self.requires_dual_control,
            canary: None,
            rollback_policy: self.rollback_policy,
            timeout_sec: self.timeout_sec,
            cooldown_sec: self.cooldown_sec,
        }
    }
}

// ── Runtime ────────────────────────────────────────────────────

/// What to do when a run is requested while an identical one is still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateRunPolicy {
    /// Fail with `DuplicateRun`.
    #[default]
    Reject,
    /// Hand back the in-flight run instead of creating a new one.
    ReuseExisting,
    /// Create the run anyway.
    Allow,
}

impl std::str::FromStr for DuplicateRunPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "reuse_existing" | "reuse" => Ok(Self::ReuseExisting),
            "allow" => Ok(Self::Allow),
            other => Err(format!("unknown duplicate run policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub duplicate_runs: DuplicateRunPolicy,
    /// Approve immediately (as the system actor) when no approval is required.
    pub auto_approve_when_not_required: bool,
    /// Deadline for each inverse action during rollback.
    pub rollback_step_timeout_sec: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            duplicate_runs: DuplicateRunPolicy::Reject,
            auto_approve_when_not_required: true,
            rollback_step_timeout_sec: 300,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".warden")
                .join("warden.db"),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty`, `compact`, or `json` for log shippers.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Concurrency ───
        if self.guard.max_concurrent == 0 {
            warnings.push(ConfigWarning {
                field: "guard.max_concurrent".into(),
                message: "max_concurrent is 0, no run could ever start".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to at least 1".into()),
            });
        }

        // ── Blast radius ───
        if let Some(pct) = self.guard.max_percent {
            if !(pct > 0.0 && pct <= 100.0) {
                warnings.push(ConfigWarning {
                    field: "guard.max_percent".into(),
                    message: format!("max_percent {} is out of range", pct),
                    severity: WarningSeverity::Error,
                    hint: Some("Must be in (0, 100]".into()),
                });
            }
        }
        if self.guard.max_entities.is_none() && self.guard.max_percent.is_none() {
            warnings.push(ConfigWarning {
                field: "guard".into(),
                message: "no blast radius limit: runs may touch every entity".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set max_entities or max_percent".into()),
            });
        }

        // ── Timeouts ───
        if self.guard.timeout_sec == 0 {
            warnings.push(ConfigWarning {
                field: "guard.timeout_sec".into(),
                message: "timeout_sec is 0, every step would time out immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 900".into()),
            });
        }
        if self.runtime.rollback_step_timeout_sec == 0 {
            warnings.push(ConfigWarning {
                field: "runtime.rollback_step_timeout_sec".into(),
                message: "rollback steps would time out immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 300".into()),
            });
        }

        // ── Dual control ───
        if !self.guard.requires_dual_control && self.runtime.auto_approve_when_not_required {
            warnings.push(ConfigWarning {
                field: "guard.requires_dual_control".into(),
                message: "read-only runs will be approved without a human".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}

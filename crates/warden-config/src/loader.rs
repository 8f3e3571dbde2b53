use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use warden_core::WardenError;

use crate::schema::WardenConfig;

const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// Owns the live `warden.toml` and can swap it in place with [`ConfigLoader::reload`].
pub struct ConfigLoader {
    config: RwLock<WardenConfig>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// `--config` beats `$WARDEN_CONFIG`, which beats `~/.warden/warden.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV).map(PathBuf::from).unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_default()
                    .join(".warden")
                    .join("warden.toml")
            }),
        }
    }

    /// Load from the resolved path. A missing file yields the defaults; a file
    /// that fails validation is an error.
    pub fn load(path: Option<&Path>) -> warden_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.is_file() {
            info!(path = %config_path.display(), "reading warden.toml");
            Self::read_checked(&config_path)?
        } else {
            warn!(path = %config_path.display(), "no warden.toml, running on defaults");
            Self::checked(WardenConfig::default())?
        };

        Ok(Self {
            config: RwLock::new(config),
            config_path,
        })
    }

    /// Wrap an already-built config (embedding hosts and tests).
    pub fn from_config(config: WardenConfig) -> Self {
        Self {
            config: RwLock::new(config),
            config_path: PathBuf::new(),
        }
    }

    pub fn get(&self) -> WardenConfig {
        self.config.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// `WARDEN_LOG_LEVEL`, `WARDEN_DB_PATH`, `WARDEN_DUPLICATE_RUNS` and
    /// `WARDEN_MAX_CONCURRENT` win over the file. Unparseable values are skipped.
    pub fn apply_env_overrides(mut config: WardenConfig) -> WardenConfig {
        let var = |name: &str| std::env::var(name).ok();

        if let Some(level) = var("WARDEN_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(path) = var("WARDEN_DB_PATH") {
            config.storage.path = PathBuf::from(path);
        }
        if let Some(raw) = var("WARDEN_DUPLICATE_RUNS") {
            match raw.parse() {
                Ok(policy) => config.runtime.duplicate_runs = policy,
                Err(e) => warn!(error = %e, "ignoring WARDEN_DUPLICATE_RUNS"),
            }
        }
        if let Some(raw) = var("WARDEN_MAX_CONCURRENT") {
            match raw.parse::<u32>() {
                Ok(n) => config.guard.max_concurrent = n,
                Err(_) => warn!(value = %raw, "ignoring WARDEN_MAX_CONCURRENT"),
            }
        }
        config
    }

    /// Re-read the file and replace the live config. The old config stays in
    /// place when the new one does not parse or validate.
    pub fn reload(&self) -> warden_core::Result<()> {
        if !self.config_path.is_file() {
            return Err(WardenError::Config(format!(
                "{} does not exist",
                self.config_path.display()
            )));
        }
        let fresh = Self::read_checked(&self.config_path)?;
        *self.config.write() = fresh;
        info!(path = %self.config_path.display(), "warden.toml reloaded");
        Ok(())
    }

    fn read_checked(path: &Path) -> warden_core::Result<WardenConfig> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: WardenConfig = toml::from_str(&raw)
            .map_err(|e| WardenError::Config(format!("failed to parse {}: {e}", path.display())))?;
        Self::checked(parsed)
    }

    fn checked(config: WardenConfig) -> warden_core::Result<WardenConfig> {
        let config = Self::apply_env_overrides(config);
        for warning in config.validate().map_err(WardenError::Config)? {
            warn!("{warning}");
        }
        Ok(config)
    }
}

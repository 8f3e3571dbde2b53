#[cfg(test)]
mod tests {
    use std::io::Write;
    use warden_config::ConfigLoader;
    use warden_config::schema::*;
    use warden_core::RollbackPolicy;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_guard_config_defaults_match_builtin_policy() {
        let config = GuardConfig::default();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_entities, Some(100));
        assert_eq!(config.max_percent, Some(10.0));
        assert!(!config.requires_dual_control);
        assert_eq!(config.timeout_sec, 900);
        assert_eq!(config.cooldown_sec, 3600);
        assert_eq!(config.rollback_policy, RollbackPolicy::Automatic);
    }

    #[test]
    fn test_runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.duplicate_runs, DuplicateRunPolicy::Reject);
        assert!(config.auto_approve_when_not_required);
        assert_eq!(config.rollback_step_timeout_sec, 300);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_storage_default_under_home() {
        let config = StorageConfig::default();
        assert!(config.path.ends_with(".warden/warden.db"));
    }

    #[test]
    fn test_guard_config_to_policy() {
        let guard = GuardConfig {
            max_concurrent: 0,
            requires_dual_control: true,
            ..Default::default()
        };
        let policy = guard.to_policy();
        assert_eq!(policy.max_concurrent, 1);
        assert!(policy.requires_dual_control);
        assert!(policy.canary.is_none());
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = WardenConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: WardenConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.guard.max_concurrent, config.guard.max_concurrent);
        assert_eq!(restored.runtime.duplicate_runs, config.runtime.duplicate_runs);
        assert_eq!(restored.storage.path, config.storage.path);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[guard]
max_concurrent = 3
requires_dual_control = true
rollback_policy = "manual"

[runtime]
duplicate_runs = "reuse_existing"
"#;
        let config: WardenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.guard.max_concurrent, 3);
        assert!(config.guard.requires_dual_control);
        assert_eq!(config.guard.rollback_policy, RollbackPolicy::Manual);
        assert_eq!(config.runtime.duplicate_runs, DuplicateRunPolicy::ReuseExisting);
        // Defaults should fill in
        assert_eq!(config.guard.timeout_sec, 900);
        assert!(config.runtime.auto_approve_when_not_required);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_duplicate_policy_from_str() {
        assert_eq!("reject".parse::<DuplicateRunPolicy>().unwrap(), DuplicateRunPolicy::Reject);
        assert_eq!("reuse".parse::<DuplicateRunPolicy>().unwrap(), DuplicateRunPolicy::ReuseExisting);
        assert_eq!("allow".parse::<DuplicateRunPolicy>().unwrap(), DuplicateRunPolicy::Allow);
        assert!("dedupe".parse::<DuplicateRunPolicy>().is_err());
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_default_config_is_valid() {
        let warnings = WardenConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    #[test]
    fn test_zero_concurrency_is_error() {
        let mut config = WardenConfig::default();
        config.guard.max_concurrent = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("guard.max_concurrent"));
    }

    #[test]
    fn test_max_percent_out_of_range_is_error() {
        let mut config = WardenConfig::default();
        config.guard.max_percent = Some(150.0);
        assert!(config.validate().is_err());
        config.guard.max_percent = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_blast_radius_warns() {
        let mut config = WardenConfig::default();
        config.guard.max_entities = None;
        config.guard.max_percent = None;
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "guard" && w.severity == WarningSeverity::Warning));
    }

    #[test]
    fn test_unknown_log_format_warns() {
        let mut config = WardenConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        let w = warnings.iter().find(|w| w.field == "logging.format").unwrap();
        assert!(w.to_string().contains("xml"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        write!(
            file,
            r#"
[guard]
max_concurrent = 4
cooldown_sec = 60

[logging]
format = "json"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.guard.max_concurrent, 4);
        assert_eq!(config.guard.cooldown_sec, 60);
        assert_eq!(config.logging.format, "json");
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.toml");
        std::fs::write(&config_path, "[guard]\ntimeout_sec = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.toml");
        std::fs::write(&config_path, "[guard\nmax_concurrent = ").unwrap();
        let err = ConfigLoader::load(Some(config_path.as_path())).err().unwrap();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.toml");
        std::fs::write(&config_path, "[guard]\ncooldown_sec = 10\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().guard.cooldown_sec, 10);

        std::fs::write(&config_path, "[guard]\ncooldown_sec = 20\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().guard.cooldown_sec, 20);
    }

    #[test]
    fn test_reload_keeps_config_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.toml");
        std::fs::write(&config_path, "[guard]\ncooldown_sec = 10\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[guard]\nmax_concurrent = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().guard.cooldown_sec, 10);
    }

    #[test]
    fn test_from_config_snapshot() {
        let mut config = WardenConfig::default();
        config.runtime.duplicate_runs = DuplicateRunPolicy::Allow;
        let loader = ConfigLoader::from_config(config);
        assert_eq!(loader.get().runtime.duplicate_runs, DuplicateRunPolicy::Allow);
        assert_eq!(loader.get().guard.max_concurrent, 1);
    }
}

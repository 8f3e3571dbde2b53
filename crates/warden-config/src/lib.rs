//! # warden-config
//!
//! Configuration system for the Warden runtime. Reads from `warden.toml`,
//! environment variables and CLI overrides, in increasing precedence.
//!
//! [`ConfigLoader::reload`] re-reads the file in place.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::WardenConfig;
pub use schema::{
    ConfigWarning, DuplicateRunPolicy, GuardConfig, LoggingConfig, RuntimeConfig, StorageConfig,
    WarningSeverity,
};

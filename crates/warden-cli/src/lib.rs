//! # warden-cli
//!
//! Command-line interface for operating Warden against its SQLite store.
//!
//! ## Commands
//!
//! - `warden config` / `warden doctor`: show and validate configuration
//! - `warden publish <file>`: publish a playbook version
//! - `warden policy get|set`: inspect or store guard policies
//! - `warden runs` / `warden show <run>`: list and inspect runs
//! - `warden approve|reject|cancel <run>`: approval decisions and cancellation
//! - `warden outbox`: print emitted events

pub mod commands;

pub use commands::{Cli, PlaybookFile};

//! # warden-store
//!
//! SQLite-backed persistence for the Warden runtime. [`SqliteStore`] implements
//! every storage seam from `warden-core` plus a durable outbox.

pub mod store;

pub use store::SqliteStore;

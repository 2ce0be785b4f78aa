//! Estate Storage crate - SQLite persistence for inventory snapshots.
//!
//! Provides a WAL-mode SQLite database with migrations and a repository
//! that keeps a history of exported inventories.

pub mod db;
pub mod migrations;
pub mod snapshots;

pub use db::Database;
pub use snapshots::{SnapshotInfo, SnapshotRepository};

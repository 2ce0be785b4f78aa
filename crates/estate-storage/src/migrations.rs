//! Database schema migrations.
//!
//! Applies the snapshot schema and records it in `schema_migrations`.

use rusqlite::Connection;
use tracing::info;

use estate_core::error::{EstateError, Result};

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| EstateError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| EstateError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: snapshots");
    }

    Ok(())
}

/// Version 1: inventory snapshots.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- One row per exported inventory; payload is the snapshot JSON.
        CREATE TABLE IF NOT EXISTS snapshots (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            taken_at        INTEGER NOT NULL,
            format_version  INTEGER NOT NULL,
            cluster_count   INTEGER NOT NULL CHECK (cluster_count >= 0),
            listing_count   INTEGER NOT NULL CHECK (listing_count >= cluster_count),
            payload         TEXT NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_taken_at
            ON snapshots (taken_at DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'snapshots');
        ",
    )
    .map_err(|e| EstateError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let (version, rows): (i64, i64) = conn
            .query_row(
                "SELECT MAX(version), COUNT(*) FROM schema_migrations",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_snapshot_counts_checked() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO snapshots (taken_at, format_version, cluster_count, listing_count, payload)
             VALUES (1700000000, 1, 2, 3, '{}')",
            [],
        )
        .unwrap();

        let fewer_listings = conn.execute(
            "INSERT INTO snapshots (taken_at, format_version, cluster_count, listing_count, payload)
             VALUES (1700000000, 1, 3, 2, '{}')",
            [],
        );
        assert!(fewer_listings.is_err());
    }
}

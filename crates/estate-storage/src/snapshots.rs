//! SQLite-backed snapshot history.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use estate_core::error::{EstateError, Result};
use estate_index::Snapshot;

use crate::db::Database;

/// Summary row for a stored snapshot (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: i64,
    pub taken_at: DateTime<Utc>,
    pub cluster_count: usize,
    pub listing_count: usize,
}

pub struct SnapshotRepository {
    db: Arc<Database>,
}

impl SnapshotRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a snapshot and return its row ID.
    pub fn save(&self, snapshot: &Snapshot) -> Result<i64> {
        let payload = snapshot.to_json()?;
        let clusters = snapshot.clusters.len();
        let listings = snapshot.listing_count();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (taken_at, format_version, cluster_count, listing_count, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    snapshot.taken_at.timestamp_millis(),
                    snapshot.version,
                    clusters as i64,
                    listings as i64,
                    payload,
                ],
            )
            .map_err(|e| EstateError::Storage(format!("Failed to save snapshot: {}", e)))?;
            Ok(conn.last_insert_rowid())
        })?;
        info!(
            snapshot_id = id,
            clusters,
            listings,
            "Snapshot saved"
        );
        Ok(id)
    }

    /// The most recently taken snapshot.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let payload: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT payload FROM snapshots ORDER BY taken_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EstateError::Storage(e.to_string()))
        })?;
        payload.map(|p| Snapshot::from_json(&p)).transpose()
    }

    pub fn load(&self, id: i64) -> Result<Option<Snapshot>> {
        let payload: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT payload FROM snapshots WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EstateError::Storage(e.to_string()))
        })?;
        payload.map(|p| Snapshot::from_json(&p)).transpose()
    }

    /// Stored snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, taken_at, cluster_count, listing_count
                     FROM snapshots
                     ORDER BY taken_at DESC, id DESC",
                )
                .map_err(|e| EstateError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| EstateError::Storage(e.to_string()))?;

            let mut infos = Vec::new();
            for row in rows {
                let (id, taken_ms, clusters, listings) =
                    row.map_err(|e| EstateError::Storage(e.to_string()))?;
                let taken_at = Utc.timestamp_millis_opt(taken_ms).single().ok_or_else(|| {
                    EstateError::Storage(format!("snapshot {} has invalid timestamp {}", id, taken_ms))
                })?;
                infos.push(SnapshotInfo {
                    id,
                    taken_at,
                    cluster_count: clusters.max(0) as usize,
                    listing_count: listings.max(0) as usize,
                });
            }
            Ok(infos)
        })
    }

    /// Delete all but the `keep` newest snapshots. Returns the number removed.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM snapshots WHERE id NOT IN (
                    SELECT id FROM snapshots ORDER BY taken_at DESC, id DESC LIMIT ?1
                 )",
                rusqlite::params![keep as i64],
            )
            .map_err(|e| EstateError::Storage(format!("Failed to prune snapshots: {}", e)))
        })?;
        debug!(removed, keep, "Pruned snapshots");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::config::EstateConfig;
    use estate_core::types::RawListing;
    use estate_index::Inventory;

    fn repo() -> SnapshotRepository {
        SnapshotRepository::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn raw(link: &str, lat: f64) -> RawListing {
        RawListing {
            m2: 80.0,
            price: 500_000.0,
            rooms: 2.0,
            bathrooms: 1.0,
            location_point: vec![lat, -74.0],
            images: Vec::new(),
            address: "123 Main St".to_string(),
            neighbourhood: "Tribeca".to_string(),
            link: link.to_string(),
        }
    }

    fn snapshot_with(listings: usize, taken_at: DateTime<Utc>) -> Snapshot {
        let inv = Inventory::new(EstateConfig::default()).unwrap();
        for i in 0..listings {
            inv.ingest_raw(&raw(&format!("l{}", i), 40.0 + i as f64 * 0.01), at(0))
                .unwrap();
        }
        let mut snapshot = inv.export().unwrap();
        snapshot.taken_at = taken_at;
        snapshot
    }

    #[test]
    fn test_save_and_load_latest() {
        let repo = repo();
        assert!(repo.latest().unwrap().is_none());

        let older = snapshot_with(1, at(0));
        let newer = snapshot_with(3, at(100));
        repo.save(&newer).unwrap();
        let older_id = repo.save(&older).unwrap();

        assert_eq!(repo.latest().unwrap(), Some(newer));
        assert_eq!(repo.load(older_id).unwrap(), Some(older));
        assert!(repo.load(9_999).unwrap().is_none());
    }

    #[test]
    fn test_list_newest_first() {
        let repo = repo();
        repo.save(&snapshot_with(1, at(0))).unwrap();
        repo.save(&snapshot_with(2, at(50))).unwrap();

        let infos = repo.list().unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].taken_at, at(50));
        assert_eq!(infos[0].cluster_count, 2);
        assert_eq!(infos[0].listing_count, 2);
        assert_eq!(infos[1].taken_at, at(0));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let repo = repo();
        for i in 0..5 {
            repo.save(&snapshot_with(1, at(i * 10))).unwrap();
        }
        assert_eq!(repo.prune(2).unwrap(), 3);
        let infos = repo.list().unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].taken_at, at(40));
        assert_eq!(infos[1].taken_at, at(30));
        assert_eq!(repo.prune(5).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (taken_at, format_version, cluster_count, listing_count, payload)
                 VALUES (0, 1, 0, 0, 'not json')",
                [],
            )
            .map_err(|e| EstateError::Storage(e.to_string()))
        })
        .unwrap();
        let repo = SnapshotRepository::new(db);
        assert!(matches!(repo.latest(), Err(EstateError::Serialization(_))));
    }
}

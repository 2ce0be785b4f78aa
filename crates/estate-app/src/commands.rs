//! Subcommand implementations.
//!
//! Engine calls are synchronous and hold locks, so they run on tokio's
//! blocking pool; the async side only coordinates.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use estate_core::config::EstateConfig;
use estate_core::error::{EstateError, Result};
use estate_core::types::RawListing;
use estate_index::{
    Deadline, IngestKind, Inventory, InventoryStats, PageRequest, Query, QueryPage, Snapshot,
};
use estate_storage::{SnapshotInfo, SnapshotRepository};

use crate::cli::{IngestArgs, QueryArgs};

/// Per-outcome counts for one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub created: usize,
    pub merged: usize,
    pub updated: usize,
    pub relocated: usize,
    pub rejected: usize,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.created += other.created;
        self.merged += other.merged;
        self.updated += other.updated;
        self.relocated += other.relocated;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub inventory: InventoryStats,
    pub snapshots: Vec<SnapshotInfo>,
}

/// The inventory from the latest stored snapshot, or an empty one.
pub async fn load_inventory(config: &EstateConfig, repo: &Arc<SnapshotRepository>) -> Result<Inventory> {
    let repo = Arc::clone(repo);
    let config = config.clone();
    blocking(move || match repo.latest()? {
        Some(snapshot) => Inventory::restore(config, snapshot),
        None => {
            info!("No snapshot stored yet, starting with an empty inventory");
            Inventory::new(config)
        }
    })
    .await
}

/// Ingest a JSON-lines file, then persist a snapshot.
pub async fn ingest(
    inventory: Arc<Inventory>,
    repo: Arc<SnapshotRepository>,
    args: &IngestArgs,
) -> Result<IngestReport> {
    let lines = read_lines(&args.file)?;
    let workers = args.workers.max(1);
    info!(records = lines.len(), workers, file = %args.file.display(), "Ingesting listings");

    // Worker `w` takes lines w, w + workers, ... so a single worker keeps
    // file order.
    let lines = Arc::new(lines);
    let mut handles = Vec::with_capacity(workers);
    for w in 0..workers {
        let inventory = Arc::clone(&inventory);
        let lines = Arc::clone(&lines);
        handles.push(tokio::task::spawn_blocking(move || {
            let mut report = IngestReport::default();
            for (n, line) in lines.iter().enumerate().skip(w).step_by(workers) {
                ingest_line(&inventory, n + 1, line, &mut report)?;
            }
            Ok::<_, EstateError>(report)
        }));
    }

    let mut report = IngestReport::default();
    for handle in handles {
        let part = handle
            .await
            .map_err(|e| EstateError::InternalInconsistency(format!("ingest worker failed: {}", e)))??;
        report.absorb(part);
    }

    let keep = args.keep_snapshots.max(1);
    let id = blocking(move || {
        let snapshot = inventory.export()?;
        let id = repo.save(&snapshot)?;
        repo.prune(keep)?;
        Ok(id)
    })
    .await?;
    info!(
        snapshot_id = id,
        created = report.created,
        merged = report.merged,
        updated = report.updated,
        rejected = report.rejected,
        "Ingest complete"
    );
    Ok(report)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Ingest one record. Bad records are counted and skipped; a fatal error
/// stops the run.
fn ingest_line(inventory: &Inventory, line_no: usize, line: &str, report: &mut IngestReport) -> Result<()> {
    let raw: RawListing = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(line = line_no, error = %e, "Skipping malformed record");
            report.rejected += 1;
            return Ok(());
        }
    };
    match inventory.ingest_raw(&raw, Utc::now()) {
        Ok(outcome) => {
            match outcome.kind {
                IngestKind::Created => report.created += 1,
                IngestKind::Merged { .. } => report.merged += 1,
                IngestKind::Updated => report.updated += 1,
            }
            if outcome.relocated_from.is_some() {
                report.relocated += 1;
            }
            debug!(line = line_no, cluster_id = %outcome.cluster_id, "Record ingested");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!(line = line_no, error = %e, "Ingest aborted");
            Err(e)
        }
        Err(e) => {
            warn!(line = line_no, link = %raw.link, error = %e, "Rejected record");
            report.rejected += 1;
            Ok(())
        }
    }
}

pub async fn query(inventory: Arc<Inventory>, args: &QueryArgs) -> Result<QueryPage> {
    let region = args.region().map_err(EstateError::InvalidQuery)?;
    let query = Query {
        region,
        filters: args.filters(),
        sort: args.sort,
        page: PageRequest {
            limit: args.limit,
            cursor: args.cursor.clone(),
        },
    };
    let deadline = match args.timeout_ms {
        Some(ms) => Deadline::within(Duration::from_millis(ms)),
        None => Deadline::none(),
    };
    blocking(move || inventory.query(&query, deadline)).await
}

pub async fn export(inventory: Arc<Inventory>, file: &Path) -> Result<Snapshot> {
    let snapshot = blocking(move || inventory.export()).await?;
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(file, snapshot.to_json()?).await?;
    info!(
        path = %file.display(),
        clusters = snapshot.clusters.len(),
        "Snapshot exported"
    );
    Ok(snapshot)
}

/// Validate a snapshot file against `config` and store it as the latest.
pub async fn import(config: &EstateConfig, repo: Arc<SnapshotRepository>, file: &Path) -> Result<InventoryStats> {
    let json = tokio::fs::read_to_string(file).await?;
    let config = config.clone();
    blocking(move || {
        let snapshot = Snapshot::from_json(&json)?;
        let stats = Inventory::restore(config, snapshot.clone())?.stats();
        repo.save(&snapshot)?;
        Ok(stats)
    })
    .await
}

pub async fn stats(inventory: Arc<Inventory>, repo: Arc<SnapshotRepository>) -> Result<StatsReport> {
    blocking(move || {
        Ok(StatsReport {
            inventory: inventory.stats(),
            snapshots: repo.list()?,
        })
    })
    .await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EstateError::InternalInconsistency(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use estate_storage::Database;

    fn repo() -> Arc<SnapshotRepository> {
        Arc::new(SnapshotRepository::new(Arc::new(Database::in_memory().unwrap())))
    }

    fn record(link: &str, lat: f64, address: &str) -> String {
        serde_json::json!({
            "m2": 80,
            "price": 500000,
            "rooms": 2,
            "bathrooms": 1,
            "location_point": [lat, -74.006],
            "images": [],
            "address": address,
            "neighbourhood": "Tribeca",
            "link": link,
        })
        .to_string()
    }

    fn listings_file(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    fn ingest_args(path: &Path, workers: usize) -> IngestArgs {
        IngestArgs {
            file: path.to_path_buf(),
            workers,
            keep_snapshots: 3,
        }
    }

    #[tokio::test]
    async fn test_ingest_counts_and_persists() {
        let file = listings_file(&[
            record("a", 40.7128, "123 Main St"),
            record("b", 40.7129, "123 Main Street"),
            record("c", 40.75, "9 Elm Rd"),
            "{not json".to_string(),
            record("d", 95.0, "1 Nowhere"),
            record("a", 40.7128, "123 Main St"),
        ]);
        let repo = repo();
        let config = EstateConfig::default();
        let inventory = Arc::new(load_inventory(&config, &repo).await.unwrap());

        let report = ingest(Arc::clone(&inventory), Arc::clone(&repo), &ingest_args(file.path(), 1))
            .await
            .unwrap();
        assert_eq!(
            report,
            IngestReport {
                created: 2,
                merged: 1,
                updated: 1,
                relocated: 0,
                rejected: 2,
            }
        );

        let reloaded = load_inventory(&config, &repo).await.unwrap();
        assert_eq!(reloaded.stats(), inventory.stats());
        assert_eq!(reloaded.stats().clusters, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_ingest_matches_serial_counts() {
        let lines: Vec<String> = (0..200)
            .map(|i| record(&format!("src-{}", i), 40.0 + (i % 50) as f64 * 0.01, "1 Main St"))
            .collect();
        let file = listings_file(&lines);
        let inventory = Arc::new(Inventory::new(EstateConfig::default()).unwrap());

        let report = ingest(Arc::clone(&inventory), repo(), &ingest_args(file.path(), 4))
            .await
            .unwrap();
        assert_eq!(report.created, 50);
        assert_eq!(report.merged, 150);
        inventory.verify().unwrap();
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = listings_file(&[record("a", 40.0, "1 Main St"), record("b", 41.0, "2 Main St")]);
        let config = EstateConfig::default();
        let source_repo = repo();
        let inventory = Arc::new(Inventory::new(config.clone()).unwrap());
        ingest(Arc::clone(&inventory), source_repo, &ingest_args(file.path(), 1))
            .await
            .unwrap();

        let path = dir.path().join("out").join("snapshot.json");
        export(Arc::clone(&inventory), &path).await.unwrap();

        let target_repo = repo();
        let stats = import(&config, Arc::clone(&target_repo), &path).await.unwrap();
        assert_eq!(stats, inventory.stats());
        let report = super::stats(
            Arc::new(load_inventory(&config, &target_repo).await.unwrap()),
            target_repo,
        )
        .await
        .unwrap();
        assert_eq!(report.inventory.clusters, 2);
        assert_eq!(report.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_query_requires_region() {
        let inventory = Arc::new(Inventory::new(EstateConfig::default()).unwrap());
        let args = QueryArgs {
            bbox: None,
            near: None,
            radius: None,
            min_price: None,
            max_price: None,
            min_area: None,
            max_area: None,
            min_rooms: None,
            max_rooms: None,
            min_bathrooms: None,
            max_bathrooms: None,
            neighbourhood: None,
            sort: Default::default(),
            limit: None,
            cursor: None,
            timeout_ms: None,
        };
        assert!(matches!(
            query(inventory, &args).await,
            Err(EstateError::InvalidQuery(_))
        ));
    }
}

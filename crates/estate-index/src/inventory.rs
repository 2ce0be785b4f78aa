//! The inventory: normalizer, deduplicator and query engine over one shared
//! cluster store and spatial index.
//!
//! Ingestion flows through:
//! 1. Normalization of the raw record
//! 2. Deduplication against nearby clusters (merge, update or create)
//! 3. Commit to the cluster store and spatial index
//!
//! Queries run concurrently with ingestion against the same structures.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use estate_core::config::EstateConfig;
use estate_core::error::{EstateError, Result};
use estate_core::normalize::normalize;
use estate_core::types::{ClusterId, ClusterView, GeoPoint, NormalizedListing, RawListing};

use crate::dedup::{Deduplicator, IngestOutcome};
use crate::locks::CellLocks;
use crate::query::{Deadline, Query, QueryEngine, QueryPage};
use crate::snapshot::Snapshot;
use crate::spatial::SpatialIndex;
use crate::store::ClusterStore;

/// Size counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryStats {
    pub clusters: usize,
    pub listings: usize,
    pub index_entries: usize,
}

pub struct Inventory {
    config: EstateConfig,
    store: Arc<ClusterStore>,
    index: Arc<SpatialIndex>,
    cell_locks: Arc<CellLocks>,
    dedup: Deduplicator,
    engine: QueryEngine,
}

impl Inventory {
    /// An empty inventory.
    pub fn new(config: EstateConfig) -> Result<Self> {
        Self::with_store(config, ClusterStore::new())
    }

    fn with_store(config: EstateConfig, store: ClusterStore) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(store);
        let index = Arc::new(SpatialIndex::new(config.index.cell_size_deg)?);
        let cell_locks = Arc::new(CellLocks::new());
        let dedup = Deduplicator::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&cell_locks),
            config.dedup.clone(),
        )?;
        let engine = QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&cell_locks),
            config.query.clone(),
            config.dedup.drift_tolerance_m,
        )?;
        Ok(Self {
            config,
            store,
            index,
            cell_locks,
            dedup,
            engine,
        })
    }

    pub fn config(&self) -> &EstateConfig {
        &self.config
    }

    /// Normalize and ingest a raw record observed at `observed_at`.
    pub fn ingest_raw(&self, raw: &RawListing, observed_at: DateTime<Utc>) -> Result<IngestOutcome> {
        let listing = normalize(raw, observed_at, &self.config.normalize)?;
        self.ingest(listing)
    }

    pub fn ingest(&self, listing: NormalizedListing) -> Result<IngestOutcome> {
        self.dedup.ingest_detailed(listing)
    }

    pub fn query(&self, query: &Query, deadline: Deadline) -> Result<QueryPage> {
        self.engine.query(query, deadline)
    }

    pub fn cluster(&self, id: ClusterId) -> Result<Option<ClusterView>> {
        Ok(self.store.get(id)?.map(|c| c.view(None)))
    }

    /// The cluster currently holding `link`.
    pub fn cluster_for_source(&self, link: &str) -> Result<Option<ClusterView>> {
        match self.store.cluster_for_source(link)? {
            Some(id) => self.cluster(id),
            None => Ok(None),
        }
    }

    /// The `k` clusters whose index entries are closest to `point`, ordered
    /// by their representative's distance, then ID.
    pub fn nearest(&self, point: GeoPoint, k: usize) -> Result<Vec<ClusterView>> {
        let mut views = Vec::with_capacity(k);
        for (id, _) in self.index.nearest(point, k)? {
            if let Some(cluster) = self.store.get(id)? {
                let distance = point.distance_m(&cluster.representative().location());
                views.push(cluster.view(Some(distance)));
            }
        }
        views.sort_by(|a, b| {
            let da = a.distance_m.unwrap_or(f64::INFINITY);
            let db = b.distance_m.unwrap_or(f64::INFINITY);
            da.total_cmp(&db).then(a.id.cmp(&b.id))
        });
        Ok(views)
    }

    pub fn stats(&self) -> InventoryStats {
        InventoryStats {
            clusters: self.store.len(),
            listings: self.store.listing_count(),
            index_entries: self.index.len(),
        }
    }

    /// Check that the store and index agree, that every source link maps to
    /// the one cluster holding it, and that every member lies within the
    /// blocking radius of its representative. Holds off ingestion while it
    /// runs.
    pub fn verify(&self) -> Result<()> {
        let result = self.check_consistency();
        if let Err(e) = &result {
            error!(error = %e, "Inventory verification failed");
        }
        result
    }

    fn check_consistency(&self) -> Result<()> {
        let cells = self.cell_locks.everything();
        let _guards = cells.read()?;
        let radius = self.config.dedup.blocking_radius_m;
        let drift = self.config.dedup.drift_tolerance_m;
        let clusters = self.store.all()?;

        for cluster in &clusters {
            let id = cluster.id();
            let rep = cluster.representative().location();
            let entries = self.index.entries_for(id)?;
            if entries.is_empty() {
                return Err(inconsistency(format!("cluster {} is not indexed", id)));
            }
            if let Some(p) = entries.iter().find(|p| p.distance_m(&rep) > drift) {
                return Err(inconsistency(format!(
                    "cluster {} is indexed at ({}, {}), {:.1} m from its representative",
                    id,
                    p.lat,
                    p.lng,
                    p.distance_m(&rep)
                )));
            }
            for member in cluster.members() {
                if member.location().distance_m(&rep) > radius {
                    return Err(inconsistency(format!(
                        "cluster {} member {} lies outside the blocking radius",
                        id,
                        member.source_link()
                    )));
                }
                if self.store.cluster_for_source(member.source_link())? != Some(id) {
                    return Err(inconsistency(format!(
                        "source {} is not mapped to its cluster {}",
                        member.source_link(),
                        id
                    )));
                }
            }
        }

        for (id, _) in self.index.snapshot_entries()? {
            if self.store.get(id)?.is_none() {
                return Err(inconsistency(format!(
                    "cluster {} is indexed but missing from the store",
                    id
                )));
            }
        }
        let listings: usize = clusters.iter().map(|c| c.member_count()).sum();
        let assigned = self.store.source_assignments()?.len();
        if assigned != listings {
            return Err(inconsistency(format!(
                "{} source links mapped for {} clustered listings",
                assigned, listings
            )));
        }
        Ok(())
    }

    /// Capture the cluster store. Ingestion pauses for the copy, so the
    /// snapshot is a consistent cut.
    pub fn export(&self) -> Result<Snapshot> {
        let cells = self.cell_locks.everything();
        let _guards = cells.read()?;
        let clusters = self.store.all()?;
        let next_id = clusters
            .iter()
            .map(|c| c.id().0 + 1)
            .max()
            .unwrap_or(1)
            .max(self.store.peek_next_id());
        Ok(Snapshot::new(Utc::now(), next_id, clusters))
    }

    /// Rebuild an inventory from a snapshot. The snapshot must satisfy the
    /// configured blocking radius; the index is rebuilt from representatives.
    pub fn restore(config: EstateConfig, snapshot: Snapshot) -> Result<Self> {
        snapshot.validate()?;
        let radius = config.dedup.blocking_radius_m;
        for cluster in &snapshot.clusters {
            let rep = cluster.representative().location();
            if let Some(m) = cluster
                .members()
                .iter()
                .find(|m| m.location().distance_m(&rep) > radius)
            {
                return Err(EstateError::Config(format!(
                    "snapshot cluster {} member {} is {:.1} m from its representative, \
                     beyond the configured blocking radius of {} m",
                    cluster.id(),
                    m.source_link(),
                    m.location().distance_m(&rep),
                    radius
                )));
            }
        }

        let inventory = Self::with_store(config, ClusterStore::starting_at(snapshot.next_cluster_id))?;
        let cluster_count = snapshot.clusters.len();
        for cluster in snapshot.clusters {
            let id = cluster.id();
            let rep = cluster.representative().location();
            inventory.store.put(cluster)?;
            inventory.index.insert(rep, id)?;
        }
        info!(
            clusters = cluster_count,
            listings = inventory.store.listing_count(),
            taken_at = %snapshot.taken_at,
            "Inventory restored from snapshot"
        );
        Ok(inventory)
    }
}

fn inconsistency(reason: String) -> EstateError {
    EstateError::InternalInconsistency(reason)
}

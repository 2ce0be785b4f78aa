//! Listing deduplication.
//!
//! The Deduplicator folds each normalized listing into the cluster store:
//! 1. Block: find clusters indexed within the blocking radius of the listing
//! 2. Score: compare the listing with each candidate's representative
//! 3. Merge into the best candidate at or above the merge threshold
//! 4. Otherwise create a new cluster
//!
//! A listing whose source link is already clustered updates its member in
//! place instead. All of this runs inside the cell locks of the listing's
//! blocking region, and every commit is undone if any step fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use estate_core::config::DedupConfig;
use estate_core::error::{EstateError, Result};
use estate_core::types::{Cluster, ClusterId, GeoPoint, NormalizedListing};

use crate::locks::{CellLocks, SourceLocks};
use crate::similarity;
use crate::spatial::{CellKey, SpatialIndex};
use crate::store::ClusterStore;

/// How an ingestion was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IngestKind {
    /// No candidate reached the threshold; a new cluster was created.
    Created,
    /// Merged into an existing cluster with this similarity score.
    Merged { score: f64 },
    /// The source link was already clustered; its member was replaced.
    Updated,
}

/// Result of an ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub cluster_id: ClusterId,
    pub kind: IngestKind,
    /// Set when a re-ingested listing moved too far from the other members
    /// of its previous cluster and was detached from it.
    pub relocated_from: Option<ClusterId>,
}

pub struct Deduplicator {
    store: Arc<ClusterStore>,
    index: Arc<SpatialIndex>,
    cell_locks: Arc<CellLocks>,
    source_locks: SourceLocks,
    config: DedupConfig,
}

impl Deduplicator {
    /// `cell_locks` must be the set queries read-lock, so readers never
    /// observe a commit half applied.
    pub fn new(
        store: Arc<ClusterStore>,
        index: Arc<SpatialIndex>,
        cell_locks: Arc<CellLocks>,
        config: DedupConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            index,
            cell_locks,
            source_locks: SourceLocks::new(),
            config,
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Ingest `listing` and return the ID of the cluster now holding it.
    pub fn ingest(&self, listing: NormalizedListing) -> Result<ClusterId> {
        self.ingest_detailed(listing).map(|o| o.cluster_id)
    }

    /// Ingest `listing` and report how it was resolved.
    ///
    /// Runs to completion or fails with no visible effect; it is not
    /// cancellable part-way.
    pub fn ingest_detailed(&self, listing: NormalizedListing) -> Result<IngestOutcome> {
        let _source = self.source_locks.lock(listing.source_link())?;
        let prior = self.store.cluster_for_source(listing.source_link())?;
        let region = self
            .index
            .cells_for_radius(&listing.location(), self.search_radius());

        loop {
            let prior_region = match prior {
                Some(id) => self.region_of(id)?,
                None => Vec::new(),
            };
            let mut keys = region.clone();
            keys.extend_from_slice(&prior_region);

            let cells = self.cell_locks.cells(&keys);
            let _guards = cells.lock()?;

            // The prior cluster may have been moved by a merge between
            // reading its entry and taking the locks.
            if let Some(id) = prior {
                if !self.region_of(id)?.iter().all(|k| cells.covers(k)) {
                    debug!(cluster_id = %id, "Prior cluster moved while locking, retrying");
                    continue;
                }
            }

            return self.ingest_locked(listing, prior);
        }
    }

    /// Blocking radius widened by the drift tolerance, since an index entry
    /// may lag its representative by up to that distance.
    fn search_radius(&self) -> f64 {
        self.config.blocking_radius_m + self.config.drift_tolerance_m
    }

    /// Cells around a cluster's index entries wide enough to hold every
    /// member, so any of them can become representative under lock.
    fn region_of(&self, id: ClusterId) -> Result<Vec<CellKey>> {
        Ok(self
            .index
            .entries_for(id)?
            .iter()
            .flat_map(|p| self.index.cells_for_radius(p, self.search_radius()))
            .collect())
    }

    fn ingest_locked(
        &self,
        listing: NormalizedListing,
        prior: Option<ClusterId>,
    ) -> Result<IngestOutcome> {
        let link = listing.source_link().to_string();
        let mut txn = Transaction::new(&self.store, &self.index);
        match self.apply(&mut txn, listing, prior) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_fatal() {
                    error!(source_link = %link, error = %e, "Ingestion hit an inconsistency, rolling back");
                } else {
                    debug!(source_link = %link, error = %e, "Ingestion failed, rolling back");
                }
                txn.rollback();
                Err(e)
            }
        }
    }

    fn apply(
        &self,
        txn: &mut Transaction<'_>,
        listing: NormalizedListing,
        prior: Option<ClusterId>,
    ) -> Result<IngestOutcome> {
        let mut relocated_from = None;

        if let Some(id) = prior {
            let mut cluster = self.load(id)?;
            if self.within_reach(&cluster, &listing) {
                cluster.upsert_member(listing);
                self.commit_update(txn, cluster)?;
                debug!(cluster_id = %id, "Member updated in place");
                return Ok(IngestOutcome {
                    cluster_id: id,
                    kind: IngestKind::Updated,
                    relocated_from: None,
                });
            }

            if cluster.remove_member(listing.source_link()).is_none() {
                return Err(EstateError::InternalInconsistency(format!(
                    "cluster {} is mapped to source {} but does not contain it",
                    id,
                    listing.source_link()
                )));
            }
            self.commit_update(txn, cluster)?;
            info!(
                cluster_id = %id,
                source_link = %listing.source_link(),
                "Listing moved beyond the blocking radius, detached from its cluster"
            );
            relocated_from = Some(id);
        }

        let point = listing.location();
        let mut candidates = self.index.query_radius(point, self.search_radius())?;
        candidates.sort();

        let mut best: Option<(Cluster, f64)> = None;
        for id in candidates {
            let cluster = self.load(id)?;
            if !self.within_reach(&cluster, &listing) {
                continue;
            }
            let sim = similarity::score(&listing, cluster.representative(), &self.config.weights);
            debug!(
                cluster_id = %id,
                score = sim.total,
                address = sim.address,
                area = sim.area,
                price = sim.price,
                rooms = sim.rooms,
                "Scored candidate"
            );
            if sim.total < self.config.merge_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(_, s)| sim.total > *s) {
                best = Some((cluster, sim.total));
            }
        }

        if let Some((mut cluster, score)) = best {
            let id = cluster.id();
            cluster.upsert_member(listing);
            self.commit_update(txn, cluster)?;
            debug!(cluster_id = %id, score, "Listing merged");
            return Ok(IngestOutcome {
                cluster_id: id,
                kind: IngestKind::Merged { score },
                relocated_from,
            });
        }

        let id = self.store.allocate_id();
        self.commit_create(txn, Cluster::new(id, listing), point)?;
        info!(cluster_id = %id, "Cluster created");
        Ok(IngestOutcome {
            cluster_id: id,
            kind: IngestKind::Created,
            relocated_from,
        })
    }

    fn load(&self, id: ClusterId) -> Result<Cluster> {
        self.store.get(id)?.ok_or_else(|| {
            EstateError::InternalInconsistency(format!(
                "cluster {} is indexed but missing from the store",
                id
            ))
        })
    }

    /// True when `listing` lies within the blocking radius of every member
    /// of `cluster` other than its own previous version.
    ///
    /// Keeping members pairwise within the radius guarantees every member
    /// stays within the radius of whichever one is representative.
    fn within_reach(&self, cluster: &Cluster, listing: &NormalizedListing) -> bool {
        let point = listing.location();
        cluster
            .members()
            .iter()
            .filter(|m| m.source_link() != listing.source_link())
            .all(|m| m.location().distance_m(&point) <= self.config.blocking_radius_m)
    }

    fn commit_create(
        &self,
        txn: &mut Transaction<'_>,
        cluster: Cluster,
        point: GeoPoint,
    ) -> Result<()> {
        let id = cluster.id();
        txn.stage_store(id, None);
        self.store.put(cluster)?;
        txn.stage_index(id, Vec::new());
        self.index.insert(point, id)
    }

    fn commit_update(&self, txn: &mut Transaction<'_>, cluster: Cluster) -> Result<()> {
        let id = cluster.id();
        let rep_point = cluster.representative().location();

        let previous = self.load(id)?;
        txn.stage_store(id, Some(previous));
        self.store.put(cluster)?;

        let entries = self.index.entries_for(id)?;
        let drifted = entries.is_empty()
            || entries
                .iter()
                .any(|p| p.distance_m(&rep_point) > self.config.drift_tolerance_m);
        if drifted {
            debug!(cluster_id = %id, "Representative drifted, moving index entry");
            txn.stage_index(id, entries);
            self.index.relocate(id, &[rep_point])?;
        }
        Ok(())
    }
}

enum Undo {
    Store(ClusterId, Option<Cluster>),
    Index(ClusterId, Vec<GeoPoint>),
}

/// Undo log for one ingestion. Each step is staged before it is applied, so
/// a partially applied step is reverted too.
struct Transaction<'a> {
    store: &'a ClusterStore,
    index: &'a SpatialIndex,
    undo: Vec<Undo>,
}

impl<'a> Transaction<'a> {
    fn new(store: &'a ClusterStore, index: &'a SpatialIndex) -> Self {
        Self {
            store,
            index,
            undo: Vec::new(),
        }
    }

    fn stage_store(&mut self, id: ClusterId, previous: Option<Cluster>) {
        self.undo.push(Undo::Store(id, previous));
    }

    fn stage_index(&mut self, id: ClusterId, previous: Vec<GeoPoint>) {
        self.undo.push(Undo::Index(id, previous));
    }

    fn rollback(self) {
        for step in self.undo.into_iter().rev() {
            let result = match step {
                Undo::Store(id, Some(cluster)) => self.store.put(cluster).map(|_| ()).map_err(|e| (id, e)),
                Undo::Store(id, None) => self.store.remove(id).map(|_| ()).map_err(|e| (id, e)),
                Undo::Index(id, points) => self.index.relocate(id, &points).map_err(|e| (id, e)),
            };
            if let Err((id, e)) = result {
                error!(cluster_id = %id, error = %e, "Rollback step failed");
            }
        }
    }
}

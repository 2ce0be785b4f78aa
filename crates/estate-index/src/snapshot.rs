//! Serializable image of the cluster store.
//!
//! The spatial index is not part of a snapshot: it is rebuilt from each
//! cluster's representative on restore.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use estate_core::error::{EstateError, Result};
use estate_core::types::Cluster;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    /// First cluster ID the restored store will allocate.
    pub next_cluster_id: u64,
    /// Sorted by cluster ID.
    pub clusters: Vec<Cluster>,
}

impl Snapshot {
    pub fn new(taken_at: DateTime<Utc>, next_cluster_id: u64, clusters: Vec<Cluster>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at,
            next_cluster_id,
            clusters,
        }
    }

    pub fn listing_count(&self) -> usize {
        self.clusters.iter().map(Cluster::member_count).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a snapshot.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(json).map_err(invalid)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Structural checks: supported version, well-formed clusters, unique
    /// IDs below `next_cluster_id`, and each source link in one cluster.
    pub fn validate(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(invalid(format!(
                "unsupported version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        let mut ids = HashSet::new();
        let mut links = HashSet::new();
        for cluster in &self.clusters {
            cluster.check_invariants().map_err(invalid)?;
            let id = cluster.id();
            if !ids.insert(id) {
                return Err(invalid(format!("duplicate cluster {}", id)));
            }
            if id.0 == 0 || id.0 >= self.next_cluster_id {
                return Err(invalid(format!(
                    "cluster {} outside allocated range [1, {})",
                    id, self.next_cluster_id
                )));
            }
            for link in cluster.source_links() {
                if !links.insert(link) {
                    return Err(invalid(format!("source {} appears in two clusters", link)));
                }
            }
        }
        Ok(())
    }
}

fn invalid(reason: impl std::fmt::Display) -> EstateError {
    EstateError::Serialization(format!("invalid snapshot: {}", reason))
}

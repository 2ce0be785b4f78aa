//! In-memory cluster store.
//!
//! Owns every [`Cluster`] (and through it every member listing). Clusters are
//! spread over independently locked shards by ID; a separate map tracks which
//! cluster each source link belongs to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use estate_core::error::{EstateError, Result};
use estate_core::types::{Cluster, ClusterId};

const SHARD_COUNT: usize = 16;

#[derive(Debug)]
pub struct ClusterStore {
    shards: Vec<RwLock<HashMap<ClusterId, Cluster>>>,
    sources: RwLock<HashMap<String, ClusterId>>,
    next_id: AtomicU64,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// An empty store whose first allocated ID is `next_id`.
    pub fn starting_at(next_id: u64) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            sources: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(next_id.max(1)),
        }
    }

    /// Reserve a fresh cluster ID.
    pub fn allocate_id(&self) -> ClusterId {
        ClusterId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The ID the next allocation will return.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// A copy of cluster `id`.
    pub fn get(&self, id: ClusterId) -> Result<Option<Cluster>> {
        let shard = self.shard_read(id)?;
        Ok(shard.get(&id).cloned())
    }

    /// Insert or overwrite a cluster and point each of its source links at
    /// it. Returns the previous version, if any.
    pub fn put(&self, cluster: Cluster) -> Result<Option<Cluster>> {
        let id = cluster.id();
        let links: Vec<String> = cluster.source_links().map(String::from).collect();
        let previous = {
            let mut shard = self.shards[Self::shard_of(id)]
                .write()
                .map_err(|e| EstateError::poisoned("cluster store", e))?;
            shard.insert(id, cluster)
        };

        let mut sources = self
            .sources
            .write()
            .map_err(|e| EstateError::poisoned("source map", e))?;
        if let Some(prev) = &previous {
            for link in prev.source_links() {
                if sources.get(link) == Some(&id) && !links.iter().any(|l| l == link) {
                    sources.remove(link);
                }
            }
        }
        for link in links {
            sources.insert(link, id);
        }
        Ok(previous)
    }

    /// Physically drop a cluster. Only used to undo a failed creation.
    pub fn remove(&self, id: ClusterId) -> Result<Option<Cluster>> {
        let removed = {
            let mut shard = self.shards[Self::shard_of(id)]
                .write()
                .map_err(|e| EstateError::poisoned("cluster store", e))?;
            shard.remove(&id)
        };
        if let Some(cluster) = &removed {
            let mut sources = self
                .sources
                .write()
                .map_err(|e| EstateError::poisoned("source map", e))?;
            for link in cluster.source_links() {
                if sources.get(link) == Some(&id) {
                    sources.remove(link);
                }
            }
        }
        Ok(removed)
    }

    /// The cluster currently holding `link`.
    pub fn cluster_for_source(&self, link: &str) -> Result<Option<ClusterId>> {
        let sources = self
            .sources
            .read()
            .map_err(|e| EstateError::poisoned("source map", e))?;
        Ok(sources.get(link).copied())
    }

    /// Every source link with its owning cluster.
    pub fn source_assignments(&self) -> Result<Vec<(String, ClusterId)>> {
        let sources = self
            .sources
            .read()
            .map_err(|e| EstateError::poisoned("source map", e))?;
        Ok(sources.iter().map(|(l, id)| (l.clone(), *id)).collect())
    }

    /// All clusters sorted by ID.
    ///
    /// Holds every shard's read lock at once, so the result is a single
    /// point-in-time view.
    pub fn all(&self) -> Result<Vec<Cluster>> {
        let guards = self
            .shards
            .iter()
            .map(|s| s.read().map_err(|e| EstateError::poisoned("cluster store", e)))
            .collect::<Result<Vec<_>>>()?;
        let mut clusters: Vec<Cluster> = guards
            .iter()
            .flat_map(|g| g.values().cloned())
            .collect();
        clusters.sort_by_key(|c| c.id());
        Ok(clusters)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().map(|g| g.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of member listings across all clusters.
    pub fn listing_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .map(|g| g.values().map(Cluster::member_count).sum::<usize>())
                    .unwrap_or(0)
            })
            .sum()
    }

    fn shard_of(id: ClusterId) -> usize {
        (id.0 % SHARD_COUNT as u64) as usize
    }

    fn shard_read(&self, id: ClusterId) -> Result<RwLockReadGuard<'_, HashMap<ClusterId, Cluster>>> {
        self.shards[Self::shard_of(id)]
            .read()
            .map_err(|e| EstateError::poisoned("cluster store", e))
    }
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::listing_at;

    #[test]
    fn test_allocate_ids_sequentially() {
        let store = ClusterStore::new();
        assert_eq!(store.allocate_id(), ClusterId(1));
        assert_eq!(store.allocate_id(), ClusterId(2));
        assert_eq!(store.peek_next_id(), 3);
        assert_eq!(ClusterStore::starting_at(0).allocate_id(), ClusterId(1));
    }

    #[test]
    fn test_put_get_and_source_lookup() {
        let store = ClusterStore::new();
        let id = store.allocate_id();
        let cluster = Cluster::new(id, listing_at("a", 40.0, -74.0, 0));
        assert!(store.put(cluster.clone()).unwrap().is_none());

        assert_eq!(store.get(id).unwrap(), Some(cluster));
        assert_eq!(store.cluster_for_source("a").unwrap(), Some(id));
        assert_eq!(store.cluster_for_source("b").unwrap(), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.listing_count(), 1);
    }

    #[test]
    fn test_put_drops_links_no_longer_members() {
        let store = ClusterStore::new();
        let id = store.allocate_id();
        let mut cluster = Cluster::new(id, listing_at("a", 40.0, -74.0, 0));
        cluster.upsert_member(listing_at("b", 40.0, -74.0, 1));
        store.put(cluster.clone()).unwrap();
        assert_eq!(store.cluster_for_source("b").unwrap(), Some(id));

        cluster.remove_member("b");
        let previous = store.put(cluster).unwrap().unwrap();
        assert_eq!(previous.member_count(), 2);
        assert_eq!(store.cluster_for_source("b").unwrap(), None);
        assert_eq!(store.cluster_for_source("a").unwrap(), Some(id));
    }

    #[test]
    fn test_remove_clears_sources() {
        let store = ClusterStore::new();
        let id = store.allocate_id();
        store
            .put(Cluster::new(id, listing_at("a", 40.0, -74.0, 0)))
            .unwrap();
        assert!(store.remove(id).unwrap().is_some());
        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.cluster_for_source("a").unwrap(), None);
        assert!(store.remove(id).unwrap().is_none());
    }

    #[test]
    fn test_all_sorted_by_id() {
        let store = ClusterStore::new();
        for i in 0..40 {
            let id = store.allocate_id();
            store
                .put(Cluster::new(id, listing_at(&format!("l{}", i), 40.0, -74.0, 0)))
                .unwrap();
        }
        let ids: Vec<u64> = store.all().unwrap().iter().map(|c| c.id().0).collect();
        assert_eq!(ids, (1..=40).collect::<Vec<u64>>());
    }
}

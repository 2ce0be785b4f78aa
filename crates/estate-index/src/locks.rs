//! Cell and source locks shared by ingestion and queries.
//!
//! Two ingestions whose blocking regions overlap must not interleave. Each
//! ingestion write-locks every grid cell its blocking region touches; because
//! a listing's own cell lies inside the region of any listing within blocking
//! distance, two such ingestions always share at least one cell and are
//! serialized. Queries read-lock the cells they scan, so a cluster's store
//! update and its index update are seen together or not at all.
//!
//! Cells map onto a fixed pool of striped `RwLock`s. Stripes are always
//! acquired in ascending order, so readers and writers cannot deadlock.
//!
//! Re-ingestions of one source link are additionally serialized through a
//! small set of striped source locks, taken before any cell lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use estate_core::error::{EstateError, Result};

use crate::spatial::CellKey;

/// Number of cell lock stripes. Also the largest cell count a caller should
/// enumerate before locking every stripe instead.
pub const CELL_STRIPES: usize = 1024;

const SOURCE_STRIPES: usize = 64;

/// Fixed pool of reader/writer locks selected by cell.
#[derive(Debug)]
pub struct CellLocks {
    stripes: Vec<RwLock<()>>,
}

impl CellLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..CELL_STRIPES).map(|_| RwLock::new(())).collect(),
        }
    }

    /// The stripes covering `keys`. Lock them with [`CellSet::lock`] or
    /// [`CellSet::read`].
    pub fn cells(&self, keys: &[CellKey]) -> CellSet<'_> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut stripes: Vec<usize> = keys.iter().map(stripe_of).collect();
        stripes.sort_unstable();
        stripes.dedup();
        CellSet {
            locks: self,
            keys,
            stripes,
        }
    }

    /// Every stripe, for scans too wide to enumerate cell by cell.
    pub fn everything(&self) -> CellSet<'_> {
        CellSet {
            locks: self,
            keys: Vec::new(),
            stripes: (0..self.stripes.len()).collect(),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

impl Default for CellLocks {
    fn default() -> Self {
        Self::new()
    }
}

fn stripe_of(key: &CellKey) -> usize {
    (key.row as i64 * 7_919 + key.col as i64).rem_euclid(CELL_STRIPES as i64) as usize
}

/// An ordered set of cell stripes.
pub struct CellSet<'a> {
    locks: &'a CellLocks,
    keys: Vec<CellKey>,
    stripes: Vec<usize>,
}

impl<'a> CellSet<'a> {
    /// The cells this set was built from, sorted.
    pub fn keys(&self) -> &[CellKey] {
        &self.keys
    }

    /// Exclusive locks on every stripe, in order. The guards release on drop.
    pub fn lock(&self) -> Result<Vec<RwLockWriteGuard<'a, ()>>> {
        let locks = self.locks;
        self.stripes
            .iter()
            .map(|&s| {
                locks.stripes[s]
                    .write()
                    .map_err(|e| EstateError::poisoned("cell", e))
            })
            .collect()
    }

    /// Shared locks on every stripe, in order.
    pub fn read(&self) -> Result<Vec<RwLockReadGuard<'a, ()>>> {
        let locks = self.locks;
        self.stripes
            .iter()
            .map(|&s| {
                locks.stripes[s]
                    .read()
                    .map_err(|e| EstateError::poisoned("cell", e))
            })
            .collect()
    }

    /// True when holding this set excludes every other writer of `key`.
    pub fn covers(&self, key: &CellKey) -> bool {
        self.stripes.binary_search(&stripe_of(key)).is_ok()
    }
}

/// Fixed pool of mutexes selected by hashing the source link.
#[derive(Debug)]
pub struct SourceLocks {
    stripes: Vec<Mutex<()>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..SOURCE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, link: &str) -> Result<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        link.hash(&mut hasher);
        let stripe = (hasher.finish() % SOURCE_STRIPES as u64) as usize;
        self.stripes[stripe]
            .lock()
            .map_err(|e| EstateError::poisoned("source", e))
    }
}

impl Default for SourceLocks {
    fn default() -> Self {
        Self::new()
    }
}

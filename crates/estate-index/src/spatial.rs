//! Grid-bucketed geographic index over (point, cluster) entries.
//!
//! The globe is cut into square latitude/longitude cells of a fixed edge
//! length. Each cell holds the entries whose point falls inside it, and the
//! cells are spread over a fixed number of independently locked shards so a
//! write to one region never blocks readers of another.
//!
//! Range queries first enumerate the cells overlapping the query's bounding
//! region, then filter the entries exactly (great-circle distance for radius
//! queries, coordinate comparison for boxes). Results are always ordered
//! deterministically.

use std::collections::HashMap;
use std::sync::RwLock;

use estate_core::error::{EstateError, Result};
use estate_core::geo;
use estate_core::types::{BoundingBox, ClusterId, GeoPoint};

const SHARD_COUNT: usize = 16;

/// Relative slack added to cell coverings so rounding never drops a point
/// sitting exactly on the query boundary.
const COVER_SLACK: f64 = 1e-6;

/// Grid coordinates of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub row: i32,
    pub col: i32,
}

/// One index entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexEntry {
    pub id: ClusterId,
    pub point: GeoPoint,
}

#[derive(Debug, Clone, Copy)]
struct Grid {
    cell_deg: f64,
    rows: i32,
    cols: i32,
}

impl Grid {
    fn new(cell_deg: f64) -> Self {
        Self {
            cell_deg,
            rows: (180.0 / cell_deg).ceil() as i32,
            cols: (360.0 / cell_deg).ceil() as i32,
        }
    }

    fn row(&self, lat: f64) -> i32 {
        (((lat + 90.0) / self.cell_deg).floor() as i32).clamp(0, self.rows - 1)
    }

    fn col(&self, lng: f64) -> i32 {
        (((lng + 180.0) / self.cell_deg).floor() as i32).clamp(0, self.cols - 1)
    }

    fn key(&self, p: &GeoPoint) -> CellKey {
        CellKey {
            row: self.row(p.lat),
            col: self.col(p.lng),
        }
    }

    /// Cells overlapping the circle of `radius_m` around `center`.
    fn cover_radius(&self, center: &GeoPoint, radius_m: f64) -> Cover {
        let dlat = geo::meters_to_lat_deg(radius_m) * (1.0 + COVER_SLACK);
        let lat_lo = center.lat - dlat;
        let lat_hi = center.lat + dlat;
        let rows = (self.row(lat_lo.max(-90.0)), self.row(lat_hi.min(90.0)));

        let dlng = match geo::meters_to_lng_deg(radius_m, center.lat) {
            Some(d) => d * (1.0 + COVER_SLACK),
            None => return Cover::all_cols(rows, self.cols),
        };
        let lng_lo = center.lng - dlng;
        let lng_hi = center.lng + dlng;
        if lng_hi - lng_lo >= 360.0 {
            return Cover::all_cols(rows, self.cols);
        }

        let mut cols = Vec::with_capacity(2);
        if lng_lo < -180.0 {
            cols.push((self.col(lng_lo + 360.0), self.cols - 1));
            cols.push((0, self.col(lng_hi)));
        } else if lng_hi > 180.0 {
            cols.push((self.col(lng_lo), self.cols - 1));
            cols.push((0, self.col(lng_hi - 360.0)));
        } else {
            cols.push((self.col(lng_lo), self.col(lng_hi)));
        }
        Cover { rows, cols }
    }

    fn cover_box(&self, bbox: &BoundingBox) -> Cover {
        Cover {
            rows: (self.row(bbox.min.lat), self.row(bbox.max.lat)),
            cols: vec![(self.col(bbox.min.lng), self.col(bbox.max.lng))],
        }
    }
}

/// A rectangular set of cells, with the column range split in two when it
/// crosses the antimeridian.
#[derive(Debug, Clone)]
struct Cover {
    rows: (i32, i32),
    cols: Vec<(i32, i32)>,
}

impl Cover {
    fn all_cols(rows: (i32, i32), cols: i32) -> Self {
        Self {
            rows,
            cols: vec![(0, cols - 1)],
        }
    }

    fn contains(&self, key: &CellKey) -> bool {
        key.row >= self.rows.0
            && key.row <= self.rows.1
            && self.cols.iter().any(|(lo, hi)| key.col >= *lo && key.col <= *hi)
    }

    fn cell_count(&self) -> u64 {
        let rows = (self.rows.1 - self.rows.0 + 1).max(0) as u64;
        let cols: u64 = self
            .cols
            .iter()
            .map(|(lo, hi)| (hi - lo + 1).max(0) as u64)
            .sum();
        rows * cols
    }

    fn keys(&self) -> impl Iterator<Item = CellKey> + '_ {
        (self.rows.0..=self.rows.1).flat_map(move |row| {
            self.cols
                .iter()
                .flat_map(move |(lo, hi)| (*lo..=*hi).map(move |col| CellKey { row, col }))
        })
    }
}

type Shard = HashMap<CellKey, Vec<IndexEntry>>;

/// Sharded, thread-safe spatial index.
///
/// Holds only back-references (cluster ID plus point); the cluster store
/// owns the listing data.
#[derive(Debug)]
pub struct SpatialIndex {
    grid: Grid,
    shards: Vec<RwLock<Shard>>,
    by_cluster: RwLock<HashMap<ClusterId, Vec<GeoPoint>>>,
}

impl SpatialIndex {
    /// Create an empty index with cells of `cell_size_deg` degrees.
    pub fn new(cell_size_deg: f64) -> Result<Self> {
        if !(cell_size_deg.is_finite() && cell_size_deg > 0.0 && cell_size_deg <= 90.0) {
            return Err(EstateError::Config(format!(
                "cell size {} must be within (0, 90] degrees",
                cell_size_deg
            )));
        }
        Ok(Self {
            grid: Grid::new(cell_size_deg),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            by_cluster: RwLock::new(HashMap::new()),
        })
    }

    /// Add an entry. Inserting an identical (point, cluster) pair is a no-op.
    pub fn insert(&self, point: GeoPoint, id: ClusterId) -> Result<()> {
        point.validate()?;
        let key = self.grid.key(&point);

        let mut by_cluster = self
            .by_cluster
            .write()
            .map_err(|e| EstateError::poisoned("spatial index", e))?;
        let points = by_cluster.entry(id).or_default();
        if points.contains(&point) {
            return Ok(());
        }

        let mut shard = self.shard(&key)?;
        shard
            .entry(key)
            .or_default()
            .push(IndexEntry { id, point });
        points.push(point);
        Ok(())
    }

    /// Remove every entry of `id`. Absent clusters are a no-op.
    pub fn remove(&self, id: ClusterId) -> Result<()> {
        let mut by_cluster = self
            .by_cluster
            .write()
            .map_err(|e| EstateError::poisoned("spatial index", e))?;
        let Some(points) = by_cluster.remove(&id) else {
            return Ok(());
        };

        for point in points {
            let key = self.grid.key(&point);
            let mut shard = self.shard(&key)?;
            if let Some(entries) = shard.get_mut(&key) {
                entries.retain(|e| e.id != id);
                if entries.is_empty() {
                    shard.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Replace every entry of `id` with `points` under a single acquisition of
    /// the affected locks, so lookups by cluster never see it half moved.
    /// Range scans rely on the caller's cell locks for the same guarantee.
    /// An empty `points` removes the cluster.
    pub fn relocate(&self, id: ClusterId, points: &[GeoPoint]) -> Result<()> {
        for point in points {
            point.validate()?;
        }
        let mut new_points: Vec<GeoPoint> = Vec::with_capacity(points.len());
        for point in points {
            if !new_points.contains(point) {
                new_points.push(*point);
            }
        }

        let mut by_cluster = self
            .by_cluster
            .write()
            .map_err(|e| EstateError::poisoned("spatial index", e))?;
        let old_points = by_cluster.get(&id).cloned().unwrap_or_default();

        let mut shard_ids: Vec<usize> = old_points
            .iter()
            .chain(new_points.iter())
            .map(|p| Self::shard_of(&self.grid.key(p)))
            .collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();
        let mut shards = Vec::with_capacity(shard_ids.len());
        for &i in &shard_ids {
            let guard = self.shards[i]
                .write()
                .map_err(|e| EstateError::poisoned("spatial index shard", e))?;
            shards.push(guard);
        }
        let slot = |key: &CellKey| shard_ids.binary_search(&Self::shard_of(key)).unwrap_or(0);

        for point in &old_points {
            let key = self.grid.key(point);
            let shard = &mut shards[slot(&key)];
            if let Some(entries) = shard.get_mut(&key) {
                entries.retain(|e| e.id != id);
                if entries.is_empty() {
                    shard.remove(&key);
                }
            }
        }
        for point in &new_points {
            let key = self.grid.key(point);
            shards[slot(&key)]
                .entry(key)
                .or_default()
                .push(IndexEntry { id, point: *point });
        }

        if new_points.is_empty() {
            by_cluster.remove(&id);
        } else {
            by_cluster.insert(id, new_points);
        }
        Ok(())
    }

    /// Points currently indexed for `id`.
    pub fn entries_for(&self, id: ClusterId) -> Result<Vec<GeoPoint>> {
        let by_cluster = self
            .by_cluster
            .read()
            .map_err(|e| EstateError::poisoned("spatial index", e))?;
        Ok(by_cluster.get(&id).cloned().unwrap_or_default())
    }

    /// Clusters with at least one entry within `radius_m` meters of `center`,
    /// ordered by ascending distance then cluster ID.
    pub fn query_radius(&self, center: GeoPoint, radius_m: f64) -> Result<Vec<ClusterId>> {
        Ok(self
            .query_radius_with_distance(center, radius_m)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Like [`query_radius`](Self::query_radius), with each cluster's
    /// distance in meters (its closest entry when it has several).
    pub fn query_radius_with_distance(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<(ClusterId, f64)>> {
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(EstateError::InvalidQuery(format!(
                "radius {} must be a positive number of meters",
                radius_m
            )));
        }
        center
            .validate()
            .map_err(|e| EstateError::InvalidQuery(format!("center: {}", e)))?;

        let cover = self.grid.cover_radius(&center, radius_m);
        let mut best: HashMap<ClusterId, f64> = HashMap::new();
        self.scan(&cover, |entry| {
            let d = geo::haversine_m(&center, &entry.point);
            if d <= radius_m {
                best.entry(entry.id)
                    .and_modify(|cur| *cur = cur.min(d))
                    .or_insert(d);
            }
        })?;

        let mut hits: Vec<(ClusterId, f64)> = best.into_iter().collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(hits)
    }

    /// Clusters with at least one entry inside the box spanned by `min` and
    /// `max`, ordered by cluster ID.
    pub fn query_box(&self, min: GeoPoint, max: GeoPoint) -> Result<Vec<ClusterId>> {
        let bbox = BoundingBox::new(min, max)?;
        let cover = self.grid.cover_box(&bbox);
        let mut ids = Vec::new();
        self.scan(&cover, |entry| {
            if bbox.contains(&entry.point) {
                ids.push(entry.id);
            }
        })?;
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// The `k` clusters closest to `point`, ascending distance, ties by ID.
    ///
    /// Searches a growing radius until at least `k` clusters are inside it;
    /// everything outside that radius is necessarily farther away.
    pub fn nearest(&self, point: GeoPoint, k: usize) -> Result<Vec<(ClusterId, f64)>> {
        point
            .validate()
            .map_err(|e| EstateError::InvalidQuery(format!("point: {}", e)))?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let half_circumference = std::f64::consts::PI * geo::EARTH_RADIUS_M;
        let mut radius = (self.grid.cell_deg.to_radians() * geo::EARTH_RADIUS_M).max(1.0);
        loop {
            let mut hits = self.query_radius_with_distance(point, radius)?;
            if hits.len() >= k || radius >= half_circumference {
                hits.truncate(k);
                return Ok(hits);
            }
            radius = (radius * 4.0).min(half_circumference);
        }
    }

    /// Cell containing `point`.
    pub fn cell_of(&self, point: &GeoPoint) -> CellKey {
        self.grid.key(point)
    }

    /// Every cell overlapping the circle of `radius_m` around `center`,
    /// sorted.
    pub fn cells_for_radius(&self, center: &GeoPoint, radius_m: f64) -> Vec<CellKey> {
        let mut keys: Vec<CellKey> = self.grid.cover_radius(center, radius_m).keys().collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Cells overlapping the circle of `radius_m` around `center`, or `None`
    /// when there are more than `limit` of them.
    pub fn cells_for_radius_within(
        &self,
        center: &GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Option<Vec<CellKey>> {
        Self::bounded_keys(&self.grid.cover_radius(center, radius_m), limit)
    }

    /// Cells overlapping `bbox`, or `None` when there are more than `limit`.
    pub fn cells_for_box_within(&self, bbox: &BoundingBox, limit: usize) -> Option<Vec<CellKey>> {
        Self::bounded_keys(&self.grid.cover_box(bbox), limit)
    }

    fn bounded_keys(cover: &Cover, limit: usize) -> Option<Vec<CellKey>> {
        if cover.cell_count() > limit as u64 {
            return None;
        }
        let mut keys: Vec<CellKey> = cover.keys().collect();
        keys.sort();
        keys.dedup();
        Some(keys)
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.by_cluster
            .read()
            .map(|m| m.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every (cluster, points) pair, sorted by cluster ID.
    pub fn snapshot_entries(&self) -> Result<Vec<(ClusterId, Vec<GeoPoint>)>> {
        let by_cluster = self
            .by_cluster
            .read()
            .map_err(|e| EstateError::poisoned("spatial index", e))?;
        let mut all: Vec<(ClusterId, Vec<GeoPoint>)> =
            by_cluster.iter().map(|(id, p)| (*id, p.clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        Ok(all)
    }

    fn shard_of(key: &CellKey) -> usize {
        (key.row as i64 * 31 + key.col as i64).rem_euclid(SHARD_COUNT as i64) as usize
    }

    fn shard(&self, key: &CellKey) -> Result<std::sync::RwLockWriteGuard<'_, Shard>> {
        self.shards[Self::shard_of(key)]
            .write()
            .map_err(|e| EstateError::poisoned("spatial index shard", e))
    }

    /// Visit every entry in the cells of `cover`.
    ///
    /// Small covers are walked key by key; covers larger than the number of
    /// occupied cells are answered by scanning the occupied cells instead.
    fn scan<F: FnMut(&IndexEntry)>(&self, cover: &Cover, mut visit: F) -> Result<()> {
        let mut occupied = 0u64;
        for shard in &self.shards {
            let shard = shard
                .read()
                .map_err(|e| EstateError::poisoned("spatial index shard", e))?;
            occupied += shard.len() as u64;
        }

        if cover.cell_count() <= occupied {
            let mut per_shard: Vec<Vec<CellKey>> = vec![Vec::new(); SHARD_COUNT];
            for key in cover.keys() {
                per_shard[Self::shard_of(&key)].push(key);
            }
            for (i, keys) in per_shard.iter().enumerate() {
                if keys.is_empty() {
                    continue;
                }
                let shard = self.shards[i]
                    .read()
                    .map_err(|e| EstateError::poisoned("spatial index shard", e))?;
                for key in keys {
                    if let Some(entries) = shard.get(key) {
                        entries.iter().for_each(&mut visit);
                    }
                }
            }
        } else {
            for shard in &self.shards {
                let shard = shard
                    .read()
                    .map_err(|e| EstateError::poisoned("spatial index shard", e))?;
                for (key, entries) in shard.iter() {
                    if cover.contains(key) {
                        entries.iter().for_each(&mut visit);
                    }
                }
            }
        }
        Ok(())
    }
}

//! Read path: region + attribute filters over cluster representatives.

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use estate_core::config::QueryConfig;
use estate_core::error::{EstateError, Result};
use estate_core::types::{BoundingBox, Cluster, ClusterId, ClusterView, GeoPoint, NormalizedText};

use crate::locks::{CellLocks, CellSet, CELL_STRIPES};
use crate::spatial::SpatialIndex;
use crate::store::ClusterStore;

/// Deadline checks happen at least this often while scanning candidates.
const DEADLINE_CHECK_EVERY: usize = 256;

/// Geographic part of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Box(BoundingBox),
    Radius { center: GeoPoint, radius_m: f64 },
}

impl Region {
    /// Point distances are measured from: the circle center or box center.
    pub fn center(&self) -> GeoPoint {
        match self {
            Region::Box(b) => b.center(),
            Region::Radius { center, .. } => *center,
        }
    }

    fn contains(&self, point: &GeoPoint) -> bool {
        match self {
            Region::Box(b) => b.contains(point),
            Region::Radius { center, radius_m } => center.distance_m(point) <= *radius_m,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Region::Box(b) => BoundingBox::new(b.min, b.max).map(|_| ()),
            Region::Radius { center, radius_m } => {
                center
                    .validate()
                    .map_err(|e| EstateError::InvalidQuery(format!("center: {}", e)))?;
                if !(radius_m.is_finite() && *radius_m > 0.0) {
                    return Err(EstateError::InvalidQuery(format!(
                        "radius {} must be a positive number of meters",
                        radius_m
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Filters on representative attributes. Bounds are inclusive; unset
/// bounds do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_area_m2: Option<f64>,
    pub max_area_m2: Option<f64>,
    pub min_rooms: Option<u32>,
    pub max_rooms: Option<u32>,
    pub min_bathrooms: Option<u32>,
    pub max_bathrooms: Option<u32>,
    /// Case-insensitive substring of the neighbourhood.
    pub neighbourhood: Option<String>,
}

impl Filters {
    fn validate(&self) -> Result<()> {
        check_float_range("price", self.min_price, self.max_price)?;
        check_float_range("area_m2", self.min_area_m2, self.max_area_m2)?;
        check_count_range("rooms", self.min_rooms, self.max_rooms)?;
        check_count_range("bathrooms", self.min_bathrooms, self.max_bathrooms)?;
        if let Some(n) = &self.neighbourhood {
            if NormalizedText::new(n).is_empty() {
                return Err(EstateError::InvalidQuery(
                    "neighbourhood filter is empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn matches(&self, view: &ClusterView, neighbourhood_key: &str, needle: Option<&str>) -> bool {
        within(view.price, self.min_price, self.max_price)
            && within(view.area_m2, self.min_area_m2, self.max_area_m2)
            && within(view.rooms, self.min_rooms, self.max_rooms)
            && within(view.bathrooms, self.min_bathrooms, self.max_bathrooms)
            && needle.map_or(true, |n| neighbourhood_key.contains(n))
    }
}

fn within<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

fn check_float_range(field: &str, min: Option<f64>, max: Option<f64>) -> Result<()> {
    for bound in [min, max].into_iter().flatten() {
        if !bound.is_finite() || bound < 0.0 {
            return Err(EstateError::InvalidQuery(format!(
                "{} bound {} must be a non-negative number",
                field, bound
            )));
        }
    }
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(EstateError::InvalidQuery(format!(
                "{} range is empty: min {} > max {}",
                field, lo, hi
            )));
        }
    }
    Ok(())
}

fn check_count_range(field: &str, min: Option<u32>, max: Option<u32>) -> Result<()> {
    match (min, max) {
        (Some(lo), Some(hi)) if lo > hi => Err(EstateError::InvalidQuery(format!(
            "{} range is empty: min {} > max {}",
            field, lo, hi
        ))),
        _ => Ok(()),
    }
}

/// Result ordering. Every key breaks ties by ascending cluster ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Distance,
    PriceAsc,
    PriceDesc,
    AreaAsc,
    AreaDesc,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Distance => "distance",
            SortKey::PriceAsc => "price_asc",
            SortKey::PriceDesc => "price_desc",
            SortKey::AreaAsc => "area_asc",
            SortKey::AreaDesc => "area_desc",
        }
    }

    fn value(&self, view: &ClusterView, distance: f64) -> f64 {
        match self {
            SortKey::Distance => distance,
            SortKey::PriceAsc | SortKey::PriceDesc => view.price,
            SortKey::AreaAsc | SortKey::AreaDesc => view.area_m2,
        }
    }

    fn compare(&self, a: (f64, ClusterId), b: (f64, ClusterId)) -> Ordering {
        let by_value = match self {
            SortKey::PriceDesc | SortKey::AreaDesc => b.0.total_cmp(&a.0),
            _ => a.0.total_cmp(&b.0),
        };
        by_value.then(a.1.cmp(&b.1))
    }
}

impl FromStr for SortKey {
    type Err = EstateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "distance" => Ok(SortKey::Distance),
            "price_asc" => Ok(SortKey::PriceAsc),
            "price_desc" => Ok(SortKey::PriceDesc),
            "area_asc" => Ok(SortKey::AreaAsc),
            "area_desc" => Ok(SortKey::AreaDesc),
            other => Err(EstateError::InvalidQuery(format!(
                "unknown sort key: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Defaults to the configured page size.
    pub limit: Option<usize>,
    /// `next_cursor` from the previous page.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub region: Region,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub page: PageRequest,
}

impl Query {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            filters: Filters::default(),
            sort: SortKey::default(),
            page: PageRequest::default(),
        }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.page.limit = Some(limit);
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.page.cursor = Some(cursor.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub items: Vec<ClusterView>,
    /// Present when more results follow.
    pub next_cursor: Option<String>,
}

/// Point in time after which a query gives up with `DeadlineExceeded`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn within(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(EstateError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

/// Position of the last item on a page. Opaque to callers.
///
/// The sort key travels as its bit pattern so the resume point compares
/// exactly equal to the last item returned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Cursor {
    sort: SortKey,
    key_bits: u64,
    id: ClusterId,
}

impl Cursor {
    fn new(sort: SortKey, key: f64, id: ClusterId) -> Self {
        Self {
            sort,
            key_bits: key.to_bits(),
            id,
        }
    }

    fn key(&self) -> f64 {
        f64::from_bits(self.key_bits)
    }

    fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| EstateError::InvalidQuery(format!("invalid cursor: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EstateError::InvalidQuery(format!("invalid cursor: {}", e)))
    }
}

pub struct QueryEngine {
    store: Arc<ClusterStore>,
    index: Arc<SpatialIndex>,
    cell_locks: Arc<CellLocks>,
    config: QueryConfig,
    drift_tolerance_m: f64,
}

impl QueryEngine {
    /// `cell_locks` and `drift_tolerance_m` must be the deduplicator's:
    /// scans read-lock the cells writers lock, and index entries may lag
    /// their representative by up to the drift tolerance.
    pub fn new(
        store: Arc<ClusterStore>,
        index: Arc<SpatialIndex>,
        cell_locks: Arc<CellLocks>,
        config: QueryConfig,
        drift_tolerance_m: f64,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            index,
            cell_locks,
            config,
            drift_tolerance_m: drift_tolerance_m.max(0.0),
        })
    }

    pub fn query(&self, query: &Query, deadline: Deadline) -> Result<QueryPage> {
        query.region.validate()?;
        query.filters.validate()?;
        let limit = self.page_limit(&query.page)?;
        let cursor = match &query.page.cursor {
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                if cursor.sort != query.sort {
                    return Err(EstateError::InvalidQuery(format!(
                        "cursor was issued for sort {}, not {}",
                        cursor.sort.as_str(),
                        query.sort.as_str()
                    )));
                }
                Some(cursor)
            }
            None => None,
        };
        deadline.check()?;

        let mut hits = self.matching_clusters(query, deadline)?;
        deadline.check()?;

        let sort = query.sort;
        hits.sort_by(|a, b| sort.compare((a.0, a.1.id), (b.0, b.1.id)));

        let start = match cursor {
            Some(c) => hits.partition_point(|h| {
                sort.compare((h.0, h.1.id), (c.key(), c.id)) != Ordering::Greater
            }),
            None => 0,
        };
        let remaining = hits.len() - start;
        let page: Vec<(f64, ClusterView)> = hits.into_iter().skip(start).take(limit).collect();

        let next_cursor = match page.last() {
            Some((key, view)) if remaining > limit => Some(Cursor::new(sort, *key, view.id).encode()?),
            _ => None,
        };

        debug!(
            returned = page.len(),
            matched = remaining + start,
            more = next_cursor.is_some(),
            "Query served"
        );

        Ok(QueryPage {
            items: page.into_iter().map(|(_, v)| v).collect(),
            next_cursor,
        })
    }

    /// Every matching cluster with its sort key, read under shared locks on
    /// the scanned cells so no commit is seen half applied.
    fn matching_clusters(&self, query: &Query, deadline: Deadline) -> Result<Vec<(f64, ClusterView)>> {
        let cells = self.scan_cells(&query.region);
        let _guards = cells.read()?;

        let candidates = self.candidates(&query.region)?;
        deadline.check()?;

        let center = query.region.center();
        let needle = query
            .filters
            .neighbourhood
            .as_deref()
            .map(|n| NormalizedText::new(n).key().to_string());

        let mut hits: Vec<(f64, ClusterView)> = Vec::new();
        for (i, id) in candidates.into_iter().enumerate() {
            if i % DEADLINE_CHECK_EVERY == 0 {
                deadline.check()?;
            }
            let Some(cluster) = self.resolve(id)? else {
                continue;
            };
            let rep = cluster.representative();
            let location = rep.location();
            if !query.region.contains(&location) {
                continue;
            }
            let distance = center.distance_m(&location);
            let view = cluster.view(Some(distance));
            if !query
                .filters
                .matches(&view, rep.neighbourhood().key(), needle.as_deref())
            {
                continue;
            }
            let key = query.sort.value(&view, distance);
            hits.push((key, view));
        }
        Ok(hits)
    }

    /// The cells [`candidates`](Self::candidates) scans, or every stripe when
    /// there are too many to list.
    fn scan_cells(&self, region: &Region) -> CellSet<'_> {
        let keys = match region {
            Region::Radius { center, radius_m } => self.index.cells_for_radius_within(
                center,
                radius_m + self.drift_tolerance_m,
                CELL_STRIPES,
            ),
            Region::Box(b) => self
                .index
                .cells_for_box_within(&b.expanded_by_m(self.drift_tolerance_m), CELL_STRIPES),
        };
        match keys {
            Some(keys) => self.cell_locks.cells(&keys),
            None => self.cell_locks.everything(),
        }
    }

    fn page_limit(&self, page: &PageRequest) -> Result<usize> {
        let limit = page.limit.unwrap_or(self.config.default_page_size);
        if limit == 0 || limit > self.config.max_page_size {
            return Err(EstateError::InvalidQuery(format!(
                "page size {} must be between 1 and {}",
                limit, self.config.max_page_size
            )));
        }
        Ok(limit)
    }

    /// Index lookup widened by the drift tolerance. Exact region membership
    /// is decided later against the representative itself.
    fn candidates(&self, region: &Region) -> Result<Vec<ClusterId>> {
        match region {
            Region::Radius { center, radius_m } => self
                .index
                .query_radius(*center, radius_m + self.drift_tolerance_m),
            Region::Box(b) => {
                let wide = b.expanded_by_m(self.drift_tolerance_m);
                self.index.query_box(wide.min, wide.max)
            }
        }
    }

    /// Load an indexed cluster. A cluster that vanished from both store and
    /// index was rolled back concurrently and is skipped; one that is still
    /// indexed but missing from the store is a divergence.
    fn resolve(&self, id: ClusterId) -> Result<Option<Cluster>> {
        if let Some(cluster) = self.store.get(id)? {
            return Ok(Some(cluster));
        }
        if self.index.entries_for(id)?.is_empty() {
            return Ok(None);
        }
        error!(cluster_id = %id, "Indexed cluster missing from store");
        Err(EstateError::InternalInconsistency(format!(
            "cluster {} is indexed but missing from the store",
            id
        )))
    }
}

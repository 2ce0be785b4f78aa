use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EstateError, Result};
use crate::geo;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable identifier of a cluster.
///
/// Allocated sequentially by the cluster store, so the same serialized
/// ingestion sequence always produces the same identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// A WGS84 point in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(EstateError::InvalidLocation(format!(
                "latitude {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(EstateError::InvalidLocation(format!(
                "longitude {} outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        geo::haversine_m(self, other)
    }
}

/// An axis-aligned latitude/longitude box. Boxes never wrap the antimeridian.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: GeoPoint,
    pub max: GeoPoint,
}

impl BoundingBox {
    /// Build a box; `min` must not exceed `max` on either axis.
    pub fn new(min: GeoPoint, max: GeoPoint) -> Result<Self> {
        min.validate()
            .and_then(|_| max.validate())
            .map_err(|e| EstateError::InvalidQuery(format!("box corner: {}", e)))?;
        if min.lat > max.lat || min.lng > max.lng {
            return Err(EstateError::InvalidQuery(format!(
                "box min ({}, {}) exceeds max ({}, {})",
                min.lat, min.lng, max.lat, max.lng
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, p: &GeoPoint) -> bool {
        p.lat >= self.min.lat && p.lat <= self.max.lat && p.lng >= self.min.lng && p.lng <= self.max.lng
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min.lat + self.max.lat) / 2.0,
            lng: (self.min.lng + self.max.lng) / 2.0,
        }
    }

    /// Grow the box by `meters` on every side, clamped to the globe.
    pub fn expanded_by_m(&self, meters: f64) -> BoundingBox {
        if meters <= 0.0 {
            return *self;
        }
        let dlat = geo::meters_to_lat_deg(meters);
        let widest = self.min.lat.abs().max(self.max.lat.abs()) + dlat;
        let dlng = geo::meters_to_lng_deg(meters, widest).unwrap_or(360.0);
        BoundingBox {
            min: GeoPoint {
                lat: (self.min.lat - dlat).max(-90.0),
                lng: (self.min.lng - dlng).max(-180.0),
            },
            max: GeoPoint {
                lat: (self.max.lat + dlat).min(90.0),
                lng: (self.max.lng + dlng).min(180.0),
            },
        }
    }
}

// =============================================================================
// Listings
// =============================================================================

/// A listing exactly as harvested from a source.
///
/// Field names follow the upstream schema. `location_point` is
/// `[latitude, longitude]`; counts arrive as JSON numbers and must be integral.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub m2: f64,
    pub price: f64,
    pub rooms: f64,
    pub bathrooms: f64,
    pub location_point: Vec<f64>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub neighbourhood: String,
    pub link: String,
}

/// A free-text field kept in two forms: whitespace-collapsed for display and
/// lower-cased for comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedText {
    display: String,
    key: String,
}

impl NormalizedText {
    pub fn new(raw: &str) -> Self {
        let display = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let key = display.to_lowercase();
        Self { display, key }
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// One validated observation of a unit from one source.
///
/// Only the normalizer builds these; fields are read through accessors so an
/// instance can never be edited into an invalid state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub(crate) area_m2: f64,
    pub(crate) price: f64,
    pub(crate) rooms: u32,
    pub(crate) bathrooms: u32,
    pub(crate) location: GeoPoint,
    pub(crate) images: Vec<String>,
    pub(crate) address: NormalizedText,
    pub(crate) neighbourhood: NormalizedText,
    pub(crate) source_link: String,
    pub(crate) observed_at: DateTime<Utc>,
}

impl NormalizedListing {
    pub fn area_m2(&self) -> f64 {
        self.area_m2
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn rooms(&self) -> u32 {
        self.rooms
    }

    pub fn bathrooms(&self) -> u32 {
        self.bathrooms
    }

    pub fn location(&self) -> GeoPoint {
        self.location
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn address(&self) -> &NormalizedText {
        &self.address
    }

    pub fn neighbourhood(&self) -> &NormalizedText {
        &self.neighbourhood
    }

    pub fn source_link(&self) -> &str {
        &self.source_link
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Re-check the construction invariants, e.g. after deserializing a
    /// snapshot.
    pub fn check_invariants(&self) -> Result<()> {
        self.location.validate()?;
        if !(self.area_m2.is_finite() && self.area_m2 > 0.0) {
            return Err(EstateError::invalid_attribute("m2", "must be a positive number"));
        }
        if !(self.price.is_finite() && self.price >= 0.0) {
            return Err(EstateError::invalid_attribute("price", "must be non-negative"));
        }
        if self.source_link.trim().is_empty() {
            return Err(EstateError::invalid_attribute("link", "must not be empty"));
        }
        Ok(())
    }
}

// =============================================================================
// Clusters
// =============================================================================

/// The canonical record of one physical property.
///
/// Members are kept in join order. The representative is the member observed
/// most recently; ties go to the earliest joined member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    id: ClusterId,
    members: Vec<NormalizedListing>,
    representative: usize,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Cluster {
    /// A new cluster with `listing` as its sole member and representative.
    pub fn new(id: ClusterId, listing: NormalizedListing) -> Self {
        let at = listing.observed_at;
        Self {
            id,
            members: vec![listing],
            representative: 0,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn members(&self) -> &[NormalizedListing] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn representative(&self) -> &NormalizedListing {
        &self.members[self.representative]
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn source_links(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.source_link.as_str())
    }

    pub fn contains_source(&self, link: &str) -> bool {
        self.members.iter().any(|m| m.source_link == link)
    }

    /// Add `listing`, or replace the member with the same source link in
    /// place. Returns true when an existing member was replaced.
    pub fn upsert_member(&mut self, listing: NormalizedListing) -> bool {
        let observed = listing.observed_at;
        let replaced = match self
            .members
            .iter()
            .position(|m| m.source_link == listing.source_link)
        {
            Some(pos) => {
                self.members[pos] = listing;
                true
            }
            None => {
                self.members.push(listing);
                false
            }
        };
        if observed > self.updated_at {
            self.updated_at = observed;
        }
        self.rederive();
        replaced
    }

    /// Remove the member with `link`. The last member is never removed.
    pub fn remove_member(&mut self, link: &str) -> Option<NormalizedListing> {
        if self.members.len() <= 1 {
            return None;
        }
        let pos = self.members.iter().position(|m| m.source_link == link)?;
        let removed = self.members.remove(pos);
        self.rederive();
        Some(removed)
    }

    /// Recompute the representative index.
    pub fn rederive(&mut self) {
        let mut best = 0;
        for (i, member) in self.members.iter().enumerate().skip(1) {
            if member.observed_at > self.members[best].observed_at {
                best = i;
            }
        }
        self.representative = best;
    }

    /// Check that a cluster read from outside (a snapshot) is well formed:
    /// at least one member, valid members with distinct source links, and
    /// the representative the selection policy would pick.
    pub fn check_invariants(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(EstateError::InternalInconsistency(format!(
                "cluster {} has no members",
                self.id
            )));
        }
        let mut links = std::collections::HashSet::new();
        for member in &self.members {
            member.check_invariants()?;
            if !links.insert(member.source_link.as_str()) {
                return Err(EstateError::InternalInconsistency(format!(
                    "cluster {} lists source {} twice",
                    self.id, member.source_link
                )));
            }
        }
        let mut expected = self.clone();
        expected.rederive();
        if expected.representative != self.representative {
            return Err(EstateError::InternalInconsistency(format!(
                "cluster {} has representative {} but policy selects {}",
                self.id, self.representative, expected.representative
            )));
        }
        Ok(())
    }

    /// True when every member was observed more than `max_age` before `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.members.iter().all(|m| now - m.observed_at > max_age)
    }

    /// The display view of this cluster, optionally annotated with the
    /// distance to a query center.
    pub fn view(&self, distance_m: Option<f64>) -> ClusterView {
        let rep = self.representative();
        ClusterView {
            id: self.id,
            price: rep.price,
            area_m2: rep.area_m2,
            rooms: rep.rooms,
            bathrooms: rep.bathrooms,
            location: rep.location,
            address: rep.address.display().to_string(),
            neighbourhood: rep.neighbourhood.display().to_string(),
            images: rep.images.clone(),
            source_link: rep.source_link.clone(),
            member_count: self.members.len(),
            member_links: self.source_links().map(String::from).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            distance_m,
        }
    }
}

/// What queries return: representative attributes plus membership summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub id: ClusterId,
    pub price: f64,
    pub area_m2: f64,
    pub rooms: u32,
    pub bathrooms: u32,
    pub location: GeoPoint,
    pub address: String,
    pub neighbourhood: String,
    pub images: Vec<String>,
    pub source_link: String,
    pub member_count: usize,
    pub member_links: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(link: &str, secs: i64) -> NormalizedListing {
        NormalizedListing {
            area_m2: 80.0,
            price: 500_000.0,
            rooms: 2,
            bathrooms: 1,
            location: GeoPoint {
                lat: 40.7128,
                lng: -74.006,
            },
            images: vec![],
            address: NormalizedText::new("123 Main St"),
            neighbourhood: NormalizedText::new("Tribeca"),
            source_link: link.to_string(),
            observed_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(40.0, -74.0).is_ok());
        assert!(GeoPoint::new(90.0, 180.0).is_ok());
        assert!(matches!(
            GeoPoint::new(90.5, 0.0),
            Err(EstateError::InvalidLocation(_))
        ));
        assert!(matches!(
            GeoPoint::new(0.0, -180.1),
            Err(EstateError::InvalidLocation(_))
        ));
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_bounding_box_rejects_inverted_axes() {
        let a = GeoPoint::new(1.0, 1.0).unwrap();
        let b = GeoPoint::new(2.0, 0.0).unwrap();
        assert!(matches!(
            BoundingBox::new(a, b),
            Err(EstateError::InvalidQuery(_))
        ));
        let bbox = BoundingBox::new(GeoPoint::new(0.0, 0.0).unwrap(), a).unwrap();
        assert!(bbox.contains(&GeoPoint::new(0.5, 0.5).unwrap()));
        assert!(!bbox.contains(&GeoPoint::new(1.5, 0.5).unwrap()));
        assert_eq!(bbox.center(), GeoPoint { lat: 0.5, lng: 0.5 });
    }

    #[test]
    fn test_bounding_box_expansion_clamps() {
        let bbox = BoundingBox::new(
            GeoPoint::new(89.9999, 179.9999).unwrap(),
            GeoPoint::new(90.0, 180.0).unwrap(),
        )
        .unwrap();
        let grown = bbox.expanded_by_m(1_000.0);
        assert_eq!(grown.max.lat, 90.0);
        assert_eq!(grown.max.lng, 180.0);
        assert!(grown.min.lat < bbox.min.lat);
    }

    #[test]
    fn test_normalized_text_forms() {
        let text = NormalizedText::new("  123   Main\tStreet ");
        assert_eq!(text.display(), "123 Main Street");
        assert_eq!(text.key(), "123 main street");
        assert!(NormalizedText::new("   ").is_empty());
    }

    #[test]
    fn test_cluster_representative_prefers_most_recent() {
        let mut cluster = Cluster::new(ClusterId(1), listing("a", 100));
        cluster.upsert_member(listing("b", 200));
        assert_eq!(cluster.representative().source_link(), "b");
        assert_eq!(cluster.updated_at().timestamp(), 200);
        assert_eq!(cluster.created_at().timestamp(), 100);

        // Older observation joins: representative stays, updated_at stays.
        cluster.upsert_member(listing("c", 50));
        assert_eq!(cluster.representative().source_link(), "b");
        assert_eq!(cluster.updated_at().timestamp(), 200);
    }

    #[test]
    fn test_cluster_representative_tie_goes_to_first_member() {
        let mut cluster = Cluster::new(ClusterId(1), listing("a", 100));
        cluster.upsert_member(listing("b", 100));
        assert_eq!(cluster.representative().source_link(), "a");
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut cluster = Cluster::new(ClusterId(1), listing("a", 100));
        cluster.upsert_member(listing("b", 150));
        assert!(cluster.upsert_member(listing("a", 300)));
        assert_eq!(cluster.member_count(), 2);
        let links: Vec<&str> = cluster.source_links().collect();
        assert_eq!(links, vec!["a", "b"]);
        assert_eq!(cluster.representative().source_link(), "a");
    }

    #[test]
    fn test_remove_member_keeps_last() {
        let mut cluster = Cluster::new(ClusterId(1), listing("a", 100));
        assert!(cluster.remove_member("a").is_none());
        cluster.upsert_member(listing("b", 200));
        assert!(cluster.remove_member("b").is_some());
        assert_eq!(cluster.representative().source_link(), "a");
    }

    #[test]
    fn test_cluster_invariants_detect_bad_representative() {
        let mut cluster = Cluster::new(ClusterId(1), listing("a", 10));
        cluster.upsert_member(listing("b", 20));
        assert!(cluster.check_invariants().is_ok());
        cluster.representative = 0;
        assert!(cluster.check_invariants().is_err());
        cluster.representative = 5;
        assert!(cluster.check_invariants().is_err());
    }

    #[test]
    fn test_is_stale() {
        let cluster = Cluster::new(ClusterId(1), listing("a", 0));
        let now = Utc.timestamp_opt(10 * 86_400, 0).unwrap();
        assert!(cluster.is_stale(now, Duration::days(7)));
        assert!(!cluster.is_stale(now, Duration::days(30)));
    }

    #[test]
    fn test_view_carries_member_summary() {
        let mut cluster = Cluster::new(ClusterId(9), listing("a", 100));
        cluster.upsert_member(listing("b", 200));
        let view = cluster.view(Some(12.5));
        assert_eq!(view.id, ClusterId(9));
        assert_eq!(view.member_count, 2);
        assert_eq!(view.member_links, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(view.address, "123 Main St");
        assert_eq!(view.distance_m, Some(12.5));
    }

    #[test]
    fn test_raw_listing_deserializes_upstream_schema() {
        let json = r#"{
            "m2": 80, "price": 500000, "rooms": 2, "bathrooms": 1,
            "location_point": [40.7128, -74.006],
            "images": ["a.jpg"], "address": "123 Main St",
            "neighbourhood": "Tribeca", "link": "https://example.com/1"
        }"#;
        let raw: RawListing = serde_json::from_str(json).unwrap();
        assert_eq!(raw.m2, 80.0);
        assert_eq!(raw.location_point, vec![40.7128, -74.006]);
        assert_eq!(raw.link, "https://example.com/1");
    }
}

//! Pairwise similarity between a listing and a cluster representative.
//!
//! Four components, each bounded to [0, 1], combined by the configured
//! [`SimilarityWeights`]:
//! - address: Jaccard overlap of canonical address tokens
//! - area: relative agreement of floor areas
//! - price: relative agreement of prices
//! - rooms: mean of room-count and bathroom-count equality

use std::collections::BTreeSet;

use estate_core::config::SimilarityWeights;
use estate_core::types::{NormalizedListing, NormalizedText};

/// Component scores and their weighted total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub address: f64,
    pub area: f64,
    pub price: f64,
    pub rooms: f64,
    pub total: f64,
}

/// Score `listing` against `representative`.
pub fn score(
    listing: &NormalizedListing,
    representative: &NormalizedListing,
    weights: &SimilarityWeights,
) -> Similarity {
    let address = address_similarity(listing.address(), representative.address());
    let area = relative_agreement(listing.area_m2(), representative.area_m2());
    let price = relative_agreement(listing.price(), representative.price());
    let rooms = count_agreement(
        (listing.rooms(), listing.bathrooms()),
        (representative.rooms(), representative.bathrooms()),
    );
    let total = weights.address * address
        + weights.area * area
        + weights.price * price
        + weights.rooms * rooms;
    Similarity {
        address,
        area,
        price,
        rooms,
        total: total.clamp(0.0, 1.0),
    }
}

/// Jaccard similarity of the canonical token sets. An empty address on
/// either side carries no evidence and scores 0.
pub fn address_similarity(a: &NormalizedText, b: &NormalizedText) -> f64 {
    let ta = address_tokens(a.key());
    let tb = address_tokens(b.key());
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// `1 - |a - b| / max(a, b)`, so equal values score 1 and values an order of
/// magnitude apart score close to 0.
pub fn relative_agreement(a: f64, b: f64) -> f64 {
    if a == b {
        return 1.0;
    }
    let largest = a.abs().max(b.abs());
    (1.0 - (a - b).abs() / largest).clamp(0.0, 1.0)
}

/// Half a point for matching rooms, half for matching bathrooms.
pub fn count_agreement(a: (u32, u32), b: (u32, u32)) -> f64 {
    let rooms = if a.0 == b.0 { 0.5 } else { 0.0 };
    let baths = if a.1 == b.1 { 0.5 } else { 0.0 };
    rooms + baths
}

/// Split a lower-cased address into alphanumeric tokens, folding common
/// street-type and direction spellings onto one abbreviation.
fn address_tokens(key: &str) -> BTreeSet<&str> {
    key.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(canonical_token)
        .collect()
}

fn canonical_token(token: &str) -> &str {
    match token {
        "street" | "str" => "st",
        "avenue" | "av" => "ave",
        "road" => "rd",
        "boulevard" => "blvd",
        "drive" => "dr",
        "lane" => "ln",
        "court" => "ct",
        "place" => "pl",
        "square" => "sq",
        "apartment" | "unit" => "apt",
        "floor" => "fl",
        "north" => "n",
        "south" => "s",
        "east" => "e",
        "west" => "w",
        "calle" => "c",
        "avenida" => "ave",
        other => other,
    }
}

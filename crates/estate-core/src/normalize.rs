//! Raw listing validation and canonicalization.
//!
//! `normalize` is a pure function: it performs no I/O and touches no shared
//! state, so it can run on any thread ahead of the deduplicator.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::NormalizeConfig;
use crate::error::{EstateError, Result};
use crate::types::{GeoPoint, NormalizedListing, NormalizedText, RawListing};

/// Validate `raw` and convert it into a [`NormalizedListing`] observed at
/// `observed_at`.
///
/// Numeric fields out of range fail with `InvalidAttribute`; a malformed or
/// out-of-range point fails with `InvalidLocation`.
pub fn normalize(
    raw: &RawListing,
    observed_at: DateTime<Utc>,
    config: &NormalizeConfig,
) -> Result<NormalizedListing> {
    let area_m2 = check_area(raw.m2, config)?;
    let price = check_price(raw.price, config)?;
    let rooms = check_count("rooms", raw.rooms, config.max_rooms)?;
    let bathrooms = check_count("bathrooms", raw.bathrooms, config.max_bathrooms)?;
    let location = check_location(&raw.location_point, config.coordinate_precision)?;

    let source_link = raw.link.trim();
    if source_link.is_empty() {
        return Err(EstateError::invalid_attribute("link", "must not be empty"));
    }

    Ok(NormalizedListing {
        area_m2,
        price,
        rooms,
        bathrooms,
        location,
        images: dedup_images(&raw.images),
        address: NormalizedText::new(&raw.address),
        neighbourhood: NormalizedText::new(&raw.neighbourhood),
        source_link: source_link.to_string(),
        observed_at,
    })
}

fn check_area(m2: f64, config: &NormalizeConfig) -> Result<f64> {
    if !m2.is_finite() || m2 <= 0.0 {
        return Err(EstateError::invalid_attribute(
            "m2",
            format!("{} is not a positive number", m2),
        ));
    }
    if m2 >= config.max_area_m2 {
        return Err(EstateError::invalid_attribute(
            "m2",
            format!("{} exceeds the limit of {}", m2, config.max_area_m2),
        ));
    }
    Ok(m2)
}

fn check_price(price: f64, config: &NormalizeConfig) -> Result<f64> {
    if !price.is_finite() || price < 0.0 {
        return Err(EstateError::invalid_attribute(
            "price",
            format!("{} is not a non-negative number", price),
        ));
    }
    if price >= config.max_price {
        return Err(EstateError::invalid_attribute(
            "price",
            format!("{} exceeds the ceiling of {}", price, config.max_price),
        ));
    }
    Ok(price)
}

fn check_count(field: &str, value: f64, max: u32) -> Result<u32> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(EstateError::invalid_attribute(
            field,
            format!("{} is not a non-negative integer", value),
        ));
    }
    if value > f64::from(max) {
        return Err(EstateError::invalid_attribute(
            field,
            format!("{} exceeds the limit of {}", value, max),
        ));
    }
    Ok(value as u32)
}

fn check_location(point: &[f64], precision: u32) -> Result<GeoPoint> {
    let [lat, lng] = point else {
        return Err(EstateError::InvalidLocation(format!(
            "expected [latitude, longitude], got {} values",
            point.len()
        )));
    };
    GeoPoint::new(*lat, *lng)?;
    let scale = 10f64.powi(precision as i32);
    GeoPoint::new((lat * scale).round() / scale, (lng * scale).round() / scale)
}

/// Trim URLs, drop blanks and exact duplicates, keep first-seen order.
fn dedup_images(images: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    images
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty() && seen.insert(*url))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawListing {
        RawListing {
            m2: 80.0,
            price: 500_000.0,
            rooms: 2.0,
            bathrooms: 1.0,
            location_point: vec![40.712_812_345, -74.006_049_9],
            images: vec![
                "https://img/1.jpg".to_string(),
                " https://img/2.jpg ".to_string(),
                "https://img/1.jpg".to_string(),
                "".to_string(),
            ],
            address: "  123   Main St ".to_string(),
            neighbourhood: "TriBeCa".to_string(),
            link: " https://source-a/listing/1 ".to_string(),
        }
    }

    fn run(raw: &RawListing) -> Result<NormalizedListing> {
        normalize(raw, Utc::now(), &NormalizeConfig::default())
    }

    #[test]
    fn test_normalize_valid_listing() {
        let listing = run(&raw()).unwrap();
        assert_eq!(listing.area_m2(), 80.0);
        assert_eq!(listing.rooms(), 2);
        assert_eq!(listing.bathrooms(), 1);
        assert_eq!(listing.location().lat, 40.712812);
        assert_eq!(listing.location().lng, -74.00605);
        assert_eq!(listing.address().display(), "123 Main St");
        assert_eq!(listing.address().key(), "123 main st");
        assert_eq!(listing.neighbourhood().key(), "tribeca");
        assert_eq!(listing.source_link(), "https://source-a/listing/1");
    }

    #[test]
    fn test_images_deduplicated_in_order() {
        let listing = run(&raw()).unwrap();
        assert_eq!(
            listing.images(),
            &["https://img/1.jpg".to_string(), "https://img/2.jpg".to_string()]
        );
    }

    #[test]
    fn test_rejects_bad_area() {
        for m2 in [0.0, -5.0, f64::NAN, 100_000.0] {
            let mut r = raw();
            r.m2 = m2;
            let err = run(&r).unwrap_err();
            assert!(
                matches!(err, EstateError::InvalidAttribute { ref field, .. } if field == "m2"),
                "m2={} gave {:?}",
                m2,
                err
            );
        }
    }

    #[test]
    fn test_price_zero_allowed_ceiling_rejected() {
        let mut r = raw();
        r.price = 0.0;
        assert!(run(&r).is_ok());

        let config = NormalizeConfig {
            max_price: 1_000_000.0,
            ..NormalizeConfig::default()
        };
        r.price = 1_000_000.0;
        let err = normalize(&r, Utc::now(), &config).unwrap_err();
        assert!(matches!(err, EstateError::InvalidAttribute { ref field, .. } if field == "price"));
    }

    #[test]
    fn test_rejects_fractional_or_negative_counts() {
        let mut r = raw();
        r.rooms = 2.5;
        assert!(matches!(
            run(&r).unwrap_err(),
            EstateError::InvalidAttribute { ref field, .. } if field == "rooms"
        ));

        let mut r = raw();
        r.bathrooms = -1.0;
        assert!(matches!(
            run(&r).unwrap_err(),
            EstateError::InvalidAttribute { ref field, .. } if field == "bathrooms"
        ));
    }

    #[test]
    fn test_rejects_bad_location() {
        let cases = vec![
            vec![91.0, 0.0],
            vec![0.0, 181.0],
            vec![40.0],
            vec![40.0, -74.0, 10.0],
            vec![f64::INFINITY, 0.0],
        ];
        for point in cases {
            let mut r = raw();
            r.location_point = point.clone();
            assert!(
                matches!(run(&r).unwrap_err(), EstateError::InvalidLocation(_)),
                "point {:?}",
                point
            );
        }
    }

    #[test]
    fn test_rejects_blank_link() {
        let mut r = raw();
        r.link = "   ".to_string();
        assert!(matches!(
            run(&r).unwrap_err(),
            EstateError::InvalidAttribute { ref field, .. } if field == "link"
        ));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let at = Utc::now();
        let config = NormalizeConfig::default();
        assert_eq!(
            normalize(&raw(), at, &config).unwrap(),
            normalize(&raw(), at, &config).unwrap()
        );
    }
}

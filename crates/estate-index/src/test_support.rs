//! Fixtures shared by the unit tests.

use chrono::{TimeZone, Utc};

use estate_core::config::NormalizeConfig;
use estate_core::normalize::normalize;
use estate_core::types::{NormalizedListing, RawListing};

/// Builds listings through the real normalizer. Defaults describe
/// "123 Main St", 80 m², 500 000, 2 rooms, 1 bathroom, lower Manhattan.
pub struct ListingBuilder {
    raw: RawListing,
    observed_secs: i64,
}

impl ListingBuilder {
    pub fn new(link: &str) -> Self {
        Self {
            raw: RawListing {
                m2: 80.0,
                price: 500_000.0,
                rooms: 2.0,
                bathrooms: 1.0,
                location_point: vec![40.7128, -74.0060],
                images: vec![format!("https://img.example/{}.jpg", link)],
                address: "123 Main St".to_string(),
                neighbourhood: "Tribeca".to_string(),
                link: link.to_string(),
            },
            observed_secs: 1_700_000_000,
        }
    }

    pub fn at(mut self, lat: f64, lng: f64) -> Self {
        self.raw.location_point = vec![lat, lng];
        self
    }

    pub fn price(mut self, price: f64) -> Self {
        self.raw.price = price;
        self
    }

    pub fn area(mut self, m2: f64) -> Self {
        self.raw.m2 = m2;
        self
    }

    pub fn rooms(mut self, rooms: u32) -> Self {
        self.raw.rooms = f64::from(rooms);
        self
    }

    pub fn bathrooms(mut self, bathrooms: u32) -> Self {
        self.raw.bathrooms = f64::from(bathrooms);
        self
    }

    pub fn address(mut self, address: &str) -> Self {
        self.raw.address = address.to_string();
        self
    }

    pub fn neighbourhood(mut self, neighbourhood: &str) -> Self {
        self.raw.neighbourhood = neighbourhood.to_string();
        self
    }

    /// Seconds added to the default observation time.
    pub fn observed(mut self, offset_secs: i64) -> Self {
        self.observed_secs = 1_700_000_000 + offset_secs;
        self
    }

    pub fn build(self) -> NormalizedListing {
        let at = Utc.timestamp_opt(self.observed_secs, 0).unwrap();
        normalize(&self.raw, at, &NormalizeConfig::default()).unwrap()
    }
}

/// Default listing with a custom link, point, and observation offset.
pub fn listing_at(link: &str, lat: f64, lng: f64, offset_secs: i64) -> NormalizedListing {
    ListingBuilder::new(link)
        .at(lat, lng)
        .observed(offset_secs)
        .build()
}

/// Small deterministic xorshift generator for property-style tests.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_f64(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EstateError, Result};

/// Top-level configuration for the Estate engine.
///
/// Loaded from `~/.estate/config.toml` by default. Every tunable used by the
/// normalizer, the deduplicator, the spatial index, and the query engine lives
/// here; the engine itself carries no hidden defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstateConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl EstateConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EstateConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist, cannot be parsed, or fails validation.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.normalize.validate()?;
        self.dedup.validate()?;
        self.index.validate()?;
        self.query.validate()?;
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the snapshot database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.estate/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Plausibility bounds applied by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Exclusive upper bound on floor area in square meters.
    pub max_area_m2: f64,
    /// Exclusive upper bound on price, in the listing currency unit.
    pub max_price: f64,
    /// Inclusive upper bound on the room count.
    pub max_rooms: u32,
    /// Inclusive upper bound on the bathroom count.
    pub max_bathrooms: u32,
    /// Decimal places kept on latitude/longitude (6 is roughly 0.1 m).
    pub coordinate_precision: u32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_area_m2: 100_000.0,
            max_price: 10_000_000_000.0,
            max_rooms: 1_000,
            max_bathrooms: 1_000,
            coordinate_precision: 6,
        }
    }
}

impl NormalizeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_area_m2.is_finite() && self.max_area_m2 > 0.0) {
            return Err(EstateError::Config(
                "normalize.max_area_m2 must be a positive number".to_string(),
            ));
        }
        if !(self.max_price.is_finite() && self.max_price > 0.0) {
            return Err(EstateError::Config(
                "normalize.max_price must be a positive number".to_string(),
            ));
        }
        if self.coordinate_precision > 12 {
            return Err(EstateError::Config(
                "normalize.coordinate_precision must be at most 12".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum distance in meters between two listings of the same unit.
    pub blocking_radius_m: f64,
    /// Minimum similarity score (inclusive) for a merge.
    pub merge_threshold: f64,
    /// Representative moves shorter than this many meters do not rewrite the
    /// spatial index entry.
    pub drift_tolerance_m: f64,
    /// Weights of the similarity components.
    #[serde(default)]
    pub weights: SimilarityWeights,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            blocking_radius_m: 75.0,
            merge_threshold: 0.8,
            drift_tolerance_m: 5.0,
            weights: SimilarityWeights::default(),
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.blocking_radius_m.is_finite() && self.blocking_radius_m > 0.0) {
            return Err(EstateError::Config(
                "dedup.blocking_radius_m must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.merge_threshold) {
            return Err(EstateError::Config(
                "dedup.merge_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(self.drift_tolerance_m.is_finite() && self.drift_tolerance_m >= 0.0) {
            return Err(EstateError::Config(
                "dedup.drift_tolerance_m must be non-negative".to_string(),
            ));
        }
        self.weights.validate()
    }
}

/// Weights of the four similarity components. They must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    /// Normalized address token overlap.
    pub address: f64,
    /// Relative floor-area agreement.
    pub area: f64,
    /// Relative price agreement.
    pub price: f64,
    /// Room and bathroom count equality.
    pub rooms: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            address: 0.4,
            area: 0.2,
            price: 0.2,
            rooms: 0.2,
        }
    }
}

impl SimilarityWeights {
    /// Tolerance on the sum of the weights.
    pub const SUM_TOLERANCE: f64 = 1e-9;

    pub fn validate(&self) -> Result<()> {
        let parts = [self.address, self.area, self.price, self.rooms];
        if parts.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(EstateError::Config(
                "dedup.weights must each be within [0, 1]".to_string(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > Self::SUM_TOLERANCE {
            return Err(EstateError::Config(format!(
                "dedup.weights must sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// Spatial index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Edge length of a grid cell in degrees (0.01 is about 1.1 km of latitude).
    pub cell_size_deg: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            cell_size_deg: 0.01,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.cell_size_deg.is_finite() && self.cell_size_deg > 0.0 && self.cell_size_deg <= 90.0)
        {
            return Err(EstateError::Config(
                "index.cell_size_deg must be within (0, 90]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Query engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size used when the caller gives none.
    pub default_page_size: usize,
    /// Largest page size a caller may request.
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 200,
        }
    }
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(EstateError::Config(
                "query.default_page_size must be within [1, max_page_size]".to_string(),
            ));
        }
        Ok(())
    }
}

//! CLI argument definitions for the Estate application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use estate_core::types::{BoundingBox, GeoPoint};
use estate_index::{Filters, Region, SortKey};

/// Estate — deduplicates property listings from many sources into one
/// searchable inventory.
#[derive(Parser, Debug)]
#[command(name = "estate", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the snapshot database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest raw listings from a JSON-lines file and save a snapshot.
    Ingest(IngestArgs),
    /// Query the latest snapshot by region and attributes.
    Query(QueryArgs),
    /// Write the latest snapshot to a JSON file.
    Export {
        /// Destination file.
        file: PathBuf,
    },
    /// Validate a snapshot JSON file and store it as the latest snapshot.
    Import {
        /// Snapshot file produced by `export`.
        file: PathBuf,
    },
    /// Print inventory counters and stored snapshots.
    Stats,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON-lines file, one raw listing per line.
    pub file: PathBuf,

    /// Ingestion threads. Output is deterministic only with one.
    #[arg(short = 'w', long = "workers", default_value_t = 1)]
    pub workers: usize,

    /// Snapshots to keep after saving the new one.
    #[arg(long = "keep-snapshots", default_value_t = 10)]
    pub keep_snapshots: usize,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Bounding box as minLat,minLng,maxLat,maxLng.
    #[arg(long = "bbox", value_parser = parse_bbox, conflicts_with_all = ["near", "radius"])]
    pub bbox: Option<BoundingBox>,

    /// Query center as lat,lng (requires --radius).
    #[arg(long = "near", value_parser = parse_point, requires = "radius")]
    pub near: Option<GeoPoint>,

    /// Radius in meters around --near.
    #[arg(long = "radius", requires = "near")]
    pub radius: Option<f64>,

    #[arg(long = "min-price")]
    pub min_price: Option<f64>,
    #[arg(long = "max-price")]
    pub max_price: Option<f64>,
    #[arg(long = "min-area")]
    pub min_area: Option<f64>,
    #[arg(long = "max-area")]
    pub max_area: Option<f64>,
    #[arg(long = "min-rooms")]
    pub min_rooms: Option<u32>,
    #[arg(long = "max-rooms")]
    pub max_rooms: Option<u32>,
    #[arg(long = "min-bathrooms")]
    pub min_bathrooms: Option<u32>,
    #[arg(long = "max-bathrooms")]
    pub max_bathrooms: Option<u32>,

    /// Substring of the neighbourhood name.
    #[arg(long = "neighbourhood")]
    pub neighbourhood: Option<String>,

    /// distance, price_asc, price_desc, area_asc or area_desc.
    #[arg(long = "sort", value_parser = parse_sort, default_value = "distance")]
    pub sort: SortKey,

    /// Page size (defaults to the configured page size).
    #[arg(long = "limit")]
    pub limit: Option<usize>,

    /// Continuation token from a previous page.
    #[arg(long = "cursor")]
    pub cursor: Option<String>,

    /// Give up after this many milliseconds.
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

impl QueryArgs {
    /// The query region, or an error message when none was given.
    pub fn region(&self) -> Result<Region, String> {
        match (self.bbox, self.near, self.radius) {
            (Some(b), _, _) => Ok(Region::Box(b)),
            (None, Some(center), Some(radius_m)) => Ok(Region::Radius { center, radius_m }),
            _ => Err("a region is required: --bbox or --near with --radius".to_string()),
        }
    }

    pub fn filters(&self) -> Filters {
        Filters {
            min_price: self.min_price,
            max_price: self.max_price,
            min_area_m2: self.min_area,
            max_area_m2: self.max_area,
            min_rooms: self.min_rooms,
            max_rooms: self.max_rooms,
            min_bathrooms: self.min_bathrooms,
            max_bathrooms: self.max_bathrooms,
            neighbourhood: self.neighbourhood.clone(),
        }
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > ESTATE_CONFIG env var > platform default (~/.estate/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("ESTATE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Priority: --data-dir flag > config file value.
    /// Returns `None` if not overridden (use config default).
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    /// Returns `None` if not overridden.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".estate").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".estate").join("config.toml");
    }
    PathBuf::from("config.toml")
}

fn parse_numbers<const N: usize>(s: &str) -> Result<[f64; N], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(format!("expected {} comma-separated numbers, got {:?}", N, s));
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part
            .parse()
            .map_err(|e| format!("invalid number {:?}: {}", part, e))?;
    }
    Ok(out)
}

fn parse_point(s: &str) -> Result<GeoPoint, String> {
    let [lat, lng] = parse_numbers::<2>(s)?;
    GeoPoint::new(lat, lng).map_err(|e| e.to_string())
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let [min_lat, min_lng, max_lat, max_lng] = parse_numbers::<4>(s)?;
    let min = GeoPoint::new(min_lat, min_lng).map_err(|e| e.to_string())?;
    let max = GeoPoint::new(max_lat, max_lng).map_err(|e| e.to_string())?;
    BoundingBox::new(min, max).map_err(|e| e.to_string())
}

fn parse_sort(s: &str) -> Result<SortKey, String> {
    s.parse::<SortKey>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("estate").chain(args.iter().copied()))
    }

    #[test]
    fn test_ingest_with_global_flags() {
        let cli = parse(&["ingest", "listings.jsonl", "--workers", "4", "-d", "/tmp/estate"]).unwrap();
        assert_eq!(cli.resolve_data_dir().as_deref(), Some("/tmp/estate"));
        match cli.command {
            Command::Ingest(args) => {
                assert_eq!(args.file, PathBuf::from("listings.jsonl"));
                assert_eq!(args.workers, 4);
                assert_eq!(args.keep_snapshots, 10);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_query_radius_region_and_filters() {
        let cli = parse(&[
            "query",
            "--near",
            "40.7128,-74.006",
            "--radius",
            "500",
            "--min-rooms",
            "2",
            "--sort",
            "price_desc",
        ])
        .unwrap();
        let Command::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert_eq!(
            args.region().unwrap(),
            Region::Radius {
                center: GeoPoint::new(40.7128, -74.006).unwrap(),
                radius_m: 500.0,
            }
        );
        assert_eq!(args.filters().min_rooms, Some(2));
        assert_eq!(args.sort, SortKey::PriceDesc);
    }

    #[test]
    fn test_query_bbox_parsing() {
        let cli = parse(&["query", "--bbox", "40.70,-74.02,40.72,-74.00"]).unwrap();
        let Command::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert!(matches!(args.region().unwrap(), Region::Box(_)));
        assert_eq!(args.sort, SortKey::Distance);

        assert!(parse(&["query", "--bbox", "40.72,-74.02,40.70,-74.00"]).is_err());
        assert!(parse(&["query", "--bbox", "1,2,3"]).is_err());
        assert!(parse(&["query", "--near", "95,0", "--radius", "10"]).is_err());
        assert!(parse(&["query", "--near", "40,-74"]).is_err());
    }

    #[test]
    fn test_query_without_region_is_reported() {
        let cli = parse(&["query"]).unwrap();
        let Command::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert!(args.region().is_err());
    }

    #[test]
    fn test_config_flag_wins() {
        let cli = parse(&["-c", "/etc/estate.toml", "stats"]).unwrap();
        assert_eq!(cli.resolve_config_path(), PathBuf::from("/etc/estate.toml"));
    }
}

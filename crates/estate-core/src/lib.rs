//! Estate Core crate - shared data model, configuration, errors, geometry,
//! and listing normalization.

pub mod config;
pub mod error;
pub mod geo;
pub mod normalize;
pub mod types;

pub use config::EstateConfig;
pub use error::{EstateError, Result};
pub use normalize::normalize;
pub use types::*;

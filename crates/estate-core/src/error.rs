use thiserror::Error;

/// Top-level error type for the Estate engine.
///
/// Validation failures (`InvalidAttribute`, `InvalidLocation`, `InvalidQuery`)
/// are rejected synchronously with no partial effect. `InternalInconsistency`
/// signals that the spatial index and the cluster store have diverged and must
/// never be swallowed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EstateError {
    #[error("Invalid attribute `{field}`: {reason}")]
    InvalidAttribute { field: String, reason: String },

    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EstateError {
    /// Shorthand for an [`EstateError::InvalidAttribute`].
    pub fn invalid_attribute(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EstateError::InvalidAttribute {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Errors after which the in-memory state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EstateError::InternalInconsistency(_))
    }

    /// Map a poisoned lock into an inconsistency error.
    pub fn poisoned<E: std::fmt::Display>(what: &str, err: E) -> Self {
        EstateError::InternalInconsistency(format!("{} lock poisoned: {}", what, err))
    }
}

impl From<toml::de::Error> for EstateError {
    fn from(err: toml::de::Error) -> Self {
        EstateError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for EstateError {
    fn from(err: toml::ser::Error) -> Self {
        EstateError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for EstateError {
    fn from(err: serde_json::Error) -> Self {
        EstateError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Estate operations.
pub type Result<T> = std::result::Result<T, EstateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EstateError::invalid_attribute("m2", "must be positive");
        assert_eq!(err.to_string(), "Invalid attribute `m2`: must be positive");
    }

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(EstateError, &str)> = vec![
            (
                EstateError::InvalidLocation("latitude 91".to_string()),
                "Invalid location: latitude 91",
            ),
            (
                EstateError::InvalidQuery("radius must be positive".to_string()),
                "Invalid query: radius must be positive",
            ),
            (EstateError::DeadlineExceeded, "Deadline exceeded"),
            (
                EstateError::InternalInconsistency("cluster 7 missing".to_string()),
                "Internal inconsistency: cluster 7 missing",
            ),
            (
                EstateError::Config("bad key".to_string()),
                "Configuration error: bad key",
            ),
            (
                EstateError::Storage("disk full".to_string()),
                "Storage error: disk full",
            ),
            (
                EstateError::Serialization("invalid json".to_string()),
                "Serialization error: invalid json",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_only_inconsistency_is_fatal() {
        assert!(EstateError::InternalInconsistency("x".into()).is_fatal());
        assert!(!EstateError::DeadlineExceeded.is_fatal());
        assert!(!EstateError::InvalidQuery("x".into()).is_fatal());
    }

    #[test]
    fn test_poisoned_maps_to_inconsistency() {
        let err = EstateError::poisoned("cluster store", "boom");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cluster store lock poisoned"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EstateError = io_err.into();
        assert!(matches!(err, EstateError::Io(_)));
        assert!(err.to_string().starts_with("I/O error:"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let estate_err: EstateError = err.unwrap_err().into();
        assert!(matches!(estate_err, EstateError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let estate_err: EstateError = err.unwrap_err().into();
        assert!(matches!(estate_err, EstateError::Serialization(_)));
    }
}

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for docucache
#[derive(Error, Debug)]
pub enum DocCacheError {
    /// Vector length differs from the configured dimensionality
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Stored vector bytes could not be decoded by any known layout
    #[error("Corrupt vector: {0}")]
    CorruptVector(String),

    /// Stored record is missing fields required to interpret it
    #[error("Corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// Backing store unreachable or failing
    #[error("Store unavailable ({backend}): {message}")]
    StoreUnavailable { backend: String, message: String },

    /// Vector index missing or unsupported by the engine
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// Vector index exists but the query against it failed
    #[error("Index query failed on '{index}': {message}")]
    IndexQueryFailed { index: String, message: String },

    /// Embedding collaborator failed
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A store or embedding call exceeded its deadline
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Rejected search request
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DocCacheError {
    pub fn store(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// True for failures of the backing store itself (unreachable or timed out),
    /// as opposed to bad input or unreadable individual records.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<rusqlite::Error> for DocCacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::store("sqlite", e.to_string())
    }
}

impl From<r2d2::Error> for DocCacheError {
    fn from(e: r2d2::Error) -> Self {
        Self::store("sqlite", format!("connection pool: {}", e))
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for docucache operations
pub type Result<T> = std::result::Result<T, DocCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        assert!(DocCacheError::store("sqlite", "gone").is_store_failure());
        assert!(DocCacheError::Timeout {
            operation: "get".to_string(),
            timeout_ms: 10
        }
        .is_store_failure());
        assert!(!DocCacheError::CorruptVector("short".to_string()).is_store_failure());
        assert!(!DocCacheError::IndexUnavailable("none".to_string()).is_timeout());
    }

    #[test]
    fn test_rusqlite_error_maps_to_store_unavailable() {
        let err: DocCacheError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, DocCacheError::StoreUnavailable { .. }));
    }
}

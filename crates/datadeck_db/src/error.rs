//! Error types for the catalog layer.

use thiserror::Error;

use crate::backend::BackendError;

/// Catalog operation result type.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Catalog errors.
///
/// Validation variants are raised before anything is written, so a caller
/// seeing one of them can assume the catalog was left untouched.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Malformed input (table name, `etc` payload, definition document)
    #[error("Validation error: {0}")]
    Validation(String),

    /// `external_type` has no registered payload shape
    #[error("Unknown external type: {0}")]
    UnknownExternalType(String),

    /// Cluster missing from the cluster registry
    #[error("Cluster '{0}' is not registered")]
    UnknownCluster(String),

    /// Database missing from a registered cluster
    #[error("Database '{database}' is not registered for cluster '{cluster}'")]
    UnknownDatabase { cluster: String, database: String },

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Embedded store error (connection, query, conflict, ...)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// External cluster error (connection, query, decode)
    #[error("External query error: {0}")]
    External(#[from] sqlx::Error),

    /// Post-process expression rejected or failed
    #[error("Post-process error: {0}")]
    PostProcess(String),

    /// Blocking task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True for errors raised by boundary validation (schema or registry).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownExternalType(_)
                | Self::UnknownCluster(_)
                | Self::UnknownDatabase { .. }
        )
    }
}

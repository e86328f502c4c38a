// galena-core/src/error.rs
// Crate-wide error type. One enum, one variant per failure kind the
// collection layer can surface to a caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GalenaError>;

#[derive(Error, Debug)]
pub enum GalenaError {
    #[error("namespace does not exist: {0}")]
    NamespaceMissing(String),

    #[error("namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("invalid collection options: {0}")]
    InvalidOptions(String),

    #[error("invalid primary key field '{field}': {reason}")]
    InvalidPKField { field: String, reason: String },

    #[error("update would change the primary key of {ns}")]
    PKChanged { ns: String },

    #[error("duplicate key in index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    #[error("cannot have more than {max} indexes on {ns}")]
    TooManyIndexes { ns: String, max: usize },

    #[error("an index build is already in progress on {0}")]
    IndexBuildInProgress(String),

    #[error("namespace {0} is being bulk loaded by another connection")]
    BulkLoadConflict(String),

    #[error("capped collection {ns}: {reason}")]
    CappedSizeViolation { ns: String, reason: String },

    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("cannot modify system namespace {0}")]
    SystemNamespaceProtected(String),

    #[error("index build failed on {ns}: {reason}")]
    IndexBuildFailed { ns: String, reason: String },

    #[error("storage engine error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GalenaError {
    fn from(e: serde_json::Error) -> Self {
        GalenaError::Serialization(e.to_string())
    }
}

//! Error types for the keyflag storage collaborators.

use keyflag_core::RecordId;
use thiserror::Error;

/// Result type alias for key store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during key store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness constraint: one open proposal per key path.
    #[error("key {key} already has open proposal {holder}")]
    ProposalConflict { key: String, holder: RecordId },
}

/// Errors from a [`ValueCache`](crate::ValueCache) backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache lock poisoned")]
    Poisoned,
}

/// Errors from a [`DeploymentRegistry`](crate::DeploymentRegistry) backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Store(#[from] StateError),
}

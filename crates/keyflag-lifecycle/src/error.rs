//! Error taxonomy of the lifecycle engine.

use keyflag_core::PathError;
use keyflag_state::{CacheError, RegistryError, StateError};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An open proposal or canary blocks the requested transition.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// More rows than an invariant allows. The operation was aborted.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage failure: {0}")]
    Storage(StateError),

    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),

    #[error("registry failure: {0}")]
    Registry(#[from] RegistryError),
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::ProposalConflict { key, holder } => {
                EngineError::Conflict(format!("{key}: pending approval exists (record {holder})"))
            }
            other => EngineError::Storage(other),
        }
    }
}

impl From<PathError> for EngineError {
    fn from(err: PathError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}

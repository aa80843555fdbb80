use thiserror::Error;

/// Errors from repository operations (used by trait definitions in stepchain-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised while building a step registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a step registry needs at least one step")]
    Empty,

    #[error("step '{0}' is registered twice")]
    DuplicateStep(String),
}

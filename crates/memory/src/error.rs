use thiserror::Error;

use crate::schema::RecordId;

/// Error taxonomy for the memory subsystem.
///
/// `BackendUnavailable` is kept distinct from `NotFound` so callers never
/// mistake a transient store outage for permanent absence; retry policy is
/// the caller's.  Realm and validation errors always surface synchronously.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("record {0} is already consolidated")]
    AlreadyConsolidated(RecordId),

    #[error("cannot consolidate record {0} with itself")]
    SameRecord(RecordId),

    #[error("memory backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl MemoryError {
    /// Wrap a collaborator failure from the vector-store boundary.
    pub fn backend(err: anyhow::Error) -> Self {
        Self::BackendUnavailable(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

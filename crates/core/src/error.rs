use std::time::Duration;

use crate::job::JobStatus;
use crate::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    /// Lost an optimistic-concurrency race. Re-read and retry the
    /// read-modify-write.
    #[error("Version conflict on job {id}: expected version {expected}")]
    VersionConflict { id: JobId, expected: i64 },

    /// Durable store or filesystem failure that survived local retries.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Artifact for job {id} is not ready (status: {status})")]
    NotReady { id: JobId, status: JobStatus },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// A transition was requested that the state machine forbids from the
    /// stored status. Always a programming error in the caller.
    #[error("Invalid transition: {transition} is not allowed from {from}")]
    InvalidTransition {
        from: JobStatus,
        transition: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn job_not_found(id: JobId) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.to_string(),
        }
    }

    /// Whether this error means "someone else changed the record first".
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

//! Durable job record storage.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::job::{Job, JobStatus, JobTransition};
use crate::params::SubmitJob;
use crate::types::JobId;

/// The single source of truth for job state.
///
/// `compare_and_swap` is the only write path after `create`. Implementations
/// must compute the successor record with [`Job::apply`] and persist it only
/// if the stored version still equals `expected_version`.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new `Pending` job at version 0.
    async fn create(&self, input: &SubmitJob) -> Result<Job, CoreError>;

    /// Fetch a job, or [`CoreError::NotFound`].
    async fn get(&self, id: JobId) -> Result<Job, CoreError>;

    /// Apply `transition` iff the stored version equals `expected_version`.
    ///
    /// Errors:
    /// - [`CoreError::NotFound`] if the job does not exist.
    /// - [`CoreError::VersionConflict`] if the version moved on; the stored
    ///   record is left untouched.
    /// - [`CoreError::InvalidTransition`] if the versions match but the
    ///   state machine forbids the move.
    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: i64,
        transition: JobTransition,
    ) -> Result<Job, CoreError>;

    /// All jobs in `status`, oldest `created_at` first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, CoreError>;
}

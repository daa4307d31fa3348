//! Mapping between [`JobStatus`] and the `job_statuses` lookup table.
//!
//! Each ID matches the seed data order (1-based) in the migration.

use diffuse_core::error::CoreError;
use diffuse_core::job::JobStatus;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

pub const STATUS_PENDING: StatusId = 1;
pub const STATUS_RUNNING: StatusId = 2;
pub const STATUS_SUCCEEDED: StatusId = 3;
pub const STATUS_FAILED: StatusId = 4;
pub const STATUS_CANCELLED: StatusId = 5;

/// Return the database status ID.
pub fn status_id(status: JobStatus) -> StatusId {
    match status {
        JobStatus::Pending => STATUS_PENDING,
        JobStatus::Running => STATUS_RUNNING,
        JobStatus::Succeeded => STATUS_SUCCEEDED,
        JobStatus::Failed => STATUS_FAILED,
        JobStatus::Cancelled => STATUS_CANCELLED,
    }
}

/// Parse a status ID read from the database.
pub fn status_from_id(id: StatusId) -> Result<JobStatus, CoreError> {
    match id {
        STATUS_PENDING => Ok(JobStatus::Pending),
        STATUS_RUNNING => Ok(JobStatus::Running),
        STATUS_SUCCEEDED => Ok(JobStatus::Succeeded),
        STATUS_FAILED => Ok(JobStatus::Failed),
        STATUS_CANCELLED => Ok(JobStatus::Cancelled),
        other => Err(CoreError::Internal(format!(
            "Unknown job status id {other} in database"
        ))),
    }
}

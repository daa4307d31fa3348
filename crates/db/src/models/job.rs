//! Row model for the `generation_jobs` table.

use diffuse_core::artifact::ArtifactRef;
use diffuse_core::error::CoreError;
use diffuse_core::job::{Job, JobError, JobErrorKind};
use diffuse_core::types::{JobId, Timestamp};
use sqlx::FromRow;

use super::status::{status_from_id, StatusId};

/// A row from the `generation_jobs` table.
///
/// Flat mirror of [`Job`]; the artifact and error columns are folded back
/// into their optional structs by the `TryFrom` impl.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: JobId,
    pub status_id: StatusId,
    pub request_params: serde_json::Value,
    pub artifact_hash: Option<String>,
    pub artifact_size_bytes: Option<i64>,
    pub artifact_media_type: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attempt_count: i32,
    pub timeout_secs: Option<i32>,
    pub not_before: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub version: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let request_params = serde_json::from_value(row.request_params).map_err(|e| {
            CoreError::Internal(format!("Job {} has unreadable request_params: {e}", row.id))
        })?;

        let artifact_ref = match (row.artifact_hash, row.artifact_size_bytes, row.artifact_media_type) {
            (Some(content_hash), Some(size_bytes), Some(media_type)) => Some(ArtifactRef {
                content_hash,
                size_bytes,
                media_type,
            }),
            (None, None, None) => None,
            _ => {
                return Err(CoreError::Internal(format!(
                    "Job {} has partially populated artifact columns",
                    row.id
                )))
            }
        };

        let error_info = match (row.error_kind, row.error_message) {
            (Some(kind), Some(message)) => Some(JobError {
                kind: kind.parse::<JobErrorKind>()?,
                message,
            }),
            (None, None) => None,
            _ => {
                return Err(CoreError::Internal(format!(
                    "Job {} has partially populated error columns",
                    row.id
                )))
            }
        };

        Ok(Job {
            id: row.id,
            status: status_from_id(row.status_id)?,
            request_params,
            artifact_ref,
            error_info,
            attempt_count: row.attempt_count,
            timeout_secs: row.timeout_secs,
            not_before: row.not_before,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

//! PostgreSQL repository for the `generation_jobs` table.
//!
//! Optimistic concurrency is enforced by the `version` column: every write
//! is an `UPDATE ... WHERE id = $1 AND version = $2`, so a writer holding a
//! stale copy affects zero rows and gets [`CoreError::VersionConflict`].
//! No row locks are held between reading a job and writing it back.

use async_trait::async_trait;
use chrono::Utc;
use diffuse_core::error::CoreError;
use diffuse_core::job::{Job, JobStatus, JobTransition};
use diffuse_core::params::SubmitJob;
use diffuse_core::repository::JobRepository;
use diffuse_core::retry::{retry_transient, BackoffPolicy, DEFAULT_STORE_TRIES};
use diffuse_core::types::JobId;
use sqlx::PgPool;

use crate::models::job::JobRow;
use crate::models::status::status_id;

/// Column list for `generation_jobs` queries.
const COLUMNS: &str = "\
    id, status_id, request_params, \
    artifact_hash, artifact_size_bytes, artifact_media_type, \
    error_kind, error_message, attempt_count, timeout_secs, \
    not_before, started_at, completed_at, created_at, updated_at, version";

/// Job repository backed by PostgreSQL.
#[derive(Clone)]
pub struct PgJobRepo {
    pool: PgPool,
    backoff: BackoffPolicy,
    max_tries: u32,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::for_store(),
            max_tries: DEFAULT_STORE_TRIES,
        }
    }

    /// Override how transient database errors are retried.
    pub fn with_retry(mut self, backoff: BackoffPolicy, max_tries: u32) -> Self {
        self.backoff = backoff;
        self.max_tries = max_tries.max(1);
        self
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, CoreError> {
        let query = format!("SELECT {COLUMNS} FROM generation_jobs WHERE id = $1");
        let (pool, query) = (&self.pool, query.as_str());
        let row = retry_transient(&self.backoff, self.max_tries, is_transient, || async move {
            sqlx::query_as::<_, JobRow>(query)
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await
        .map_err(storage_error)?;

        row.map(Job::try_from).transpose()
    }

    /// Persist `next` iff the stored row is still at `expected_version`.
    ///
    /// Returns `None` when no row matched (version moved on or row missing).
    async fn write_if_version(
        &self,
        next: &Job,
        expected_version: i64,
    ) -> Result<Option<Job>, CoreError> {
        let query = format!(
            "UPDATE generation_jobs SET \
                 status_id = $3, \
                 artifact_hash = $4, artifact_size_bytes = $5, artifact_media_type = $6, \
                 error_kind = $7, error_message = $8, \
                 attempt_count = $9, not_before = $10, \
                 started_at = $11, completed_at = $12, \
                 updated_at = $13, version = $14 \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        let (pool, query) = (&self.pool, query.as_str());
        let artifact = next.artifact_ref.as_ref();
        let error = next.error_info.as_ref();

        let row = retry_transient(&self.backoff, self.max_tries, is_retryable_write, || async move {
            sqlx::query_as::<_, JobRow>(query)
                .bind(next.id)
                .bind(expected_version)
                .bind(status_id(next.status))
                .bind(artifact.map(|a| a.content_hash.as_str()))
                .bind(artifact.map(|a| a.size_bytes))
                .bind(artifact.map(|a| a.media_type.as_str()))
                .bind(error.map(|e| e.kind.as_str()))
                .bind(error.map(|e| e.message.as_str()))
                .bind(next.attempt_count)
                .bind(next.not_before)
                .bind(next.started_at)
                .bind(next.completed_at)
                .bind(next.updated_at)
                .bind(next.version)
                .fetch_optional(pool)
                .await
        })
        .await
        .map_err(storage_error)?;

        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobRepository for PgJobRepo {
    async fn create(&self, input: &SubmitJob) -> Result<Job, CoreError> {
        let job = Job::new(input, Utc::now());
        let params = serde_json::to_value(&job.request_params)
            .map_err(|e| CoreError::Internal(format!("Failed to encode request params: {e}")))?;

        let query = format!(
            "INSERT INTO generation_jobs \
                 (id, status_id, request_params, attempt_count, timeout_secs, \
                  created_at, updated_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        let (pool, query, job_ref, params) = (&self.pool, query.as_str(), &job, &params);

        let row = retry_transient(&self.backoff, self.max_tries, is_retryable_write, || async move {
            sqlx::query_as::<_, JobRow>(query)
                .bind(job_ref.id)
                .bind(status_id(job_ref.status))
                .bind(params)
                .bind(job_ref.attempt_count)
                .bind(job_ref.timeout_secs)
                .bind(job_ref.created_at)
                .bind(job_ref.updated_at)
                .bind(job_ref.version)
                .fetch_one(pool)
                .await
        })
        .await
        .map_err(storage_error)?;

        let created = Job::try_from(row)?;
        tracing::debug!(job_id = %created.id, "Job created");
        Ok(created)
    }

    async fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(id))
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: i64,
        transition: JobTransition,
    ) -> Result<Job, CoreError> {
        let current = self.get(id).await?;
        if current.version != expected_version {
            return Err(CoreError::VersionConflict {
                id,
                expected: expected_version,
            });
        }

        let next = current.apply(&transition, Utc::now())?;
        match self.write_if_version(&next, expected_version).await? {
            Some(job) => Ok(job),
            // Someone wrote between our read and our update.
            None => match self.find_by_id(id).await? {
                Some(_) => Err(CoreError::VersionConflict {
                    id,
                    expected: expected_version,
                }),
                None => Err(CoreError::job_not_found(id)),
            },
        }
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, CoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_jobs \
             WHERE status_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let (pool, query) = (&self.pool, query.as_str());
        let rows = retry_transient(&self.backoff, self.max_tries, is_transient, || async move {
            sqlx::query_as::<_, JobRow>(query)
                .bind(status_id(status))
                .fetch_all(pool)
                .await
        })
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(Job::try_from).collect()
    }
}

/// Errors worth retrying locally: dropped connections, pool exhaustion,
/// serialization failures and deadlocks.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

/// Errors after which a write is known not to have committed. A dropped
/// connection may have lost the reply to a committed write, so it is
/// surfaced instead of replayed.
fn is_retryable_write(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

fn storage_error(err: sqlx::Error) -> CoreError {
    tracing::error!(error = %err, "Job repository query failed");
    CoreError::Storage(err.to_string())
}

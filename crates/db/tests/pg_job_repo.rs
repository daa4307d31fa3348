//! Integration tests for `PgJobRepo` against a real database.
//!
//! Exercises the compare-and-swap write path and the table constraints:
//! - Version increments and stale-version rejection
//! - Concurrent claim races
//! - FIFO listing
//! - CHECK constraints mirroring the job invariants
//!
//! Require `DATABASE_URL`; run with `cargo test -p diffuse-db -- --ignored`.

use std::sync::Arc;

use assert_matches::assert_matches;
use diffuse_core::artifact::ArtifactRef;
use diffuse_core::error::CoreError;
use diffuse_core::job::{JobError, JobErrorKind, JobStatus, JobTransition};
use diffuse_core::params::{GenerationParams, SubmitJob};
use diffuse_core::repository::JobRepository;
use diffuse_db::repositories::PgJobRepo;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn submit(prompt: &str) -> SubmitJob {
    SubmitJob::new(GenerationParams::new(prompt))
}

fn artifact() -> ArtifactRef {
    ArtifactRef {
        content_hash: "0f".repeat(32),
        size_bytes: 1024,
        media_type: "image/png".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_create_and_get(pool: PgPool) {
    let repo = PgJobRepo::new(pool);
    let mut input = submit("a red fox");
    input.timeout_secs = Some(45);

    let job = repo.create(&input).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.version, 0);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.timeout_secs, Some(45));

    let fetched = repo.get(job.id).await.unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.request_params, input.params);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_get_missing_is_not_found(pool: PgPool) {
    let repo = PgJobRepo::new(pool);
    assert_matches!(
        repo.get(uuid::Uuid::now_v7()).await,
        Err(CoreError::NotFound { .. })
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_full_lifecycle_versions(pool: PgPool) {
    let repo = PgJobRepo::new(pool);
    let job = repo.create(&submit("cat")).await.unwrap();

    let running = repo
        .compare_and_swap(job.id, 0, JobTransition::Claim)
        .await
        .unwrap();
    assert_eq!(running.version, 1);
    assert_eq!(running.attempt_count, 1);

    let done = repo
        .compare_and_swap(job.id, 1, JobTransition::Succeed { artifact: artifact() })
        .await
        .unwrap();
    assert_eq!(done.version, 2);
    assert_eq!(done.artifact_ref, Some(artifact()));
    assert!(done.completed_at.is_some());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stale_version_rejected(pool: PgPool) {
    let repo = PgJobRepo::new(pool);
    let job = repo.create(&submit("cat")).await.unwrap();
    repo.compare_and_swap(job.id, 0, JobTransition::Claim)
        .await
        .unwrap();
    let before = repo.get(job.id).await.unwrap();

    assert_matches!(
        repo.compare_and_swap(job.id, 0, JobTransition::Cancel).await,
        Err(CoreError::VersionConflict { expected: 0, .. })
    );
    let after = repo.get(job.id).await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.status, JobStatus::Running);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_failed_job_stores_error(pool: PgPool) {
    let repo = PgJobRepo::new(pool);
    let job = repo.create(&submit("cat")).await.unwrap();
    repo.compare_and_swap(job.id, 0, JobTransition::Claim)
        .await
        .unwrap();
    let error = JobError::new(JobErrorKind::Timeout, "deadline exceeded");
    let failed = repo
        .compare_and_swap(job.id, 1, JobTransition::Fail { error: error.clone() })
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_info, Some(error));
    assert!(failed.artifact_ref.is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_claims_single_winner(pool: PgPool) {
    let repo = Arc::new(PgJobRepo::new(pool));
    let job = repo.create(&submit("race")).await.unwrap();

    let attempts = (0..8).map(|_| {
        let repo = Arc::clone(&repo);
        async move { repo.compare_and_swap(job.id, 0, JobTransition::Claim).await }
    });
    let results = futures::future::join_all(attempts).await;

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(CoreError::VersionConflict { .. }));
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_list_by_status_fifo(pool: PgPool) {
    let repo = PgJobRepo::new(pool);
    let a = repo.create(&submit("a")).await.unwrap();
    let b = repo.create(&submit("b")).await.unwrap();
    let c = repo.create(&submit("c")).await.unwrap();
    repo.compare_and_swap(a.id, 0, JobTransition::Cancel)
        .await
        .unwrap();

    let pending = repo.list_by_status(JobStatus::Pending).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b.id, c.id]);

    let cancelled = repo.list_by_status(JobStatus::Cancelled).await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, a.id);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_check_constraint_rejects_artifact_on_pending(pool: PgPool) {
    let repo = PgJobRepo::new(pool.clone());
    let job = repo.create(&submit("cat")).await.unwrap();

    let result = sqlx::query(
        "UPDATE generation_jobs \
         SET artifact_hash = 'abc', artifact_size_bytes = 1, artifact_media_type = 'image/png' \
         WHERE id = $1",
    )
    .bind(job.id)
    .execute(&pool)
    .await;

    let err = result.unwrap_err();
    let db_err = err.as_database_error().expect("expected a database error");
    assert_eq!(db_err.code().as_deref(), Some("23514"));
}

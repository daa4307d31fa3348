//! Process-local job repository.
//!
//! Same contract as [`super::PgJobRepo`], with the map guarded by a single
//! `RwLock` so the version check and the write happen under one write guard.
//! Jobs live only as long as the repository value.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use diffuse_core::error::CoreError;
use diffuse_core::job::{Job, JobStatus, JobTransition};
use diffuse_core::params::SubmitJob;
use diffuse_core::repository::JobRepository;
use diffuse_core::types::JobId;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryJobRepo {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepo {
    async fn create(&self, input: &SubmitJob) -> Result<Job, CoreError> {
        let job = Job::new(input, Utc::now());
        self.jobs.write().await.insert(job.id, job.clone());
        tracing::debug!(job_id = %job.id, "Job created");
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::job_not_found(id))
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: i64,
        transition: JobTransition,
    ) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&id).ok_or_else(|| CoreError::job_not_found(id))?;
        if current.version != expected_version {
            return Err(CoreError::VersionConflict {
                id,
                expected: expected_version,
            });
        }
        let next = current.apply(&transition, Utc::now())?;
        jobs.insert(id, next.clone());
        Ok(next)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, CoreError> {
        let mut matching: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use diffuse_core::artifact::ArtifactRef;
    use diffuse_core::params::GenerationParams;

    use super::*;

    fn submit(prompt: &str) -> SubmitJob {
        SubmitJob::new(GenerationParams::new(prompt))
    }

    #[tokio::test]
    async fn create_then_get() {
        let repo = InMemoryJobRepo::new();
        let job = repo.create(&submit("cat")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 0);
        assert_eq!(repo.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let repo = InMemoryJobRepo::new();
        assert_matches!(
            repo.get(uuid::Uuid::now_v7()).await,
            Err(CoreError::NotFound { entity: "job", .. })
        );
    }

    #[tokio::test]
    async fn version_increases_by_one_per_accepted_mutation() {
        let repo = InMemoryJobRepo::new();
        let job = repo.create(&submit("cat")).await.unwrap();
        let running = repo
            .compare_and_swap(job.id, 0, JobTransition::Claim)
            .await
            .unwrap();
        assert_eq!(running.version, 1);
        let done = repo
            .compare_and_swap(
                job.id,
                1,
                JobTransition::Succeed {
                    artifact: ArtifactRef {
                        content_hash: "ab".repeat(32),
                        size_bytes: 10,
                        media_type: "image/png".into(),
                    },
                },
            )
            .await
            .unwrap();
        assert_eq!(done.version, 2);
    }

    #[tokio::test]
    async fn stale_version_rejected_and_record_unchanged() {
        let repo = InMemoryJobRepo::new();
        let job = repo.create(&submit("cat")).await.unwrap();
        repo.compare_and_swap(job.id, 0, JobTransition::Claim)
            .await
            .unwrap();
        let before = repo.get(job.id).await.unwrap();

        let result = repo.compare_and_swap(job.id, 0, JobTransition::Cancel).await;
        assert_matches!(result, Err(CoreError::VersionConflict { expected: 0, .. }));
        assert_eq!(repo.get(job.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_record_unchanged() {
        let repo = InMemoryJobRepo::new();
        let job = repo.create(&submit("cat")).await.unwrap();
        let result = repo
            .compare_and_swap(
                job.id,
                0,
                JobTransition::Requeue {
                    not_before: Utc::now(),
                },
            )
            .await;
        assert_matches!(result, Err(CoreError::InvalidTransition { .. }));
        assert_eq!(repo.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn list_by_status_is_oldest_first() {
        let repo = InMemoryJobRepo::new();
        let first = repo.create(&submit("one")).await.unwrap();
        let second = repo.create(&submit("two")).await.unwrap();
        let third = repo.create(&submit("three")).await.unwrap();
        repo.compare_and_swap(second.id, 0, JobTransition::Claim)
            .await
            .unwrap();

        let pending = repo.list_by_status(JobStatus::Pending).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, third.id]);

        let running = repo.list_by_status(JobStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_concurrent_claim_wins() {
        let repo = Arc::new(InMemoryJobRepo::new());
        let job = repo.create(&submit("race")).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let repo = Arc::clone(&repo);
                tokio::spawn(async move {
                    let seen = repo.get(job.id).await.unwrap();
                    repo.compare_and_swap(job.id, seen.version, JobTransition::Claim)
                        .await
                })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(CoreError::VersionConflict { .. }) | Err(CoreError::InvalidTransition { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        let stored = repo.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.attempt_count, 1);
    }
}

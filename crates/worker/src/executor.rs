//! Runs one job from claim to settled state.
//!
//! Every write goes through `compare_and_swap` with the version read just
//! before it, so a cancellation that lands while the backend is busy makes
//! the final write fail with a version conflict instead of overwriting the
//! `Cancelled` record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diffuse_core::artifact::{probe_dimensions, ArtifactRef, ArtifactStore};
use diffuse_core::error::CoreError;
use diffuse_core::generation::{GenerationBackend, GenerationFailure};
use diffuse_core::hashing::sha256_hex;
use diffuse_core::job::{Job, JobError, JobErrorKind, JobStatus, JobTransition};
use diffuse_core::repository::JobRepository;
use diffuse_core::retry::RetryPolicy;
use diffuse_core::types::JobId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;

/// How long a backend gets to wind down after its deadline fires.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// What happened to a job offered to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not claimable any more, or another worker claimed it first.
    Skipped,
    Succeeded,
    /// Failed this attempt; back to `Pending` with a retry delay.
    Requeued,
    Failed,
    /// Cancelled while running; any result was discarded.
    Cancelled,
}

/// Result of driving the backend once.
enum Attempt {
    Produced(ArtifactRef),
    Failed(JobError),
    Cancelled,
}

pub struct Executor {
    repo: Arc<dyn JobRepository>,
    store: Arc<dyn ArtifactStore>,
    backend: Arc<dyn GenerationBackend>,
    retry: RetryPolicy,
    per_job_timeout: Duration,
    cancel_check_interval: Duration,
}

impl Executor {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        store: Arc<dyn ArtifactStore>,
        backend: Arc<dyn GenerationBackend>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            repo,
            store,
            backend,
            retry: config.retry_policy(),
            per_job_timeout: config.per_job_timeout,
            cancel_check_interval: config.cancel_check_interval,
        }
    }

    /// Claim and run the job if it is still eligible.
    ///
    /// Errors are repository failures that left the job in whatever state
    /// it was last written with; a job stuck `Running` this way is picked
    /// up by stale-job recovery.
    pub async fn execute(&self, id: JobId, worker: usize) -> Result<Outcome, CoreError> {
        let job = self.repo.get(id).await?;
        if !job.is_claimable_at(Utc::now()) {
            tracing::debug!(job_id = %id, worker, status = %job.status, "Job no longer claimable");
            return Ok(Outcome::Skipped);
        }

        let running = match self
            .repo
            .compare_and_swap(id, job.version, JobTransition::Claim)
            .await
        {
            Ok(running) => running,
            Err(e) if e.is_version_conflict() => {
                tracing::debug!(job_id = %id, worker, "Claim lost to a concurrent writer");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            job_id = %id,
            worker,
            attempt = running.attempt_count,
            "Job claimed",
        );

        let attempt = self.run_attempt(&running).await;
        self.settle(&running, attempt, worker).await
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    async fn run_attempt(&self, job: &Job) -> Attempt {
        let deadline = job.deadline(self.per_job_timeout);
        let token = CancellationToken::new();

        let generation = self.backend.generate(&job.request_params, token.clone());
        tokio::pin!(generation);
        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(expiry);

        let mut cancel_check = tokio::time::interval(self.cancel_check_interval);
        cancel_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        cancel_check.tick().await;

        let mut cancelled = false;
        let result = loop {
            tokio::select! {
                result = &mut generation => break Some(result),
                () = &mut expiry => break None,
                _ = cancel_check.tick(), if !cancelled => {
                    if self.was_cancelled(job.id).await {
                        tracing::info!(job_id = %job.id, "Cancellation observed, signalling backend");
                        cancelled = true;
                        token.cancel();
                    }
                }
            }
        };

        let Some(result) = result else {
            tracing::warn!(
                job_id = %job.id,
                deadline_secs = deadline.as_secs_f64(),
                "Deadline expired, signalling backend",
            );
            token.cancel();
            if tokio::time::timeout(STOP_GRACE, &mut generation).await.is_err() {
                tracing::warn!(job_id = %job.id, "Backend ignored cancellation, abandoning call");
            }
            if cancelled {
                return Attempt::Cancelled;
            }
            return Attempt::Failed(JobError::new(
                JobErrorKind::Timeout,
                format!("Exceeded deadline of {}s", deadline.as_secs_f64()),
            ));
        };

        if cancelled {
            return Attempt::Cancelled;
        }

        match result {
            Err(GenerationFailure::Cancelled) => Attempt::Failed(JobError::new(
                JobErrorKind::Generation,
                "Backend cancelled the generation on its own",
            )),
            Err(GenerationFailure::Failed(message)) => {
                Attempt::Failed(JobError::new(JobErrorKind::Generation, message))
            }
            Ok(bytes) => match self.publish(job, &bytes).await {
                Ok(artifact) => Attempt::Produced(artifact),
                Err(e) => Attempt::Failed(JobError::new(JobErrorKind::Storage, e.to_string())),
            },
        }
    }

    async fn was_cancelled(&self, id: JobId) -> bool {
        match self.repo.get(id).await {
            Ok(job) => job.status == JobStatus::Cancelled,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Cancellation check failed");
                false
            }
        }
    }

    /// Hash the output and write it to the artifact store.
    async fn publish(&self, job: &Job, bytes: &[u8]) -> Result<ArtifactRef, CoreError> {
        let params = &job.request_params;
        if let Some((width, height)) = probe_dimensions(bytes) {
            if (width, height) != (params.width, params.height) {
                tracing::warn!(
                    job_id = %job.id,
                    requested = %format!("{}x{}", params.width, params.height),
                    produced = %format!("{width}x{height}"),
                    "Backend output size differs from request",
                );
            }
        }

        let content_hash = sha256_hex(bytes);
        let artifact = self.store.put(bytes, &content_hash).await?;
        tracing::debug!(
            job_id = %job.id,
            content_hash = %artifact.content_hash,
            size_bytes = artifact.size_bytes,
            media_type = %artifact.media_type,
            "Artifact stored",
        );
        Ok(artifact)
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    async fn settle(
        &self,
        running: &Job,
        attempt: Attempt,
        worker: usize,
    ) -> Result<Outcome, CoreError> {
        let (transition, outcome) = match attempt {
            Attempt::Cancelled => {
                tracing::info!(
                    job_id = %running.id,
                    worker,
                    "Job cancelled while running, result discarded",
                );
                return Ok(Outcome::Cancelled);
            }
            Attempt::Produced(artifact) => (JobTransition::Succeed { artifact }, Outcome::Succeeded),
            Attempt::Failed(error) => {
                tracing::warn!(
                    job_id = %running.id,
                    worker,
                    attempt = running.attempt_count,
                    error = %error,
                    "Attempt failed",
                );
                match self.retry.on_failure(running, error, Utc::now()) {
                    t @ JobTransition::Requeue { .. } => (t, Outcome::Requeued),
                    t => (t, Outcome::Failed),
                }
            }
        };

        match self
            .repo
            .compare_and_swap(running.id, running.version, transition)
            .await
        {
            Ok(job) => {
                tracing::info!(
                    job_id = %job.id,
                    worker,
                    status = %job.status,
                    attempt = job.attempt_count,
                    "Job settled",
                );
                Ok(outcome)
            }
            Err(e) if e.is_version_conflict() => {
                let current = self.repo.get(running.id).await?;
                if current.status == JobStatus::Cancelled {
                    tracing::info!(
                        job_id = %running.id,
                        worker,
                        "Job cancelled mid-flight, result discarded",
                    );
                    Ok(Outcome::Cancelled)
                } else {
                    tracing::error!(
                        job_id = %running.id,
                        worker,
                        status = %current.status,
                        "Running job changed under its worker",
                    );
                    Err(e)
                }
            }
            Err(e) => {
                tracing::error!(job_id = %running.id, worker, error = %e, "Failed to settle job");
                Err(e)
            }
        }
    }
}

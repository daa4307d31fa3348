//! Intake and read surface over the job repository and artifact store.

use std::sync::Arc;

use diffuse_core::artifact::ArtifactStore;
use diffuse_core::error::CoreError;
use diffuse_core::job::{Job, JobStatus, JobTransition};
use diffuse_core::params::{validate_submission, SubmitJob};
use diffuse_core::repository::JobRepository;
use diffuse_core::types::JobId;
use tokio::sync::Notify;

/// Compare-and-swap attempts before `cancel` gives up on a busy record.
const CANCEL_MAX_TRIES: u32 = 5;

#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn JobRepository>,
    store: Arc<dyn ArtifactStore>,
    wake: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        store: Arc<dyn ArtifactStore>,
        wake: Arc<Notify>,
    ) -> Self {
        Self { repo, store, wake }
    }

    /// Validate and persist a new job, then wake the dispatcher.
    ///
    /// Returns as soon as the job is durable; generation happens later.
    pub async fn submit(&self, input: SubmitJob) -> Result<JobId, CoreError> {
        validate_submission(&input)?;
        let job = self.repo.create(&input).await?;
        tracing::info!(job_id = %job.id, "Job submitted");
        self.wake.notify_one();
        Ok(job.id)
    }

    pub async fn status(&self, id: JobId) -> Result<Job, CoreError> {
        self.repo.get(id).await
    }

    /// Cancel a pending or running job.
    ///
    /// Returns `true` if this call moved the job to `Cancelled`, `false` if
    /// it was already terminal. A running job is cancelled immediately; its
    /// worker notices on the next status check and discards its result.
    pub async fn cancel(&self, id: JobId) -> Result<bool, CoreError> {
        let mut expected = 0;
        for _ in 0..CANCEL_MAX_TRIES {
            let job = self.repo.get(id).await?;
            if job.status.is_terminal() {
                tracing::debug!(job_id = %id, status = %job.status, "Cancel ignored, job already finished");
                return Ok(false);
            }
            expected = job.version;

            match self
                .repo
                .compare_and_swap(id, job.version, JobTransition::Cancel)
                .await
            {
                Ok(_) => {
                    tracing::info!(job_id = %id, previous = %job.status, "Job cancelled");
                    return Ok(true);
                }
                Err(e) if e.is_version_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(job_id = %id, tries = CANCEL_MAX_TRIES, "Cancel kept losing version races");
        Err(CoreError::VersionConflict { id, expected })
    }

    /// Bytes of a succeeded job's artifact, or [`CoreError::NotReady`].
    pub async fn fetch_artifact(&self, id: JobId) -> Result<Vec<u8>, CoreError> {
        let job = self.repo.get(id).await?;
        if job.status != JobStatus::Succeeded {
            return Err(CoreError::NotReady {
                id,
                status: job.status,
            });
        }
        let artifact = job.artifact_ref.ok_or_else(|| {
            CoreError::Internal(format!("Succeeded job {id} has no artifact reference"))
        })?;
        self.store.get(&artifact).await
    }

    /// All jobs currently in `status`, oldest first.
    pub async fn list(&self, status: JobStatus) -> Result<Vec<Job>, CoreError> {
        self.repo.list_by_status(status).await
    }
}

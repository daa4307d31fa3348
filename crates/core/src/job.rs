//! Generation job model and its state machine.
//!
//! ```text
//! Pending --claim--> Running --succeed--> Succeeded
//!    |                  |  \---fail-----> Failed
//!    |                  |  \---requeue--> Pending
//!    \-----cancel-------+------cancel---> Cancelled
//! ```
//!
//! [`Job::apply`] is the only place a successor record is computed. Every
//! repository implementation runs it inside its compare-and-swap, so the
//! rules below hold no matter which store backs the engine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::error::CoreError;
use crate::params::{GenerationParams, SubmitJob};
use crate::types::{new_job_id, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Succeeded, Failed and Cancelled never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Why an attempt did not produce an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The backend reported a failure.
    Generation,
    /// The per-job deadline elapsed.
    Timeout,
    /// The result could not be persisted.
    Storage,
    /// The worker holding the job disappeared.
    Interrupted,
}

impl JobErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
            Self::Interrupted => "interrupted",
        }
    }
}

impl FromStr for JobErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(Self::Generation),
            "timeout" => Ok(Self::Timeout),
            "storage" => Ok(Self::Storage),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(CoreError::Validation(format!(
                "Unknown job error kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub request_params: GenerationParams,
    pub artifact_ref: Option<ArtifactRef>,
    pub error_info: Option<JobError>,
    pub attempt_count: i32,
    pub timeout_secs: Option<i32>,
    /// A requeued job is not offered to workers before this instant.
    pub not_before: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub version: i64,
}

/// A mutation request passed to `JobRepository::compare_and_swap`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// Pending -> Running. Increments `attempt_count`.
    Claim,
    /// Running -> Succeeded.
    Succeed { artifact: ArtifactRef },
    /// Running -> Pending, claimable again from `not_before`.
    Requeue { not_before: Timestamp },
    /// Running -> Failed.
    Fail { error: JobError },
    /// Pending | Running -> Cancelled.
    Cancel,
}

impl JobTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Succeed { .. } => "succeed",
            Self::Requeue { .. } => "requeue",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
        }
    }
}

impl Job {
    /// A fresh pending record for an accepted submission.
    pub fn new(input: &SubmitJob, now: Timestamp) -> Self {
        Self {
            id: new_job_id(),
            status: JobStatus::Pending,
            request_params: input.params.clone(),
            artifact_ref: None,
            error_info: None,
            attempt_count: 0,
            timeout_secs: input.timeout_secs,
            not_before: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Compute the record that results from applying `transition` at `now`.
    ///
    /// Does not check versions; that is the repository's job. Returns
    /// [`CoreError::InvalidTransition`] when the state machine forbids the
    /// move from the current status.
    pub fn apply(&self, transition: &JobTransition, now: Timestamp) -> Result<Job, CoreError> {
        let mut next = self.clone();
        match (self.status, transition) {
            (JobStatus::Pending, JobTransition::Claim) => {
                next.status = JobStatus::Running;
                next.attempt_count += 1;
                next.started_at = Some(now);
                next.not_before = None;
            }
            (JobStatus::Running, JobTransition::Succeed { artifact }) => {
                next.status = JobStatus::Succeeded;
                next.artifact_ref = Some(artifact.clone());
                next.completed_at = Some(now);
            }
            (JobStatus::Running, JobTransition::Requeue { not_before }) => {
                next.status = JobStatus::Pending;
                next.not_before = Some(*not_before);
            }
            (JobStatus::Running, JobTransition::Fail { error }) => {
                next.status = JobStatus::Failed;
                next.error_info = Some(error.clone());
                next.completed_at = Some(now);
            }
            (JobStatus::Pending | JobStatus::Running, JobTransition::Cancel) => {
                next.status = JobStatus::Cancelled;
                next.not_before = None;
                next.completed_at = Some(now);
            }
            (from, t) => {
                return Err(CoreError::InvalidTransition {
                    from,
                    transition: t.name(),
                })
            }
        }
        next.version += 1;
        next.updated_at = now;
        Ok(next)
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable_at(&self, now: Timestamp) -> bool {
        self.status == JobStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// Deadline for one attempt, preferring the per-job override.
    pub fn deadline(&self, default: Duration) -> Duration {
        match self.timeout_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => default,
        }
    }

    /// Check the record-level invariants.
    ///
    /// - `artifact_ref` is set iff the job succeeded.
    /// - `error_info` is set iff the job failed.
    /// - `completed_at` is set iff the job is terminal.
    pub fn check_invariants(&self) -> Result<(), String> {
        let succeeded = self.status == JobStatus::Succeeded;
        if self.artifact_ref.is_some() != succeeded {
            return Err(format!(
                "job {}: artifact_ref presence does not match status {}",
                self.id, self.status
            ));
        }
        let failed = self.status == JobStatus::Failed;
        if self.error_info.is_some() != failed {
            return Err(format!(
                "job {}: error_info presence does not match status {}",
                self.id, self.status
            ));
        }
        if self.completed_at.is_some() != self.status.is_terminal() {
            return Err(format!(
                "job {}: completed_at presence does not match status {}",
                self.id, self.status
            ));
        }
        if self.attempt_count < 0 || self.version < 0 {
            return Err(format!("job {}: negative counter", self.id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn pending_job() -> Job {
        Job::new(&SubmitJob::new(GenerationParams::new("cat")), Utc::now())
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            content_hash: crate::hashing::sha256_hex(b"png"),
            size_bytes: 3,
            media_type: "image/png".to_string(),
        }
    }

    fn generation_error() -> JobError {
        JobError::new(JobErrorKind::Generation, "backend exploded")
    }

    #[test]
    fn new_job_starts_pending_at_version_zero() {
        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.version, 0);
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn claim_increments_attempts_and_version() {
        let job = pending_job();
        let running = job.apply(&JobTransition::Claim, Utc::now()).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt_count, 1);
        assert_eq!(running.version, 1);
        assert!(running.started_at.is_some());
    }

    #[test]
    fn succeed_sets_artifact() {
        let now = Utc::now();
        let running = pending_job().apply(&JobTransition::Claim, now).unwrap();
        let done = running
            .apply(&JobTransition::Succeed { artifact: artifact() }, now)
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.artifact_ref, Some(artifact()));
        assert!(done.error_info.is_none());
        assert!(done.check_invariants().is_ok());
    }

    #[test]
    fn requeue_returns_to_pending_without_error_info() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        let running = pending_job().apply(&JobTransition::Claim, now).unwrap();
        let requeued = running
            .apply(&JobTransition::Requeue { not_before: later }, now)
            .unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert!(requeued.error_info.is_none());
        assert!(!requeued.is_claimable_at(now));
        assert!(requeued.is_claimable_at(later));
    }

    #[test]
    fn cancel_allowed_from_pending_and_running() {
        let now = Utc::now();
        let job = pending_job();
        assert_eq!(
            job.apply(&JobTransition::Cancel, now).unwrap().status,
            JobStatus::Cancelled
        );
        let running = job.apply(&JobTransition::Claim, now).unwrap();
        assert_eq!(
            running.apply(&JobTransition::Cancel, now).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        let now = Utc::now();
        let running = pending_job().apply(&JobTransition::Claim, now).unwrap();
        let failed = running
            .apply(&JobTransition::Fail { error: generation_error() }, now)
            .unwrap();
        for t in [
            JobTransition::Claim,
            JobTransition::Cancel,
            JobTransition::Succeed { artifact: artifact() },
            JobTransition::Requeue { not_before: now },
            JobTransition::Fail { error: generation_error() },
        ] {
            assert_matches!(
                failed.apply(&t, now),
                Err(CoreError::InvalidTransition { from: JobStatus::Failed, .. })
            );
        }
    }

    #[test]
    fn succeed_from_pending_is_invalid() {
        let job = pending_job();
        assert_matches!(
            job.apply(&JobTransition::Succeed { artifact: artifact() }, Utc::now()),
            Err(CoreError::InvalidTransition { transition: "succeed", .. })
        );
    }

    #[test]
    fn deadline_prefers_override() {
        let mut job = pending_job();
        let default = Duration::from_secs(300);
        assert_eq!(job.deadline(default), default);
        job.timeout_secs = Some(12);
        assert_eq!(job.deadline(default), Duration::from_secs(12));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    fn random_transition(rng: &mut StdRng, now: Timestamp) -> JobTransition {
        match rng.random_range(0..5) {
            0 => JobTransition::Claim,
            1 => JobTransition::Succeed { artifact: artifact() },
            2 => JobTransition::Requeue { not_before: now },
            3 => JobTransition::Fail { error: generation_error() },
            _ => JobTransition::Cancel,
        }
    }

    #[test]
    fn invariants_hold_across_random_transition_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let mut job = pending_job();
            for _ in 0..20 {
                let now = Utc::now();
                let transition = random_transition(&mut rng, now);
                let before = job.clone();
                match job.apply(&transition, now) {
                    Ok(next) => {
                        assert_eq!(next.version, before.version + 1);
                        assert!(
                            !before.status.is_terminal(),
                            "terminal job accepted {}",
                            transition.name()
                        );
                        job = next;
                    }
                    Err(CoreError::InvalidTransition { .. }) => {
                        assert_eq!(job, before);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
                job.check_invariants().unwrap();
            }
        }
    }
}

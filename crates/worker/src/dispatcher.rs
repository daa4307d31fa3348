//! Background job dispatcher.
//!
//! A single long-lived task that offers eligible pending job ids to the
//! workers through a bounded channel, oldest first. It runs a cycle every
//! `poll_interval`, whenever `submit` wakes it, and whenever a worker
//! reports a job finished. Each cycle also recovers `Running` jobs whose
//! worker vanished.
//!
//! Offering is not claiming: a worker still has to win the `Claim`
//! compare-and-swap, so a duplicate offer costs one wasted read.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diffuse_core::error::CoreError;
use diffuse_core::job::{Job, JobError, JobErrorKind, JobStatus};
use diffuse_core::repository::JobRepository;
use diffuse_core::retry::RetryPolicy;
use diffuse_core::types::JobId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;

pub struct JobDispatcher {
    repo: Arc<dyn JobRepository>,
    wake: Arc<Notify>,
    offers: mpsc::Sender<JobId>,
    done: mpsc::UnboundedReceiver<JobId>,
    /// Ids handed to workers and not yet reported back.
    offered: HashSet<JobId>,
    retry: RetryPolicy,
    poll_interval: Duration,
    per_job_timeout: Duration,
    stale_grace: Duration,
}

impl JobDispatcher {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        wake: Arc<Notify>,
        offers: mpsc::Sender<JobId>,
        done: mpsc::UnboundedReceiver<JobId>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            repo,
            wake,
            offers,
            done,
            offered: HashSet::new(),
            retry: config.retry_policy(),
            poll_interval: config.poll_interval,
            per_job_timeout: config.per_job_timeout,
            stale_grace: config.stale_grace,
        }
    }

    /// Run the dispatcher loop until the cancellation token is triggered.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Job dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                Some(id) = self.done.recv() => {
                    self.offered.remove(&id);
                }
            }

            if let Err(e) = self.dispatch_cycle().await {
                tracing::error!(error = %e, "Dispatch cycle failed");
            }
        }
    }

    /// One cycle: forget finished jobs, recover stale ones, offer the rest.
    async fn dispatch_cycle(&mut self) -> Result<(), CoreError> {
        while let Ok(id) = self.done.try_recv() {
            self.offered.remove(&id);
        }
        self.recover_stale().await?;
        self.offer_pending().await
    }

    async fn offer_pending(&mut self) -> Result<(), CoreError> {
        let now = Utc::now();
        let pending = self.repo.list_by_status(JobStatus::Pending).await?;

        for job in pending {
            if self.offered.contains(&job.id) || !job.is_claimable_at(now) {
                continue;
            }
            match self.offers.try_send(job.id) {
                Ok(()) => {
                    tracing::debug!(job_id = %job.id, "Job offered");
                    self.offered.insert(job.id);
                }
                // Workers are all busy; the rest wait for the next cycle.
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!("Worker channel closed, no job offered");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Fail or requeue `Running` jobs that outlived their deadline plus
    /// grace without being settled.
    async fn recover_stale(&mut self) -> Result<(), CoreError> {
        let now = Utc::now();
        let running = self.repo.list_by_status(JobStatus::Running).await?;

        for job in running {
            // Still held by one of our own workers.
            if self.offered.contains(&job.id) || !self.is_stale(&job, now) {
                continue;
            }

            let error = JobError::new(
                JobErrorKind::Interrupted,
                "Worker stopped reporting before the job finished",
            );
            let transition = self.retry.on_failure(&job, error, now);
            match self
                .repo
                .compare_and_swap(job.id, job.version, transition)
                .await
            {
                Ok(recovered) => tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    status = %recovered.status,
                    "Recovered stale running job",
                ),
                Err(e) if e.is_version_conflict() => {
                    tracing::debug!(job_id = %job.id, "Stale job settled concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn is_stale(&self, job: &Job, now: chrono::DateTime<Utc>) -> bool {
        let Some(started_at) = job.started_at else {
            return false;
        };
        let limit = job.deadline(self.per_job_timeout) + self.stale_grace;
        match chrono::Duration::from_std(limit) {
            Ok(limit) => now - started_at > limit,
            Err(_) => false,
        }
    }
}

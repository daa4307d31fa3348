//! Fixed-size worker pool fed by the [`JobDispatcher`].
//!
//! ```text
//! dispatcher --(bounded mpsc, ids)--> worker 0..N --(done ids)--> dispatcher
//! ```
//!
//! Workers share one receiver behind a mutex; whichever is idle takes the
//! next id. Shutdown stops the dispatcher and idle workers at once, then
//! gives in-flight attempts up to `shutdown_timeout` before aborting them.
//! An aborted job stays `Running` and is recovered as stale later.

use std::sync::Arc;
use std::time::Duration;

use diffuse_core::artifact::ArtifactStore;
use diffuse_core::generation::GenerationBackend;
use diffuse_core::repository::JobRepository;
use diffuse_core::types::JobId;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::dispatcher::JobDispatcher;
use crate::executor::{Executor, Outcome};

pub struct WorkerPool {
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawn the dispatcher and `config.worker_pool_size` workers.
    ///
    /// `wake` is shared with the orchestrator so new submissions are
    /// offered without waiting for the next poll.
    pub fn start(
        repo: Arc<dyn JobRepository>,
        store: Arc<dyn ArtifactStore>,
        backend: Arc<dyn GenerationBackend>,
        config: PoolConfig,
        wake: Arc<Notify>,
    ) -> Self {
        let size = config.worker_pool_size.max(1);
        let cancel = CancellationToken::new();
        let (offer_tx, offer_rx) = mpsc::channel(size);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let dispatcher = JobDispatcher::new(Arc::clone(&repo), wake, offer_tx, done_rx, &config);
        let dispatcher = tokio::spawn(dispatcher.run(cancel.clone()));

        let executor = Arc::new(Executor::new(repo, store, backend, &config));
        let offers = Arc::new(Mutex::new(offer_rx));
        let workers = (0..size)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    Arc::clone(&executor),
                    Arc::clone(&offers),
                    done_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = size, "Worker pool started");

        Self {
            cancel,
            dispatcher,
            workers,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Stop dispatching and wait for in-flight jobs, aborting stragglers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "Dispatcher task ended abnormally");
        }

        let aborts: Vec<_> = self.workers.iter().map(|h| h.abort_handle()).collect();
        let drain = futures::future::join_all(self.workers);
        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(_) => tracing::info!("Worker pool stopped"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "In-flight jobs did not finish in time, aborting workers",
                );
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }
}

async fn worker_loop(
    index: usize,
    executor: Arc<Executor>,
    offers: Arc<Mutex<mpsc::Receiver<JobId>>>,
    done: mpsc::UnboundedSender<JobId>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = index, "Worker started");

    loop {
        let next = {
            let mut offers = offers.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                id = offers.recv() => id,
            }
        };
        let Some(id) = next else {
            break;
        };

        match executor.execute(id, index).await {
            Ok(Outcome::Skipped) => {}
            Ok(outcome) => {
                tracing::debug!(job_id = %id, worker = index, ?outcome, "Job finished");
            }
            Err(e) => {
                tracing::error!(job_id = %id, worker = index, error = %e, "Job execution failed");
            }
        }

        // Dispatcher is gone during shutdown; nothing left to tell.
        let _ = done.send(id);
    }

    tracing::debug!(worker = index, "Worker stopped");
}

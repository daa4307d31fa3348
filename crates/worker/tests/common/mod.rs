//! Shared fixtures for worker integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diffuse_core::generation::{GenerationBackend, GenerationFailure};
use diffuse_core::job::Job;
use diffuse_core::params::GenerationParams;
use diffuse_core::retry::BackoffPolicy;
use diffuse_core::types::JobId;
use diffuse_db::repositories::InMemoryJobRepo;
use diffuse_storage::LocalArtifactStore;
use diffuse_worker::config::PoolConfig;
use diffuse_worker::orchestrator::Orchestrator;
use diffuse_worker::pool::WorkerPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// How a [`ScriptedBackend`] answers.
pub enum Script {
    /// Fail the first `n` calls, then return `image`.
    FailThenSucceed { failures: usize, image: Vec<u8> },
    AlwaysFail,
    /// Sleep for the given time, ignoring cancellation, then return `image`.
    Slow { delay: Duration, image: Vec<u8> },
    /// Block until cancelled, then report `Cancelled`.
    UntilCancelled,
}

pub struct ScriptedBackend {
    script: Script,
    pub calls: AtomicUsize,
    /// Set once any call has started.
    pub started: Notify,
    /// Set if a call observed its cancellation token firing.
    pub saw_cancel: AtomicBool,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            saw_cancel: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        _params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, GenerationFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        match &self.script {
            Script::FailThenSucceed { failures, image } => {
                if call < *failures {
                    Err(GenerationFailure::Failed(format!("scripted failure {}", call + 1)))
                } else {
                    Ok(image.clone())
                }
            }
            Script::AlwaysFail => Err(GenerationFailure::Failed("backend offline".into())),
            Script::Slow { delay, image } => {
                tokio::time::sleep(*delay).await;
                Ok(image.clone())
            }
            Script::UntilCancelled => {
                cancel.cancelled().await;
                self.saw_cancel.store(true, Ordering::SeqCst);
                Err(GenerationFailure::Cancelled)
            }
        }
    }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Short intervals so tests settle in milliseconds.
pub fn fast_config() -> PoolConfig {
    PoolConfig {
        worker_pool_size: 2,
        max_attempts: 3,
        per_job_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        cancel_check_interval: Duration::from_millis(20),
        retry_backoff: BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        },
        stale_grace: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
    }
}

pub struct Engine {
    pub repo: Arc<InMemoryJobRepo>,
    pub store: Arc<LocalArtifactStore>,
    pub orchestrator: Orchestrator,
    pub wake: Arc<Notify>,
    pub dir: tempfile::TempDir,
}

impl Engine {
    /// Repository, store and orchestrator, with no workers running yet.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryJobRepo::new());
        let store = Arc::new(LocalArtifactStore::open(dir.path()).await.unwrap());
        let wake = Arc::new(Notify::new());
        let orchestrator = Orchestrator::new(repo.clone(), store.clone(), wake.clone());
        Self {
            repo,
            store,
            orchestrator,
            wake,
            dir,
        }
    }

    pub fn start(&self, backend: Arc<ScriptedBackend>, config: PoolConfig) -> WorkerPool {
        WorkerPool::start(
            self.repo.clone(),
            self.store.clone(),
            backend,
            config,
            self.wake.clone(),
        )
    }

    /// Poll until the job is terminal, panicking after `limit`.
    pub async fn wait_terminal(&self, id: JobId, limit: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let job = self.orchestrator.status(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} still {} after {limit:?}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use diffuse_core::job::JobStatus;
use diffuse_db::repositories::PgJobRepo;
use diffuse_generator::HttpGenerationBackend;
use diffuse_storage::LocalArtifactStore;
use diffuse_worker::config::WorkerConfig;
use diffuse_worker::orchestrator::Orchestrator;
use diffuse_worker::pool::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "diffuse_worker=debug,diffuse_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        artifact_root = %config.artifact_root.display(),
        backend_url = %config.backend_url,
        workers = config.pool.worker_pool_size,
        max_attempts = config.pool.max_attempts,
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = diffuse_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    diffuse_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    diffuse_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Stores and backend ---
    let repo = Arc::new(PgJobRepo::new(pool.clone()));
    let store = Arc::new(
        LocalArtifactStore::open(&config.artifact_root)
            .await
            .context("Failed to open artifact store")?,
    );
    let backend = Arc::new(
        HttpGenerationBackend::from_url(&config.backend_url)
            .context("Failed to build generation backend client")?,
    );

    // --- Engine ---
    let wake = Arc::new(Notify::new());
    let orchestrator = Orchestrator::new(repo.clone(), store.clone(), Arc::clone(&wake));
    let backlog = orchestrator
        .list(JobStatus::Pending)
        .await
        .context("Failed to read pending jobs")?;
    tracing::info!(pending = backlog.len(), "Pending jobs at startup");

    let workers = WorkerPool::start(repo, store, backend, config.pool.clone(), wake);

    shutdown_signal().await;

    workers.shutdown().await;
    pool.close().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

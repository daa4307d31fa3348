use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use diffuse_core::retry::{BackoffPolicy, RetryPolicy};

/// Tuning for the dispatcher, the workers and the retry policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent worker tasks (default: `2`).
    pub worker_pool_size: usize,
    /// Attempts per job before it is marked failed (default: `3`).
    pub max_attempts: u32,
    /// Deadline for one attempt unless the job overrides it (default: `300s`).
    pub per_job_timeout: Duration,
    /// Dispatcher polling period (default: `1s`).
    pub poll_interval: Duration,
    /// How often a running attempt re-reads its job to notice cancellation
    /// (default: `2s`).
    pub cancel_check_interval: Duration,
    /// Delay between a failed attempt and the next claim.
    pub retry_backoff: BackoffPolicy,
    /// Extra time past the deadline before a running job is presumed
    /// orphaned (default: `60s`).
    pub stale_grace: Duration,
    /// How long shutdown waits for in-flight attempts (default: `30s`).
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 2,
            max_attempts: 3,
            per_job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            cancel_check_interval: Duration::from_millis(2000),
            retry_backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(2000),
                max_delay: Duration::from_millis(60_000),
                multiplier: 2.0,
            },
            stale_grace: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.retry_backoff.clone(),
        }
    }
}

/// Everything the `diffuse-worker` binary needs to start.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub artifact_root: PathBuf,
    pub backend_url: String,
    pub pool: PoolConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                   |
    /// |----------------------------|---------------------------|
    /// | `DATABASE_URL`             | required                  |
    /// | `ARTIFACT_ROOT`            | `./data/artifacts`        |
    /// | `GENERATION_BACKEND_URL`   | `http://127.0.0.1:7860`   |
    /// | `MAX_ATTEMPTS`             | `3`                       |
    /// | `WORKER_POOL_SIZE`         | `2`                       |
    /// | `PER_JOB_TIMEOUT_SECS`     | `300`                     |
    /// | `POLL_INTERVAL_MS`         | `1000`                    |
    /// | `CANCEL_CHECK_INTERVAL_MS` | `2000`                    |
    /// | `RETRY_INITIAL_DELAY_MS`   | `2000`                    |
    /// | `RETRY_MAX_DELAY_MS`       | `60000`                   |
    /// | `STALE_GRACE_SECS`         | `60`                      |
    /// | `SHUTDOWN_TIMEOUT_SECS`    | `30`                      |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`WorkerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let artifact_root = lookup("ARTIFACT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/artifacts"));

        let backend_url = lookup("GENERATION_BACKEND_URL")
            .unwrap_or_else(|| "http://127.0.0.1:7860".into());

        let worker_pool_size: usize = parse(&lookup, "WORKER_POOL_SIZE", 2)?;
        if worker_pool_size == 0 {
            return Err(invalid("WORKER_POOL_SIZE", "0", "must be at least 1"));
        }

        let max_attempts: u32 = parse(&lookup, "MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let initial_delay_ms: u64 = parse(&lookup, "RETRY_INITIAL_DELAY_MS", 2000)?;
        let max_delay_ms: u64 = parse(&lookup, "RETRY_MAX_DELAY_MS", 60_000)?;
        if max_delay_ms < initial_delay_ms {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                &max_delay_ms.to_string(),
                "must not be below RETRY_INITIAL_DELAY_MS",
            ));
        }

        let pool = PoolConfig {
            worker_pool_size,
            max_attempts,
            per_job_timeout: Duration::from_secs(parse_non_zero(
                &lookup,
                "PER_JOB_TIMEOUT_SECS",
                300,
            )?),
            poll_interval: Duration::from_millis(parse_non_zero(
                &lookup,
                "POLL_INTERVAL_MS",
                1000,
            )?),
            cancel_check_interval: Duration::from_millis(parse_non_zero(
                &lookup,
                "CANCEL_CHECK_INTERVAL_MS",
                2000,
            )?),
            retry_backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(initial_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                multiplier: 2.0,
            },
            stale_grace: Duration::from_secs(parse(&lookup, "STALE_GRACE_SECS", 60)?),
            shutdown_timeout: Duration::from_secs(parse(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?),
        };

        Ok(Self {
            database_url,
            artifact_root,
            backend_url,
            pool,
        })
    }
}

fn parse<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
    }
}

/// Like [`parse`], for periods that feed `tokio::time::interval` and must
/// not be zero.
fn parse_non_zero<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse(lookup, var, default)? {
        0 => Err(invalid(var, "0", "must be at least 1")),
        value => Ok(value),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

//! [`GenerationBackend`] over the backend's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use diffuse_core::generation::{GenerationBackend, GenerationFailure};
use diffuse_core::params::GenerationParams;
use tokio_util::sync::CancellationToken;

use crate::api::{GeneratorApi, GeneratorApiError};

/// Upper bound on the fire-and-forget interrupt request.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpGenerationBackend {
    api: GeneratorApi,
}

impl HttpGenerationBackend {
    pub fn new(api: GeneratorApi) -> Self {
        Self { api }
    }

    pub fn from_url(api_url: impl Into<String>) -> Result<Self, GeneratorApiError> {
        Ok(Self::new(GeneratorApi::new(api_url)?))
    }

    /// Ask the backend to stop, without waiting for the answer.
    fn spawn_interrupt(&self) {
        let api = self.api.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(INTERRUPT_TIMEOUT, api.interrupt()).await {
                Ok(Ok(())) => tracing::debug!(api_url = api.api_url(), "Backend interrupted"),
                Ok(Err(e)) => {
                    tracing::warn!(api_url = api.api_url(), error = %e, "Backend interrupt failed")
                }
                Err(_) => tracing::warn!(api_url = api.api_url(), "Backend interrupt timed out"),
            }
        });
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, GenerationFailure> {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the request future closes the connection; the
                // interrupt covers backends that keep computing regardless.
                self.spawn_interrupt();
                Err(GenerationFailure::Cancelled)
            }
            result = self.api.generate(params) => {
                result.map_err(|e| GenerationFailure::Failed(e.to_string()))
            }
        }
    }
}

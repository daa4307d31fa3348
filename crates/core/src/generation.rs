//! Contract for the external image-generation backend.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::params::GenerationParams;

/// Structured failure from a backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationFailure {
    #[error("{0}")]
    Failed(String),

    /// The backend honoured a cancellation request.
    #[error("generation cancelled")]
    Cancelled,
}

/// An opaque diffusion backend.
///
/// Implementations that can interrupt an in-flight generation should watch
/// `cancel` and return [`GenerationFailure::Cancelled`] once it fires. Those
/// that cannot may ignore it; the worker discards late results.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, GenerationFailure>;
}

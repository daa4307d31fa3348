//! REST API client for the generation backend.
//!
//! Endpoints used:
//! - `POST /generate` with the JSON request parameters; the response body
//!   is the encoded image.
//! - `POST /interrupt` to abort whatever is currently executing.

use std::time::Duration;

use diffuse_core::params::GenerationParams;

/// Connect timeout for backend requests. Generation itself may take
/// minutes, so no overall request timeout is set here; the worker applies
/// the per-job deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a single backend instance.
#[derive(Debug, Clone)]
pub struct GeneratorApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the backend REST layer.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx response carried no image.
    #[error("Backend returned an empty body")]
    EmptyBody,
}

impl GeneratorApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:7860`. A trailing
    ///   slash is ignored.
    pub fn new(api_url: impl Into<String>) -> Result<Self, GeneratorApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Run one generation and return the encoded image bytes.
    pub async fn generate(&self, params: &GenerationParams) -> Result<Vec<u8>, GeneratorApiError> {
        let response = self
            .client
            .post(format!("{}/generate", self.api_url))
            .json(params)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(GeneratorApiError::EmptyBody);
        }
        Ok(bytes.to_vec())
    }

    /// Interrupt the currently running generation.
    pub async fn interrupt(&self) -> Result<(), GeneratorApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`GeneratorApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, GeneratorApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(GeneratorApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

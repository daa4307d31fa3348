//! Generation request parameters and their boundary validation.
//!
//! Requests are an explicit struct with a fixed set of recognised fields.
//! Unknown fields are rejected at deserialisation time; everything else is
//! checked structurally by [`validate_submission`] before a job is created.
//! Semantic checks (does the model exist, is the prompt acceptable) belong
//! to the caller.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;

/// Default image edge length in pixels.
pub const DEFAULT_DIMENSION: u32 = 512;

/// Default number of diffusion steps.
pub const DEFAULT_STEPS: u32 = 30;

/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Width and height must be multiples of this (latent space stride).
pub const DIMENSION_STRIDE: u32 = 8;

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_guidance_scale() -> f32 {
    DEFAULT_GUIDANCE_SCALE
}

/// Immutable snapshot of what the caller asked to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GenerationParams {
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,

    #[serde(default)]
    #[validate(length(max = 2000))]
    pub negative_prompt: Option<String>,

    #[serde(default = "default_dimension")]
    #[validate(range(min = 64, max = 2048))]
    pub width: u32,

    #[serde(default = "default_dimension")]
    #[validate(range(min = 64, max = 2048))]
    pub height: u32,

    #[serde(default = "default_steps")]
    #[validate(range(min = 1, max = 150))]
    pub steps: u32,

    #[serde(default = "default_guidance_scale")]
    #[validate(range(min = 0.0, max = 30.0))]
    pub guidance_scale: f32,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub model: Option<String>,
}

impl GenerationParams {
    /// Parameters with defaults for everything except the prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
            model: None,
        }
    }
}

/// Intake DTO for `Orchestrator::submit`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SubmitJob {
    pub params: GenerationParams,
    /// Per-job deadline override in seconds. Falls back to the configured
    /// default when absent.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub timeout_secs: Option<i32>,
}

impl SubmitJob {
    pub fn new(params: GenerationParams) -> Self {
        Self {
            params,
            timeout_secs: None,
        }
    }
}

/// Structural validation of a submission.
///
/// Rules beyond the per-field ranges:
/// - The prompt must contain a non-whitespace character.
/// - Width and height must be multiples of [`DIMENSION_STRIDE`].
/// - The guidance scale must be finite.
pub fn validate_submission(input: &SubmitJob) -> Result<(), CoreError> {
    input
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;
    validate_params(&input.params)
}

/// Structural validation of generation parameters alone.
pub fn validate_params(params: &GenerationParams) -> Result<(), CoreError> {
    params
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;

    if params.prompt.trim().is_empty() {
        return Err(CoreError::Validation(
            "Prompt must not be blank".to_string(),
        ));
    }
    for (name, value) in [("width", params.width), ("height", params.height)] {
        if value % DIMENSION_STRIDE != 0 {
            return Err(CoreError::Validation(format!(
                "{name} must be a multiple of {DIMENSION_STRIDE}, got {value}"
            )));
        }
    }
    if !params.guidance_scale.is_finite() {
        return Err(CoreError::Validation(
            "guidance_scale must be a finite number".to_string(),
        ));
    }
    Ok(())
}

//! HTTP client for an external diffusion backend.
//!
//! [`api::GeneratorApi`] wraps the backend's REST endpoints;
//! [`backend::HttpGenerationBackend`] adapts it to the engine's
//! [`diffuse_core::generation::GenerationBackend`] trait, adding
//! cooperative cancellation.

pub mod api;
pub mod backend;

pub use backend::HttpGenerationBackend;

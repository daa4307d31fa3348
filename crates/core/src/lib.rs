//! Domain core for the diffusion generation job engine.
//!
//! Holds the job model and its state machine, the error taxonomy, and the
//! traits the engine consumes from its collaborators (job repository,
//! artifact store, generation backend). Has no internal workspace deps so
//! every other crate can build on it.

pub mod artifact;
pub mod error;
pub mod generation;
pub mod hashing;
pub mod job;
pub mod params;
pub mod repository;
pub mod retry;
pub mod types;

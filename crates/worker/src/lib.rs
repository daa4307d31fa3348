//! Generation worker pool and job orchestrator.
//!
//! [`orchestrator::Orchestrator`] is the intake and read surface; a
//! [`pool::WorkerPool`] runs the dispatcher and the workers that drive
//! jobs through the backend. Both share one
//! [`diffuse_core::repository::JobRepository`] and one
//! [`diffuse_core::artifact::ArtifactStore`].

pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod orchestrator;
pub mod pool;

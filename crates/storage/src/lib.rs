//! Artifact storage backends.
//!
//! Provides [`LocalArtifactStore`], a content-addressed filesystem store
//! implementing [`diffuse_core::artifact::ArtifactStore`].

pub mod local;

pub use local::LocalArtifactStore;

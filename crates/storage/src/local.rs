//! Content-addressed artifact store on a local (or mounted) filesystem.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/tmp/<uuid>.partial        in-flight writes
//! <root>/<h0h1>/<h2h3>/<hash>      published artifacts
//! ```
//!
//! A write lands in `tmp/`, is fsynced, then renamed into place. Rename is
//! atomic within one filesystem, so readers see either nothing or the whole
//! artifact. Concurrent puts of the same bytes race harmlessly: the last
//! rename replaces an identical file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use diffuse_core::artifact::{probe_media_type, ArtifactRef, ArtifactStore};
use diffuse_core::error::CoreError;
use diffuse_core::hashing::{is_sha256_hex, sha256_hex};
use diffuse_core::retry::{retry_transient, BackoffPolicy, DEFAULT_STORE_TRIES};
use tokio::io::AsyncWriteExt;

/// Subdirectory holding in-flight writes.
const TMP_DIR: &str = "tmp";

/// Suffix of in-flight files.
const PARTIAL_SUFFIX: &str = "partial";

/// Partials untouched for this long belong to no live writer.
const PARTIAL_MAX_AGE: Duration = Duration::from_secs(3600);

pub struct LocalArtifactStore {
    root: PathBuf,
    backoff: BackoffPolicy,
    max_tries: u32,
}

impl LocalArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover `.partial` files older than an hour are removed; younger ones
    /// may belong to another process sharing the root.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(|e| io_error("create artifact root", &tmp, e))?;

        let store = Self {
            root,
            backoff: BackoffPolicy::for_store(),
            max_tries: DEFAULT_STORE_TRIES,
        };
        store.sweep_partials().await;
        tracing::info!(root = %store.root.display(), "Artifact store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location for an artifact with the given hash.
    fn path_for(&self, content_hash: &str) -> PathBuf {
        self.root
            .join(&content_hash[0..2])
            .join(&content_hash[2..4])
            .join(content_hash)
    }

    async fn sweep_partials(&self) {
        let tmp = self.root.join(TMP_DIR);
        let Ok(mut entries) = tokio::fs::read_dir(&tmp).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == PARTIAL_SUFFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            if age.is_some_and(|age| age >= PARTIAL_MAX_AGE) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale partial");
                }
            }
        }
    }

    /// Write `bytes` to a temp file, fsync, and rename it to `dest`.
    async fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{PARTIAL_SUFFIX}", uuid::Uuid::new_v4()));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, dest).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    fn check_hash_shape(content_hash: &str) -> Result<(), CoreError> {
        if is_sha256_hex(content_hash) {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "'{content_hash}' is not a lowercase hex SHA-256 digest"
            )))
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, bytes: &[u8], content_hash: &str) -> Result<ArtifactRef, CoreError> {
        Self::check_hash_shape(content_hash)?;
        let actual = sha256_hex(bytes);
        if actual != content_hash {
            return Err(CoreError::Validation(format!(
                "Content hash mismatch: caller supplied {content_hash}, bytes hash to {actual}"
            )));
        }

        let artifact = ArtifactRef {
            content_hash: content_hash.to_string(),
            size_bytes: bytes.len() as i64,
            media_type: probe_media_type(bytes).to_string(),
        };
        let dest = self.path_for(content_hash);

        let exists = tokio::fs::try_exists(&dest)
            .await
            .map_err(|e| io_error("stat artifact", &dest, e))?;
        if exists {
            tracing::debug!(content_hash, "Artifact already stored, skipping write");
            return Ok(artifact);
        }

        let dest_ref = &dest;
        retry_transient(&self.backoff, self.max_tries, is_transient, || async move {
            self.write_atomic(dest_ref, bytes).await
        })
        .await
        .map_err(|e| io_error("write artifact", &dest, e))?;

        tracing::info!(
            content_hash,
            size_bytes = artifact.size_bytes,
            media_type = %artifact.media_type,
            "Artifact stored",
        );
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, CoreError> {
        let not_found = || CoreError::NotFound {
            entity: "artifact",
            id: artifact.content_hash.clone(),
        };
        if !is_sha256_hex(&artifact.content_hash) {
            return Err(not_found());
        }

        let path = self.path_for(&artifact.content_hash);
        let path_ref = &path;
        let bytes = retry_transient(&self.backoff, self.max_tries, is_transient, || async move {
            tokio::fs::read(path_ref).await
        })
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(),
            _ => io_error("read artifact", &path, e),
        })?;

        if sha256_hex(&bytes) != artifact.content_hash {
            tracing::error!(content_hash = %artifact.content_hash, "Stored artifact failed integrity check");
            return Err(CoreError::Storage(format!(
                "Artifact {} is corrupted on disk",
                artifact.content_hash
            )));
        }
        Ok(bytes)
    }

    async fn exists(&self, artifact: &ArtifactRef) -> Result<bool, CoreError> {
        if !is_sha256_hex(&artifact.content_hash) {
            return Ok(false);
        }
        let path = self.path_for(&artifact.content_hash);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat artifact", &path, e))
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> CoreError {
    tracing::error!(path = %path.display(), error = %err, "Failed to {action}");
    CoreError::Storage(format!("Failed to {action} at {}: {err}", path.display()))
}

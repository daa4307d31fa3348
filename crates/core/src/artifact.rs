//! Generated image artifacts and the store that holds them.

use std::io::Cursor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Media type recorded when the header is not a recognised image format.
pub const MEDIA_TYPE_UNKNOWN: &str = "application/octet-stream";

/// Reference from a job to its stored output.
///
/// The content hash is the storage key, so two jobs that produced identical
/// bytes point at the same artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Lowercase hex SHA-256 of the bytes.
    pub content_hash: String,
    pub size_bytes: i64,
    pub media_type: String,
}

/// Content-addressed, write-once storage for artifact bytes.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `content_hash`.
    ///
    /// Idempotent: if the hash is already present the existing reference is
    /// returned and nothing is rewritten. The hash must match the bytes.
    async fn put(&self, bytes: &[u8], content_hash: &str) -> Result<ArtifactRef, CoreError>;

    /// Read back the bytes of a stored artifact.
    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, CoreError>;

    /// Whether the artifact has been published.
    async fn exists(&self, artifact: &ArtifactRef) -> Result<bool, CoreError>;
}

/// Sniff the media type from the leading magic bytes.
pub fn probe_media_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => MEDIA_TYPE_UNKNOWN,
    }
}

/// Read `(width, height)` from the image header without decoding pixels.
///
/// Returns `None` for anything the enabled decoders cannot parse.
pub fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::new(width, height);
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn png_is_detected() {
        let bytes = png_bytes(16, 8);
        assert_eq!(probe_media_type(&bytes), "image/png");
        assert_eq!(probe_dimensions(&bytes), Some((16, 8)));
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(probe_media_type(b"not an image"), MEDIA_TYPE_UNKNOWN);
        assert_eq!(probe_dimensions(b"not an image"), None);
    }
}

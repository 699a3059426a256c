//! Blob storage for uploaded chat images.
//!
//! The store accepts raw image bytes and returns a URL the frontend can
//! load. The local implementation writes under the uploads directory that
//! the router serves at `/uploads`.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use nanoid::nanoid;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Blob storage errors.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Blob store abstraction.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store image bytes for a user and return the URL path to serve them.
    async fn put(&self, user_id: &str, bytes: &[u8], media_type: &str) -> BlobResult<String>;
}

/// Local-filesystem blob store backing the `/uploads` static mount.
#[derive(Debug, Clone)]
pub struct LocalBlobs {
    base_dir: PathBuf,
}

impl LocalBlobs {
    /// Create a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// File extension for a MIME type ("image/png" -> "png").
fn extension_for(media_type: &str) -> &str {
    let ext = media_type.rsplit('/').next().unwrap_or_default();
    if ext.is_empty() { "bin" } else { ext }
}

#[async_trait]
impl BlobStore for LocalBlobs {
    async fn put(&self, user_id: &str, bytes: &[u8], media_type: &str) -> BlobResult<String> {
        let user_dir = self.base_dir.join(user_id);
        fs::create_dir_all(&user_dir).await?;

        // Timestamped name with a short random suffix so same-second
        // uploads from one user cannot collide.
        let filename = format!(
            "{}_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            nanoid!(6),
            extension_for(media_type)
        );

        let file_path = user_dir.join(&filename);
        fs::write(&file_path, bytes).await?;
        debug!("Stored {} bytes at {}", bytes.len(), file_path.display());

        Ok(format!("/uploads/{user_id}/{filename}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpeg");
        assert_eq!(extension_for(""), "bin");
    }

    #[tokio::test]
    async fn test_put_writes_file_and_returns_url() {
        let temp = TempDir::new().unwrap();
        let store = LocalBlobs::new(temp.path());

        let url = store.put("user1", b"image-bytes", "image/png").await.unwrap();
        assert!(url.starts_with("/uploads/user1/"));
        assert!(url.ends_with(".png"));

        let relative = url.strip_prefix("/uploads/").unwrap();
        let content = fs::read(temp.path().join(relative)).await.unwrap();
        assert_eq!(content, b"image-bytes");
    }

    #[tokio::test]
    async fn test_put_urls_are_unique() {
        let temp = TempDir::new().unwrap();
        let store = LocalBlobs::new(temp.path());

        let first = store.put("user1", b"a", "image/png").await.unwrap();
        let second = store.put("user1", b"b", "image/png").await.unwrap();
        assert_ne!(first, second);
    }
}

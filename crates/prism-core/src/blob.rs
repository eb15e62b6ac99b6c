//! Blob store
//!
//! Filesystem-backed put/get by opaque identifier. Identifiers are
//! generated internally (random id plus a content-type suffix), so the
//! store never sees caller-controlled paths.

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn put(&self, storage_id: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create storage dir {}", self.root.display()))?;

        let path = self.root.join(storage_id);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", path.display()))?;
        Ok(())
    }

    pub async fn get(&self, storage_id: &str) -> Result<Vec<u8>> {
        let path = self.root.join(storage_id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {}", path.display()))
    }
}

/// Content type for serving a stored object, derived from the
/// extension its storage identifier carries.
pub fn content_type_for(storage_id: &str) -> &'static str {
    match storage_id.rsplit('.').next().unwrap_or_default() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a1b2.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("a1b2.png"), "image/png");
        assert_eq!(content_type_for("a1b2.tiff"), "application/octet-stream");
        assert_eq!(content_type_for("noextension"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = std::env::temp_dir().join(format!("prism-blob-{}", uuid::Uuid::new_v4()));
        let store = BlobStore::new(&dir);

        store.put("x.png", b"not really a png").await.unwrap();
        let bytes = store.get("x.png").await.unwrap();
        assert_eq!(bytes, b"not really a png");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_blob_fails() {
        let dir = std::env::temp_dir().join(format!("prism-blob-{}", uuid::Uuid::new_v4()));
        let store = BlobStore::new(&dir);
        assert!(store.get("absent.jpeg").await.is_err());
    }
}

//! Filesystem blob store.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::fs;

use super::BlobStore;

const URI_SCHEME: &str = "file://";

/// Stores blobs under `{root}/{bucket}/{key}` and hands out `file://` URIs
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Reject keys that would escape the bucket directory
    fn checked_relative(value: &str) -> Result<PathBuf> {
        let path = Path::new(value);
        if value.is_empty() || path.is_absolute() {
            bail!("Invalid blob key: {:?}", value);
        }
        for component in path.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("Invalid blob key: {:?}", value),
            }
        }
        Ok(path.to_path_buf())
    }

    fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(Self::checked_relative(bucket)?)
            .join(Self::checked_relative(key)?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bucket: &str, key: &str, content: &[u8], _content_type: &str) -> Result<String> {
        let path = self.blob_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create blob directory: {}", parent.display()))?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write blob: {}", path.display()))?;
        Ok(format!("{}{}", URI_SCHEME, path.display()))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let Some(raw_path) = uri.strip_prefix(URI_SCHEME) else {
            bail!("Unsupported blob URI: {}", uri);
        };
        let path = PathBuf::from(raw_path);
        if !path.starts_with(&self.root) {
            bail!("Blob URI outside the store: {}", uri);
        }
        fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path().to_path_buf());

        let uri = store
            .put("normalized", "abc/edital.pdf", b"%PDF-1.4", "application/pdf")
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(store.get(&uri).await.unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path().to_path_buf());

        assert!(store.put("b", "../outside", b"x", "text/plain").await.is_err());
        assert!(store.put("b", "/etc/passwd", b"x", "text/plain").await.is_err());
        assert!(store.get("file:///etc/passwd").await.is_err());
        assert!(store.get("gs://bucket/key").await.is_err());
    }
}

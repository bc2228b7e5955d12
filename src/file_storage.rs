//! Blob storage for uploaded attachments.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Storage backend for attachment blobs, addressed by storage key.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Location recorded in the file row for `key`.
    fn location(&self, key: &str) -> String;
}

/// Stores each blob as a flat file inside the upload folder.
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            bail!("invalid storage key '{}'", key);
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(key)?;
        debug!(storage_key = %key, full_path = %full_path.display(), size = data.len(), "file_storage: write");

        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            warn!(base_path = %self.base_path.display(), error = %e, "file_storage: create_dir_all failed");
            e
        })?;

        // Write to a sibling temp file and rename so readers never see a partial blob
        let temp_path = self.base_path.join(format!(".{}.tmp", key));
        let mut file = fs::File::create(&temp_path).await?;
        if let Err(e) = file.write_all(data).await {
            warn!(error = %e, "file_storage: write_all failed");
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "file_storage: rename failed");
            e
        })?;

        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(key)?;
        Ok(fs::read(full_path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        if fs::try_exists(&full_path).await? {
            fs::remove_file(full_path).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.full_path(key)?;
        Ok(fs::try_exists(full_path).await?)
    }

    fn location(&self, key: &str) -> String {
        self.base_path.join(key).to_string_lossy().into_owned()
    }
}

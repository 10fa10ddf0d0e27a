//! Content-addressed blob storage for uploaded documents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use whisper_core::{Error, Result};

/// Storage backend for document bytes, keyed by content hash.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `content_hash`. Writing an existing hash is a no-op.
    async fn put(&self, content_hash: &str, data: &[u8]) -> Result<()>;

    /// Read the bytes stored under `content_hash`.
    async fn get(&self, content_hash: &str) -> Result<Option<Vec<u8>>>;

    /// Check if bytes exist for `content_hash`.
    async fn exists(&self, content_hash: &str) -> Result<bool>;
}

/// Generate the storage path for a content hash.
///
/// Path format: `blobs/{first-2-hex}/{next-2-hex}/{hex}.pdf`
///
/// Only lowercase hex digests (optionally prefixed `blake3:`) are accepted,
/// so a hash can never escape the storage root.
pub fn generate_storage_path(content_hash: &str) -> Result<String> {
    let hex = content_hash.strip_prefix("blake3:").unwrap_or(content_hash);
    if hex.len() < 4 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(Error::InvalidInput(format!(
            "invalid content hash '{}'",
            content_hash
        )));
    }
    Ok(format!("blobs/{}/{}/{}.pdf", &hex[0..2], &hex[2..4], hex))
}

/// In-process blob store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::Internal("blob store lock poisoned".to_string())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, content_hash: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs
            .entry(content_hash.to_string())
            .or_insert_with(|| Arc::new(data.to_vec()));
        Ok(())
    }

    async fn get(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.get(content_hash).map(|b| b.as_ref().clone()))
    }

    async fn exists(&self, content_hash: &str) -> Result<bool> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.contains_key(content_hash))
    }
}

/// Filesystem blob store.
///
/// Stores files in a directory hierarchy sharded by content hash.
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    /// Create a new filesystem store with the given base directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, content_hash: &str) -> Result<PathBuf> {
        Ok(self.base_path.join(generate_storage_path(content_hash)?))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, content_hash: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(content_hash)?;
        if fs::try_exists(&full_path).await? {
            return Ok(());
        }
        debug!(content_hash, full_path = %full_path.display(), size = data.len(), "blob_store: write");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "blob_store: create_dir_all failed");
                e
            })?;
        }

        // Atomic write: temp file + rename
        let temp_path = full_path.with_extension(format!("tmp-{}", whisper_core::new_v7()));
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "blob_store: File::create failed");
            e
        })?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "blob_store: rename failed");
            e
        })?;

        // Set permissions to 0644 (rw-r--r--, no execute)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }

    async fn get(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.full_path(content_hash)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, content_hash: &str) -> Result<bool> {
        let full_path = self.full_path(content_hash)?;
        Ok(fs::try_exists(full_path).await?)
    }
}

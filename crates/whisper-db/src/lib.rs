//! # whisper-db
//!
//! Storage layer for the extraction pipeline.
//!
//! This crate provides:
//! - The Extraction Store (drafts, published records, atomic publish)
//! - Document and Job repositories with the job state machine
//! - Content-addressed blob storage for uploaded PDFs
//!
//! Two interchangeable backends implement the repository traits from
//! `whisper-core`: [`MemoryStore`] (default, single process) and [`PgStore`]
//! (PostgreSQL through sqlx).
//!
//! ## Example
//!
//! ```rust,ignore
//! use whisper_db::Database;
//!
//! let db = match std::env::var("DATABASE_URL") {
//!     Ok(url) => Database::connect(&url).await?,
//!     Err(_) => Database::in_memory(),
//! };
//! let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await?;
//! ```

pub mod blob;
pub mod memory;
pub mod pg;
pub mod pool;

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Notify;

pub use blob::{generate_storage_path, BlobStore, FilesystemBlobStore, MemoryBlobStore};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use pool::{create_pool_with_config, PoolConfig};

// Re-export core types
pub use whisper_core::*;

/// Combined storage context shared by the gateway, worker and exporter.
#[derive(Clone)]
pub struct Database {
    /// Uploaded documents.
    pub documents: Arc<dyn DocumentRepository>,
    /// Job state machine and status history.
    pub jobs: Arc<dyn JobRepository>,
    /// Drafts and published extraction records.
    pub records: Arc<dyn ExtractionStore>,
    /// Raw document bytes.
    pub blobs: Arc<dyn BlobStore>,
    notify: Arc<Notify>,
    pool: Option<PgPool>,
}

impl Database {
    /// Single-process store with in-memory blobs.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            documents: store.clone(),
            jobs: store.clone(),
            records: store.clone(),
            notify: store.job_notify(),
            blobs: Arc::new(MemoryBlobStore::new()),
            pool: None,
        }
    }

    /// PostgreSQL-backed store with in-memory blobs.
    pub fn from_pool(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        Self {
            documents: store.clone(),
            jobs: store.clone(),
            records: store.clone(),
            notify: store.job_notify(),
            blobs: Arc::new(MemoryBlobStore::new()),
            pool: Some(pool),
        }
    }

    /// Connect to PostgreSQL with pool settings from the environment.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool_with_config(url, PoolConfig::from_env()).await?;
        Ok(Self::from_pool(pool))
    }

    /// Replace the blob store.
    pub fn with_blob_store(mut self, blobs: impl BlobStore + 'static) -> Self {
        self.blobs = Arc::new(blobs);
        self
    }

    /// Store blobs on the filesystem under `path`.
    pub fn with_filesystem_storage(self, path: &str) -> Self {
        self.with_blob_store(FilesystemBlobStore::new(path))
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Underlying pool, when backed by PostgreSQL.
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Run pending migrations. No-op for the in-memory backend.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::migrate!("../../migrations")
                .run(pool)
                .await
                .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        }
        Ok(())
    }
}

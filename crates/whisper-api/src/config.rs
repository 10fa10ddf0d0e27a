//! HTTP server configuration.

use whisper_core::defaults::{MAX_UPLOAD_BYTES, MULTIPART_OVERHEAD_BYTES, SERVER_HOST, SERVER_PORT};

/// Listener, upload ceiling and storage locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted PDF, in bytes.
    pub max_upload_bytes: u64,
    /// PostgreSQL URL. In-memory store when unset.
    pub database_url: Option<String>,
    /// Filesystem blob root. In-memory blobs when unset.
    pub blob_storage_path: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: SERVER_HOST.to_string(),
            port: SERVER_PORT,
            max_upload_bytes: MAX_UPLOAD_BYTES,
            database_url: None,
            blob_storage_path: None,
        }
    }
}

impl ApiConfig {
    /// Create from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            max_upload_bytes: std::env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &u64| *v > 0)
                .unwrap_or(defaults.max_upload_bytes),
            database_url: non_empty_var("DATABASE_URL"),
            blob_storage_path: non_empty_var("BLOB_STORAGE_PATH"),
        }
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_blob_storage_path(mut self, path: impl Into<String>) -> Self {
        self.blob_storage_path = Some(path.into());
        self
    }

    /// Request body ceiling: the upload limit plus multipart framing.
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES))
            .unwrap_or(usize::MAX)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

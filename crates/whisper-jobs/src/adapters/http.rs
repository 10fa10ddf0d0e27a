//! HTTP client for an external OCR/NLP extraction service.
//!
//! Protocol:
//!
//! | Call | Purpose |
//! |------|---------|
//! | `POST {base}/tasks` (multipart: `file`, `job_id`, `document_id`, `page_count`) | submit |
//! | `GET {base}/tasks/{job_id}` | poll `{status, progress?, record?, error?}` |
//! | `DELETE {base}/tasks/{job_id}` | cancel |
//! | `GET {base}/health` | liveness |
//!
//! `status` is one of `queued`, `running`, `complete`, `error`. Transport
//! failures are reported as worker errors so the retry policy applies to them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, trace};
use uuid::Uuid;

use whisper_core::defaults::{
    EXTRACTION_POLL_INTERVAL_MS, EXTRACTION_REQUEST_TIMEOUT_SECS, PDF_MIME,
};
use whisper_core::{DraftRecord, Error, ExtractionRequest, ExtractionWorker, Result};

/// Connection settings for the external worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpWorkerConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl HttpWorkerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval_ms: EXTRACTION_POLL_INTERVAL_MS,
            request_timeout_secs: EXTRACTION_REQUEST_TIMEOUT_SECS,
        }
    }

    /// Create from environment variables.
    /// Returns None if `EXTRACTION_WORKER_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("EXTRACTION_WORKER_URL").ok()?;
        if base_url.trim().is_empty() {
            return None;
        }
        let mut config = Self::new(base_url.trim());
        if let Some(ms) = std::env::var("EXTRACTION_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.poll_interval_ms = ms;
        }
        Some(config)
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    fn task_url(&self, job_id: Uuid) -> String {
        format!("{}/tasks/{}", self.base_url, job_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskState {
    Queued,
    Running,
    Complete,
    Error,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: TaskState,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    record: Option<JsonValue>,
    #[serde(default)]
    error: Option<String>,
}

/// Extraction worker reached over HTTP.
pub struct HttpExtractionWorker {
    config: HttpWorkerConfig,
    client: Client,
}

impl HttpExtractionWorker {
    pub fn new(config: HttpWorkerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpWorkerConfig {
        &self.config
    }

    async fn submit(&self, req: &ExtractionRequest) -> Result<()> {
        let file_part = reqwest::multipart::Part::bytes(req.data.as_ref().clone())
            .file_name(format!("{}.pdf", req.document.id))
            .mime_str(PDF_MIME)
            .map_err(|e| Error::Internal(format!("Failed to create multipart: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("job_id", req.job_id.to_string())
            .text("document_id", req.document.id.to_string())
            .text("page_count", req.document.page_count.to_string());

        let response = self
            .client
            .post(format!("{}/tasks", self.config.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Worker(format!(
                "worker rejected task with {}: {}",
                status, body
            )));
        }
        debug!(job_id = %req.job_id, "Task submitted to extraction worker");
        Ok(())
    }

    async fn poll(&self, job_id: Uuid) -> Result<TaskStatus> {
        let response = self
            .client
            .get(self.config.task_url(job_id))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Worker(format!(
                "worker status returned {}: {}",
                status, body
            )));
        }
        response
            .json::<TaskStatus>()
            .await
            .map_err(|e| Error::MalformedOutput(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Worker(format!("worker unreachable: {}", e))
}

#[async_trait]
impl ExtractionWorker for HttpExtractionWorker {
    fn name(&self) -> &str {
        "http"
    }

    async fn extract(&self, req: ExtractionRequest) -> Result<DraftRecord> {
        self.submit(&req).await?;
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            sleep(interval).await;
            let status = self.poll(req.job_id).await?;
            trace!(job_id = %req.job_id, status = ?status.status, progress = ?status.progress, "Polled worker");

            match status.status {
                TaskState::Queued => {}
                TaskState::Running => {
                    if let Some(progress) = status.progress {
                        req.report_progress(progress);
                    }
                }
                TaskState::Complete => {
                    req.report_progress(100);
                    let record = status.record.ok_or_else(|| {
                        Error::MalformedOutput("complete task without record".into())
                    })?;
                    return DraftRecord::from_json(record);
                }
                TaskState::Error => {
                    return Err(Error::Worker(
                        status
                            .error
                            .unwrap_or_else(|| "worker reported failure".to_string()),
                    ));
                }
            }
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(self.config.task_url(job_id))
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => {
                debug!(job_id = %job_id, "Worker task cancelled");
                Ok(())
            }
            s => Err(Error::Worker(format!("worker cancel returned {}", s))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self
            .client
            .get(format!("{}/health", self.config.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_trims_trailing_slash() {
        let config = HttpWorkerConfig::new("http://ocr.internal:8080/");
        assert_eq!(config.base_url, "http://ocr.internal:8080");
        assert_eq!(
            config.task_url(Uuid::nil()),
            "http://ocr.internal:8080/tasks/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = HttpWorkerConfig::new("http://w")
            .with_poll_interval(10)
            .with_request_timeout(3);
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.request_timeout_secs, 3);
    }

    #[test]
    fn test_task_status_decodes() {
        let status: TaskStatus =
            serde_json::from_str(r#"{"status":"running","progress":40}"#).unwrap();
        assert!(matches!(status.status, TaskState::Running));
        assert_eq!(status.progress, Some(40));
        assert!(serde_json::from_str::<TaskStatus>(r#"{"status":"paused"}"#).is_err());
    }
}

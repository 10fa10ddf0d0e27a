//! Job worker that claims queued extraction jobs and runs them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use whisper_core::defaults::{EVENT_BUS_CAPACITY, JOB_MAX_CONCURRENT, JOB_TIMEOUT_SECS};
use whisper_core::{Error, Job, Result};
use whisper_db::Database;

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::housekeeping::timeout_message;
use crate::{DEFAULT_MAX_AUTO_RETRIES, DEFAULT_POLL_INTERVAL_MS};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Safety-net polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Wall-clock budget per job, measured from job creation.
    pub job_timeout: Duration,
    /// Automatic re-enqueues allowed after retryable failures.
    pub max_auto_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: JOB_MAX_CONCURRENT,
            enabled: true,
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECS),
            max_auto_retries: DEFAULT_MAX_AUTO_RETRIES,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when no wake-up arrives |
    /// | `JOB_TIMEOUT_SECS` | `300` | Budget per job, from creation |
    /// | `JOB_MAX_AUTO_RETRIES` | `1` | Automatic re-enqueues after worker failures |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(JOB_TIMEOUT_SECS);

        let max_auto_retries = std::env::var("JOB_MAX_AUTO_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_AUTO_RETRIES);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            job_timeout: Duration::from_secs(job_timeout_secs),
            max_auto_retries,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_auto_retries(mut self, retries: u32) -> Self {
        self.max_auto_retries = retries;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A job was claimed and started.
    JobStarted { job_id: Uuid, document_id: Uuid },
    /// Job progress was recorded.
    JobProgress {
        job_id: Uuid,
        percent: u8,
        message: Option<String>,
    },
    /// A job's record was published.
    JobCompleted { job_id: Uuid, document_id: Uuid },
    /// A job failed. `retry_job_id` is set when a retry was queued.
    JobFailed {
        job_id: Uuid,
        error: String,
        retry_job_id: Option<Uuid>,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    db: Database,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
    notify: Arc<Notify>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(db: Database, config: WorkerConfig, handler: impl JobHandler + 'static) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let notify = db.job_notify();
        Self {
            db,
            config,
            handler: Arc::new(handler),
            event_tx,
            notify,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Run the worker loop.
    ///
    /// Keeps up to `max_concurrent_jobs` jobs in flight. When the queue is
    /// empty or the worker is at capacity it waits for whichever comes first:
    /// shutdown, a finished job, an enqueue wake-up, or the poll interval.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            handler = self.handler.name(),
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut tasks = JoinSet::new();

        loop {
            while tasks.len() < self.config.max_concurrent_jobs {
                match self.claim_job().await {
                    Some(job) => {
                        let runner = self.runner();
                        tasks.spawn(async move { runner.execute_job(job).await });
                    }
                    None => break,
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
                _ = self.notify.notified() => {}
                _ = sleep(poll_interval) => {}
            }
        }

        if !tasks.is_empty() {
            // Housekeeping times these out.
            warn!(in_flight = tasks.len(), "Aborting in-flight jobs on shutdown");
        }
        tasks.shutdown().await;

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "jobs", component = "worker", "Job worker stopped");
    }

    async fn claim_job(&self) -> Option<Job> {
        match self.db.jobs.claim_next().await {
            Ok(job) => job,
            Err(e) => {
                error!(error = ?e, "Failed to claim job");
                None
            }
        }
    }

    fn runner(&self) -> JobRunner {
        JobRunner {
            db: self.db.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Everything needed to execute one claimed job in a spawned task.
struct JobRunner {
    db: Database,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let document_id = job.document_id;

        info!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job_id,
            document_id = %document_id,
            attempt = job.attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            document_id,
        });

        let event_tx = self.event_tx.clone();
        let ctx = JobContext::new(job.clone(), self.db.jobs.clone()).with_progress_callback(
            move |percent, message| {
                let _ = event_tx.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: message.map(String::from),
                });
            },
        );

        let result = match self.remaining_budget(&job) {
            Some(remaining) => {
                match tokio::time::timeout(remaining, self.handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            job_id = %job_id,
                            job_timeout_secs = self.config.job_timeout.as_secs(),
                            "Job exceeded its budget"
                        );
                        self.handler.cancel(&job).await;
                        JobResult::Failed(timeout_message(self.config.job_timeout))
                    }
                }
            }
            None => JobResult::Failed(timeout_message(self.config.job_timeout)),
        };

        match result {
            JobResult::Published => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    document_id = %document_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                    job_id,
                    document_id,
                });
            }
            JobResult::Failed(error) => self.fail(&job, error, false, start).await,
            JobResult::Retry(error) => {
                let retry = job.attempt < self.config.max_auto_retries;
                self.fail(&job, error, retry, start).await
            }
        }
    }

    /// Time left before the job's budget, counted from creation, runs out.
    fn remaining_budget(&self, job: &Job) -> Option<Duration> {
        let elapsed = (Utc::now() - job.created_at).to_std().unwrap_or(Duration::ZERO);
        self.config
            .job_timeout
            .checked_sub(elapsed)
            .filter(|d| !d.is_zero())
    }

    async fn fail(&self, job: &Job, error: String, retry: bool, start: Instant) {
        match self.db.jobs.fail(job.id, &error, retry).await {
            Ok(retry_job) => {
                let retry_job_id = retry_job.map(|j| j.id);
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job.id,
                    document_id = %job.document_id,
                    attempt = job.attempt,
                    retry_job_id = ?retry_job_id,
                    %error,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error,
                    retry_job_id,
                });
            }
            Err(Error::InvalidTransition { from, .. }) => {
                // Already terminal, typically timed out by housekeeping.
                debug!(job_id = %job.id, state = %from, "Job already finished, dropping result");
            }
            Err(e) => {
                error!(error = ?e, job_id = %job.id, "Failed to mark job as failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.max_auto_retries, 1);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(50)
            .with_max_concurrent(8)
            .with_job_timeout(Duration::from_secs(2))
            .with_max_auto_retries(0)
            .with_enabled(false);

        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.job_timeout, Duration::from_secs(2));
        assert_eq!(config.max_auto_retries, 0);
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_config_max_concurrent_floor() {
        let config = WorkerConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_remaining_budget_counts_from_creation() {
        struct Idle;

        #[async_trait::async_trait]
        impl JobHandler for Idle {
            fn name(&self) -> &str {
                "idle"
            }
            async fn execute(&self, _ctx: JobContext) -> JobResult {
                JobResult::Published
            }
        }

        let (event_tx, _) = broadcast::channel(4);
        let runner = JobRunner {
            db: Database::in_memory(),
            config: WorkerConfig::default().with_job_timeout(Duration::from_secs(60)),
            handler: Arc::new(Idle),
            event_tx,
        };

        let mut job = Job::queued(Uuid::nil(), Uuid::nil(), 0, None);
        let fresh = runner.remaining_budget(&job).unwrap();
        assert!(fresh <= Duration::from_secs(60) && fresh > Duration::from_secs(59));

        job.created_at = Utc::now() - chrono::Duration::seconds(45);
        let left = runner.remaining_budget(&job).unwrap();
        assert!(left <= Duration::from_secs(15));

        job.created_at = Utc::now() - chrono::Duration::seconds(61);
        assert_eq!(runner.remaining_budget(&job), None);
    }
}

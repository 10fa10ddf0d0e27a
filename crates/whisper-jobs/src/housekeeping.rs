//! Timeout sweeper.
//!
//! The pipeline handler enforces the job budget while it runs. This sweeper
//! covers everything it cannot: jobs still queued when their budget runs out,
//! and jobs whose handler crashed or whose process died mid-flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use whisper_core::defaults::HOUSEKEEPING_INTERVAL_MS;
use whisper_core::{Error, ExtractionWorker, Result};
use whisper_db::Database;

/// Error message recorded on a job that ran out of time.
pub fn timeout_message(budget: Duration) -> String {
    Error::WorkerTimeout(budget.as_secs()).to_string()
}

/// Forces overdue jobs to `error`.
pub struct Housekeeper {
    db: Database,
    job_timeout: Duration,
    interval: Duration,
    worker: Option<Arc<dyn ExtractionWorker>>,
}

impl Housekeeper {
    pub fn new(db: Database, job_timeout: Duration) -> Self {
        Self {
            db,
            job_timeout,
            interval: Duration::from_millis(HOUSEKEEPING_INTERVAL_MS),
            worker: None,
        }
    }

    /// Sweep period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Extraction worker to notify when a job is timed out.
    pub fn with_worker(mut self, worker: Arc<dyn ExtractionWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Fail every non-terminal job created more than the budget before `now`.
    ///
    /// Returns the number of jobs moved to `error`. A job that reached a
    /// terminal state between listing and failing is skipped.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let budget = chrono::Duration::from_std(self.job_timeout)
            .map_err(|e| Error::Config(format!("job timeout out of range: {}", e)))?;
        let overdue = self.db.jobs.overdue(now - budget).await?;
        if overdue.is_empty() {
            return Ok(0);
        }

        let message = timeout_message(self.job_timeout);
        let mut expired = 0;
        for job in overdue {
            match self.db.jobs.fail(job.id, &message, false).await {
                Ok(_) => {
                    expired += 1;
                    warn!(
                        subsystem = "jobs",
                        component = "housekeeping",
                        job_id = %job.id,
                        document_id = %job.document_id,
                        state = %job.state,
                        "Job timed out"
                    );
                    if let Some(worker) = &self.worker {
                        if let Err(e) = worker.cancel(job.id).await {
                            debug!(job_id = %job.id, error = %e, "Worker cancel failed");
                        }
                    }
                }
                Err(Error::InvalidTransition { .. }) => {
                    debug!(job_id = %job.id, "Job finished before it could be timed out");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Run the sweeper in the background.
    pub fn start(self) -> HousekeeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        HousekeeperHandle { shutdown_tx }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        info!(
            subsystem = "jobs",
            component = "housekeeping",
            interval_ms = self.interval.as_millis() as u64,
            job_timeout_secs = self.job_timeout.as_secs(),
            "Housekeeping started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let start = Instant::now();
                    match self.sweep_once(Utc::now()).await {
                        Ok(0) => {}
                        Ok(expired) => debug!(
                            expired,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Timeout sweep finished"
                        ),
                        Err(e) => error!(error = %e, "Timeout sweep failed"),
                    }
                }
            }
        }
        info!(subsystem = "jobs", component = "housekeeping", "Housekeeping stopped");
    }
}

/// Handle for stopping a running sweeper.
pub struct HousekeeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl HousekeeperHandle {
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }
}

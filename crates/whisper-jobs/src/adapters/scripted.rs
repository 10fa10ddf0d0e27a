//! Scripted in-process extraction worker for tests and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use whisper_core::{DraftRecord, Error, ExtractionRequest, ExtractionWorker, Result};

/// What one `extract` call does.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Return this draft.
    Draft(DraftRecord),
    /// Fail with a worker error carrying this message.
    Fail(String),
    /// Never answer.
    Hang,
}

/// Worker that plays back a fixed list of outcomes, one per call. The last
/// outcome repeats once the list is exhausted.
pub struct ScriptedWorker {
    outcomes: Vec<Outcome>,
    progress: Vec<u8>,
    delay: Duration,
    calls: AtomicUsize,
    cancelled: Mutex<Vec<Uuid>>,
}

impl ScriptedWorker {
    pub fn new(outcomes: Vec<Outcome>) -> Self {
        Self {
            outcomes,
            progress: vec![25, 50, 75],
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(draft: DraftRecord) -> Self {
        Self::new(vec![Outcome::Draft(draft)])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(vec![Outcome::Fail(message.into())])
    }

    pub fn hanging() -> Self {
        Self::new(vec![Outcome::Hang])
    }

    /// Progress values reported before the outcome.
    pub fn with_progress(mut self, progress: Vec<u8>) -> Self {
        self.progress = progress;
        self
    }

    /// Pause before the outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `extract` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Jobs the pipeline asked to cancel.
    pub fn cancelled(&self) -> Vec<Uuid> {
        self.cancelled
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExtractionWorker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(&self, req: ExtractionRequest) -> Result<DraftRecord> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .get(call)
            .or_else(|| self.outcomes.last())
            .cloned()
            .unwrap_or(Outcome::Hang);

        for p in &self.progress {
            req.report_progress(*p);
            tokio::task::yield_now().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match outcome {
            Outcome::Draft(draft) => Ok(draft),
            Outcome::Fail(message) => Err(Error::Worker(message)),
            Outcome::Hang => std::future::pending().await,
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.cancelled
            .lock()
            .map_err(|_| Error::Internal("cancel log poisoned".into()))?
            .push(job_id);
        Ok(())
    }
}

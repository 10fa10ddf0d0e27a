//! In-memory store backend.
//!
//! Each document owns a slot behind its own async `RwLock`. Every mutation of
//! a document's jobs, drafts and records happens under that slot's write
//! lock, which gives per-document serialization and atomic publish, while
//! different documents never contend. The outer maps are only touched for
//! short lookups and inserts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock as AsyncRwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use whisper_core::defaults::{PROGRESS_CLAIMED, PROGRESS_DONE};
use whisper_core::{
    new_v7, Document, DocumentRepository, DraftRecord, Error, ExtractionRecord, ExtractionStore,
    Job, JobRepository, JobState, JobTransition, NewJob, Result,
};

struct JobEntry {
    job: Job,
    history: Vec<JobTransition>,
    draft: Option<DraftRecord>,
    record: Option<Arc<ExtractionRecord>>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        let history = vec![JobTransition {
            state: job.state,
            progress: job.progress,
            message: None,
            at: job.created_at,
        }];
        Self {
            job,
            history,
            draft: None,
            record: None,
        }
    }

    fn transition(&mut self, to: JobState, message: Option<String>) -> Result<()> {
        if !self.job.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                job_id: self.job.id,
                from: self.job.state,
                to,
            });
        }
        let now = Utc::now();
        self.job.state = to;
        match to {
            JobState::Processing => {
                self.job.started_at = Some(now);
                self.job.progress = self.job.progress.max(PROGRESS_CLAIMED);
            }
            JobState::Complete => {
                self.job.finished_at = Some(now);
                self.job.progress = PROGRESS_DONE;
            }
            JobState::Error => {
                self.job.finished_at = Some(now);
                self.job.error_message = message.clone();
            }
            JobState::Queued => {}
        }
        self.history.push(JobTransition {
            state: to,
            progress: self.job.progress,
            message,
            at: now,
        });
        Ok(())
    }
}

struct DocumentSlot {
    document: Document,
    /// Oldest first.
    jobs: Vec<JobEntry>,
    /// Job whose record is the current published one.
    published: Option<Uuid>,
}

impl DocumentSlot {
    fn job(&self, job_id: Uuid) -> Option<&JobEntry> {
        self.jobs.iter().find(|e| e.job.id == job_id)
    }

    fn job_mut(&mut self, job_id: Uuid) -> Option<&mut JobEntry> {
        self.jobs.iter_mut().find(|e| e.job.id == job_id)
    }

    fn in_flight(&self) -> Option<&Job> {
        self.jobs
            .iter()
            .map(|e| &e.job)
            .find(|j| !j.state.is_terminal())
    }

    fn push_job(&mut self, req: &NewJob) -> Job {
        let job = Job::queued(new_v7(), req.document_id, req.attempt, req.retry_of);
        self.jobs.push(JobEntry::new(job.clone()));
        job
    }
}

type Slot = Arc<AsyncRwLock<DocumentSlot>>;

/// In-memory implementation of the document, job and extraction stores.
pub struct MemoryStore {
    slots: RwLock<HashMap<Uuid, Slot>>,
    by_hash: Mutex<HashMap<String, Uuid>>,
    job_index: RwLock<HashMap<Uuid, Uuid>>,
    queue: Mutex<VecDeque<Uuid>>,
    notify: Arc<Notify>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::Internal("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_notify(Arc::new(Notify::new()))
    }

    /// Create a store sharing an existing notify handle.
    pub fn with_notify(notify: Arc<Notify>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            by_hash: Mutex::new(HashMap::new()),
            job_index: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            notify,
        }
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn slot(&self, document_id: Uuid) -> Result<Option<Slot>> {
        let slots = self.slots.read().map_err(|_| poisoned())?;
        Ok(slots.get(&document_id).cloned())
    }

    fn slot_for_job(&self, job_id: Uuid) -> Result<Option<Slot>> {
        let document_id = {
            let index = self.job_index.read().map_err(|_| poisoned())?;
            match index.get(&job_id) {
                Some(id) => *id,
                None => return Ok(None),
            }
        };
        self.slot(document_id)
    }

    fn index_job(&self, job: &Job) -> Result<()> {
        self.job_index
            .write()
            .map_err(|_| poisoned())?
            .insert(job.id, job.document_id);
        Ok(())
    }

    fn push_queue(&self, job_id: Uuid) -> Result<()> {
        self.queue.lock().map_err(|_| poisoned())?.push_back(job_id);
        self.notify.notify_one();
        Ok(())
    }

    fn pop_queue(&self) -> Result<Option<Uuid>> {
        Ok(self.queue.lock().map_err(|_| poisoned())?.pop_front())
    }

    fn all_slots(&self) -> Result<Vec<Slot>> {
        let slots = self.slots.read().map_err(|_| poisoned())?;
        Ok(slots.values().cloned().collect())
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

#[async_trait]
impl DocumentRepository for MemoryStore {
    async fn insert_or_get(&self, doc: Document) -> Result<(Document, bool)> {
        let existing_id = {
            let mut by_hash = self.by_hash.lock().map_err(|_| poisoned())?;
            match by_hash.get(&doc.content_hash).copied() {
                Some(id) => Some(id),
                None => {
                    by_hash.insert(doc.content_hash.clone(), doc.id);
                    let slot = Arc::new(AsyncRwLock::new(DocumentSlot {
                        document: doc.clone(),
                        jobs: Vec::new(),
                        published: None,
                    }));
                    self.slots
                        .write()
                        .map_err(|_| poisoned())?
                        .insert(doc.id, slot);
                    None
                }
            }
        };

        if let Some(existing_id) = existing_id {
            let slot = self
                .slot(existing_id)?
                .ok_or_else(|| Error::Internal("hash index points at missing document".into()))?;
            let existing = slot.read().await.document.clone();
            return Ok((existing, false));
        }

        debug!(document_id = %doc.id, page_count = doc.page_count, "Document stored");
        Ok((doc, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        match self.slot(id)? {
            Some(slot) => Ok(Some(slot.read().await.document.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let id = {
            let by_hash = self.by_hash.lock().map_err(|_| poisoned())?;
            by_hash.get(content_hash).copied()
        };
        match id {
            Some(id) => DocumentRepository::get(self, id).await,
            None => Ok(None),
        }
    }
}

// =============================================================================
// JOBS
// =============================================================================

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(&self, req: NewJob) -> Result<Job> {
        let slot = self
            .slot(req.document_id)?
            .ok_or_else(|| Error::NotFound(format!("document {}", req.document_id)))?;

        let job = {
            let mut guard = slot.write().await;
            if let Some(active) = guard.in_flight() {
                return Err(Error::Conflict(format!(
                    "document {} already has job {} in state {}",
                    req.document_id, active.id, active.state
                )));
            }
            let job = guard.push_job(&req);
            self.index_job(&job)?;
            job
        };

        self.push_queue(job.id)?;
        debug!(job_id = %job.id, document_id = %job.document_id, attempt = job.attempt, "Job queued");
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        while let Some(job_id) = self.pop_queue()? {
            let Some(slot) = self.slot_for_job(job_id)? else {
                continue;
            };
            let mut guard = slot.write().await;
            let Some(entry) = guard.job_mut(job_id) else {
                continue;
            };
            if entry.job.state != JobState::Queued {
                // Failed (e.g. timed out) while waiting in the queue.
                trace!(job_id = %job_id, state = %entry.job.state, "Skipping stale queue entry");
                continue;
            }
            entry.transition(JobState::Processing, None)?;
            return Ok(Some(entry.job.clone()));
        }
        Ok(None)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        message: Option<&str>,
    ) -> Result<bool> {
        let Some(slot) = self.slot_for_job(job_id)? else {
            return Ok(false);
        };
        let mut guard = slot.write().await;
        let Some(entry) = guard.job_mut(job_id) else {
            return Ok(false);
        };
        if entry.job.state.is_terminal() {
            return Ok(false);
        }
        let progress = progress.min(PROGRESS_DONE - 1);
        if progress > entry.job.progress {
            entry.job.progress = progress;
            if let Some(message) = message {
                entry.history.push(JobTransition {
                    state: entry.job.state,
                    progress,
                    message: Some(message.to_string()),
                    at: Utc::now(),
                });
            }
        }
        Ok(true)
    }

    async fn fail(&self, job_id: Uuid, message: &str, retry: bool) -> Result<Option<Job>> {
        let slot = self
            .slot_for_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

        let retry_job = {
            let mut guard = slot.write().await;
            let entry = guard
                .job_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
            entry.transition(JobState::Error, Some(message.to_string()))?;
            let (document_id, attempt) = (entry.job.document_id, entry.job.attempt);

            if retry {
                let req = NewJob {
                    document_id,
                    attempt: attempt + 1,
                    retry_of: Some(job_id),
                };
                let next = guard.push_job(&req);
                if let Some(entry) = guard.job_mut(job_id) {
                    entry.job.retry_job_id = Some(next.id);
                }
                self.index_job(&next)?;
                Some(next)
            } else {
                None
            }
        };

        if let Some(next) = &retry_job {
            self.push_queue(next.id)?;
            debug!(job_id = %job_id, retry_job_id = %next.id, "Job failed, retry queued");
        }
        Ok(retry_job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let Some(slot) = self.slot_for_job(job_id)? else {
            return Ok(None);
        };
        let guard = slot.read().await;
        Ok(guard.job(job_id).map(|e| e.job.clone()))
    }

    async fn latest_for_document(&self, document_id: Uuid) -> Result<Option<Job>> {
        let Some(slot) = self.slot(document_id)? else {
            return Ok(None);
        };
        let guard = slot.read().await;
        Ok(guard.jobs.last().map(|e| e.job.clone()))
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<Job>> {
        let Some(slot) = self.slot(document_id)? else {
            return Ok(Vec::new());
        };
        let guard = slot.read().await;
        Ok(guard.jobs.iter().map(|e| e.job.clone()).collect())
    }

    async fn history(&self, job_id: Uuid) -> Result<Vec<JobTransition>> {
        let Some(slot) = self.slot_for_job(job_id)? else {
            return Ok(Vec::new());
        };
        let guard = slot.read().await;
        Ok(guard
            .job(job_id)
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn overdue(&self, created_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut overdue = Vec::new();
        for slot in self.all_slots()? {
            let guard = slot.read().await;
            overdue.extend(
                guard
                    .jobs
                    .iter()
                    .map(|e| &e.job)
                    .filter(|j| !j.state.is_terminal() && j.created_at < created_before)
                    .cloned(),
            );
        }
        overdue.sort_by_key(|j| j.created_at);
        Ok(overdue)
    }
}

// =============================================================================
// EXTRACTION RECORDS
// =============================================================================

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn put_draft(&self, job_id: Uuid, draft: &DraftRecord) -> Result<()> {
        let slot = self
            .slot_for_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        let mut guard = slot.write().await;
        let entry = guard
            .job_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        if entry.job.state != JobState::Processing {
            return Err(Error::Conflict(format!(
                "job {} is {}, drafts are only accepted while processing",
                job_id, entry.job.state
            )));
        }
        entry.draft = Some(draft.clone());
        Ok(())
    }

    async fn get_draft(&self, job_id: Uuid) -> Result<Option<DraftRecord>> {
        let Some(slot) = self.slot_for_job(job_id)? else {
            return Ok(None);
        };
        let guard = slot.read().await;
        Ok(guard.job(job_id).and_then(|e| e.draft.clone()))
    }

    async fn put(&self, record: &ExtractionRecord) -> Result<()> {
        let slot = self
            .slot(record.document_id)?
            .ok_or_else(|| Error::NotFound(format!("document {}", record.document_id)))?;
        let mut guard = slot.write().await;
        let entry = guard.job_mut(record.job_id).ok_or_else(|| {
            Error::NotFound(format!(
                "job {} for document {}",
                record.job_id, record.document_id
            ))
        })?;

        if entry.job.state == JobState::Complete && entry.record.is_some() {
            debug!(job_id = %record.job_id, "Record already published, skipping");
            return Ok(());
        }
        entry.transition(JobState::Complete, None)?;
        entry.record = Some(Arc::new(record.clone()));
        entry.draft = None;
        // Only the published record is kept; finished jobs drop their drafts.
        for other in guard.jobs.iter_mut().filter(|e| e.job.id != record.job_id) {
            other.record = None;
            if other.job.state.is_terminal() {
                other.draft = None;
            }
        }
        guard.published = Some(record.job_id);

        debug!(
            job_id = %record.job_id,
            document_id = %record.document_id,
            check_count = record.checks.len(),
            "Record published"
        );
        Ok(())
    }

    async fn get(&self, document_id: Uuid) -> Result<Option<ExtractionRecord>> {
        let Some(slot) = self.slot(document_id)? else {
            return Ok(None);
        };
        let guard = slot.read().await;
        let Some(job_id) = guard.published else {
            return Ok(None);
        };
        Ok(guard
            .job(job_id)
            .and_then(|e| e.record.as_ref())
            .map(|r| r.as_ref().clone()))
    }

    async fn get_for_job(&self, job_id: Uuid) -> Result<Option<ExtractionRecord>> {
        let Some(slot) = self.slot_for_job(job_id)? else {
            return Ok(None);
        };
        let guard = slot.read().await;
        Ok(guard
            .job(job_id)
            .and_then(|e| e.record.as_ref())
            .map(|r| r.as_ref().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use whisper_core::{Totals, Money};

    fn document(hash: &str) -> Document {
        Document {
            id: new_v7(),
            content_hash: hash.to_string(),
            page_count: 2,
            size_bytes: 10,
            filename: Some("om.pdf".into()),
            uploaded_at: Utc::now(),
        }
    }

    fn record(job: &Job) -> ExtractionRecord {
        ExtractionRecord {
            document_id: job.document_id,
            job_id: job.id,
            totals: Totals {
                noi: Some(Money::from_dollars(600_000)),
                ..Default::default()
            },
            derivations: vec![],
            t12_lines: vec![],
            rent_roll: vec![],
            debt_terms: None,
            covenants: vec![],
            assumptions: vec![],
            checks: vec![],
            confidences: BTreeMap::new(),
            provenance: vec![],
            reconciled_at: Utc::now(),
        }
    }

    async fn store_with_doc() -> (MemoryStore, Document) {
        let store = MemoryStore::new();
        let (doc, created) = store.insert_or_get(document("blake3:aa")).await.unwrap();
        assert!(created);
        (store, doc)
    }

    #[tokio::test]
    async fn insert_or_get_dedups_by_hash() {
        let (store, doc) = store_with_doc().await;
        let (again, created) = store.insert_or_get(document("blake3:aa")).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, doc.id);
        assert_eq!(
            store.find_by_hash("blake3:aa").await.unwrap().map(|d| d.id),
            Some(doc.id)
        );
    }

    #[tokio::test]
    async fn second_inflight_job_is_a_conflict() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        let err = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn claim_moves_to_processing_with_history() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.progress, PROGRESS_CLAIMED);
        assert!(store.claim_next().await.unwrap().is_none());

        let states: Vec<_> = store
            .history(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.state)
            .collect();
        assert_eq!(states, vec![JobState::Queued, JobState::Processing]);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_frozen_after_terminal() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.claim_next().await.unwrap();

        assert!(store.update_progress(job.id, 40, None).await.unwrap());
        assert!(store.update_progress(job.id, 20, None).await.unwrap());
        assert_eq!(JobRepository::get(&store, job.id).await.unwrap().unwrap().progress, 40);

        store.fail(job.id, "boom", false).await.unwrap();
        assert!(!store.update_progress(job.id, 90, None).await.unwrap());
        let failed = JobRepository::get(&store, job.id).await.unwrap().unwrap();
        assert_eq!(failed.progress, 40);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn fail_with_retry_links_jobs_atomically() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.claim_next().await.unwrap();

        let retry = store.fail(job.id, "worker crashed", true).await.unwrap().unwrap();
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.retry_of, Some(job.id));

        let failed = JobRepository::get(&store, job.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Error);
        assert_eq!(failed.retry_job_id, Some(retry.id));
        assert_eq!(store.claim_next().await.unwrap().map(|j| j.id), Some(retry.id));
    }

    #[tokio::test]
    async fn terminal_jobs_reject_further_transitions() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.fail(job.id, "timeout", false).await.unwrap();

        let err = store.fail(job.id, "again", false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        // The queue entry is stale and must be skipped.
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_publishes_and_completes_once() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.claim_next().await.unwrap();
        assert!(ExtractionStore::get(&store, doc.id).await.unwrap().is_none());

        let rec = record(&job);
        store.put(&rec).await.unwrap();
        store.put(&rec).await.unwrap();

        let done = JobRepository::get(&store, job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Complete);
        assert_eq!(done.progress, 100);
        assert_eq!(ExtractionStore::get(&store, doc.id).await.unwrap(), Some(rec.clone()));
        assert_eq!(store.get_for_job(job.id).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn publish_evicts_drafts_and_superseded_records() {
        let (store, doc) = store_with_doc().await;
        let first = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.claim_next().await.unwrap();
        store.put_draft(first.id, &DraftRecord::default()).await.unwrap();
        store.put(&record(&first)).await.unwrap();
        assert!(store.get_draft(first.id).await.unwrap().is_none());

        let second = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.claim_next().await.unwrap();
        store.put_draft(second.id, &DraftRecord::default()).await.unwrap();
        store.put(&record(&second)).await.unwrap();

        assert!(store.get_draft(second.id).await.unwrap().is_none());
        assert!(store.get_for_job(first.id).await.unwrap().is_none());
        assert_eq!(
            ExtractionStore::get(&store, doc.id).await.unwrap().map(|r| r.job_id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn put_for_failed_job_is_rejected() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        store.claim_next().await.unwrap();
        store.fail(job.id, "timeout", false).await.unwrap();

        let err = store.put(&record(&job)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(ExtractionStore::get(&store, doc.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drafts_require_processing() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        let draft = DraftRecord::default();
        assert!(matches!(
            store.put_draft(job.id, &draft).await,
            Err(Error::Conflict(_))
        ));
        store.claim_next().await.unwrap();
        store.put_draft(job.id, &draft).await.unwrap();
        assert_eq!(store.get_draft(job.id).await.unwrap(), Some(draft));
    }

    #[tokio::test]
    async fn overdue_lists_only_old_inflight_jobs() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        let overdue = store.overdue(later).await.unwrap();
        assert_eq!(overdue.iter().map(|j| j.id).collect::<Vec<_>>(), vec![job.id]);
        assert!(store.overdue(job.created_at).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_wakes_waiters() {
        let (store, doc) = store_with_doc().await;
        let notify = store.job_notify();
        store.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
        // notify_one stores a permit when nobody is waiting yet.
        tokio::time::timeout(std::time::Duration::from_millis(100), notify.notified())
            .await
            .expect("permit stored by enqueue");
    }
}

//! Extraction store implementation: drafts and published records.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use whisper_core::defaults::PROGRESS_DONE;
use whisper_core::{
    DraftRecord, Error, ExtractionRecord, ExtractionStore, JobState, Result,
};

use super::{lock_document, record_transition, PgStore};

#[async_trait]
impl ExtractionStore for PgStore {
    async fn put_draft(&self, job_id: Uuid, draft: &DraftRecord) -> Result<()> {
        let payload = serde_json::to_value(draft)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;
        let state: JobState = state
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?
            .parse()?;
        if state != JobState::Processing {
            return Err(Error::Conflict(format!(
                "job {} is {}, drafts are only accepted while processing",
                job_id, state
            )));
        }

        sqlx::query(
            "INSERT INTO drafts (job_id, draft, stored_at) VALUES ($1, $2, NOW())
             ON CONFLICT (job_id) DO UPDATE SET draft = EXCLUDED.draft, stored_at = NOW()",
        )
        .bind(job_id)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get_draft(&self, job_id: Uuid) -> Result<Option<DraftRecord>> {
        let payload: Option<JsonValue> =
            sqlx::query_scalar("SELECT draft FROM drafts WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        payload
            .map(|p| serde_json::from_value(p).map_err(Error::from))
            .transpose()
    }

    async fn put(&self, record: &ExtractionRecord) -> Result<()> {
        let payload = serde_json::to_value(record)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_document(&mut tx, record.document_id).await?;

        let current: Option<(String, i16)> = sqlx::query_as(
            "SELECT state, progress FROM jobs WHERE id = $1 AND document_id = $2 FOR UPDATE",
        )
        .bind(record.job_id)
        .bind(record.document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let (state, _) = current.ok_or_else(|| {
            Error::NotFound(format!(
                "job {} for document {}",
                record.job_id, record.document_id
            ))
        })?;
        let state: JobState = state.parse()?;

        if state == JobState::Complete {
            debug!(job_id = %record.job_id, "Record already published, skipping");
            return Ok(());
        }
        if !state.can_transition_to(JobState::Complete) {
            return Err(Error::InvalidTransition {
                job_id: record.job_id,
                from: state,
                to: JobState::Complete,
            });
        }

        // Record and state flip commit together: readers never see
        // `complete` without the record, nor the record without `complete`.
        sqlx::query(
            "INSERT INTO extraction_records (document_id, job_id, record, published_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (document_id, job_id) DO NOTHING",
        )
        .bind(record.document_id)
        .bind(record.job_id)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE jobs SET state = 'complete', progress = $2, finished_at = $3 WHERE id = $1",
        )
        .bind(record.job_id)
        .bind(PROGRESS_DONE as i16)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        record_transition(&mut tx, record.job_id, JobState::Complete, PROGRESS_DONE, None).await?;

        // Only the published record is kept; finished jobs drop their drafts.
        sqlx::query("DELETE FROM extraction_records WHERE document_id = $1 AND job_id <> $2")
            .bind(record.document_id)
            .bind(record.job_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query(
            "DELETE FROM drafts WHERE job_id IN (
                 SELECT id FROM jobs WHERE document_id = $1 AND state IN ('complete', 'error')
             )",
        )
        .bind(record.document_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        debug!(
            job_id = %record.job_id,
            document_id = %record.document_id,
            check_count = record.checks.len(),
            "Record published"
        );
        Ok(())
    }

    async fn get(&self, document_id: Uuid) -> Result<Option<ExtractionRecord>> {
        let payload: Option<JsonValue> = sqlx::query_scalar(
            "SELECT record FROM extraction_records WHERE document_id = $1
             ORDER BY published_at DESC, job_id DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        payload
            .map(|p| serde_json::from_value(p).map_err(Error::from))
            .transpose()
    }

    async fn get_for_job(&self, job_id: Uuid) -> Result<Option<ExtractionRecord>> {
        let payload: Option<JsonValue> =
            sqlx::query_scalar("SELECT record FROM extraction_records WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        payload
            .map(|p| serde_json::from_value(p).map_err(Error::from))
            .transpose()
    }
}

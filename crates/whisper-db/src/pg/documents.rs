//! Document repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use whisper_core::{Document, DocumentRepository, Error, Result};

use super::PgStore;

fn parse_document_row(row: &PgRow) -> Document {
    let page_count: i32 = row.get("page_count");
    let size_bytes: i64 = row.get("size_bytes");
    Document {
        id: row.get("id"),
        content_hash: row.get("content_hash"),
        page_count: page_count.max(0) as u32,
        size_bytes: size_bytes.max(0) as u64,
        filename: row.get("filename"),
        uploaded_at: row.get("uploaded_at"),
    }
}

#[async_trait]
impl DocumentRepository for PgStore {
    async fn insert_or_get(&self, doc: Document) -> Result<(Document, bool)> {
        // ON CONFLICT DO NOTHING returns no row when the hash already exists.
        let inserted = sqlx::query(
            "INSERT INTO documents (id, content_hash, page_count, size_bytes, filename, uploaded_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (content_hash) DO NOTHING
             RETURNING id, content_hash, page_count, size_bytes, filename, uploaded_at",
        )
        .bind(doc.id)
        .bind(&doc.content_hash)
        .bind(doc.page_count as i32)
        .bind(doc.size_bytes as i64)
        .bind(&doc.filename)
        .bind(doc.uploaded_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = inserted {
            debug!(document_id = %doc.id, page_count = doc.page_count, "Document stored");
            return Ok((parse_document_row(&row), true));
        }

        let existing = self.find_by_hash(&doc.content_hash).await?.ok_or_else(|| {
            Error::Internal(format!(
                "document with hash {} vanished after conflict",
                doc.content_hash
            ))
        })?;
        Ok((existing, false))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, content_hash, page_count, size_bytes, filename, uploaded_at
             FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(parse_document_row))
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, content_hash, page_count, size_bytes, filename, uploaded_at
             FROM documents WHERE content_hash = $1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(parse_document_row))
    }
}

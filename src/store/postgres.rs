//! Postgres/pgvector backend.
//!
//! One [`PgStore`] serves documents, crawl jobs and content fingerprints
//! from the schema created by [`crate::migrate`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::crawl::dedup::{DedupEntry, DedupStore, Fingerprint};
use crate::models::{
    CrawlConfig, CrawlJob, CrawlResult, CrawlStatus, Document, NewDocument, ScoredDocument,
};

use super::{DocumentStore, JobStore};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &PgRow) -> Result<Document> {
    let metadata: Json<serde_json::Value> = row.try_get("metadata")?;
    let embedding: Option<Vector> = row.try_get("embedding")?;
    Ok(Document {
        id: row.try_get("id")?,
        text: row.try_get("text")?,
        metadata: metadata.0,
        embedding: embedding.map(|v| v.to_vec()),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_job(row: &PgRow) -> Result<CrawlJob> {
    let status: String = row.try_get("status")?;
    let config: Json<CrawlConfig> = row.try_get("config")?;
    let result: Option<Json<CrawlResult>> = row.try_get("result")?;
    Ok(CrawlJob {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        status: status
            .parse()
            .with_context(|| format!("crawl_jobs row has unknown status '{}'", status))?,
        config: config.0,
        result: result.map(|r| r.0),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

const JOB_COLUMNS: &str = "id, url, status, config, result, error_message, \
                           created_at, updated_at, queued_at, started_at, completed_at";

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert_document(&self, doc: NewDocument) -> Result<Document> {
        let row = sqlx::query(
            r#"
            INSERT INTO documents (text, metadata, embedding)
            VALUES ($1, $2, $3)
            RETURNING id, text, metadata, embedding, created_at, updated_at
            "#,
        )
        .bind(&doc.text)
        .bind(Json(&doc.metadata))
        .bind(doc.embedding.map(Vector::from))
        .fetch_one(&self.pool)
        .await
        .context("failed to insert document")?;

        row_to_document(&row)
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, text, metadata, embedding, created_at, updated_at FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn match_documents(
        &self,
        query: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, text, metadata, embedding, created_at, updated_at,
                   1 - (embedding <=> $1) AS similarity
            FROM documents
            WHERE embedding IS NOT NULL
              AND 1 - (embedding <=> $1) > $2
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(threshold)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("vector search failed")?;

        rows.iter()
            .map(|row| {
                Ok(ScoredDocument {
                    document: row_to_document(row)?,
                    similarity: row.try_get("similarity")?,
                })
            })
            .collect()
    }

    async fn count_documents(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn save_job(&self, job: &CrawlJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_jobs (id, url, status, config, result, error_message,
                                    created_at, updated_at, queued_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                config = EXCLUDED.config,
                result = EXCLUDED.result,
                error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at,
                queued_at = EXCLUDED.queued_at,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(job.id)
        .bind(&job.url)
        .bind(job.status.as_str())
        .bind(Json(&job.config))
        .bind(job.result.as_ref().map(Json))
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save crawl job {}", job.id))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM crawl_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self, status: Option<CrawlStatus>, limit: usize) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM crawl_jobs \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn unfinished_jobs(&self) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM crawl_jobs WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }
}

#[async_trait]
impl DedupStore for PgStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DedupEntry>> {
        let row = sqlx::query(
            r#"
            SELECT content_hash, url_hash, job_id, url, title, content_size, extracted_at
            FROM crawl_content WHERE content_hash = $1
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<DedupEntry> {
            let content_size: i64 = row.try_get("content_size")?;
            Ok(DedupEntry {
                fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("content_hash")?),
                url_fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("url_hash")?),
                job_id: row.try_get("job_id")?,
                url: row.try_get("url")?,
                title: row.try_get("title")?,
                content_size: content_size.max(0) as usize,
                first_seen: row.try_get("extracted_at")?,
            })
        })
        .transpose()
    }

    async fn insert_if_absent(&self, entry: DedupEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO crawl_content (content_hash, url_hash, job_id, url, title, content_size, extracted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (content_hash) DO NOTHING
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(entry.url_fingerprint.as_str())
        .bind(entry.job_id)
        .bind(&entry.url)
        .bind(&entry.title)
        .bind(entry.content_size as i64)
        .bind(entry.first_seen)
        .execute(&self.pool)
        .await
        .context("failed to record content fingerprint")?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM crawl_content WHERE content_hash = $1 AND job_id = $2")
            .bind(fingerprint.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to release content fingerprint")?;
        Ok(result.rows_affected() == 1)
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let (content, urls): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT url_hash) FROM crawl_content",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((content as u64, urls as u64))
    }
}

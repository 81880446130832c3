//! Storage abstraction.
//!
//! [`DocumentStore`] holds embedded documents and answers similarity
//! queries; [`JobStore`] persists crawl jobs. Both are async traits so the
//! Postgres backend and the in-memory backend (tests, local runs without a
//! database) are interchangeable.
//!
//! | Backend | Documents | Jobs | Fingerprints |
//! |---------|-----------|------|--------------|
//! | [`memory`] | brute-force cosine | `HashMap` | [`InMemoryDedupStore`](crate::crawl::dedup::InMemoryDedupStore) |
//! | [`postgres`] | pgvector `<=>` | `crawl_jobs` | `crawl_content` |

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{CrawlJob, CrawlStatus, Document, NewDocument, ScoredDocument};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document; the store assigns `id` and timestamps.
    async fn insert_document(&self, doc: NewDocument) -> Result<Document>;

    async fn get_document(&self, id: i64) -> Result<Option<Document>>;

    /// Documents with cosine similarity above `threshold`, best first.
    async fn match_documents(
        &self,
        query: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredDocument>>;

    async fn count_documents(&self) -> Result<u64>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the job with the same id.
    async fn save_job(&self, job: &CrawlJob) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<CrawlJob>>;

    /// Newest first.
    async fn list_jobs(&self, status: Option<CrawlStatus>, limit: usize) -> Result<Vec<CrawlJob>>;

    /// Jobs in `pending` or `running`, oldest first.
    async fn unfinished_jobs(&self) -> Result<Vec<CrawlJob>>;
}

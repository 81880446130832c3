//! In-memory stores for tests and database-less runs.
//!
//! Uses `HashMap`/`Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over all stored embeddings.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::models::{CrawlJob, CrawlStatus, Document, NewDocument, ScoredDocument};

use super::{DocumentStore, JobStore};

#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<Vec<Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_document(&self, doc: NewDocument) -> Result<Document> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let stored = Document {
            id: docs.last().map_or(1, |d| d.id + 1),
            text: doc.text,
            metadata: doc.metadata,
            embedding: doc.embedding,
            created_at: now,
            updated_at: now,
        };
        docs.push(stored.clone());
        Ok(stored)
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.iter().find(|d| d.id == id).cloned())
    }

    async fn match_documents(
        &self,
        query: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<ScoredDocument> = docs
            .iter()
            .filter_map(|d| {
                let embedding = d.embedding.as_ref()?;
                let similarity = cosine_similarity(query, embedding) as f64;
                (similarity > threshold).then(|| ScoredDocument {
                    document: d.clone(),
                    similarity,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count_documents(&self) -> Result<u64> {
        Ok(self.docs.read().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, CrawlJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save_job(&self, job: &CrawlJob) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, status: Option<CrawlStatus>, limit: usize) -> Result<Vec<CrawlJob>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<CrawlJob> = jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn unfinished_jobs(&self) -> Result<Vec<CrawlJob>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut unfinished: Vec<CrawlJob> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(unfinished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CrawlConfig;

    fn new_doc(text: &str, embedding: Vec<f32>) -> NewDocument {
        NewDocument {
            text: text.to_string(),
            metadata: serde_json::json!({ "filename": format!("{}.txt", text) }),
            embedding: Some(embedding),
        }
    }

    #[tokio::test]
    async fn ids_are_sequential() {
        let store = InMemoryDocumentStore::new();
        let a = store.insert_document(new_doc("a", vec![1.0, 0.0])).await.unwrap();
        let b = store.insert_document(new_doc("b", vec![0.0, 1.0])).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.count_documents().await.unwrap(), 2);
        assert_eq!(store.get_document(2).await.unwrap().unwrap().text, "b");
        assert!(store.get_document(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn match_orders_by_similarity() {
        let store = InMemoryDocumentStore::new();
        store.insert_document(new_doc("x", vec![1.0, 0.0])).await.unwrap();
        store.insert_document(new_doc("y", vec![0.7, 0.7])).await.unwrap();
        store.insert_document(new_doc("z", vec![-1.0, 0.0])).await.unwrap();
        store
            .insert_document(NewDocument {
                text: "no vector".into(),
                metadata: serde_json::json!({}),
                embedding: None,
            })
            .await
            .unwrap();

        let hits = store.match_documents(&[1.0, 0.1], 0.0, 10).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.document.text.as_str()).collect();
        assert_eq!(texts, vec!["x", "y"]);

        let top = store.match_documents(&[1.0, 0.1], -1.0, 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].document.text, "x");
    }

    #[tokio::test]
    async fn job_listing_filters_and_limits() {
        let store = InMemoryJobStore::new();
        let mut first = CrawlJob::new("https://a.example", CrawlConfig::default());
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = CrawlJob::new("https://b.example", CrawlConfig::default());
        second.mark_running().unwrap();
        store.save_job(&first).await.unwrap();
        store.save_job(&second).await.unwrap();

        let all = store.list_jobs(None, 10).await.unwrap();
        assert_eq!(all[0].id, second.id);
        assert_eq!(store.list_jobs(None, 1).await.unwrap().len(), 1);

        let pending = store.list_jobs(Some(CrawlStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);

        let unfinished = store.unfinished_jobs().await.unwrap();
        assert_eq!(unfinished[0].id, first.id);
        assert_eq!(unfinished.len(), 2);
    }
}

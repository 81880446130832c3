//! Ingestion pipeline: text → embedding → document store → graph episode.
//!
//! Shared by `POST /ingest`, `ragflow ingest` and completed crawl jobs.
//! The document write is the only step that can fail the call; the graph
//! episode is best-effort and its outcome is reported alongside.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::ServiceError;
use crate::graph::{Episode, GraphClient};
use crate::models::{Document, NewDocument};
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Filename or URL; prefixes the graph episode name.
    pub source: String,
    pub source_description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GraphOutcome {
    Added { episode_name: String },
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: i64,
    pub created_at: chrono::DateTime<Utc>,
    pub embedded: bool,
    pub graph: GraphOutcome,
}

pub struct Ingestor {
    documents: Arc<dyn DocumentStore>,
    embedder: Arc<Embedder>,
    graph: Arc<dyn GraphClient>,
    max_episode_chars: usize,
}

impl Ingestor {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        embedder: Arc<Embedder>,
        graph: Arc<dyn GraphClient>,
        max_episode_chars: usize,
    ) -> Self {
        Self {
            documents,
            embedder,
            graph,
            max_episode_chars,
        }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, ServiceError> {
        if request.text.trim().is_empty() {
            return Err(ServiceError::validation("Document text is empty."));
        }

        let embedding = if self.embedder.is_enabled() {
            Some(self.embedder.embed(&request.text).await?)
        } else {
            None
        };
        let embedded = embedding.is_some();

        let document: Document = self
            .documents
            .insert_document(NewDocument {
                text: request.text.clone(),
                metadata: serde_json::Value::Object(request.metadata),
                embedding,
            })
            .await?;

        tracing::info!(
            document_id = document.id,
            source = %request.source,
            chars = request.text.len(),
            embedded,
            "stored document"
        );

        let graph = self
            .add_episode(&request.source, &request.source_description, &request.text)
            .await;

        Ok(IngestOutcome {
            document_id: document.id,
            created_at: document.created_at,
            embedded,
            graph,
        })
    }

    async fn add_episode(&self, source: &str, description: &str, text: &str) -> GraphOutcome {
        if !self.graph.is_available() {
            return GraphOutcome::Skipped;
        }
        let id = Uuid::new_v4().simple().to_string();
        let episode_name = format!("{}_{}", source, &id[..8]);
        let episode = Episode {
            name: episode_name.clone(),
            body: text.chars().take(self.max_episode_chars).collect(),
            source_description: description.to_string(),
            reference_time: Utc::now(),
        };
        match self.graph.add_episode(episode).await {
            Ok(()) => GraphOutcome::Added { episode_name },
            Err(e) => {
                tracing::warn!(episode = %episode_name, error = %e, "graph episode failed");
                GraphOutcome::Failed
            }
        }
    }
}

//! Retrieval: query embedding → vector similarity → metadata filter,
//! merged with knowledge-graph facts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::ServiceError;
use crate::graph::{GraphClient, GraphFact};
use crate::models::ScoredDocument;
use crate::store::DocumentStore;

/// Candidates fetched per requested hit when a metadata filter will
/// discard some of them.
const FILTER_OVERFETCH: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub doc_id: i64,
    pub filename: String,
    pub snippet: String,
    pub similarity: f64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResponse {
    pub vector_results: Vec<VectorHit>,
    pub graph_results: Vec<GraphFact>,
}

pub struct Retriever {
    documents: Arc<dyn DocumentStore>,
    embedder: Arc<Embedder>,
    graph: Arc<dyn GraphClient>,
    config: RetrievalConfig,
}

/// Every key in `filter` is present in `metadata` with an equal value.
pub fn metadata_matches(
    metadata: &serde_json::Value,
    filter: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

impl Retriever {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        embedder: Arc<Embedder>,
        graph: Arc<dyn GraphClient>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            documents,
            embedder,
            graph,
            config,
        }
    }

    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResponse, ServiceError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ServiceError::validation("Query is required."));
        }
        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        if top_k < 1 || top_k > self.config.max_top_k {
            return Err(ServiceError::validation(format!(
                "top_k must be between 1 and {}.",
                self.config.max_top_k
            )));
        }
        let filter = request.metadata.filter(|m| !m.is_empty());

        let embedding = self.embedder.embed(query).await?;
        let fetch = if filter.is_some() {
            top_k * FILTER_OVERFETCH
        } else {
            top_k
        };
        let mut docs = self
            .documents
            .match_documents(&embedding, self.config.match_threshold, fetch)
            .await?;
        if let Some(filter) = &filter {
            docs.retain(|d| metadata_matches(&d.document.metadata, filter));
        }
        docs.truncate(top_k);

        let graph_results = self.graph_facts(query).await;
        tracing::info!(
            query,
            top_k,
            vector_hits = docs.len(),
            graph_hits = graph_results.len(),
            "retrieval"
        );

        Ok(RetrievalResponse {
            vector_results: docs.into_iter().map(|d| self.hit(d)).collect(),
            graph_results,
        })
    }

    async fn graph_facts(&self, query: &str) -> Vec<GraphFact> {
        if !self.graph.is_available() {
            return Vec::new();
        }
        match self.graph.search(query, self.config.graph_results, None).await {
            Ok(facts) => facts,
            Err(e) => {
                tracing::warn!(error = %e, "graph search during retrieval failed");
                Vec::new()
            }
        }
    }

    fn hit(&self, scored: ScoredDocument) -> VectorHit {
        let doc = scored.document;
        let filename = doc
            .metadata
            .get("filename")
            .or_else(|| doc.metadata.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        VectorHit {
            doc_id: doc.id,
            filename,
            snippet: doc.text.chars().take(self.config.snippet_chars).collect(),
            similarity: scored.similarity,
            metadata: doc.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::graph::DisabledGraph;
    use crate::models::NewDocument;
    use crate::store::memory::InMemoryDocumentStore;
    use serde_json::json;

    async fn seeded() -> Retriever {
        let embedding = EmbeddingConfig {
            provider: "hash".into(),
            dims: 256,
            ..EmbeddingConfig::default()
        };
        let embedder = Arc::new(Embedder::new(&embedding).unwrap());
        let store = Arc::new(InMemoryDocumentStore::new());
        for (text, team) in [
            ("postgres vector index tuning guide", "data"),
            ("quarterly finance report for the board", "finance"),
            ("postgres backup and restore runbook", "ops"),
        ] {
            store
                .insert_document(NewDocument {
                    text: text.into(),
                    metadata: json!({ "filename": format!("{team}.txt"), "team": team }),
                    embedding: Some(embedder.embed(text).await.unwrap()),
                })
                .await
                .unwrap();
        }
        Retriever::new(store, embedder, Arc::new(DisabledGraph), RetrievalConfig::default())
    }

    fn request(query: &str, top_k: Option<usize>) -> RetrievalRequest {
        RetrievalRequest {
            query: query.into(),
            top_k,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn closest_document_ranks_first() {
        let retriever = seeded().await;
        let response = retriever
            .retrieve(request("finance report", Some(3)))
            .await
            .unwrap();
        assert_eq!(response.vector_results[0].filename, "finance.txt");
        assert!(response.graph_results.is_empty());
    }

    #[tokio::test]
    async fn metadata_filter_applies_after_ranking() {
        let retriever = seeded().await;
        let mut req = request("postgres", Some(1));
        req.metadata = Some(serde_json::Map::from_iter([("team".to_string(), json!("ops"))]));
        let response = retriever.retrieve(req).await.unwrap();
        assert_eq!(response.vector_results.len(), 1);
        assert_eq!(response.vector_results[0].metadata["team"], "ops");
    }

    #[tokio::test]
    async fn validates_query_and_top_k() {
        let retriever = seeded().await;
        for req in [request("  ", None), request("x", Some(0)), request("x", Some(21))] {
            assert!(matches!(
                retriever.retrieve(req).await,
                Err(ServiceError::Validation(_))
            ));
        }
    }

    #[test]
    fn metadata_filter_requires_equal_values() {
        let filter = serde_json::Map::from_iter([("a".to_string(), json!(1))]);
        assert!(metadata_matches(&json!({"a": 1, "b": 2}), &filter));
        assert!(!metadata_matches(&json!({"a": 2}), &filter));
    }
}

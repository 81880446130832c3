//! Temporal knowledge-graph client.
//!
//! The graph itself lives in a Graphiti REST service backed by Neo4j; this
//! module only speaks its HTTP API (`POST /messages`, `POST /search`).
//! When `graph.url` is unset the service runs with [`DisabledGraph`] and the
//! graph endpoints answer 503.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::GraphConfig;

/// An edge (fact) returned by a graph search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphFact {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub fact: String,
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

impl GraphFact {
    /// Whether the fact's validity interval overlaps `[start, end]`.
    /// Open bounds on either side match everything.
    pub fn overlaps(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        if let (Some(end), Some(valid_at)) = (end, self.valid_at) {
            if valid_at > end {
                return false;
            }
        }
        if let (Some(start), Some(invalid_at)) = (start, self.invalid_at) {
            if invalid_at < start {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct Episode {
    pub name: String,
    pub body: String,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemporalContext {
    pub entity: String,
    pub time_range: TimeRange,
    pub results: Vec<GraphFact>,
}

#[async_trait]
pub trait GraphClient: Send + Sync {
    fn is_available(&self) -> bool;
    async fn add_episode(&self, episode: Episode) -> Result<()>;
    async fn search(
        &self,
        query: &str,
        num_results: usize,
        center_node_uuid: Option<&str>,
    ) -> Result<Vec<GraphFact>>;
}

/// Facts about `entity`, restricted to those valid at some point in the
/// requested range.
pub async fn temporal_context(
    graph: &dyn GraphClient,
    entity: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<TemporalContext> {
    let facts = graph.search(entity, 5, None).await?;
    let results = facts
        .into_iter()
        .filter(|f| f.overlaps(start, end))
        .collect();
    Ok(TemporalContext {
        entity: entity.to_string(),
        time_range: TimeRange { start, end },
        results,
    })
}

/// Parse RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare date.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub struct DisabledGraph;

#[async_trait]
impl GraphClient for DisabledGraph {
    fn is_available(&self) -> bool {
        false
    }

    async fn add_episode(&self, _episode: Episode) -> Result<()> {
        bail!("graph service is not configured")
    }

    async fn search(&self, _: &str, _: usize, _: Option<&str>) -> Result<Vec<GraphFact>> {
        bail!("graph service is not configured")
    }
}

pub struct GraphitiHttpClient {
    client: reqwest::Client,
    base_url: String,
    group_id: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    facts: Vec<GraphFact>,
}

impl GraphitiHttpClient {
    pub fn new(url: &str, config: &GraphConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            group_id: config.group_id.clone(),
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("graph request to {} failed", path))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("graph service error {} on {}: {}", status, path, text);
        }
        Ok(response)
    }
}

#[async_trait]
impl GraphClient for GraphitiHttpClient {
    fn is_available(&self) -> bool {
        true
    }

    async fn add_episode(&self, episode: Episode) -> Result<()> {
        let body = serde_json::json!({
            "group_id": self.group_id,
            "messages": [{
                "content": episode.body,
                "name": episode.name,
                "role_type": "user",
                "role": "ragflow",
                "timestamp": episode.reference_time,
                "source_description": episode.source_description,
            }],
        });
        self.post("/messages", &body).await?;
        tracing::info!(episode = %episode.name, "added graph episode");
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        num_results: usize,
        center_node_uuid: Option<&str>,
    ) -> Result<Vec<GraphFact>> {
        let mut body = serde_json::json!({
            "group_ids": [self.group_id],
            "query": query,
            "max_facts": num_results,
        });
        if let Some(uuid) = center_node_uuid {
            body["center_node_uuid"] = serde_json::Value::String(uuid.to_string());
        }
        let response: SearchResponse = self.post("/search", &body).await?.json().await?;
        tracing::debug!(query, count = response.facts.len(), "graph search");
        Ok(response.facts)
    }
}

/// `GraphitiHttpClient` when `graph.url` is set, otherwise [`DisabledGraph`].
pub fn create_graph_client(config: &GraphConfig) -> Result<Box<dyn GraphClient>> {
    match config.url.as_deref() {
        Some(url) => Ok(Box::new(GraphitiHttpClient::new(url, config)?)),
        None => Ok(Box::new(DisabledGraph)),
    }
}

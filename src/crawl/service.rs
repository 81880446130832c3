//! Request/response shapes for the crawl API and the façade that maps them
//! onto [`CrawlManager`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CrawlSettings;
use crate::error::ServiceError;
use crate::models::{CrawlConfig, CrawlJob, CrawlResult, CrawlStatus};

use super::manager::{CrawlManager, CrawlStats};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_USER_AGENT_LEN: usize = 512;
const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlJobRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub extract_metadata: Option<bool>,
    #[serde(default)]
    pub ingest: Option<bool>,
    /// `false` creates the job without queueing it.
    #[serde(default)]
    pub start: Option<bool>,
}

impl CrawlJobRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: None,
            user_agent: None,
            extract_metadata: None,
            ingest: None,
            start: None,
        }
    }

    /// Resolve per-job options against the `[crawl]` defaults.
    pub fn to_config(&self, settings: &CrawlSettings) -> Result<CrawlConfig, ServiceError> {
        let timeout_secs = self.timeout_secs.unwrap_or(settings.timeout_secs);
        if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ServiceError::validation(format!(
                "timeout_secs must be between 1 and {}.",
                MAX_TIMEOUT_SECS
            )));
        }
        let user_agent = match self.user_agent.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(agent) if agent.len() > MAX_USER_AGENT_LEN || agent.chars().any(char::is_control) => {
                return Err(ServiceError::validation("user_agent is not a valid header value."));
            }
            Some(agent) => Some(agent.to_string()),
        };
        Ok(CrawlConfig {
            timeout_secs,
            user_agent,
            extract_metadata: self.extract_metadata.unwrap_or(true),
            ingest: self.ingest.unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlResultView {
    pub url: String,
    pub title: Option<String>,
    pub content_preview: String,
    pub content_size: usize,
    pub content_hash: String,
    pub crawl_time_ms: u64,
    pub links_count: usize,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub duplicate: bool,
    pub document_id: Option<i64>,
    pub extracted_at: DateTime<Utc>,
}

impl From<&CrawlResult> for CrawlResultView {
    fn from(result: &CrawlResult) -> Self {
        Self {
            url: result.url.clone(),
            title: result.title.clone(),
            content_preview: result.content.chars().take(PREVIEW_CHARS).collect(),
            content_size: result.content_size,
            content_hash: result.content_hash.clone(),
            crawl_time_ms: result.crawl_time_ms,
            links_count: result.links.len(),
            metadata: result.metadata.clone(),
            duplicate: result.duplicate,
            document_id: result.document_id,
            extracted_at: result.extracted_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlJobResponse {
    pub id: Uuid,
    pub url: String,
    pub status: CrawlStatus,
    pub config: CrawlConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<CrawlResultView>,
}

impl From<&CrawlJob> for CrawlJobResponse {
    fn from(job: &CrawlJob) -> Self {
        Self {
            id: job.id,
            url: job.url.clone(),
            status: job.status,
            config: job.config.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message.clone(),
            result: job.result.as_ref().map(CrawlResultView::from),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobList {
    pub jobs: Vec<CrawlJobResponse>,
    pub count: usize,
}

pub fn parse_job_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ServiceError::validation(format!("Invalid job id: {}", raw)))
}

/// Validated `(status, limit)` for a list query.
pub fn parse_list_query(query: &ListQuery) -> Result<(Option<CrawlStatus>, usize), ServiceError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit < 1 || limit > MAX_LIST_LIMIT {
        return Err(ServiceError::validation(format!(
            "limit must be between 1 and {}.",
            MAX_LIST_LIMIT
        )));
    }
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.to_ascii_lowercase().parse::<CrawlStatus>().map_err(|_| {
            let valid: Vec<&str> = CrawlStatus::ALL.iter().map(|s| s.as_str()).collect();
            ServiceError::validation(format!(
                "Invalid status: {}. Must be one of: {}",
                raw,
                valid.join(", ")
            ))
        })?),
    };
    Ok((status, limit))
}

pub struct CrawlService {
    manager: Arc<CrawlManager>,
    settings: CrawlSettings,
}

impl CrawlService {
    pub fn new(manager: Arc<CrawlManager>, settings: CrawlSettings) -> Self {
        Self { manager, settings }
    }

    pub fn manager(&self) -> &CrawlManager {
        &self.manager
    }

    pub async fn submit(&self, request: CrawlJobRequest) -> Result<CrawlJobResponse, ServiceError> {
        if request.url.trim().is_empty() {
            return Err(ServiceError::validation("url is required."));
        }
        let config = request.to_config(&self.settings)?;
        let job = if request.start.unwrap_or(true) {
            self.manager.submit(&request.url, config).await?
        } else {
            self.manager.create(&request.url, config).await?
        };
        Ok(CrawlJobResponse::from(&job))
    }

    pub async fn get(&self, raw_id: &str) -> Result<CrawlJobResponse, ServiceError> {
        let id = parse_job_id(raw_id)?;
        let job = self
            .manager
            .status(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Job not found"))?;
        Ok(CrawlJobResponse::from(&job))
    }

    pub async fn list(&self, query: &ListQuery) -> Result<JobList, ServiceError> {
        let (status, limit) = parse_list_query(query)?;
        let jobs: Vec<CrawlJobResponse> = self
            .manager
            .list(status, limit)
            .await?
            .iter()
            .map(CrawlJobResponse::from)
            .collect();
        Ok(JobList {
            count: jobs.len(),
            jobs,
        })
    }

    pub async fn start(&self, raw_id: &str) -> Result<CrawlJobResponse, ServiceError> {
        let job = self.manager.start(parse_job_id(raw_id)?).await?;
        Ok(CrawlJobResponse::from(&job))
    }

    pub async fn cancel(&self, raw_id: &str) -> Result<CrawlJobResponse, ServiceError> {
        let job = self.manager.cancel(parse_job_id(raw_id)?).await?;
        Ok(CrawlJobResponse::from(&job))
    }

    pub async fn stats(&self) -> Result<CrawlStats, ServiceError> {
        self.manager.stats().await
    }
}

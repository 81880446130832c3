//! Core data models: crawl jobs and stored documents.
//!
//! A [`CrawlJob`] only moves forward through its lifecycle:
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!    │           ├──────▶ failed
//!    └───────────┴──────▶ cancelled
//! ```
//!
//! `completed_at` is set exactly when the job reaches one of the three
//! terminal states, `started_at` when it enters `running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CrawlStatus {
    pub const ALL: [CrawlStatus; 5] = [
        CrawlStatus::Pending,
        CrawlStatus::Running,
        CrawlStatus::Completed,
        CrawlStatus::Failed,
        CrawlStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: CrawlStatus) -> bool {
        use CrawlStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid status '{0}', must be one of: pending, running, completed, failed, cancelled")]
pub struct UnknownStatus(pub String);

impl FromStr for CrawlStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CrawlStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("crawl job cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: CrawlStatus,
    pub to: CrawlStatus,
}

/// Per-job crawl options. Missing fields fall back to `[crawl]` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_true")]
    pub extract_metadata: bool,
    /// Store the page as a document and graph episode once crawled.
    #[serde(default = "default_true")]
    pub ingest: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: None,
            extract_metadata: true,
            ingest: true,
        }
    }
}

/// What a completed crawl produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResult {
    /// Final URL after redirects.
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub links: Vec<String>,
    pub content_hash: String,
    pub content_size: usize,
    pub crawl_time_ms: u64,
    pub extracted_at: DateTime<Utc>,
    /// The content was already seen under another job; nothing was stored.
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub url: String,
    pub status: CrawlStatus,
    pub config: CrawlConfig,
    pub result: Option<CrawlResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the job has been handed to the worker queue. Deferred jobs
    /// stay `pending` with no `queued_at` until started.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    pub fn new(url: impl Into<String>, config: CrawlConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            status: CrawlStatus::Pending,
            config,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_queued(&mut self) {
        let now = Utc::now();
        self.queued_at = Some(now);
        self.updated_at = now;
    }

    fn transition(&mut self, to: CrawlStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        if to == CrawlStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(CrawlStatus::Running, Utc::now())
    }

    pub fn mark_completed(&mut self, result: CrawlResult) -> Result<(), TransitionError> {
        self.transition(CrawlStatus::Completed, Utc::now())?;
        self.result = Some(result);
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(CrawlStatus::Failed, Utc::now())?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(CrawlStatus::Cancelled, Utc::now())
    }
}

/// A stored document. The embedding is produced by an external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub text: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for the document store.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub text: String,
    pub metadata: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub similarity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> CrawlResult {
        CrawlResult {
            url: "https://example.org/".into(),
            title: Some("Example".into()),
            content: "hello".into(),
            metadata: Default::default(),
            links: vec![],
            content_hash: "abc".into(),
            content_size: 5,
            crawl_time_ms: 12,
            extracted_at: Utc::now(),
            duplicate: false,
            document_id: None,
        }
    }

    #[test]
    fn happy_path_sets_timestamps() {
        let mut job = CrawlJob::new("https://example.org", CrawlConfig::default());
        assert_eq!(job.status, CrawlStatus::Pending);
        assert!(job.started_at.is_none() && job.completed_at.is_none());

        job.mark_running().unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        job.mark_completed(sample_result()).unwrap();
        assert_eq!(job.status, CrawlStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.result.is_some());
    }

    #[test]
    fn cannot_complete_pending_job() {
        let mut job = CrawlJob::new("https://example.org", CrawlConfig::default());
        let err = job.mark_completed(sample_result()).unwrap_err();
        assert_eq!(err.from, CrawlStatus::Pending);
        assert_eq!(err.to, CrawlStatus::Completed);
        assert!(job.result.is_none());
    }

    #[test]
    fn cancelled_is_final() {
        let mut job = CrawlJob::new("https://example.org", CrawlConfig::default());
        job.mark_running().unwrap();
        job.mark_cancelled().unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.mark_completed(sample_result()).is_err());
        assert!(job.mark_failed("late").is_err());
        assert!(job.mark_cancelled().is_err());
        assert_eq!(job.status, CrawlStatus::Cancelled);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn failure_records_message() {
        let mut job = CrawlJob::new("https://example.org", CrawlConfig::default());
        job.mark_running().unwrap();
        job.mark_failed("connection refused").unwrap();
        assert_eq!(job.error_message.as_deref(), Some("connection refused"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn transition_table() {
        use CrawlStatus::*;
        for from in CrawlStatus::ALL {
            for to in CrawlStatus::ALL {
                let allowed = from.can_transition_to(to);
                if from.is_terminal() {
                    assert!(!allowed, "{} -> {} must be rejected", from, to);
                }
                if to == Pending {
                    assert!(!allowed);
                }
            }
        }
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn status_parsing() {
        assert_eq!("RUNNING".parse::<CrawlStatus>(), Ok(CrawlStatus::Running));
        assert!("done".parse::<CrawlStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&CrawlStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}

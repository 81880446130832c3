//! Crawl job orchestration.
//!
//! Jobs are persisted through a [`JobStore`] and executed by a bounded pool:
//! a dispatcher task pulls job ids from an unbounded channel in FIFO order
//! and spawns one task per job once a semaphore permit is available.
//!
//! Status writes from workers and from [`CrawlManager::cancel`] go through
//! one async mutex, so a cancelled job is never overwritten with a result.
//!
//! Worker flow for one job:
//!
//! 1. `pending → running` (skipped if the job was cancelled while queued)
//! 2. re-check the URL, wait for the domain throttle; a wait longer than
//!    the throttle's limit fails the job, and a cancel ends the wait early
//! 3. fetch; a 429 puts the domain into cooldown and fails the job
//! 4. extract content and fingerprint it
//! 5. when `config.ingest` is set, claim the fingerprint and ingest new
//!    content; a failed ingest releases the claim (non-fatal)
//! 6. `running → completed | failed`, unless cancelled meanwhile
//!
//! A worker that panics fails its job instead of leaving it `running`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::ingest::{IngestRequest, Ingestor};
use crate::models::{CrawlConfig, CrawlJob, CrawlResult, CrawlStatus};
use crate::store::JobStore;

use super::dedup::{self, DedupEntry, DedupStats, Deduplicator};
use super::engine::{extract_page, CrawlEngine, CrawlError};
use super::guard::{self, UnsafeUrl};
use super::politeness::{self, DomainStats, DomainThrottle};

const RESTART_MESSAGE: &str = "interrupted by service restart";
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Why a single job attempt failed. The display text becomes the job's
/// `error_message`.
#[derive(Debug, thiserror::Error)]
enum JobError {
    #[error("unsafe URL: {0}")]
    Unsafe(#[from] UnsafeUrl),
    #[error("{0}")]
    Crawl(#[from] CrawlError),
    #[error("no content could be extracted from the page")]
    EmptyContent,
    #[error("domain {domain} is cooling down for another {secs}s")]
    Throttled { domain: String, secs: i64 },
    #[error("cancelled")]
    Cancelled,
    #[error("crawl worker stopped unexpectedly")]
    Aborted,
    #[error("{0}")]
    Store(#[from] anyhow::Error),
}

/// Collaborators the manager drives.
pub struct CrawlDeps {
    pub jobs: Arc<dyn JobStore>,
    pub engine: Arc<dyn CrawlEngine>,
    pub dedup: Arc<Deduplicator>,
    pub throttle: Arc<DomainThrottle>,
    /// Absent when crawled pages should not be stored as documents.
    pub ingestor: Option<Arc<Ingestor>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub max_concurrent_jobs: usize,
    pub active_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlStats {
    pub dedup: DedupStats,
    pub domains: Vec<DomainStats>,
    pub workers: WorkerStats,
}

struct Shared {
    deps: CrawlDeps,
    status_lock: Mutex<()>,
}

pub struct CrawlManager {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Uuid>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl CrawlManager {
    /// Build the manager and spawn its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn spawn(deps: CrawlDeps, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let shared = Arc::new(Shared {
            deps,
            status_lock: Mutex::new(()),
        });
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(shared.clone(), semaphore.clone(), rx));
        Self {
            shared,
            queue,
            semaphore,
            max_workers,
        }
    }

    /// Validate, persist and enqueue a job.
    pub async fn submit(&self, url: &str, config: CrawlConfig) -> Result<CrawlJob, ServiceError> {
        let mut job = self.new_job(url, config).await?;
        job.mark_queued();
        self.shared.deps.jobs.save_job(&job).await?;
        self.enqueue(job.id)?;
        tracing::info!(job_id = %job.id, url = %job.url, "crawl job submitted");
        Ok(job)
    }

    /// Validate and persist a job without starting it.
    pub async fn create(&self, url: &str, config: CrawlConfig) -> Result<CrawlJob, ServiceError> {
        let job = self.new_job(url, config).await?;
        self.shared.deps.jobs.save_job(&job).await?;
        tracing::info!(job_id = %job.id, url = %job.url, "crawl job created (deferred)");
        Ok(job)
    }

    /// Enqueue a deferred job.
    pub async fn start(&self, id: Uuid) -> Result<CrawlJob, ServiceError> {
        let job = {
            let _guard = self.shared.status_lock.lock().await;
            let mut job = self.load(id).await?;
            if job.status != CrawlStatus::Pending {
                return Err(ServiceError::Conflict(format!(
                    "job {} is {}, only pending jobs can be started",
                    id, job.status
                )));
            }
            if job.queued_at.is_some() {
                return Err(ServiceError::Conflict(format!("job {} is already queued", id)));
            }
            job.mark_queued();
            self.shared.deps.jobs.save_job(&job).await?;
            job
        };
        self.enqueue(id)?;
        tracing::info!(job_id = %id, "crawl job started");
        Ok(job)
    }

    pub async fn status(&self, id: Uuid) -> Result<Option<CrawlJob>, ServiceError> {
        Ok(self.shared.deps.jobs.get_job(id).await?)
    }

    pub async fn list(
        &self,
        status: Option<CrawlStatus>,
        limit: usize,
    ) -> Result<Vec<CrawlJob>, ServiceError> {
        Ok(self.shared.deps.jobs.list_jobs(status, limit).await?)
    }

    /// Cancel a pending or running job. A fetch already in flight finishes,
    /// but its result is discarded.
    pub async fn cancel(&self, id: Uuid) -> Result<CrawlJob, ServiceError> {
        let _guard = self.shared.status_lock.lock().await;
        let mut job = self.load(id).await?;
        if job.mark_cancelled().is_err() {
            return Err(ServiceError::Conflict(format!(
                "job {} is already {}",
                id, job.status
            )));
        }
        self.shared.deps.jobs.save_job(&job).await?;
        tracing::info!(job_id = %id, "crawl job cancelled");
        Ok(job)
    }

    /// Recover jobs left over by a previous process: `running` jobs are
    /// failed, queued `pending` jobs are enqueued again. Returns
    /// `(failed, requeued)`.
    pub async fn resume_unfinished(&self) -> anyhow::Result<(usize, usize)> {
        let mut failed = 0;
        let mut requeued = 0;
        for mut job in self.shared.deps.jobs.unfinished_jobs().await? {
            match job.status {
                CrawlStatus::Running => {
                    job.mark_failed(RESTART_MESSAGE)?;
                    self.shared.deps.jobs.save_job(&job).await?;
                    failed += 1;
                }
                CrawlStatus::Pending if job.queued_at.is_some() => {
                    self.queue
                        .send(job.id)
                        .context("crawl dispatcher has stopped")?;
                    requeued += 1;
                }
                _ => {}
            }
        }
        if failed + requeued > 0 {
            tracing::info!(failed, requeued, "recovered unfinished crawl jobs");
        }
        Ok((failed, requeued))
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for(&self, id: Uuid, timeout: Duration) -> anyhow::Result<CrawlJob> {
        tokio::time::timeout(timeout, async {
            loop {
                let job = self
                    .shared
                    .deps
                    .jobs
                    .get_job(id)
                    .await?
                    .with_context(|| format!("crawl job {} not found", id))?;
                if job.status.is_terminal() {
                    return Ok(job);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .with_context(|| format!("timed out waiting for crawl job {}", id))?
    }

    pub async fn stats(&self) -> Result<CrawlStats, ServiceError> {
        Ok(CrawlStats {
            dedup: self.shared.deps.dedup.stats().await?,
            domains: self.shared.deps.throttle.stats(),
            workers: WorkerStats {
                max_concurrent_jobs: self.max_workers,
                active_jobs: self
                    .max_workers
                    .saturating_sub(self.semaphore.available_permits()),
            },
        })
    }

    pub fn throttle(&self) -> &DomainThrottle {
        &self.shared.deps.throttle
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.shared.deps.dedup
    }

    /// Stop accepting work. Running jobs finish; queued ones stay pending
    /// and are recovered on the next start.
    pub fn shutdown(&self) {
        self.semaphore.close();
    }

    async fn new_job(&self, url: &str, config: CrawlConfig) -> Result<CrawlJob, ServiceError> {
        let url = guard::check_url(url)
            .await
            .map_err(|e| ServiceError::validation(e.to_string()))?;
        Ok(CrawlJob::new(url.as_str(), config))
    }

    async fn load(&self, id: Uuid) -> Result<CrawlJob, ServiceError> {
        self.shared
            .deps
            .jobs
            .get_job(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("crawl job {} not found", id)))
    }

    fn enqueue(&self, id: Uuid) -> Result<(), ServiceError> {
        self.queue
            .send(id)
            .map_err(|_| ServiceError::Unavailable("crawl workers"))
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
) {
    while let Some(id) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            tracing::info!("crawl pool closed; dispatcher exiting");
            break;
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn({
                let shared = shared.clone();
                async move { shared.run_job(id).await }
            });
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(job_id = %id, error = %e, "crawl job bookkeeping failed");
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "crawl worker panicked");
                    if let Err(e) = shared.finish(id, Err(JobError::Aborted)).await {
                        tracing::error!(job_id = %id, error = %e, "failing aborted crawl job failed");
                    }
                }
            }
            drop(permit);
        });
    }
}

impl Shared {
    async fn run_job(&self, id: Uuid) -> anyhow::Result<()> {
        let job = {
            let _guard = self.status_lock.lock().await;
            let Some(mut job) = self.deps.jobs.get_job(id).await? else {
                tracing::warn!(job_id = %id, "queued crawl job vanished");
                return Ok(());
            };
            if job.status != CrawlStatus::Pending {
                tracing::debug!(job_id = %id, status = %job.status, "skipping queued job");
                return Ok(());
            }
            job.mark_running()?;
            self.deps.jobs.save_job(&job).await?;
            job
        };

        tracing::info!(job_id = %id, url = %job.url, "crawl job running");
        let outcome = self.crawl(&job).await;
        self.finish(id, outcome).await
    }

    async fn is_cancelled(&self, id: Uuid) -> anyhow::Result<bool> {
        let job = self.deps.jobs.get_job(id).await?;
        Ok(job.is_some_and(|j| j.status == CrawlStatus::Cancelled))
    }

    async fn crawl(&self, job: &CrawlJob) -> Result<CrawlResult, JobError> {
        let url = guard::check_url(&job.url).await?;

        let throttle = &self.deps.throttle;
        let delay = throttle
            .reserve_within(&url, Utc::now(), throttle.max_wait())
            .map_err(|delay| JobError::Throttled {
                domain: politeness::domain_of(&url).unwrap_or_default(),
                secs: delay.num_seconds(),
            })?;
        if let Ok(delay) = delay.to_std() {
            if !delay.is_zero() {
                tracing::debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "domain throttle");
                self.wait_unless_cancelled(job.id, delay).await?;
            }
        }

        let page = match self.deps.engine.fetch(&url, &job.config).await {
            Ok(page) => page,
            Err(CrawlError::RateLimited { retry_after }) => {
                self.deps
                    .throttle
                    .penalize(&url, retry_after.as_deref(), Utc::now());
                return Err(CrawlError::RateLimited { retry_after }.into());
            }
            Err(e) => return Err(e.into()),
        };

        if self.is_cancelled(job.id).await? {
            return Err(JobError::Cancelled);
        }

        let extracted = extract_page(&page, job.config.extract_metadata);
        if extracted.content.trim().is_empty() {
            return Err(JobError::EmptyContent);
        }

        let fingerprint = dedup::fingerprint(&extracted.content);
        let final_url = page.final_url.to_string();
        let deduplicator = &self.deps.dedup;
        // Only a job that stores the page owns its fingerprint.
        let ingestor = self.deps.ingestor.as_ref().filter(|_| job.config.ingest);
        let owner = match ingestor {
            Some(_) => {
                deduplicator
                    .claim(DedupEntry {
                        fingerprint: fingerprint.clone(),
                        url_fingerprint: dedup::url_fingerprint(&page.final_url),
                        job_id: job.id,
                        url: final_url.clone(),
                        title: extracted.title.clone(),
                        content_size: extracted.content.len(),
                        first_seen: Utc::now(),
                    })
                    .await?
            }
            None => deduplicator.owner(&fingerprint).await?,
        };

        let mut metadata = extracted.metadata;
        let mut document_id = None;
        if let Some(owner) = &owner {
            tracing::info!(job_id = %job.id, duplicate_of = %owner.job_id, "duplicate content skipped");
            metadata.insert("duplicate_of".into(), owner.job_id.to_string().into());
        } else if let Some(ingestor) = ingestor {
            let mut doc_metadata = serde_json::Map::new();
            doc_metadata.insert("source".into(), "crawl".into());
            doc_metadata.insert("url".into(), final_url.clone().into());
            doc_metadata.insert("job_id".into(), job.id.to_string().into());
            if let Some(title) = &extracted.title {
                doc_metadata.insert("title".into(), title.clone().into());
            }
            let request = IngestRequest {
                text: extracted.content.clone(),
                metadata: doc_metadata,
                source: url.host_str().unwrap_or("page").to_string(),
                source_description: format!("Web page: {}", final_url),
            };
            match ingestor.ingest(request).await {
                Ok(outcome) => {
                    document_id = Some(outcome.document_id);
                    if let Ok(graph) = serde_json::to_value(&outcome.graph) {
                        metadata.insert("graph".into(), graph);
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "ingesting crawled page failed");
                    metadata.insert("ingest_error".into(), e.public_message().into());
                    deduplicator.release(&fingerprint, job.id).await?;
                }
            }
        }

        Ok(CrawlResult {
            url: final_url,
            title: extracted.title,
            content_size: extracted.content.len(),
            content: extracted.content,
            metadata,
            links: extracted.links,
            content_hash: fingerprint.to_string(),
            crawl_time_ms: page.elapsed.as_millis() as u64,
            extracted_at: Utc::now(),
            duplicate: owner.is_some(),
            document_id,
        })
    }

    /// Sleep for `delay`, checking for cancellation every [`CANCEL_POLL`].
    async fn wait_unless_cancelled(&self, id: Uuid, delay: Duration) -> Result<(), JobError> {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            tokio::time::sleep(remaining.min(CANCEL_POLL)).await;
            if self.is_cancelled(id).await? {
                return Err(JobError::Cancelled);
            }
        }
    }

    async fn finish(&self, id: Uuid, outcome: Result<CrawlResult, JobError>) -> anyhow::Result<()> {
        let _guard = self.status_lock.lock().await;
        let Some(mut job) = self.deps.jobs.get_job(id).await? else {
            return Ok(());
        };
        if job.status != CrawlStatus::Running {
            tracing::info!(job_id = %id, status = %job.status, "discarding crawl outcome");
            return Ok(());
        }
        match outcome {
            Ok(result) => {
                tracing::info!(
                    job_id = %id,
                    bytes = result.content_size,
                    duplicate = result.duplicate,
                    "crawl job completed"
                );
                job.mark_completed(result)?;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "crawl job failed");
                job.mark_failed(e.to_string())?;
            }
        }
        self.deps.jobs.save_job(&job).await?;
        Ok(())
    }
}

//! Wiring: storage backends and the services built on top of them.
//!
//! [`Services`] is shared by the HTTP server and the one-shot CLI commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::crawl::dedup::{DedupStore, Deduplicator, InMemoryDedupStore};
use crate::crawl::engine::{CrawlEngine, HttpCrawlEngine};
use crate::crawl::politeness::DomainThrottle;
use crate::crawl::{CrawlDeps, CrawlManager, CrawlService};
use crate::db;
use crate::embedding::Embedder;
use crate::graph::{self, GraphClient};
use crate::ingest::Ingestor;
use crate::llm::{self, CompletionProvider, ProviderInfo};
use crate::outputs::OutputLog;
use crate::rate_limit::{ClientRateLimiter, InMemoryRateLimitStore, RateLimitStore};
use crate::retrieval::Retriever;
use crate::store::memory::{InMemoryDocumentStore, InMemoryJobStore};
use crate::store::postgres::PgStore;
use crate::store::{DocumentStore, JobStore};

/// Where documents, jobs, fingerprints and client quotas live.
pub struct Backends {
    pub documents: Arc<dyn DocumentStore>,
    pub jobs: Arc<dyn JobStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub label: &'static str,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            documents: Arc::new(InMemoryDocumentStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            dedup: Arc::new(InMemoryDedupStore::new()),
            rate_limits: Arc::new(InMemoryRateLimitStore::new()),
            label: "memory",
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            documents: store.clone(),
            jobs: store.clone(),
            dedup: store,
            rate_limits: Arc::new(InMemoryRateLimitStore::new()),
            label: "postgres",
        }
    }

    /// Postgres when `db.url` is configured, otherwise in-memory stores.
    pub async fn from_config(config: &Config) -> Result<Self> {
        if config.db.url.is_some() {
            let pool = db::connect(config).await?;
            Ok(Self::postgres(PgStore::new(pool)))
        } else {
            tracing::warn!("no database configured; documents and crawl jobs are kept in memory");
            Ok(Self::in_memory())
        }
    }
}

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub backend: &'static str,
    pub documents: Arc<dyn DocumentStore>,
    pub embedder: Arc<Embedder>,
    pub ingestor: Arc<Ingestor>,
    pub retriever: Arc<Retriever>,
    pub graph: Arc<dyn GraphClient>,
    pub llm: Arc<dyn CompletionProvider>,
    pub provider_info: ProviderInfo,
    pub crawl: Arc<CrawlService>,
    pub limiter: Arc<ClientRateLimiter>,
    pub outputs: OutputLog,
}

impl Services {
    /// Build every service with the HTTP crawl engine.
    pub async fn build(config: Config, backends: Backends) -> Result<Self> {
        let engine = Arc::new(HttpCrawlEngine::new(&config.crawl)?);
        Self::build_with_engine(config, backends, engine).await
    }

    /// Like [`Services::build`] with a caller-supplied crawl engine.
    /// Must be called inside a tokio runtime; it spawns the crawl dispatcher.
    pub async fn build_with_engine(
        mut config: Config,
        backends: Backends,
        engine: Arc<dyn CrawlEngine>,
    ) -> Result<Self> {
        if config.embedding.provider == "ollama" && config.embedding.url.is_none() {
            config.embedding.url = Some(config.llm.ollama_host.clone());
        }

        let embedder = Arc::new(Embedder::new(&config.embedding)?);
        let graph: Arc<dyn GraphClient> = Arc::from(graph::create_graph_client(&config.graph)?);

        let kind = llm::detect_provider(&config.llm).await;
        let llm = llm::build_provider(kind, &config.llm)?;
        let provider_info = llm::provider_info(kind, &config.llm, &config.embedding);

        let ingestor = Arc::new(Ingestor::new(
            backends.documents.clone(),
            embedder.clone(),
            graph.clone(),
            config.graph.max_episode_chars,
        ));
        let retriever = Arc::new(Retriever::new(
            backends.documents.clone(),
            embedder.clone(),
            graph.clone(),
            config.retrieval.clone(),
        ));

        let manager = CrawlManager::spawn(
            CrawlDeps {
                jobs: backends.jobs.clone(),
                engine,
                dedup: Arc::new(Deduplicator::new(backends.dedup.clone())),
                throttle: Arc::new(DomainThrottle::from_settings(&config.crawl)),
                ingestor: Some(ingestor.clone()),
            },
            config.crawl.max_concurrent_jobs,
        );
        let crawl = Arc::new(CrawlService::new(Arc::new(manager), config.crawl.clone()));

        let limiter = Arc::new(ClientRateLimiter::new(
            backends.rate_limits.clone(),
            config.rate_limit.requests_per_hour,
            Duration::from_secs(config.rate_limit.window_secs),
        ));

        tracing::info!(
            backend = backends.label,
            llm = %provider_info.provider,
            llm_model = %provider_info.llm_model,
            embeddings = %provider_info.embeddings_provider,
            graph = graph.is_available(),
            "services ready"
        );

        Ok(Self {
            outputs: OutputLog::new(config.outputs.dir.clone()),
            config: Arc::new(config),
            backend: backends.label,
            documents: backends.documents,
            embedder,
            ingestor,
            retriever,
            graph,
            llm,
            provider_info,
            crawl,
            limiter,
        })
    }
}

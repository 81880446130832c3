//! # RAGFlow Slim CLI (`ragflow`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragflow init` | Create the Postgres schema (requires `DATABASE_URL`) |
//! | `ragflow serve` | Start the HTTP API |
//! | `ragflow ingest <file>` | Ingest a `.txt` or `.pdf` file |
//! | `ragflow ingest --text "..."` | Ingest literal text |
//! | `ragflow search "<query>"` | Run a retrieval query |
//! | `ragflow crawl <url>` | Crawl one page and wait for the result |
//!
//! Settings come from `--config` (TOML) plus environment variables; a `.env`
//! file in the working directory is loaded first.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use ragflow_slim::config;
use ragflow_slim::crawl::service::CrawlJobRequest;
use ragflow_slim::extract;
use ragflow_slim::ingest::IngestRequest;
use ragflow_slim::logging::{setup_logging, DEFAULT_LOG_SETTINGS};
use ragflow_slim::migrate;
use ragflow_slim::retrieval::RetrievalRequest;
use ragflow_slim::server;
use ragflow_slim::state::{Backends, Services};

#[derive(Parser)]
#[command(
    name = "ragflow",
    about = "RAGFlow Slim: crawl, ingest, retrieve and complete behind one API",
    version
)]
struct Cli {
    /// Path to a TOML configuration file. Optional; environment variables
    /// are applied on top of it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the Postgres schema. Idempotent.
    Init,

    /// Start the HTTP server.
    ///
    /// Refuses to start in production without a strong `RAGFLOW_API_KEY`.
    Serve,

    /// Ingest a document.
    Ingest {
        /// A `.txt` or `.pdf` file.
        #[arg(conflicts_with = "text", required_unless_present = "text")]
        file: Option<PathBuf>,

        /// Literal text instead of a file.
        #[arg(long)]
        text: Option<String>,

        /// Title stored in the document metadata.
        #[arg(long)]
        title: Option<String>,
    },

    /// Retrieve documents and graph facts for a query.
    Search {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Crawl a single page and print the finished job.
    Crawl {
        url: String,

        /// Do not ingest the crawled content.
        #[arg(long)]
        no_ingest: bool,

        /// Seconds to wait for the job to finish.
        #[arg(long, default_value_t = 120)]
        wait_secs: u64,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn services(cfg: config::Config) -> anyhow::Result<Services> {
    let backends = Backends::from_config(&cfg).await?;
    Services::build(cfg, backends).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    setup_logging(DEFAULT_LOG_SETTINGS);

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Ingest { file, text, title } => {
            let request = match (file, text) {
                (Some(path), _) => {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let filename = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(extract::sanitize_filename)
                        .context("file name is not usable")?;
                    let name = filename.clone();
                    let text =
                        tokio::task::spawn_blocking(move || extract::extract_text(&name, &bytes))
                            .await??;
                    let mut metadata = serde_json::Map::new();
                    metadata.insert("filename".into(), filename.clone().into());
                    if let Some(title) = title {
                        metadata.insert("title".into(), title.into());
                    }
                    IngestRequest {
                        text,
                        metadata,
                        source_description: format!("Document: {}", filename),
                        source: filename,
                    }
                }
                (None, Some(text)) => {
                    let mut metadata = serde_json::Map::new();
                    metadata.insert("source".into(), "cli".into());
                    let source = title.clone().unwrap_or_else(|| "text".to_string());
                    if let Some(title) = title {
                        metadata.insert("title".into(), title.into());
                    }
                    IngestRequest {
                        text,
                        metadata,
                        source_description: format!("Text submitted via CLI: {}", source),
                        source,
                    }
                }
                (None, None) => bail!("provide a file or --text"),
            };

            let services = services(cfg).await?;
            let outcome = services.ingestor.ingest(request).await?;
            print_json(&outcome)?;
        }
        Commands::Search { query, top_k } => {
            let services = services(cfg).await?;
            let response = services
                .retriever
                .retrieve(RetrievalRequest {
                    query,
                    top_k,
                    metadata: None,
                })
                .await?;
            print_json(&response)?;
        }
        Commands::Crawl {
            url,
            no_ingest,
            wait_secs,
        } => {
            let services = services(cfg).await?;
            let mut request = CrawlJobRequest::new(url);
            request.ingest = Some(!no_ingest);
            let job = services.crawl.submit(request).await?;

            let manager = services.crawl.manager();
            let finished = manager
                .wait_for(job.id, Duration::from_secs(wait_secs))
                .await?;
            let view = services.crawl.get(&finished.id.to_string()).await?;
            manager.shutdown();
            print_json(&view)?;
        }
    }

    Ok(())
}

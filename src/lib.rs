//! # RAGFlow Slim
//!
//! A thin retrieval-augmented generation gateway. It accepts documents and
//! web crawl jobs, stores text with embeddings in Postgres/pgvector, mirrors
//! content into a temporal knowledge graph, and forwards prompts to an LLM
//! provider.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum) ──▶ auth ──▶ rate limit ──▶ handlers
//!                                             │
//!        ┌──────────────┬─────────────┬───────┴──────┬─────────────┐
//!        ▼              ▼             ▼              ▼             ▼
//!   ┌─────────┐   ┌──────────┐  ┌───────────┐  ┌──────────┐  ┌─────────┐
//!   │  crawl  │──▶│  ingest  │─▶│ documents │  │ retrieval│  │   llm   │
//!   │ workers │   │          │  │ (pgvector)│◀─│          │  │         │
//!   └─────────┘   └────┬─────┘  └───────────┘  └────┬─────┘  └─────────┘
//!                      └──────────▶ graph ◀─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragflow init                         # create the Postgres schema
//! RAGFLOW_API_KEY=... ragflow serve    # start the HTTP API
//! ragflow ingest notes.pdf
//! ragflow search "release schedule" --top-k 5
//! ragflow crawl https://example.org/
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`models`] | Documents, crawl jobs and their state machine |
//! | [`store`] | Document and job persistence (memory, Postgres) |
//! | [`embedding`] | Embedding providers with dimension checks |
//! | [`crawl`] | URL safety, politeness, dedup, workers |
//! | [`ingest`] | Store a document, embed it, add a graph episode |
//! | [`retrieval`] | Vector search merged with graph facts |
//! | [`graph`] | Knowledge-graph client |
//! | [`llm`] | Provider detection and completions |
//! | [`server`] | HTTP API |

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod outputs;
pub mod rate_limit;
pub mod retrieval;
pub mod server;
pub mod state;
pub mod store;

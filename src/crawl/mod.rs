//! Crawl orchestration.
//!
//! | Module | Role |
//! |--------|------|
//! | [`guard`] | URL safety checks before any outbound request |
//! | [`politeness`] | per-domain request pacing and 429 cooldowns |
//! | [`engine`] | fetching and page extraction |
//! | [`dedup`] | content fingerprints |
//! | [`manager`] | job lifecycle and the bounded worker pool |
//! | [`service`] | API request/response shapes |

pub mod dedup;
pub mod engine;
pub mod guard;
pub mod manager;
pub mod politeness;
pub mod service;

pub use manager::{CrawlDeps, CrawlManager};
pub use service::CrawlService;

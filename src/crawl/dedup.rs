//! Content-fingerprint deduplication for crawled pages.
//!
//! A fingerprint is the SHA-256 of the page text after whitespace runs are
//! collapsed, the ends trimmed and everything lowercased, so cosmetic
//! re-renders of the same article map to one entry. The normalized URL is
//! fingerprinted too and kept alongside for statistics.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;
use uuid::Uuid;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "msclkid"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn fingerprint(text: &str) -> Fingerprint {
    Fingerprint(sha256_hex(&normalize_text(text)))
}

/// Canonical form of a URL: tracking parameters and fragment removed,
/// trailing slash trimmed. Scheme and host are already lowercased by the
/// parser; the path keeps its case.
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut out = url.to_string();
    if url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    out
}

pub fn url_fingerprint(url: &Url) -> Fingerprint {
    Fingerprint(sha256_hex(&normalize_url(url)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub fingerprint: Fingerprint,
    pub url_fingerprint: Fingerprint,
    pub job_id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub content_size: usize,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub unique_content: u64,
    pub unique_urls: u64,
    pub duplicates_skipped: u64,
}

/// Persistence for fingerprints. `insert_if_absent` must be atomic so two
/// workers racing on identical content cannot both claim it.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DedupEntry>>;
    /// Returns `true` if the entry was inserted, `false` if the fingerprint existed.
    async fn insert_if_absent(&self, entry: DedupEntry) -> Result<bool>;
    /// Delete the entry for `fingerprint` if `job_id` owns it. Returns
    /// whether anything was removed.
    async fn remove(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool>;
    /// `(unique content, unique urls)`.
    async fn counts(&self) -> Result<(u64, u64)>;
}

#[derive(Default)]
pub struct InMemoryDedupStore {
    entries: Mutex<HashMap<Fingerprint, DedupEntry>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DedupEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(fingerprint).cloned())
    }

    async fn insert_if_absent(&self, entry: DedupEntry) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&entry.fingerprint) {
            return Ok(false);
        }
        entries.insert(entry.fingerprint.clone(), entry);
        Ok(true)
    }

    async fn remove(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(fingerprint).is_some_and(|e| e.job_id == job_id) {
            entries.remove(fingerprint);
            return Ok(true);
        }
        Ok(false)
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let urls: HashSet<&Fingerprint> = entries.values().map(|e| &e.url_fingerprint).collect();
        Ok((entries.len() as u64, urls.len() as u64))
    }
}

pub struct Deduplicator {
    store: Arc<dyn DedupStore>,
    duplicates: AtomicU64,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self {
            store,
            duplicates: AtomicU64::new(0),
        }
    }

    pub async fn seen(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.store.get(fingerprint).await?.is_some())
    }

    /// The entry that owns `fingerprint`, if any.
    pub async fn owner(&self, fingerprint: &Fingerprint) -> Result<Option<DedupEntry>> {
        self.store.get(fingerprint).await
    }

    /// Record a fingerprint. The first job to record a fingerprint owns it.
    pub async fn record(&self, entry: DedupEntry) -> Result<()> {
        self.store.insert_if_absent(entry).await?;
        Ok(())
    }

    /// Atomically record `entry` and report whether its content was new.
    /// Returns the owning entry when the content is a duplicate.
    pub async fn claim(&self, entry: DedupEntry) -> Result<Option<DedupEntry>> {
        let fingerprint = entry.fingerprint.clone();
        if self.store.insert_if_absent(entry).await? {
            return Ok(None);
        }
        self.duplicates.fetch_add(1, Ordering::Relaxed);
        Ok(self.store.get(&fingerprint).await?)
    }

    /// Give up `job_id`'s claim on `fingerprint` so a later job can store
    /// the content. Claims held by other jobs are left alone.
    pub async fn release(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<()> {
        if self.store.remove(fingerprint, job_id).await? {
            tracing::debug!(%fingerprint, %job_id, "content claim released");
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<DedupStats> {
        let (unique_content, unique_urls) = self.store.counts().await?;
        Ok(DedupStats {
            unique_content,
            unique_urls,
            duplicates_skipped: self.duplicates.load(Ordering::Relaxed),
        })
    }
}

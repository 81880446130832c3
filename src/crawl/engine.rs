//! Page fetching and content extraction.
//!
//! [`CrawlEngine`] is the seam the manager talks to; [`HttpCrawlEngine`]
//! fetches with `reqwest` (size-capped, redirect-checked, public-DNS only) and
//! [`extract_page`] turns the body into markdown, a title, metadata and
//! outbound links.

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::config::CrawlSettings;
use crate::models::CrawlConfig;

use super::guard;

const MAX_LINKS: usize = 1000;

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("request failed: {0}")]
    Request(String),
    #[error("target answered HTTP {0}")]
    Status(u16),
    #[error("target rate limited the crawl (HTTP 429)")]
    RateLimited { retry_after: Option<String> },
    #[error("response exceeds {0} bytes")]
    TooLarge(usize),
    #[error("unsupported content type '{0}'")]
    UnsupportedContent(String),
}

#[async_trait]
pub trait CrawlEngine: Send + Sync {
    async fn fetch(&self, url: &Url, config: &CrawlConfig) -> Result<FetchedPage, CrawlError>;
}

pub struct HttpCrawlEngine {
    client: reqwest::Client,
    max_content_bytes: usize,
}

impl HttpCrawlEngine {
    pub fn new(settings: &CrawlSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.timeout_secs))
            .redirect(guard::redirect_policy(settings.max_redirects))
            .dns_resolver(Arc::new(guard::PublicResolver))
            // A proxy would resolve names itself.
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            max_content_bytes: settings.max_content_bytes,
        })
    }
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        mime.as_str(),
        "text/html" | "application/xhtml+xml" | "text/plain" | "text/markdown" | ""
    )
}

#[async_trait]
impl CrawlEngine for HttpCrawlEngine {
    async fn fetch(&self, url: &Url, config: &CrawlConfig) -> Result<FetchedPage, CrawlError> {
        let started = Instant::now();
        let mut request = self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(config.timeout_secs));
        if let Some(agent) = &config.user_agent {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }

        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                CrawlError::Timeout(config.timeout_secs)
            } else {
                CrawlError::Request(e.to_string())
            }
        };

        let mut response = request.send().await.map_err(classify)?;
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(CrawlError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(CrawlError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ct) = &content_type {
            if !is_textual(ct) {
                return Err(CrawlError::UnsupportedContent(ct.clone()));
            }
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_content_bytes)
        {
            return Err(CrawlError::TooLarge(self.max_content_bytes));
        }

        let final_url = response.url().clone();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if body.len() + chunk.len() > self.max_content_bytes {
                return Err(CrawlError::TooLarge(self.max_content_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            final_url,
            status: status.as_u16(),
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
            elapsed: started.elapsed(),
        })
    }
}

/// Structured view of a fetched page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub links: Vec<String>,
}

fn first_text(doc: &Html, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn first_attr(doc: &Html, css: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    doc.select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn collect_links(doc: &Html, base: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut links = BTreeSet::new();
    for href in doc.select(&selector).filter_map(|el| el.value().attr("href")) {
        let Ok(mut link) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(link.scheme(), "http" | "https") {
            continue;
        }
        link.set_fragment(None);
        links.insert(link.to_string());
        if links.len() >= MAX_LINKS {
            break;
        }
    }
    links.into_iter().collect()
}

/// Pull title, markdown content, metadata and links out of a fetched page.
pub fn extract_page(page: &FetchedPage, extract_metadata: bool) -> ExtractedPage {
    use serde_json::Value;

    let is_html = page
        .content_type
        .as_deref()
        .map(|ct| ct.contains("html"))
        .unwrap_or(true);

    let mut metadata = serde_json::Map::new();
    if extract_metadata {
        metadata.insert("domain".into(), Value::from(page.final_url.host_str().unwrap_or_default()));
        metadata.insert("scheme".into(), Value::from(page.final_url.scheme()));
        metadata.insert("status_code".into(), Value::from(page.status));
        if let Some(ct) = &page.content_type {
            metadata.insert("content_type".into(), Value::from(ct.as_str()));
        }
    }

    if !is_html {
        return ExtractedPage {
            title: None,
            content: page.body.trim().to_string(),
            metadata,
            links: Vec::new(),
        };
    }

    let doc = Html::parse_document(&page.body);
    let title = first_text(&doc, "title")
        .or_else(|| first_attr(&doc, r#"meta[property="og:title"]"#, "content"))
        .or_else(|| first_text(&doc, "h1"));

    if extract_metadata {
        let fields = [
            ("title", title.clone()),
            (
                "description",
                first_attr(&doc, r#"meta[name="description"]"#, "content")
                    .or_else(|| first_attr(&doc, r#"meta[property="og:description"]"#, "content")),
            ),
            ("keywords", first_attr(&doc, r#"meta[name="keywords"]"#, "content")),
            ("author", first_attr(&doc, r#"meta[name="author"]"#, "content")),
            ("language", first_attr(&doc, "html[lang]", "lang")),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                metadata.insert(key.into(), Value::from(value));
            }
        }
    }

    ExtractedPage {
        title,
        content: html2md::parse_html(&page.body).trim().to_string(),
        metadata,
        links: collect_links(&doc, &page.final_url),
    }
}

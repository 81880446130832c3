//! Optional JSON audit records of forwarded calls.
//!
//! When `outputs.dir` is set, each completion, retrieval, graph query and
//! crawl submission writes `{prefix}_{timestamp}.json` there. Write
//! failures are logged and never reach the caller.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    dir: Option<PathBuf>,
}

/// Strip any directory part and characters outside `[A-Za-z0-9_-]`.
fn sanitize_prefix(prefix: &str) -> String {
    let base = Path::new(prefix)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output");
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}

impl OutputLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Write `value` as pretty JSON. Returns the path written, if any.
    pub async fn record<T: Serialize>(&self, prefix: &str, value: &T) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let name = format!(
            "{}_{}.json",
            sanitize_prefix(prefix),
            Utc::now().format("%Y%m%d_%H%M%S_%6f")
        );
        let path = dir.join(name);

        let body = match serde_json::to_vec_pretty(value) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(prefix, error = %e, "failed to serialize output record");
                return None;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::error!(dir = %dir.display(), error = %e, "failed to create output directory");
            return None;
        }
        match tokio::fs::write(&path, body).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "output written");
                Some(path)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to write output");
                None
            }
        }
    }
}

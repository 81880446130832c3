//! Bootstrap configuration files served by `GET /config`.
//!
//! Files live in `server.config_dir`. A client may name an app (via the
//! `X-APP` header or `app` query parameter); files from the app's
//! subdirectory are returned alongside the top-level files. Only regular
//! files whose canonical path stays inside the config directory are read,
//! so symlinks pointing elsewhere are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

/// Keep only the last path component of a client-supplied app name.
fn sanitize_app(app: &str) -> Option<&str> {
    let name = app.rsplit(['/', '\\']).next().unwrap_or(app).trim();
    match name {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Read config files as `{relative path: content}`.
///
/// `file` restricts the result to entries with that basename. A missing
/// config directory yields an empty map.
pub fn load_config_files(
    config_dir: &Path,
    app: Option<&str>,
    file: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let Ok(base) = config_dir.canonicalize() else {
        return Ok(BTreeMap::new());
    };
    if !base.is_dir() {
        return Ok(BTreeMap::new());
    }

    let mut candidates = Vec::new();
    if let Some(app) = app.and_then(sanitize_app) {
        candidates.extend(files_in(&base.join(app)));
    }
    candidates.extend(files_in(&base));
    candidates.sort();
    candidates.dedup();

    let mut results = BTreeMap::new();
    for path in candidates {
        let Ok(resolved) = path.canonicalize() else {
            continue;
        };
        if !resolved.starts_with(&base) {
            tracing::warn!(path = %path.display(), "skipping config file outside the config directory");
            continue;
        }
        let Some(key) = relative_key(&base, &path) else {
            continue;
        };
        if let Some(wanted) = file {
            if path.file_name().and_then(|n| n.to_str()) != Some(wanted) {
                continue;
            }
        }
        match std::fs::read_to_string(&resolved) {
            Ok(content) => {
                results.insert(key, content);
            }
            Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to read config file"),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("global.toml"), "level = 1").unwrap();
        fs::create_dir(dir.path().join("billing")).unwrap();
        fs::write(dir.path().join("billing/app.json"), "{\"tier\":\"pro\"}").unwrap();
        fs::write(dir.path().join("billing/global.toml"), "level = 2").unwrap();
        dir
    }

    #[test]
    fn top_level_only_without_app() {
        let dir = fixture();
        let files = load_config_files(dir.path(), None, None).unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["global.toml"]);
    }

    #[test]
    fn app_files_join_top_level() {
        let dir = fixture();
        let files = load_config_files(dir.path(), Some("billing"), None).unwrap();
        assert_eq!(
            files.keys().collect::<Vec<_>>(),
            vec!["billing/app.json", "billing/global.toml", "global.toml"]
        );
        assert_eq!(files["billing/global.toml"], "level = 2");
    }

    #[test]
    fn file_filter_matches_basename() {
        let dir = fixture();
        let files = load_config_files(dir.path(), Some("billing"), Some("global.toml")).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn traversal_in_app_name_is_neutralised() {
        let dir = fixture();
        let files = load_config_files(dir.path(), Some("../../billing"), None).unwrap();
        assert!(files.contains_key("billing/app.json"));
        let files = load_config_files(dir.path(), Some(".."), None).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_leaving_the_directory_are_skipped() {
        let dir = fixture();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "token").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt"))
            .unwrap();
        let files = load_config_files(dir.path(), None, None).unwrap();
        assert!(!files.contains_key("leak.txt"));
    }

    #[test]
    fn missing_directory_is_empty() {
        let files = load_config_files(Path::new("/nonexistent/ragflow-config"), None, None).unwrap();
        assert!(files.is_empty());
    }
}

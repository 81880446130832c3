//! API key policy and the `X-API-KEY` check.
//!
//! A key is weak when it is shorter than [`MIN_KEY_LEN`] characters, made
//! of a single repeated character, or contains a well-known placeholder.
//! Production refuses weak or missing keys at startup; development falls
//! back to a placeholder key and logs warnings.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use crate::config::Environment;
use crate::error::ServiceError;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const MIN_KEY_LEN: usize = 16;
pub const RECOMMENDED_KEY_LEN: usize = 32;
const DEV_FALLBACK_KEY: &str = "changeme";

const WEAK_PATTERNS: &[&str] = &[
    "changeme",
    "change_me",
    "change-me",
    "password",
    "secret",
    "default",
    "example",
    "apikey",
    "api_key",
    "letmein",
    "qwerty",
    "123456",
    "admin",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApiKeyError {
    #[error("RAGFLOW_API_KEY must be set in production")]
    Missing,
    #[error("RAGFLOW_API_KEY is too weak: {0}")]
    Weak(&'static str),
}

/// Returns why `key` is weak, or `None` if it passes the policy.
pub fn weakness(key: &str) -> Option<&'static str> {
    if key.chars().count() < MIN_KEY_LEN {
        return Some("shorter than 16 characters");
    }
    let mut chars = key.chars();
    if let Some(first) = chars.next() {
        if chars.all(|c| c == first) {
            return Some("a single repeated character");
        }
    }
    let lowered = key.to_ascii_lowercase();
    if WEAK_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some("contains a well-known placeholder");
    }
    None
}

/// The key every protected request must present.
#[derive(Clone)]
pub struct ApiKey {
    digest: [u8; 32],
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(**redacted**)")
    }
}

impl ApiKey {
    /// Apply the key policy for `environment`.
    pub fn resolve(configured: Option<&str>, environment: Environment) -> Result<Self, ApiKeyError> {
        let key = match (configured, environment) {
            (Some(key), _) => key,
            (None, Environment::Production) => return Err(ApiKeyError::Missing),
            (None, Environment::Development) => {
                tracing::warn!(
                    "RAGFLOW_API_KEY not set; using the development placeholder key. \
                     Never run like this outside local development"
                );
                DEV_FALLBACK_KEY
            }
        };

        if let Some(reason) = weakness(key) {
            if environment == Environment::Production {
                return Err(ApiKeyError::Weak(reason));
            }
            if configured.is_some() {
                tracing::warn!(reason, "RAGFLOW_API_KEY is weak; acceptable only in development");
            }
        } else if key.chars().count() < RECOMMENDED_KEY_LEN {
            tracing::warn!(
                "RAGFLOW_API_KEY is shorter than {} characters; consider a longer key",
                RECOMMENDED_KEY_LEN
            );
        }

        Ok(Self {
            digest: Sha256::digest(key.as_bytes()).into(),
        })
    }

    /// Constant-time comparison over fixed-length digests.
    pub fn matches(&self, presented: &str) -> bool {
        let other: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        self.digest
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Rejects requests without a matching `X-API-KEY` header.
pub async fn require_api_key(
    State(key): State<ApiKey>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(value) if key.matches(value) => Ok(next.run(request).await),
        _ => Err(ServiceError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRONG: &str = "Zq8r4Lx2Vw9Np3Ht7Bc5Km1Fd6Gs0Jy4";

    #[test]
    fn weak_keys_are_detected() {
        assert!(weakness("short").is_some());
        assert!(weakness("changeme").is_some());
        assert!(weakness("my-ragflow-change_me").is_some());
        assert!(weakness("aaaaaaaaaaaaaaaaaaaaaaaa").is_some());
        assert!(weakness("SuperSecretValue12345").is_some());
        assert!(weakness(STRONG).is_none());
    }

    #[test]
    fn production_fails_closed() {
        assert_eq!(
            ApiKey::resolve(None, Environment::Production).unwrap_err(),
            ApiKeyError::Missing
        );
        assert!(matches!(
            ApiKey::resolve(Some("tooshort"), Environment::Production),
            Err(ApiKeyError::Weak(_))
        ));
        assert!(ApiKey::resolve(Some(STRONG), Environment::Production).is_ok());
    }

    #[test]
    fn development_falls_back() {
        let key = ApiKey::resolve(None, Environment::Development).unwrap();
        assert!(key.matches("changeme"));
        let key = ApiKey::resolve(Some("dev"), Environment::Development).unwrap();
        assert!(key.matches("dev"));
    }

    #[test]
    fn matches_only_exact_key() {
        let key = ApiKey::resolve(Some(STRONG), Environment::Production).unwrap();
        assert!(key.matches(STRONG));
        assert!(!key.matches(&STRONG[1..]));
        assert!(!key.matches(""));
    }
}

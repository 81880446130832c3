//! Outbound URL safety checks.
//!
//! Crawl targets must be plain `http`/`https` URLs whose host resolves only
//! to public addresses. Cloud metadata endpoints and `localhost` names are
//! blocked by name, everything else by address.
//!
//! [`check_url`] runs before a job is accepted. At fetch time the crawl
//! client resolves names through [`PublicResolver`], so a host that
//! re-resolves to a private address is refused on every hop, and
//! [`redirect_policy`] re-runs the static checks on each redirect target.

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use url::{Host, Url};

const BLOCKED_HOSTS: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.com",
    "instance-data",
    "instance-data.ec2.internal",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnsafeUrl {
    #[error("invalid URL: {0}")]
    Invalid(String),
    #[error("only http and https URLs are allowed, got '{0}'")]
    Scheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("host '{0}' is blocked")]
    BlockedHost(String),
    #[error("host '{host}' resolves to non-public address {addr}")]
    PrivateAddress { host: String, addr: IpAddr },
    #[error("host '{0}' could not be resolved")]
    Unresolvable(String),
}

/// Scheme, host and literal-address checks that need no DNS.
pub fn check_static(raw: &str) -> Result<Url, UnsafeUrl> {
    let url = Url::parse(raw.trim()).map_err(|e| UnsafeUrl::Invalid(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UnsafeUrl::Scheme(other.to_string())),
    }

    match url.host() {
        None => return Err(UnsafeUrl::MissingHost),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                return Err(UnsafeUrl::MissingHost);
            }
            if is_blocked_name(&domain) {
                return Err(UnsafeUrl::BlockedHost(domain));
            }
        }
        Some(Host::Ipv4(addr)) => ensure_public(&addr.to_string(), IpAddr::V4(addr))?,
        Some(Host::Ipv6(addr)) => ensure_public(&addr.to_string(), IpAddr::V6(addr))?,
    }

    Ok(url)
}

fn is_blocked_name(domain: &str) -> bool {
    BLOCKED_HOSTS.contains(&domain) || domain == "localhost" || domain.ends_with(".localhost")
}

/// Full check: static rules plus DNS resolution of named hosts. Every
/// resolved address must be public.
pub async fn check_url(raw: &str) -> Result<Url, UnsafeUrl> {
    let url = check_static(raw)?;

    if let Some(Host::Domain(domain)) = url.host() {
        let port = url.port_or_known_default().unwrap_or(80);
        resolve_public(domain, port).await?;
    }

    Ok(url)
}

/// Resolve `host` and return its addresses, failing if any of them is
/// not public.
pub async fn resolve_public(host: &str, port: u16) -> Result<Vec<SocketAddr>, UnsafeUrl> {
    let name = host.trim_end_matches('.').to_ascii_lowercase();
    if is_blocked_name(&name) {
        return Err(UnsafeUrl::BlockedHost(name));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| UnsafeUrl::Unresolvable(host.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(UnsafeUrl::Unresolvable(host.to_string()));
    }
    for addr in &addrs {
        ensure_public(host, addr.ip())?;
    }
    Ok(addrs)
}

/// DNS resolver for crawl clients that only hands out public addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicResolver;

impl Resolve for PublicResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            // The connector replaces the port with the URL's.
            let addrs = resolve_public(&host, 0).await.inspect_err(|e| {
                tracing::warn!(%host, error = %e, "refusing to connect");
            })?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

fn ensure_public(host: &str, addr: IpAddr) -> Result<(), UnsafeUrl> {
    if is_public(addr) {
        Ok(())
    } else {
        Err(UnsafeUrl::PrivateAddress {
            host: host.to_string(),
            addr,
        })
    }
}

pub fn is_public(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(addr: Ipv4Addr) -> bool {
    let [a, b, ..] = addr.octets();
    let cgnat = a == 100 && (64..=127).contains(&b);
    let this_network = a == 0;
    !(addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_multicast()
        || addr.is_documentation()
        || cgnat
        || this_network)
}

fn is_public_v6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(addr.is_loopback() || addr.is_unspecified() || addr.is_multicast() || unique_local || link_local)
}

/// Redirect policy for crawl clients: caps the hop count and refuses
/// redirects to non-HTTP schemes, blocked hosts or non-public IP literals.
/// Named targets are resolved through [`PublicResolver`] when connecting.
pub fn redirect_policy(max_redirects: usize) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= max_redirects {
            return attempt.error(format!("more than {} redirects", max_redirects));
        }
        match check_static(attempt.url().as_str()) {
            Ok(_) => attempt.follow(),
            Err(reason) => attempt.error(reason),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_schemes() {
        assert_eq!(
            check_static("ftp://example.org/file").unwrap_err(),
            UnsafeUrl::Scheme("ftp".into())
        );
        assert!(matches!(
            check_static("file:///etc/passwd"),
            Err(UnsafeUrl::Scheme(_))
        ));
        assert!(matches!(check_static("not a url"), Err(UnsafeUrl::Invalid(_))));
    }

    #[test]
    fn rejects_private_literals() {
        for raw in [
            "http://10.0.0.5/",
            "http://172.16.3.4/admin",
            "http://192.168.1.1/",
            "http://127.0.0.1:8080/",
            "http://169.254.169.254/latest/meta-data/",
            "http://0.0.0.0/",
            "http://100.64.0.1/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:10.0.0.1]/",
        ] {
            assert!(
                matches!(check_static(raw), Err(UnsafeUrl::PrivateAddress { .. })),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn rejects_metadata_hosts() {
        assert_eq!(
            check_static("http://metadata.google.internal/computeMetadata/v1/").unwrap_err(),
            UnsafeUrl::BlockedHost("metadata.google.internal".into())
        );
        assert!(matches!(
            check_static("http://METADATA.GOOG./"),
            Err(UnsafeUrl::BlockedHost(_))
        ));
    }

    #[test]
    fn rejects_localhost_names() {
        for raw in [
            "http://localhost:6379/",
            "http://LOCALHOST./",
            "http://api.localhost/",
        ] {
            assert!(
                matches!(check_static(raw), Err(UnsafeUrl::BlockedHost(_))),
                "{} should be rejected",
                raw
            );
        }
        assert!(check_static("http://localhost.example.org/").is_ok());
    }

    #[tokio::test]
    async fn resolver_refuses_loopback_names() {
        let name: Name = "localhost".parse().unwrap();
        assert!(PublicResolver.resolve(name).await.is_err());
        assert!(matches!(
            resolve_public("localhost", 80).await,
            Err(UnsafeUrl::BlockedHost(_))
        ));
    }

    #[tokio::test]
    async fn resolver_passes_public_literals() {
        let addrs = resolve_public("93.184.216.34", 443).await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34:443".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn accepts_public_literals() {
        assert!(check_static("http://93.184.216.34/index.html").is_ok());
        assert!(check_static("https://[2606:4700:4700::1111]/").is_ok());
    }

    #[tokio::test]
    async fn check_url_blocks_localhost_before_dns() {
        assert_eq!(
            check_url("http://localhost:9000/").await.unwrap_err(),
            UnsafeUrl::BlockedHost("localhost".into())
        );
    }

    #[tokio::test]
    async fn public_literal_skips_dns() {
        let url = check_url("https://93.184.216.34/a?b=c").await.unwrap();
        assert_eq!(url.host_str(), Some("93.184.216.34"));
    }
}

//! Per-domain politeness throttle for outbound crawl requests.
//!
//! Every domain (host without `www.`) gets a rule: a cap of
//! `requests_per_minute` per one-minute window, a minimum spacing of
//! `60 / requests_per_minute` seconds between requests once the first
//! `burst` requests of the window are spent, and a cooldown imposed after
//! the site answers 429.
//!
//! [`DomainThrottle::reserve`] books the next slot and returns how long the
//! caller must sleep before using it, so concurrent workers targeting the
//! same domain queue up behind each other instead of firing together.
//!
//! Rules match on domain suffix: a rule for `wikipedia.org` also covers
//! `en.wikipedia.org`. Every cooldown, including one taken from a
//! `Retry-After` header, is capped at the throttle's maximum.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use url::Url;

use crate::config::{CrawlSettings, DomainRuleConfig};

const WINDOW_SECS: i64 = 60;
const DEFAULT_MAX_COOLDOWN_SECS: u64 = 3600;
const DEFAULT_MAX_WAIT_SECS: i64 = 300;

/// `secs` as a duration, `None` when it does not fit.
fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DomainRule {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub cooldown_secs: u64,
}

impl DomainRule {
    pub const fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            burst,
            cooldown_secs: 60,
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::milliseconds(60_000 / i64::from(self.requests_per_minute.max(1)))
    }
}

impl From<DomainRuleConfig> for DomainRule {
    fn from(c: DomainRuleConfig) -> Self {
        Self {
            requests_per_minute: c.requests_per_minute,
            burst: c.burst,
            cooldown_secs: c.cooldown_secs,
        }
    }
}

/// Conservative built-in rules for large platforms.
const BUILTIN_RULES: &[(&str, DomainRule)] = &[
    ("google.com", DomainRule::new(10, 2)),
    ("github.com", DomainRule::new(15, 3)),
    ("stackoverflow.com", DomainRule::new(20, 3)),
    ("wikipedia.org", DomainRule::new(60, 10)),
    ("reddit.com", DomainRule::new(10, 2)),
    ("twitter.com", DomainRule::new(5, 1)),
    ("facebook.com", DomainRule::new(5, 1)),
    ("linkedin.com", DomainRule::new(5, 1)),
    ("amazon.com", DomainRule::new(10, 2)),
    ("youtube.com", DomainRule::new(5, 1)),
];

#[derive(Debug, Clone, Default)]
struct DomainState {
    window_start: Option<DateTime<Utc>>,
    window_count: u32,
    last_request: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    total_requests: u64,
    throttled: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub rule: DomainRule,
    pub window_count: u32,
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

pub struct DomainThrottle {
    default_rule: DomainRule,
    rules: HashMap<String, DomainRule>,
    max_cooldown: Duration,
    max_wait: Duration,
    state: Mutex<HashMap<String, DomainState>>,
}

pub fn domain_of(url: &Url) -> Option<String> {
    let host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

impl DomainThrottle {
    pub fn new(default_rule: DomainRule) -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .map(|(d, r)| (d.to_string(), *r))
            .collect();
        Self {
            default_rule,
            rules,
            max_cooldown: Duration::seconds(DEFAULT_MAX_COOLDOWN_SECS as i64),
            max_wait: Duration::seconds(DEFAULT_MAX_WAIT_SECS),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Cap every cooldown at `secs`.
    pub fn with_max_cooldown(mut self, secs: u64) -> Self {
        self.max_cooldown = seconds(secs.max(1)).unwrap_or(self.max_cooldown);
        self
    }

    /// Longest wait a caller of [`reserve_within`](Self::reserve_within)
    /// should accept before giving up on a request.
    pub fn with_max_wait(mut self, secs: u64) -> Self {
        self.max_wait = seconds(secs).unwrap_or(self.max_wait);
        self
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn from_settings(settings: &CrawlSettings) -> Self {
        let mut throttle = Self::new(settings.default_rule.into())
            .with_max_cooldown(settings.max_cooldown_secs)
            .with_max_wait(settings.max_throttle_wait_secs);
        for (domain, rule) in &settings.domain_rules {
            throttle.set_rule(domain, (*rule).into());
        }
        throttle
    }

    pub fn set_rule(&mut self, domain: &str, rule: DomainRule) {
        let domain = domain.to_ascii_lowercase();
        let domain = domain.strip_prefix("www.").unwrap_or(&domain).to_string();
        tracing::debug!(
            %domain,
            requests_per_minute = rule.requests_per_minute,
            burst = rule.burst,
            "domain rule set"
        );
        self.rules.insert(domain, rule);
    }

    /// Rule for `domain` or its closest configured parent domain.
    pub fn rule_for(&self, domain: &str) -> DomainRule {
        let mut candidate = domain;
        loop {
            if let Some(rule) = self.rules.get(candidate) {
                return *rule;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return self.default_rule,
            }
        }
    }

    /// Book the next request slot for `url`'s domain and return the delay
    /// before it may be sent.
    pub fn reserve(&self, url: &Url, now: DateTime<Utc>) -> Duration {
        match self.book(url, now, None) {
            Ok(delay) | Err(delay) => delay,
        }
    }

    /// Like [`reserve`](Self::reserve), but books nothing and returns
    /// `Err(delay)` when the wait would exceed `limit`.
    pub fn reserve_within(
        &self,
        url: &Url,
        now: DateTime<Utc>,
        limit: Duration,
    ) -> Result<Duration, Duration> {
        self.book(url, now, Some(limit))
    }

    fn book(
        &self,
        url: &Url,
        now: DateTime<Utc>,
        limit: Option<Duration>,
    ) -> Result<Duration, Duration> {
        let Some(domain) = domain_of(url) else {
            return Ok(Duration::zero());
        };
        let rule = self.rule_for(&domain);
        let window = Duration::seconds(WINDOW_SECS);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = state.entry(domain).or_default();
        let mut next = slot.clone();
        let entry = &mut next;

        let mut at = now;
        if let Some(until) = entry.cooldown_until {
            if at < until {
                at = until;
            } else {
                entry.cooldown_until = None;
            }
        }

        let window_start = match entry.window_start {
            Some(start) if at - start < window => start,
            _ => {
                entry.window_count = 0;
                at
            }
        };
        entry.window_start = Some(window_start);
        if at < window_start {
            at = window_start;
        }

        if entry.window_count >= rule.requests_per_minute {
            at = window_start + window;
            entry.window_start = Some(at);
            entry.window_count = 0;
        }

        if entry.window_count >= rule.burst {
            if let Some(last) = entry.last_request {
                let earliest = last + rule.min_interval();
                if at < earliest {
                    at = earliest;
                }
            }
        }

        let delay = at - now;
        if limit.is_some_and(|limit| delay > limit) {
            return Err(delay);
        }

        entry.window_count += 1;
        entry.total_requests += 1;
        entry.last_request = Some(at);
        if delay > Duration::zero() {
            entry.throttled += 1;
        }
        *slot = next;
        Ok(delay)
    }

    /// Put the domain into cooldown after a 429. `retry_after` is the raw
    /// header value: delay-seconds or an HTTP date.
    pub fn penalize(&self, url: &Url, retry_after: Option<&str>, now: DateTime<Utc>) {
        let Some(domain) = domain_of(url) else {
            return;
        };
        let rule = self.rule_for(&domain);
        let fallback = seconds(rule.cooldown_secs).unwrap_or(self.max_cooldown);
        let wait = retry_after
            .and_then(|v| parse_retry_after(v, now))
            .unwrap_or(fallback)
            .min(self.max_cooldown);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = state.entry(domain.clone()).or_default();
        let until = now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC);
        entry.cooldown_until = Some(entry.cooldown_until.map_or(until, |u| u.max(until)));
        tracing::warn!(%domain, cooldown_secs = wait.num_seconds(), "domain rate limited us");
    }

    pub fn stats(&self) -> Vec<DomainStats> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<DomainStats> = state
            .iter()
            .map(|(domain, s)| DomainStats {
                domain: domain.clone(),
                rule: self.rule_for(domain),
                window_count: s.window_count,
                total_requests: s.total_requests,
                throttled_requests: s.throttled,
                cooldown_until: s.cooldown_until,
            })
            .collect();
        stats.sort_by(|a, b| a.domain.cmp(&b.domain));
        stats
    }

    pub fn reset(&self, domain: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match domain {
            Some(d) => {
                state.remove(d);
            }
            None => state.clear(),
        }
    }
}

/// Parse a `Retry-After` header value (seconds or HTTP date). Values too
/// large to represent saturate at `i64::MAX` milliseconds.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.bytes().all(|b| b.is_ascii_digit()) && !value.is_empty() {
        let millis = value
            .parse::<u64>()
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .and_then(|ms| i64::try_from(ms).ok())
            .unwrap_or(i64::MAX);
        return Some(Duration::milliseconds(millis));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc).signed_duration_since(now).max(Duration::zero()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn domain_strips_www() {
        assert_eq!(
            domain_of(&url("https://WWW.Example.org/x")).as_deref(),
            Some("example.org")
        );
    }

    #[test]
    fn burst_is_free_then_spaced() {
        let throttle = DomainThrottle::new(DomainRule::new(30, 2));
        let now = Utc::now();
        let u = url("https://example.org/");
        assert_eq!(throttle.reserve(&u, now), Duration::zero());
        assert_eq!(throttle.reserve(&u, now), Duration::zero());
        // Third request waits one min-interval (2s at 30 rpm) after the second.
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(2));
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(4));
    }

    #[test]
    fn window_cap_pushes_to_next_window() {
        let throttle = DomainThrottle::new(DomainRule::new(2, 2));
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.reserve(&u, now);
        throttle.reserve(&u, now);
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(60));
    }

    #[test]
    fn builtin_rules_apply() {
        let throttle = DomainThrottle::new(DomainRule::new(30, 5));
        assert_eq!(throttle.rule_for("twitter.com").requests_per_minute, 5);
        assert_eq!(throttle.rule_for("unknown.dev").requests_per_minute, 30);
    }

    #[test]
    fn penalty_delays_next_request() {
        let throttle = DomainThrottle::new(DomainRule::new(30, 5));
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.penalize(&u, Some("120"), now);
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(120));
        let stats = throttle.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].throttled_requests, 1);
    }

    #[test]
    fn penalty_without_header_uses_rule_cooldown() {
        let throttle = DomainThrottle::new(DomainRule::new(30, 5));
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.penalize(&u, Some("soon"), now);
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(60));
    }

    #[test]
    fn retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:28:30 GMT", now),
            Some(Duration::seconds(30))
        );
        assert_eq!(parse_retry_after("-5", now), None);
    }

    #[test]
    fn subdomains_inherit_parent_rules() {
        let mut throttle = DomainThrottle::new(DomainRule::new(30, 5));
        assert_eq!(throttle.rule_for("en.wikipedia.org").requests_per_minute, 60);
        assert_eq!(throttle.rule_for("api.github.com").requests_per_minute, 15);
        assert_eq!(throttle.rule_for("notgithub.com").requests_per_minute, 30);
        assert_eq!(throttle.rule_for("github.com.evil.dev").requests_per_minute, 30);

        throttle.set_rule("docs.github.com", DomainRule::new(2, 1));
        assert_eq!(throttle.rule_for("v2.docs.github.com").requests_per_minute, 2);
        assert_eq!(throttle.rule_for("api.github.com").requests_per_minute, 15);
    }

    #[test]
    fn huge_retry_after_saturates() {
        let now = Utc::now();
        let max = parse_retry_after("9223372036854775807", now).unwrap();
        assert!(max > Duration::days(365 * 1000));
        let beyond = parse_retry_after("99999999999999999999999", now).unwrap();
        assert_eq!(beyond, max);
    }

    #[test]
    fn huge_retry_after_is_capped() {
        let throttle = DomainThrottle::new(DomainRule::new(30, 5)).with_max_cooldown(600);
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.penalize(&u, Some("100000000000000"), now);
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(600));

        let v = url("https://example.net/");
        throttle.penalize(&v, Some("Fri, 31 Dec 9999 23:59:59 GMT"), now);
        assert_eq!(throttle.reserve(&v, now), Duration::seconds(600));
    }

    #[test]
    fn rule_cooldown_is_capped_too() {
        let mut throttle = DomainThrottle::new(DomainRule::new(30, 5)).with_max_cooldown(30);
        throttle.set_rule(
            "example.org",
            DomainRule {
                requests_per_minute: 30,
                burst: 5,
                cooldown_secs: u64::MAX,
            },
        );
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.penalize(&u, None, now);
        assert_eq!(throttle.reserve(&u, now), Duration::seconds(30));
    }

    #[test]
    fn reserve_within_books_nothing_past_limit() {
        let throttle = DomainThrottle::new(DomainRule::new(30, 5));
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.penalize(&u, Some("120"), now);

        assert_eq!(
            throttle.reserve_within(&u, now, Duration::seconds(60)),
            Err(Duration::seconds(120))
        );
        let stats = throttle.stats();
        assert_eq!(stats[0].total_requests, 0);

        assert_eq!(
            throttle.reserve_within(&u, now, Duration::seconds(300)),
            Ok(Duration::seconds(120))
        );
        assert_eq!(throttle.stats()[0].total_requests, 1);
    }

    #[test]
    fn reset_clears_state() {
        let throttle = DomainThrottle::new(DomainRule::new(1, 0));
        let now = Utc::now();
        let u = url("https://example.org/");
        throttle.reserve(&u, now);
        throttle.reset(Some("example.org"));
        assert_eq!(throttle.reserve(&u, now), Duration::zero());
        throttle.reset(None);
        assert!(throttle.stats().is_empty());
    }
}

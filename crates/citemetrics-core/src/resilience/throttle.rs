//! Per-host politeness throttle with adaptive slowdown on HTTP 429.
//!
//! Every outbound request calls [`RateLimiter::acquire`] with its host first.
//! The limiter remembers when the last request to that host was issued and
//! sleeps until the configured spacing has passed. The slot is reserved
//! under the lock before sleeping, so two callers racing for the same host
//! are still spaced apart.
//!
//! On a 429 the spacing for that host is doubled (capped at 16x). After 60s
//! without another 429 the factor decays back to 1.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Hosts that serve machine-readable APIs and tolerate tighter spacing.
pub const API_DOMAINS: &[&str] = &[
    "doi.org",
    "api.crossref.org",
    "shortdoi.org",
    "api.altmetric.com",
    "www.altmetric.com",
];

const MAX_FACTOR: u32 = 16;
const DECAY_AFTER: Duration = Duration::from_secs(60);

/// Minimum spacing between requests, per host.
#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    default_spacing: Duration,
    overrides: HashMap<String, Duration>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::standard(Duration::from_secs(30), Duration::from_secs(1), API_DOMAINS)
    }
}

impl ThrottlePolicy {
    pub fn new(default_spacing: Duration) -> Self {
        Self {
            default_spacing,
            overrides: HashMap::new(),
        }
    }

    /// Scraped sites get `default_spacing`, the listed API hosts get `api_spacing`.
    pub fn standard<S: AsRef<str>>(
        default_spacing: Duration,
        api_spacing: Duration,
        api_domains: &[S],
    ) -> Self {
        let mut policy = Self::new(default_spacing);
        for host in api_domains {
            policy = policy.with_host(host.as_ref(), api_spacing);
        }
        policy
    }

    pub fn with_host(mut self, host: &str, spacing: Duration) -> Self {
        self.overrides.insert(host.to_ascii_lowercase(), spacing);
        self
    }

    /// Spacing for `host`. An override for `doi.org` also covers `dx.doi.org`.
    pub fn spacing_for(&self, host: &str) -> Duration {
        let host = host.to_ascii_lowercase();
        if let Some(spacing) = self.overrides.get(&host) {
            return *spacing;
        }
        self.overrides
            .iter()
            .filter(|(key, _)| host.ends_with(&format!(".{key}")))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, spacing)| *spacing)
            .unwrap_or(self.default_spacing)
    }
}

#[derive(Debug)]
struct HostState {
    last_access: Option<Instant>,
    factor: u32,
    last_429: Option<Instant>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            last_access: None,
            factor: 1,
            last_429: None,
        }
    }
}

impl HostState {
    fn decay(&mut self, now: Instant) {
        if self.factor > 1
            && let Some(last) = self.last_429
            && now.duration_since(last) >= DECAY_AFTER
        {
            self.factor = 1;
            self.last_429 = None;
        }
    }
}

/// Process-local throttle shared by every network call site.
#[derive(Debug, Default)]
pub struct RateLimiter {
    policy: ThrottlePolicy,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl RateLimiter {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until a request to `host` is allowed, then record it.
    ///
    /// Returns how long the caller was made to wait.
    pub async fn acquire(&self, host: &str) -> Duration {
        let host = host.to_ascii_lowercase();
        let base = self.policy.spacing_for(&host);

        let wait = {
            let mut hosts = self.hosts();
            let state = hosts.entry(host.clone()).or_default();
            let now = Instant::now();
            state.decay(now);
            let spacing = base * state.factor;
            let start = match state.last_access {
                Some(last) => (last + spacing).max(now),
                None => now,
            };
            state.last_access = Some(start);
            start - now
        };

        if !wait.is_zero() {
            tracing::debug!(
                domain = %host,
                wait_secs = wait.as_secs_f64(),
                "throttling request"
            );
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a 429 from `host`: double its spacing, capped at 16x.
    pub fn on_rate_limited(&self, host: &str) {
        let host = host.to_ascii_lowercase();
        let mut hosts = self.hosts();
        let state = hosts.entry(host.clone()).or_default();
        state.factor = (state.factor * 2).min(MAX_FACTOR);
        state.last_429 = Some(Instant::now());
        tracing::info!(domain = %host, factor = state.factor, "429 received, slowing down");
    }

    /// Current slowdown factor for `host` (1 = normal).
    pub fn factor(&self, host: &str) -> u32 {
        let host = host.to_ascii_lowercase();
        let mut hosts = self.hosts();
        match hosts.get_mut(&host) {
            Some(state) => {
                state.decay(Instant::now());
                state.factor
            }
            None => 1,
        }
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form: use a conservative fixed wait
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod authors;
pub mod cache;
pub mod clock;
pub mod config_file;
pub mod doi;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod matching;
pub mod metadata;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod profile;
pub mod resilience;
pub mod search;
pub mod store;

// Re-export for convenience
pub use cache::{CacheDomain, CacheStore};
pub use clock::{Clock, SystemClock};
pub use doi::{DoiOutcome, DoiResolver};
pub use error::CoreError;
pub use metrics::{MetricsService, RevalidationPolicy, SweepReport};
pub use model::{AuthorRecord, Coauthor, PublicationRecord, ResumeMarker};
pub use orchestrator::{ItemState, Orchestrator, RunOutcome, RunSettings, RunSummary};

use doi::DoiRegistry;
use doi::verify::DoiVerifier;
use fetcher::HttpContentFetcher;
use http::{HttpTransport, PoliteClient};
use metadata::MetadataSource;
use metrics::{AltmetricSource, AuthorGate, ScholarSource};
use profile::{JsonProfileProvider, ProfileProvider};
use resilience::{CaptchaBackoff, ProxyChain, RateLimiter, RetryPolicy, ThrottlePolicy};
use search::SearxngSearch;
use store::AuthorStore;

const DAY: u64 = 24 * 60 * 60;

/// Progress events emitted during an author run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    AlreadyFresh {
        author_id: String,
    },
    ProfileLoaded {
        name: String,
        coauthors: usize,
        publications: usize,
    },
    Coauthor {
        index: usize,
        total: usize,
        name: String,
    },
    Publication {
        index: usize,
        total: usize,
        title: String,
        state: ItemState,
    },
}

/// Engine configuration, resolved from defaults, config files and the
/// environment.
#[derive(Clone)]
pub struct Config {
    /// Author records, one JSON file each.
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub profiles_dir: PathBuf,

    pub http_ttl: Duration,
    pub metrics_ttl: Duration,
    pub revalidate_after: Duration,
    /// Whether revalidation re-checks stale gate denials.
    pub recheck_denied: bool,

    pub fresh_data: Duration,
    pub coauthor_delay: Duration,
    pub publication_delay: Duration,

    pub retry: RetryPolicy,
    pub captcha: CaptchaBackoff,

    /// Spacing for scraped hosts.
    pub default_spacing: Duration,
    /// Spacing for the hosts in `api_domains`.
    pub api_spacing: Duration,
    pub api_domains: Vec<String>,

    pub tor_proxy: Option<String>,
    pub tor_repeats: usize,
    /// Raw `host:port|user|pass` list.
    pub socks5_proxies: Option<String>,

    pub browser_render_url: Option<String>,
    pub searxng_url: Option<String>,
    pub crossref_mailto: Option<String>,

    pub allowed_surnames: Vec<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("cache_dir", &self.cache_dir)
            .field("profiles_dir", &self.profiles_dir)
            .field("http_ttl", &self.http_ttl)
            .field("metrics_ttl", &self.metrics_ttl)
            .field("revalidate_after", &self.revalidate_after)
            .field("recheck_denied", &self.recheck_denied)
            .field("fresh_data", &self.fresh_data)
            .field("coauthor_delay", &self.coauthor_delay)
            .field("publication_delay", &self.publication_delay)
            .field("retry", &self.retry)
            .field("captcha", &self.captcha)
            .field("default_spacing", &self.default_spacing)
            .field("api_spacing", &self.api_spacing)
            .field("api_domains", &self.api_domains)
            .field("tor_proxy", &self.tor_proxy)
            .field("tor_repeats", &self.tor_repeats)
            .field(
                "socks5_proxies",
                &self.socks5_proxies.as_ref().map(|_| "***"),
            )
            .field("browser_render_url", &self.browser_render_url)
            .field("searxng_url", &self.searxng_url)
            .field(
                "crossref_mailto",
                &self.crossref_mailto.as_ref().map(|_| "***"),
            )
            .field("allowed_surnames", &self.allowed_surnames)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("scholar_data"),
            cache_dir: PathBuf::from("cache"),
            profiles_dir: PathBuf::from("profiles"),
            http_ttl: Duration::from_secs(30 * DAY),
            metrics_ttl: Duration::from_secs(14 * DAY),
            revalidate_after: Duration::from_secs(7 * DAY),
            recheck_denied: true,
            fresh_data: Duration::from_secs(7 * DAY),
            coauthor_delay: Duration::from_secs(2),
            publication_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            captcha: CaptchaBackoff::default(),
            default_spacing: Duration::from_secs(30),
            api_spacing: Duration::from_secs(1),
            api_domains: resilience::throttle::API_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            tor_proxy: None,
            tor_repeats: 3,
            socks5_proxies: None,
            browser_render_url: Some("http://localhost:3000".to_string()),
            searxng_url: None,
            crossref_mailto: None,
            allowed_surnames: metrics::gate::DEFAULT_ALLOWED_SURNAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Defaults, then `file`, then the environment.
    pub fn resolve(file: &config_file::ConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config_file::apply_file(&mut config, file);
        config_file::apply_env(&mut config, env);
        config
    }

    pub fn run_settings(&self, force: bool) -> RunSettings {
        RunSettings {
            fresh_data: self.fresh_data,
            coauthor_delay: self.coauthor_delay,
            publication_delay: self.publication_delay,
            force,
        }
    }

    pub fn revalidation_policy(&self) -> RevalidationPolicy {
        RevalidationPolicy {
            stale_after: self.revalidate_after,
            recheck_denied: self.recheck_denied,
        }
    }

    pub fn throttle_policy(&self) -> ThrottlePolicy {
        let mut policy =
            ThrottlePolicy::standard(self.default_spacing, self.api_spacing, self.api_domains.as_slice());
        // The render backend is local; it gets no politeness delay.
        if let Some(host) = self.browser_render_url.as_deref().and_then(http::host_of) {
            policy = policy.with_host(&host, Duration::ZERO);
        }
        policy
    }

    pub fn proxy_chain(&self) -> ProxyChain {
        ProxyChain::from_settings(
            self.tor_proxy.as_deref(),
            self.tor_repeats,
            self.socks5_proxies.as_deref(),
        )
    }
}

/// Build a [`CacheStore`] under `cache_dir`.
///
/// Falls back to an in-memory cache when the directory cannot be used.
pub fn build_cache(cache_dir: &Path, clock: Arc<dyn Clock>) -> Arc<CacheStore> {
    match CacheStore::open_in_dir(cache_dir, clock.clone()) {
        Ok(cache) => {
            tracing::info!(path = %cache_dir.display(), "opened persistent cache");
            Arc::new(cache)
        }
        Err(e) => {
            tracing::warn!(path = %cache_dir.display(), error = %e, "failed to open cache, falling back to in-memory");
            Arc::new(CacheStore::in_memory(clock))
        }
    }
}

/// Every component wired from one [`Config`].
pub struct Engine {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub cache: Arc<CacheStore>,
    pub client: PoliteClient,
    pub metadata: Arc<MetadataSource>,
    pub resolver: Arc<DoiResolver>,
    pub metrics: Arc<MetricsService>,
    pub profiles: Arc<dyn ProfileProvider>,
}

impl Engine {
    pub fn build(config: Config, transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        let cache = build_cache(&config.cache_dir, clock.clone());
        Self::with_cache(config, transport, clock, cache)
    }

    pub fn with_cache(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        cache: Arc<CacheStore>,
    ) -> Self {
        tracing::debug!(config = ?config, "building engine");
        let limiter = Arc::new(RateLimiter::new(config.throttle_policy()));
        let client = PoliteClient::new(transport, limiter)
            .with_proxies(config.proxy_chain())
            .with_retry(config.retry)
            .with_cache(cache.clone(), config.http_ttl);

        let metadata = Arc::new(MetadataSource::new(
            client.clone(),
            cache.clone(),
            config.crossref_mailto.clone(),
        ));

        let verifier = DoiVerifier::new(client.clone(), DoiRegistry::new(client.clone()))
            .with_captcha_backoff(config.captcha);
        let fetcher = Arc::new(HttpContentFetcher::new(
            client.clone(),
            config.browser_render_url.clone(),
        ));
        let mut resolver = DoiResolver::new(fetcher, verifier).with_metadata(metadata.clone());
        if let Some(url) = &config.searxng_url {
            resolver = resolver.with_search(Arc::new(SearxngSearch::new(url, client.clone())));
        }

        let metrics = MetricsService::new(
            cache.clone(),
            metadata.clone(),
            AuthorGate::new(config.allowed_surnames.as_slice()),
        )
        .with_ttl(config.metrics_ttl)
        .with_source(Arc::new(AltmetricSource::new(client.clone())))
        .with_source(Arc::new(ScholarSource::new(client.clone())));

        let profiles = Arc::new(JsonProfileProvider::new(config.profiles_dir.clone()));

        Self {
            config,
            clock,
            cache,
            client,
            metadata,
            resolver: Arc::new(resolver),
            metrics: Arc::new(metrics),
            profiles,
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileProvider>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn store(&self) -> AuthorStore {
        AuthorStore::new(self.config.data_dir.clone(), self.clock.clone())
    }

    pub fn orchestrator(&self, force: bool) -> Orchestrator {
        Orchestrator::new(
            self.profiles.clone(),
            self.resolver.clone(),
            self.metrics.clone(),
            self.store(),
            self.config.run_settings(force),
        )
    }
}

//! The polite client every network call site goes through.
//!
//! Order of operations per request: throttle the host, send, on 429 slow
//! the host down and honor `Retry-After` once, retry transient transport
//! errors with exponential backoff. [`PoliteClient::send_via_proxies`] adds
//! linear proxy failover with block-page detection on top.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::{HttpError, HttpRequest, HttpResponse, HttpTransport};
use crate::cache::{CacheDomain, CacheStore};
use crate::resilience::retry::retry_transient;
use crate::resilience::{BlockDetector, ProxyChain, ProxyEndpoint, RateLimiter, RetryPolicy};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct PoliteClient {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    proxies: ProxyChain,
    retry: RetryPolicy,
    cache: Option<Arc<CacheStore>>,
    http_ttl: Duration,
}

impl PoliteClient {
    pub fn new(transport: Arc<dyn HttpTransport>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            transport,
            limiter,
            proxies: ProxyChain::direct(),
            retry: RetryPolicy::default(),
            cache: None,
            http_ttl: CacheDomain::Http.default_ttl().unwrap_or(Duration::from_secs(30 * 86_400)),
        }
    }

    pub fn with_proxies(mut self, proxies: ProxyChain) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable the HTTP replay cache for [`get_cached`](Self::get_cached).
    pub fn with_cache(mut self, cache: Arc<CacheStore>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.http_ttl = ttl;
        self
    }

    pub fn proxies(&self) -> &ProxyChain {
        &self.proxies
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    /// Send without a proxy.
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.send_via(request, &ProxyEndpoint::Direct).await
    }

    /// Send through `proxy`. Every status except a persistent 429 is `Ok`.
    pub async fn send_via(
        &self,
        request: &HttpRequest,
        proxy: &ProxyEndpoint,
    ) -> Result<HttpResponse, HttpError> {
        retry_transient(self.retry, HttpError::is_transient, |_| {
            self.attempt(request, proxy)
        })
        .await
    }

    async fn attempt(
        &self,
        request: &HttpRequest,
        proxy: &ProxyEndpoint,
    ) -> Result<HttpResponse, HttpError> {
        let host = request.host();
        self.limiter.acquire(&host).await;
        let resp = self.transport.execute(request, proxy).await?;
        if resp.status != 429 {
            return Ok(resp);
        }

        self.limiter.on_rate_limited(&host);
        let wait = resp
            .retry_after
            .unwrap_or(DEFAULT_RETRY_AFTER)
            .min(MAX_RETRY_AFTER);
        tracing::info!(
            url = %request.url,
            domain = %host,
            wait_secs = wait.as_secs_f64(),
            "429 rate limited, waiting then retrying once"
        );
        tokio::time::sleep(wait).await;
        self.limiter.acquire(&host).await;

        let resp = self.transport.execute(request, proxy).await?;
        if resp.status == 429 {
            self.limiter.on_rate_limited(&host);
            return Err(HttpError::RateLimited {
                url: request.url.clone(),
                retry_after: resp.retry_after,
            });
        }
        Ok(resp)
    }

    /// GET/POST with replay from the HTTP cache domain.
    ///
    /// Only successful text responses are stored.
    pub async fn get_cached(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let Some(cache) = &self.cache else {
            return self.send(request).await;
        };
        let key = request.cache_key();
        if let Some(entry) = cache.get(CacheDomain::Http, &key)
            && let Some(resp) = response_from_payload(&entry.payload)
        {
            tracing::trace!(url = %request.url, "HTTP cache hit");
            return Ok(resp);
        }

        let resp = self.send(request).await?;
        if resp.is_success()
            && let Ok(text) = std::str::from_utf8(&resp.body)
        {
            let payload = json!({
                "status": resp.status,
                "final_url": resp.final_url,
                "content_type": resp.content_type,
                "body": text,
            });
            if let Err(e) = cache.put(CacheDomain::Http, &key, payload, Some(self.http_ttl)) {
                tracing::warn!(url = %request.url, error = %e, "failed to cache HTTP response");
            }
        }
        Ok(resp)
    }

    /// Try each proxy in chain order. The first 2xx response that is not a
    /// block page wins. 404/410 are definitive and returned as-is.
    ///
    /// When every hop fails, returns [`HttpError::Blocked`] if any hop was
    /// blocked, else the last error.
    pub async fn send_via_proxies(
        &self,
        request: &HttpRequest,
        detector: &BlockDetector,
    ) -> Result<HttpResponse, HttpError> {
        let mut blocked = false;
        let mut last_err = None;

        for proxy in self.proxies.endpoints() {
            match self.send_via(request, &proxy).await {
                Ok(resp) if resp.is_success() => {
                    let verdict = detector.classify(&resp.final_url, &resp.text());
                    if !verdict.is_blocked() {
                        return Ok(resp);
                    }
                    tracing::warn!(
                        url = %request.url,
                        proxy = %proxy,
                        verdict = ?verdict,
                        "block page detected, trying next proxy"
                    );
                    blocked = true;
                }
                Ok(resp) if resp.status == 404 || resp.status == 410 => return Ok(resp),
                Ok(resp) => {
                    tracing::warn!(
                        url = %request.url,
                        proxy = %proxy,
                        status = resp.status,
                        "unexpected status, trying next proxy"
                    );
                    if resp.status == 403 {
                        blocked = true;
                    }
                    last_err = Some(HttpError::Status {
                        url: request.url.clone(),
                        status: resp.status,
                    });
                }
                Err(e) => {
                    tracing::warn!(url = %request.url, proxy = %proxy, error = %e, "proxy attempt failed");
                    last_err = Some(e);
                }
            }
        }

        if blocked {
            Err(HttpError::Blocked {
                url: request.url.clone(),
            })
        } else {
            Err(last_err.unwrap_or_else(|| HttpError::Other {
                url: request.url.clone(),
                message: "no proxy attempts were made".into(),
            }))
        }
    }
}

fn response_from_payload(payload: &serde_json::Value) -> Option<HttpResponse> {
    let status = payload.get("status")?.as_u64()? as u16;
    let final_url = payload.get("final_url")?.as_str()?.to_string();
    let body = payload.get("body")?.as_str()?.as_bytes().to_vec();
    let content_type = payload
        .get("content_type")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(HttpResponse {
        status,
        final_url,
        content_type,
        body,
        retry_after: None,
    })
}

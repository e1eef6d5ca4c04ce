//! Outbound HTTP: request/response types, the transport seam, and the
//! polite client that layers throttling, retry, proxy failover and caching
//! on top of it.

pub mod client;
pub mod mock;
pub mod reqwest_transport;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::resilience::ProxyEndpoint;

pub use client::PoliteClient;
pub use reqwest_transport::ReqwestTransport;

/// Crawler identity used for DOI redirect checks.
pub const SEARCH_BOT_USER_AGENT: &str = "Googlebot/2.1 (+http://www.google.com/bot.html)";

/// Desktop browser identity used for scraped pages.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// JSON body for POST requests.
    pub body: Option<String>,
    pub timeout: Duration,
    pub follow_redirects: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
            follow_redirects: true,
        }
    }

    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(body.to_string()),
            timeout: DEFAULT_TIMEOUT,
            follow_redirects: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn user_agent(self, agent: &str) -> Self {
        self.header("User-Agent", agent)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Cache key for replaying this request: method, URL and body.
    pub fn cache_key(&self) -> String {
        match (&self.method, &self.body) {
            (Method::Get, _) => format!("GET {}", self.url),
            (Method::Post, Some(body)) => format!("POST {} {}", self.url, body),
            (Method::Post, None) => format!("POST {}", self.url),
        }
    }

    pub fn host(&self) -> String {
        host_of(&self.url).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn new(status: u16, final_url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            content_type: None,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
            || self.body.starts_with(b"%PDF")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("timeout fetching {url}")]
    Timeout { url: String },
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("rate limited (429) by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("blocked by {url}")]
    Blocked { url: String },
    #[error("request to {url} failed: {message}")]
    Other { url: String, message: String },
}

impl HttpError {
    /// Timeouts and connection failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connect { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Timeout { url }
            | Self::Connect { url, .. }
            | Self::Status { url, .. }
            | Self::RateLimited { url, .. }
            | Self::Blocked { url }
            | Self::Other { url, .. } => url,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

/// The network seam. Production uses [`ReqwestTransport`]; tests use
/// [`mock::MockTransport`].
///
/// A transport returns every HTTP status as `Ok`; only failures to get a
/// response at all are `Err`.
pub trait HttpTransport: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
        proxy: &'a ProxyEndpoint,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Lowercased host of `url`, if it parses.
pub fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url.trim())
        .ok()?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_lowercases() {
        assert_eq!(
            host_of("https://WWW.Nature.com/articles/x"),
            Some("www.nature.com".into())
        );
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn cache_key_includes_post_body() {
        let get = HttpRequest::get("https://a.org/x");
        let post = HttpRequest::post_json("https://a.org/x", &serde_json::json!({"url": "u"}));
        assert_eq!(get.cache_key(), "GET https://a.org/x");
        assert_eq!(post.cache_key(), r#"POST https://a.org/x {"url":"u"}"#);
    }

    #[test]
    fn pdf_detection() {
        let by_type = HttpResponse::new(200, "https://a.org/x", "…").with_content_type("application/pdf");
        let by_magic = HttpResponse::new(200, "https://a.org/x", b"%PDF-1.7".to_vec());
        let html = HttpResponse::new(200, "https://a.org/x", "<html>").with_content_type("text/html");
        assert!(by_type.is_pdf());
        assert!(by_magic.is_pdf());
        assert!(!html.is_pdf());
    }

    #[test]
    fn transient_classification() {
        assert!(HttpError::Timeout { url: "u".into() }.is_transient());
        assert!(
            HttpError::Connect {
                url: "u".into(),
                message: "reset".into()
            }
            .is_transient()
        );
        assert!(
            !HttpError::Status {
                url: "u".into(),
                status: 500
            }
            .is_transient()
        );
    }
}

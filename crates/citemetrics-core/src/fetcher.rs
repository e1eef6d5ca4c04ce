//! Page fetching for DOI discovery: a plain HTTP GET first, a
//! browser-rendering backend when that fails, PDF bodies flattened to text.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use lopdf::Document;
use serde_json::json;

use crate::error::CoreError;
use crate::http::{BROWSER_USER_AGENT, HttpRequest, HttpResponse, PoliteClient};
use crate::resilience::BlockDetector;
use crate::resilience::block::{CAPTCHA_WIDGET_MARKERS, CHALLENGE_MARKERS};

/// Hosts known to reject plain HTTP clients.
pub const BROWSER_ONLY_HOSTS: &[&str] = &["www.sciencedirect.com", "journals.biologists.com"];

const RENDER_TIMEOUT: Duration = Duration::from_secs(90);

/// A fetched page, already converted to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub content_type: Option<String>,
    pub body: String,
    pub final_url: String,
}

/// Returns HTML (or PDF text) for a URL.
pub trait ContentFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedContent, CoreError>> + Send + 'a>>;
}

/// Split `#page=N` off a URL.
pub fn split_page_fragment(url: &str) -> (&str, Option<u32>) {
    match url.split_once("#page=") {
        Some((base, page)) => (base, page.trim().parse().ok().filter(|p| *p > 0)),
        None => (url.split('#').next().unwrap_or(url), None),
    }
}

/// Text of a PDF, or of one 1-based page of it when `page` exists.
pub fn pdf_text(bytes: &[u8], page: Option<u32>) -> Result<String, CoreError> {
    let document = Document::load_mem(bytes).map_err(|e| CoreError::Pdf(e.to_string()))?;
    let pages = document.get_pages();
    let selected: Vec<u32> = match page {
        Some(n) if pages.contains_key(&n) => vec![n],
        Some(n) => {
            tracing::warn!(page = n, pages = pages.len(), "PDF page not found, extracting all pages");
            pages.keys().copied().collect()
        }
        None => pages.keys().copied().collect(),
    };
    if selected.is_empty() {
        return Ok(String::new());
    }
    let text = document
        .extract_text(&selected)
        .map_err(|e| CoreError::Pdf(e.to_string()))?;
    Ok(text.trim().to_string())
}

/// [`ContentFetcher`] over the polite client with an optional
/// browser-rendering fallback (`POST <render_url>/scrape {"url": ...}`).
pub struct HttpContentFetcher {
    client: PoliteClient,
    render_url: Option<String>,
    browser_only: Mutex<HashSet<String>>,
    detector: BlockDetector,
}

impl HttpContentFetcher {
    pub fn new(client: PoliteClient, render_url: Option<String>) -> Self {
        Self {
            client,
            render_url: render_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            browser_only: Mutex::new(BROWSER_ONLY_HOSTS.iter().map(|h| h.to_string()).collect()),
            detector: BlockDetector::new(&[CAPTCHA_WIDGET_MARKERS, CHALLENGE_MARKERS].concat()[..]),
        }
    }

    fn is_browser_only(&self, host: &str) -> bool {
        self.browser_only
            .lock()
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false)
    }

    fn mark_browser_only(&self, host: &str) {
        if let Ok(mut hosts) = self.browser_only.lock()
            && hosts.insert(host.to_string())
        {
            tracing::warn!(domain = %host, "host refuses plain HTTP, using browser backend from now on");
        }
    }

    fn convert(&self, resp: &HttpResponse, page: Option<u32>) -> Result<FetchedContent, CoreError> {
        let body = if resp.is_pdf() {
            tracing::debug!(url = %resp.final_url, "extracting text from PDF");
            pdf_text(&resp.body, page)?
        } else {
            resp.text()
        };
        Ok(FetchedContent {
            content_type: resp.content_type.clone(),
            body,
            final_url: resp.final_url.clone(),
        })
    }

    async fn fetch_plain(&self, url: &str, page: Option<u32>) -> Result<FetchedContent, CoreError> {
        let request = HttpRequest::get(url).user_agent(BROWSER_USER_AGENT);
        let resp = self.client.send(&request).await?;
        if resp.status == 403 {
            self.mark_browser_only(&request.host());
        }
        if !resp.is_success() {
            return Err(CoreError::Http {
                url: url.to_string(),
                status: resp.status,
            });
        }
        if !resp.is_pdf() && self.detector.is_blocked(&resp.final_url, &resp.text()) {
            return Err(CoreError::Blocked { url: url.to_string() });
        }
        self.convert(&resp, page)
    }

    async fn fetch_rendered(&self, url: &str, page: Option<u32>) -> Result<FetchedContent, CoreError> {
        let Some(render_url) = &self.render_url else {
            return Err(CoreError::Fetch(format!("no browser backend configured for {url}")));
        };
        let request = HttpRequest::post_json(format!("{render_url}/scrape"), &json!({ "url": url }))
            .timeout(RENDER_TIMEOUT);
        let resp = self.client.send(&request).await?;
        if !resp.is_success() {
            return Err(CoreError::Fetch(format!(
                "browser backend returned HTTP {} for {url}",
                resp.status
            )));
        }
        if resp.is_pdf() {
            return self.convert(&resp, page).map(|c| FetchedContent {
                final_url: url.to_string(),
                ..c
            });
        }

        // The backend answers with raw HTML or with `{"html": ...}`.
        let text = resp.text();
        let html = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("html").and_then(|h| h.as_str()).map(str::to_string))
            .unwrap_or(text);
        Ok(FetchedContent {
            content_type: Some("text/html".into()),
            body: html,
            final_url: url.to_string(),
        })
    }
}

impl ContentFetcher for HttpContentFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedContent, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let (base, page) = split_page_fragment(url);
            let host = crate::http::host_of(base).unwrap_or_default();

            let mut plain_err = None;
            if !self.is_browser_only(&host) {
                match self.fetch_plain(base, page).await {
                    Ok(content) => return Ok(content),
                    Err(e) => {
                        tracing::warn!(url = %base, domain = %host, error = %e, "plain fetch failed");
                        plain_err = Some(e);
                    }
                }
            }
            if self.render_url.is_none()
                && let Some(e) = plain_err
            {
                return Err(e);
            }

            tracing::info!(url = %base, "fetching via browser backend");
            self.fetch_rendered(base, page).await.inspect_err(|e| {
                tracing::warn!(url = %base, error = %e, "failed to fetch content");
            })
        })
    }
}

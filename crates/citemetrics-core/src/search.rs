//! Web search for the title fallback.
//!
//! Queries a self-hosted SearxNG instance with the exact title and returns
//! candidate article URLs in rank order. Aggregator pages (Scholar,
//! ResearchGate, ...) are dropped since they never carry the publisher DOI
//! in a verifiable form.

use std::future::Future;
use std::pin::Pin;

use crate::error::CoreError;
use crate::http::{HttpRequest, PoliteClient};
use crate::matching::normalize_title;

/// Hosts whose result pages are never the article itself.
pub const AGGREGATOR_HOSTS: &[&str] = &[
    "scholar.google.com",
    "www.researchgate.net",
    "www.semanticscholar.org",
    "www.academia.edu",
    "www.google.com",
];

const MAX_RESULTS: usize = 5;

/// Web search returning result URLs, best first.
pub trait WebSearch: Send + Sync {
    fn search<'a>(
        &'a self,
        title: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, CoreError>> + Send + 'a>>;
}

/// Lenient title matching for web search results: result titles often carry
/// a venue suffix (`Title - Journal`).
fn titles_match_lenient(reference_title: &str, search_title: &str) -> bool {
    let norm_ref = normalize_title(reference_title);
    let norm_search = normalize_title(search_title);

    if norm_ref.is_empty() || norm_search.is_empty() {
        return false;
    }
    if norm_ref == norm_search {
        return true;
    }

    let score = rapidfuzz::fuzz::ratio(norm_ref.chars(), norm_search.chars());
    if score >= 0.85 {
        return true;
    }

    (norm_ref.len() >= 15 && norm_search.contains(&norm_ref))
        || (norm_search.len() >= 15 && norm_ref.contains(&norm_search))
}

#[derive(Debug, serde::Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngResult>,
}

#[derive(Debug, serde::Deserialize)]
struct SearxngResult {
    #[serde(default)]
    title: String,
    url: String,
}

/// SearxNG JSON API client.
pub struct SearxngSearch {
    /// Base URL of the SearxNG instance (e.g., "http://localhost:8080")
    base_url: String,
    client: PoliteClient,
}

impl SearxngSearch {
    pub fn new(base_url: &str, client: PoliteClient) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn search_url(&self, title: &str) -> String {
        let query = format!("\"{}\"", title);
        format!(
            "{}/search?q={}&format=json",
            self.base_url,
            urlencoding::encode(&query)
        )
    }
}

fn is_aggregator(url: &str) -> bool {
    crate::http::host_of(url).is_some_and(|host| AGGREGATOR_HOSTS.contains(&host.as_str()))
}

impl WebSearch for SearxngSearch {
    fn search<'a>(
        &'a self,
        title: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.search_url(title);
            let resp = self.client.get_cached(&HttpRequest::get(url.clone())).await?;
            if !resp.is_success() {
                return Err(CoreError::Http {
                    url,
                    status: resp.status,
                });
            }
            let data: SearxngResponse = resp.json()?;

            let urls: Vec<String> = data
                .results
                .into_iter()
                .filter(|r| !is_aggregator(&r.url))
                .filter(|r| r.title.is_empty() || titles_match_lenient(title, &r.title))
                .map(|r| r.url)
                .take(MAX_RESULTS)
                .collect();
            tracing::debug!(title = %title, results = urls.len(), "web search results");
            Ok(urls)
        })
    }
}

//! Authoritative bibliographic metadata from Crossref.
//!
//! Works are cached permanently in the metadata domain keyed by the
//! lowercased DOI. A 404 is never cached.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::authors::surname_matches;
use crate::cache::{CacheDomain, CacheStore};
use crate::http::{HttpRequest, PoliteClient};
use crate::matching::title_similarity;

pub const CROSSREF_API: &str = "https://api.crossref.org";

/// Minimum title similarity for the title-search fallback.
const TITLE_MATCH_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkMetadata {
    pub doi: String,
    pub title: String,
    pub journal: String,
    pub year: Option<i32>,
    /// `"Given Family"` per author.
    pub authors: Vec<String>,
    pub family_names: Vec<String>,
    pub url: String,
    pub citation_count: Option<u64>,
}

impl WorkMetadata {
    pub fn has_family_name(&self, surname: &str) -> bool {
        self.family_names
            .iter()
            .any(|family| surname_matches(family, surname))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    message: T,
}

#[derive(Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<CrossrefWork>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CrossrefWork {
    #[serde(rename = "DOI", default)]
    doi: String,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    container_title: Vec<String>,
    #[serde(default)]
    author: Vec<CrossrefAuthor>,
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(default)]
    is_referenced_by_count: Option<u64>,
    issued: Option<DateParts>,
    published: Option<DateParts>,
    published_print: Option<DateParts>,
    published_online: Option<DateParts>,
}

#[derive(Debug, Default, Deserialize)]
struct CrossrefAuthor {
    given: Option<String>,
    family: Option<String>,
    /// Organisational authors carry only a name.
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DateParts {
    #[serde(default)]
    date_parts: Vec<Vec<Option<i32>>>,
}

impl DateParts {
    fn year(&self) -> Option<i32> {
        self.date_parts.first()?.first().copied().flatten()
    }
}

impl From<CrossrefWork> for WorkMetadata {
    fn from(work: CrossrefWork) -> Self {
        let year = [
            &work.issued,
            &work.published,
            &work.published_print,
            &work.published_online,
        ]
        .into_iter()
        .flatten()
        .find_map(DateParts::year);

        let mut authors = Vec::new();
        let mut family_names = Vec::new();
        for author in &work.author {
            let family = author.family.as_deref().unwrap_or("").trim();
            let given = author.given.as_deref().unwrap_or("").trim();
            if !family.is_empty() {
                family_names.push(family.to_string());
                authors.push(format!("{given} {family}").trim().to_string());
            } else if let Some(name) = author.name.as_deref().filter(|n| !n.trim().is_empty()) {
                authors.push(name.trim().to_string());
            }
        }

        Self {
            doi: work.doi,
            title: work.title.into_iter().next().unwrap_or_default(),
            journal: work.container_title.into_iter().next().unwrap_or_default(),
            year,
            authors,
            family_names,
            url: work.url,
            citation_count: work.is_referenced_by_count,
        }
    }
}

/// Parse a `/works/{doi}` response body.
pub fn parse_work(body: &[u8]) -> Result<WorkMetadata, CoreError> {
    let envelope: Envelope<CrossrefWork> = serde_json::from_slice(body)?;
    Ok(envelope.message.into())
}

/// Parse a `/works?query...` response body.
pub fn parse_work_list(body: &[u8]) -> Result<Vec<WorkMetadata>, CoreError> {
    let envelope: Envelope<ItemList> = serde_json::from_slice(body)?;
    Ok(envelope.message.items.into_iter().map(Into::into).collect())
}

pub struct MetadataSource {
    client: PoliteClient,
    cache: Arc<CacheStore>,
    mailto: Option<String>,
    base_url: String,
}

impl MetadataSource {
    pub fn new(client: PoliteClient, cache: Arc<CacheStore>, mailto: Option<String>) -> Self {
        Self {
            client,
            cache,
            mailto: mailto.filter(|m| !m.trim().is_empty()),
            base_url: CROSSREF_API.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn request(&self, url: String) -> HttpRequest {
        let user_agent = match &self.mailto {
            Some(email) => format!("citemetrics/{} (mailto:{email})", env!("CARGO_PKG_VERSION")),
            None => format!("citemetrics/{}", env!("CARGO_PKG_VERSION")),
        };
        HttpRequest::get(url).user_agent(&user_agent)
    }

    fn with_mailto(&self, mut url: String) -> String {
        if let Some(email) = &self.mailto {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("mailto=");
            url.push_str(&urlencoding::encode(email));
        }
        url
    }

    /// URL of the `/works/{doi}` endpoint.
    pub fn work_url(&self, doi: &str) -> String {
        self.with_mailto(format!("{}/works/{}", self.base_url, doi))
    }

    /// Metadata for `doi`, or `None` if Crossref does not know it.
    pub async fn work(&self, doi: &str, force_refresh: bool) -> Result<Option<WorkMetadata>, CoreError> {
        let key = doi.trim().to_lowercase();
        let url = self.work_url(doi.trim());
        let fetched: Result<serde_json::Value, CoreError> = self
            .cache
            .get_or_fetch(CacheDomain::Metadata, &key, None, force_refresh, || async {
                let resp = self.client.send(&self.request(url.clone())).await?;
                match resp.status {
                    404 => Err(CoreError::NotFound(format!("crossref: {key}"))),
                    s if !(200..300).contains(&s) => Err(CoreError::Http { url: url.clone(), status: s }),
                    _ => {
                        let work = parse_work(&resp.body)?;
                        Ok(serde_json::to_value(work)?)
                    }
                }
            })
            .await;

        match fetched {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(e) if e.is_not_found() => {
                tracing::debug!(doi = %doi, "DOI not registered with Crossref");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Title search, optionally narrowed by author. Up to five candidates.
    pub async fn search_by_title(&self, title: &str, author: Option<&str>) -> Result<Vec<WorkMetadata>, CoreError> {
        let mut url = format!(
            "{}/works?query.title={}",
            self.base_url,
            urlencoding::encode(title)
        );
        if let Some(author) = author.filter(|a| !a.trim().is_empty()) {
            url.push_str("&query.author=");
            url.push_str(&urlencoding::encode(author));
        }
        url.push_str("&rows=5");
        let url = self.with_mailto(url);

        let resp = self.client.get_cached(&self.request(url.clone())).await?;
        if !resp.is_success() {
            return Err(CoreError::Http {
                url,
                status: resp.status,
            });
        }
        parse_work_list(&resp.body)
    }

    /// First title-search hit whose title matches closely and that lists
    /// `surname` among its family names.
    pub async fn find_by_title(&self, title: &str, surname: &str) -> Result<Option<WorkMetadata>, CoreError> {
        let candidates = self.search_by_title(title, Some(surname)).await?;
        Ok(candidates.into_iter().find(|work| {
            !work.doi.is_empty()
                && title_similarity(title, &work.title) >= TITLE_MATCH_THRESHOLD
                && work.has_family_name(surname)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::http::mock::{MockReply, MockTransport};
    use crate::resilience::{RateLimiter, ThrottlePolicy};
    use serde_json::json;

    fn work_json() -> serde_json::Value {
        json!({
            "status": "ok",
            "message": {
                "DOI": "10.1111/gcb.12455",
                "title": ["Life in the fast lane"],
                "container-title": ["Global Change Biology"],
                "author": [
                    {"given": "Jodie L.", "family": "Rummer"},
                    {"given": "Philip L.", "family": "Munday"},
                    {"name": "Coral Consortium"}
                ],
                "URL": "https://doi.org/10.1111/gcb.12455",
                "is-referenced-by-count": 120,
                "issued": {"date-parts": [[null]]},
                "published-print": {"date-parts": [[2014, 4]]}
            }
        })
    }

    fn source(mock: Arc<MockTransport>) -> (MetadataSource, Arc<CacheStore>) {
        let limiter = Arc::new(RateLimiter::new(ThrottlePolicy::default()));
        let cache = Arc::new(CacheStore::in_memory(Arc::new(SystemClock)));
        let client = PoliteClient::new(mock, limiter).with_cache(cache.clone(), std::time::Duration::from_secs(60));
        (MetadataSource::new(client, cache.clone(), None), cache)
    }

    // ── parsing ────────────────────────────────────────────────────────

    #[test]
    fn parses_crossref_work() {
        let work = parse_work(work_json().to_string().as_bytes()).unwrap();
        assert_eq!(work.doi, "10.1111/gcb.12455");
        assert_eq!(work.title, "Life in the fast lane");
        assert_eq!(work.journal, "Global Change Biology");
        assert_eq!(work.year, Some(2014));
        assert_eq!(work.family_names, vec!["Rummer", "Munday"]);
        assert_eq!(work.authors[0], "Jodie L. Rummer");
        assert_eq!(work.authors[2], "Coral Consortium");
        assert_eq!(work.citation_count, Some(120));
        assert!(work.has_family_name("rummer"));
    }

    #[test]
    fn missing_fields_default() {
        let work = parse_work(br#"{"message": {"DOI": "10.1/x"}}"#).unwrap();
        assert_eq!(work.title, "");
        assert_eq!(work.year, None);
        assert!(work.family_names.is_empty());
    }

    // ── MetadataSource ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn work_is_cached_permanently() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://api.crossref.org/works/10.1111/gcb.12455",
            MockReply::json(work_json()),
        );
        let (source, cache) = source(mock.clone());
        let first = source.work("10.1111/gcb.12455", false).await.unwrap().unwrap();
        let second = source.work("10.1111/GCB.12455", false).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.call_count(), 1);
        let entry = cache.get(CacheDomain::Metadata, "10.1111/gcb.12455").unwrap();
        assert_eq!(entry.expires_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_none_and_not_cached() {
        let mock = Arc::new(MockTransport::new());
        let (source, cache) = source(mock.clone());
        assert!(source.work("10.1/missing", false).await.unwrap().is_none());
        assert!(source.work("10.1/missing", false).await.unwrap().is_none());
        assert_eq!(mock.call_count(), 2);
        assert!(cache.get_any(CacheDomain::Metadata, "10.1/missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_propagate() {
        let mock = Arc::new(MockTransport::new());
        mock.on("https://api.crossref.org/works/10.1/x", MockReply::status(503));
        let (source, _) = source(mock);
        let err = source.work("10.1/x", false).await.unwrap_err();
        assert!(matches!(err, CoreError::Http { status: 503, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn find_by_title_requires_title_and_surname() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://api.crossref.org/works?query.title=Life%20in%20the%20fast%20lane&query.author=Rummer&rows=5",
            MockReply::json(json!({
                "message": {"items": [
                    {"DOI": "10.1/other", "title": ["Life in the slow lane of reefs"], "author": [{"family": "Rummer"}]},
                    {"DOI": "10.1/nope", "title": ["Life in the fast lane"], "author": [{"family": "Smith"}]},
                    {"DOI": "10.1111/gcb.12455", "title": ["Life in the Fast Lane."], "author": [{"family": "Rummer"}]}
                ]}
            })),
        );
        let (source, _) = source(mock);
        let work = source
            .find_by_title("Life in the fast lane", "Rummer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(work.doi, "10.1111/gcb.12455");
    }

    #[test]
    fn mailto_is_appended() {
        let mock = Arc::new(MockTransport::new());
        let (source, cache) = source(mock);
        let client = source.client.clone();
        let source = MetadataSource::new(client, cache, Some("me@example.org".into()));
        assert_eq!(
            source.work_url("10.1/x"),
            "https://api.crossref.org/works/10.1/x?mailto=me%40example.org"
        );
    }
}

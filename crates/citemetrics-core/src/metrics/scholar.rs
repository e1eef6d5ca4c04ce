//! Google Scholar citation counts, parsed from the "Cited by N" link of a
//! results page.

use std::future::Future;
use std::pin::Pin;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::{MetricKind, MetricSource, SourceReading};
use crate::error::CoreError;
use crate::http::{BROWSER_USER_AGENT, HttpRequest, PoliteClient};
use crate::metadata::WorkMetadata;
use crate::resilience::BlockDetector;

pub const SCHOLAR_HOST: &str = "scholar.google.com";
pub const SCHOLAR_BASE: &str = "https://scholar.google.com/scholar";

const NO_RESULTS: &str = "did not match any articles";

static LINKS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static CITED_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"Cited by (\d+)").unwrap());

/// One parsed results page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScholarPage {
    pub citations: Option<u64>,
    pub no_results: bool,
}

/// A page listing results without a "Cited by" link counts as 0.
pub fn parse_results(html: &str) -> ScholarPage {
    let document = Html::parse_document(html);
    let citations = document
        .select(&LINKS)
        .map(|a| a.text().collect::<String>())
        .map(|text| text.trim().to_string())
        .filter(|text| text.starts_with("Cited by"))
        .find_map(|text| CITED_BY.captures(&text).and_then(|c| c[1].parse().ok()));
    let no_results = document.root_element().text().collect::<String>().contains(NO_RESULTS);

    ScholarPage {
        citations: citations.or((!no_results).then_some(0)),
        no_results,
    }
}

pub struct ScholarSource {
    client: PoliteClient,
    detector: BlockDetector,
}

impl ScholarSource {
    pub fn new(client: PoliteClient) -> Self {
        Self {
            client,
            detector: BlockDetector::search_engine(SCHOLAR_HOST),
        }
    }

    pub fn search_url(query: &str) -> String {
        format!(
            "{SCHOLAR_BASE}?hl=en&as_sdt=0%2C5&q={}&btnG=",
            urlencoding::encode(query)
        )
    }

    /// Run one search through the proxy chain.
    pub async fn search(&self, query: &str) -> Result<ScholarPage, CoreError> {
        let request = HttpRequest::get(Self::search_url(query))
            .user_agent(BROWSER_USER_AGENT)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Referer", "https://scholar.google.com/");
        let resp = self.client.send_via_proxies(&request, &self.detector).await?;
        if !resp.is_success() {
            return Err(CoreError::Http {
                url: request.url,
                status: resp.status,
            });
        }
        Ok(parse_results(&resp.text()))
    }

    /// Search by DOI, then by the registered title when the DOI finds nothing.
    pub async fn citations(&self, doi: &str, title: &str) -> Result<Option<u64>, CoreError> {
        let page = self.search(doi).await?;
        if page.citations.is_some() || !page.no_results {
            return Ok(page.citations);
        }
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }
        let by_title = self.search(title).await?;
        if by_title.citations.is_some() {
            tracing::info!(doi = %doi, title = %title, "Scholar DOI search empty, counted via title");
        }
        Ok(by_title.citations)
    }
}

impl MetricSource for ScholarSource {
    fn kind(&self) -> MetricKind {
        MetricKind::ScholarCitations
    }

    fn fetch<'a>(
        &'a self,
        doi: &'a str,
        work: &'a WorkMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<SourceReading, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let citations = self.citations(doi, &work.title).await?;
            Ok(SourceReading {
                value: citations.map(|n| n as f64),
                details: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::{MockReply, MockTransport};
    use crate::resilience::{RateLimiter, ThrottlePolicy};
    use std::sync::Arc;

    const DOI: &str = "10.1111/gcb.12455";
    const RESULTS: &str = r#"<div class="gs_r"><h3>Life in the fast lane</h3>
        <a href="/scholar?cites=123">Cited by 87</a> <a href="/scholar?related">Related articles</a></div>"#;
    const EMPTY: &str = "<p>Your search - <b>x</b> - did not match any articles.</p>";

    fn source(mock: Arc<MockTransport>) -> ScholarSource {
        ScholarSource::new(PoliteClient::new(
            mock,
            Arc::new(RateLimiter::new(ThrottlePolicy::default())),
        ))
    }

    // ── parsing ────────────────────────────────────────────────────────

    #[test]
    fn cited_by_count() {
        assert_eq!(
            parse_results(RESULTS),
            ScholarPage {
                citations: Some(87),
                no_results: false
            }
        );
    }

    #[test]
    fn results_without_citations_count_zero() {
        let page = parse_results("<div class=\"gs_r\"><h3>Brand new paper</h3></div>");
        assert_eq!(page.citations, Some(0));
    }

    #[test]
    fn no_results_page() {
        assert_eq!(
            parse_results(EMPTY),
            ScholarPage {
                citations: None,
                no_results: true
            }
        );
    }

    // ── fetching ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn searches_by_doi() {
        let mock = Arc::new(MockTransport::new());
        mock.on(&ScholarSource::search_url(DOI), MockReply::html(RESULTS));
        let s = source(mock.clone());
        assert_eq!(s.citations(DOI, "Life in the fast lane").await.unwrap(), Some(87));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(
            mock.requests()[0].header("accept-language"),
            Some("en-US,en;q=0.9")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_title() {
        let mock = Arc::new(MockTransport::new());
        mock.on(&ScholarSource::search_url(DOI), MockReply::html(EMPTY));
        mock.on(&ScholarSource::search_url("Life in the fast lane"), MockReply::html(RESULTS));
        let s = source(mock.clone());
        let work = WorkMetadata {
            title: "Life in the fast lane".into(),
            ..Default::default()
        };
        let reading = s.fetch(DOI, &work).await.unwrap();
        assert_eq!(reading.value, Some(87.0));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_results_without_title() {
        let mock = Arc::new(MockTransport::new());
        mock.on(&ScholarSource::search_url(DOI), MockReply::html(EMPTY));
        let s = source(mock);
        assert_eq!(s.citations(DOI, "  ").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_and_interstitials_are_blocked() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            &ScholarSource::search_url(DOI),
            MockReply::html("<div id=\"gs_captcha_ccl\">unusual traffic</div>"),
        );
        mock.on(
            &ScholarSource::search_url("10.1000/x"),
            MockReply::html(RESULTS).landed_at("https://www.google.com/sorry/index"),
        );
        let s = source(mock);
        assert!(s.citations(DOI, "").await.unwrap_err().is_blocked());
        assert!(s.citations("10.1000/x", "").await.unwrap_err().is_blocked());
    }
}

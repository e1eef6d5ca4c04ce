//! Altmetric attention score.
//!
//! The public details page carries the bibliography, a score badge, mention
//! counts and Mendeley readers. Its canonical link exposes Altmetric's
//! internal id, which keys a JSONP badge endpoint with the fuller set of
//! `cited_by_*` counts. Badge values win over page values when present.

use std::future::Future;
use std::pin::Pin;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MetricKind, MetricSource, SourceReading};
use crate::error::CoreError;
use crate::http::{BROWSER_USER_AGENT, HttpRequest, PoliteClient};
use crate::metadata::WorkMetadata;
use crate::resilience::BlockDetector;

pub const DETAILS_BASE: &str = "https://www.altmetric.com/details/doi";
pub const EMBED_BASE: &str = "https://api.altmetric.com/v1/internal-556fdf0f/id";
const EMBED_CALLBACK: &str = "_altmetric.embed_callback";

static HEADER_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse(".document-header h1").unwrap());
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static DETAIL_ROWS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".document-details-table tr").unwrap());
static TH: Lazy<Selector> = Lazy::new(|| Selector::parse("th").unwrap());
static TD: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());
static CONTENT_WRAPPER: Lazy<Selector> = Lazy::new(|| Selector::parse(".content-wrapper").unwrap());
static TAGLINE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".document-header .tagline").unwrap());
static SCORE_PANEL: Lazy<Selector> = Lazy::new(|| Selector::parse(".score-panel").unwrap());
static MENTION_COUNTS: Lazy<Selector> = Lazy::new(|| Selector::parse("dl.mention-counts").unwrap());
static READER_COUNTS: Lazy<Selector> = Lazy::new(|| Selector::parse("dl.reader-counts").unwrap());
static DT: Lazy<Selector> = Lazy::new(|| Selector::parse("dt").unwrap());
static DD: Lazy<Selector> = Lazy::new(|| Selector::parse("dd").unwrap());
static STRONG: Lazy<Selector> = Lazy::new(|| Selector::parse("strong").unwrap());
static CANONICAL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"link[rel="canonical"][href]"#).unwrap());

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})").unwrap());
static BADGE_SCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"score=(\d+)").unwrap());
static CANONICAL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"details/(\d+)").unwrap());
static FINAL_URL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"details/(\d+)(?:\?|$)").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Everything scraped for one DOI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AltmetricDetails {
    pub doi: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub journal: Option<String>,
    pub published_text: Option<String>,
    pub year: Option<i32>,
    pub authors: Vec<String>,
    pub score: Option<f64>,
    pub cited_by_posts_count: Option<u64>,
    pub cited_by_accounts_count: Option<u64>,
    pub cited_by_msm_count: Option<u64>,
    pub cited_by_bluesky_count: Option<u64>,
    pub cited_by_tweeters_count: Option<u64>,
    pub cited_by_peer_review_sites_count: Option<u64>,
    pub mendeley_readers: Option<u64>,
    pub altmetric_id: Option<String>,
}

impl AltmetricDetails {
    /// Whether the page told us anything about the work itself.
    pub fn has_bibliography(&self) -> bool {
        self.title.is_some() || self.journal.is_some() || !self.authors.is_empty() || self.year.is_some()
    }

    /// Overlay the badge endpoint's counts.
    pub fn merge_embed(&mut self, embed: &Value) {
        if let Some(score) = embed.get("score").and_then(as_score) {
            self.score = Some(score);
        }
        let count = |field: &str| embed.get(field).and_then(as_count);
        self.cited_by_posts_count = count("cited_by_posts_count");
        self.cited_by_accounts_count = count("cited_by_accounts_count");
        self.cited_by_msm_count = count("cited_by_msm_count");
        self.cited_by_peer_review_sites_count = count("cited_by_peer_review_sites_count");
        if let Some(n) = count("cited_by_bluesky_count") {
            self.cited_by_bluesky_count = Some(n);
        }
        if let Some(n) = count("cited_by_tweeters_count") {
            self.cited_by_tweeters_count = Some(n);
        }
        if let Some(n) = embed
            .get("readers")
            .and_then(|r| r.get("mendeley"))
            .and_then(as_count)
        {
            self.mendeley_readers = Some(n);
        }
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Text of an element with each text node trimmed, joined without spaces.
fn stripped_text(el: ElementRef<'_>) -> String {
    el.text().map(str::trim).collect::<String>()
}

fn first_year(text: &str) -> Option<i32> {
    YEAR.captures(text).and_then(|c| c[1].parse().ok())
}

fn parse_count(text: &str) -> Option<u64> {
    text.trim().replace(',', "").parse().ok()
}

/// `(label, strong value)` for every `dt`/`dd` pair of the matched lists.
fn definition_counts(panel: ElementRef<'_>, lists: &Selector) -> Vec<(String, Option<u64>)> {
    let mut out = Vec::new();
    for dl in panel.select(lists) {
        for (dt, dd) in dl.select(&DT).zip(dl.select(&DD)) {
            let label = stripped_text(dt).to_lowercase();
            let value = dd.select(&STRONG).next().and_then(|s| parse_count(&stripped_text(s)));
            out.push((label, value));
        }
    }
    out
}

fn parse_score_panel(document: &Html, details: &mut AltmetricDetails) {
    let Some(panel) = document.select(&SCORE_PANEL).next() else {
        return;
    };
    if let Some(caps) = BADGE_SCORE.captures(&panel.html()) {
        details.score = caps[1].parse().ok();
    }
    for (source, count) in definition_counts(panel, &MENTION_COUNTS) {
        let Some(n) = count.filter(|n| *n > 0) else {
            continue;
        };
        match source.as_str() {
            "twitter" => details.cited_by_tweeters_count = Some(n),
            "bluesky" => details.cited_by_bluesky_count = Some(n),
            _ => {}
        }
    }
    if let Some((_, readers)) = definition_counts(panel, &READER_COUNTS)
        .into_iter()
        .find(|(source, _)| source == "mendeley")
    {
        details.mendeley_readers = readers;
    }
}

/// Parse a details page. `final_url` is where the request landed, which
/// carries the internal id when the page has no canonical link.
pub fn parse_details_page(doi: &str, html: &str, final_url: &str) -> AltmetricDetails {
    let document = Html::parse_document(html);
    let mut details = AltmetricDetails {
        doi: doi.to_string(),
        ..Default::default()
    };

    if let Some(header) = document.select(&HEADER_TITLE).next() {
        details.title = Some(stripped_text(header)).filter(|t| !t.is_empty());
        details.url = header
            .select(&ANCHOR)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);
    }

    for row in document.select(&DETAIL_ROWS) {
        let (Some(th), Some(td)) = (row.select(&TH).next(), row.select(&TD).next()) else {
            continue;
        };
        let heading = stripped_text(th);
        let content = td
            .select(&CONTENT_WRAPPER)
            .next()
            .map(stripped_text)
            .unwrap_or_else(|| stripped_text(td));

        match heading.as_str() {
            "Published in" if !content.is_empty() => {
                details.journal = content.split(',').next().map(|j| j.trim().to_string());
                details.year = first_year(&content);
                details.published_text = Some(content);
            }
            "Authors" => {
                details.authors = WHITESPACE
                    .replace_all(&content, " ")
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {}
        }
    }

    if details.year.is_none()
        && let Some(tagline) = document.select(&TAGLINE).next()
    {
        details.year = first_year(&tagline.text().collect::<String>());
    }

    details.altmetric_id = document
        .select(&CANONICAL)
        .next()
        .and_then(|link| link.value().attr("href"))
        .and_then(|href| CANONICAL_ID.captures(href).map(|caps| caps[1].to_string()))
        .or_else(|| FINAL_URL_ID.captures(final_url).map(|caps| caps[1].to_string()));

    parse_score_panel(&document, &mut details);
    details
}

/// Unwrap `_altmetric.embed_callback({...});` into its JSON object.
pub fn parse_embed(body: &str) -> Result<Value, CoreError> {
    let body = body.trim();
    let json = body
        .strip_prefix(EMBED_CALLBACK)
        .map(|rest| rest.trim_start().trim_start_matches('('))
        .unwrap_or(body)
        .trim_end_matches(';')
        .trim_end();
    let json = json.strip_suffix(')').unwrap_or(json);
    Ok(serde_json::from_str(json)?)
}

pub struct AltmetricSource {
    client: PoliteClient,
    detector: BlockDetector,
}

impl AltmetricSource {
    pub fn new(client: PoliteClient) -> Self {
        Self {
            client,
            detector: BlockDetector::challenge_pages(),
        }
    }

    /// The DOI's slash must stay literal.
    pub fn details_url(doi: &str) -> String {
        format!("{DETAILS_BASE}/{}", urlencoding::encode(doi).replace("%2F", "/"))
    }

    pub fn embed_url(altmetric_id: &str) -> String {
        format!("{EMBED_BASE}/{altmetric_id}?callback={EMBED_CALLBACK}")
    }

    /// Scrape the details page and merge in the badge counts.
    ///
    /// `Ok(None)` when Altmetric has no record of the DOI. Blocked or
    /// failed pages are errors; a failed badge fetch only loses the
    /// badge-only counts.
    pub async fn details(&self, doi: &str) -> Result<Option<AltmetricDetails>, CoreError> {
        let request = HttpRequest::get(Self::details_url(doi))
            .user_agent(BROWSER_USER_AGENT)
            .header("Accept", "text/html");
        let resp = self.client.send_via_proxies(&request, &self.detector).await?;
        if !resp.is_success() {
            tracing::debug!(doi = %doi, status = resp.status, "no Altmetric record");
            return Ok(None);
        }

        let mut details = parse_details_page(doi, &resp.text(), &resp.final_url);
        if let Some(id) = details.altmetric_id.clone() {
            match self.embed(&id).await {
                Ok(embed) => details.merge_embed(&embed),
                Err(e) => {
                    tracing::warn!(doi = %doi, altmetric_id = %id, error = %e, "Altmetric badge fetch failed");
                }
            }
        }
        Ok(details.has_bibliography().then_some(details))
    }

    async fn embed(&self, altmetric_id: &str) -> Result<Value, CoreError> {
        let request = HttpRequest::get(Self::embed_url(altmetric_id))
            .user_agent(BROWSER_USER_AGENT)
            .header("Accept", "*/*")
            .header("Referer", "https://www.altmetric.com/")
            .no_redirects();
        let resp = self.client.send_via_proxies(&request, &self.detector).await?;
        if !resp.is_success() {
            return Err(CoreError::Http {
                url: request.url,
                status: resp.status,
            });
        }
        parse_embed(&resp.text())
    }
}

impl MetricSource for AltmetricSource {
    fn kind(&self) -> MetricKind {
        MetricKind::Altmetric
    }

    fn fetch<'a>(
        &'a self,
        doi: &'a str,
        _work: &'a WorkMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<SourceReading, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let details = self.details(doi).await?;
            Ok(SourceReading {
                value: details.as_ref().and_then(|d| d.score),
                details: details.map(serde_json::to_value).transpose()?,
            })
        })
    }
}

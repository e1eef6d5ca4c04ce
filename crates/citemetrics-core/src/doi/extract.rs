//! Pull DOI candidates out of URLs and HTML.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::{is_valid_doi, normalize_doi, strip_artifacts};

/// DOI token ending at a path boundary:
/// `.../doi/10.1242/jeb.243973/2170187/jeb243973.pdf` → `10.1242/jeb.243973`.
static URL_BASIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(10\.\d{4,9}/[-._;():a-z0-9]+?)(?:/|\.pdf|$)").unwrap());

/// Two-segment suffix: `.../doi/10.1093/conphys/cox003/17644168/cox003.pdf`
/// → `10.1093/conphys/cox003`.
static URL_EXTENDED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)10\.\d{4,9}/[-._;():a-z0-9]+/[-._;():a-z0-9]+").unwrap());

/// Everything DOI-shaped to the end of the path.
static URL_FULL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)10\.\d{4,9}/[-._;()/:a-z0-9]+").unwrap());

static TEXT_DOI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)10\.\d{4,9}/[-._()/:a-z0-9]+").unwrap());

static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[content]").unwrap());
static DOI_ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[class][href]").unwrap());

const RESOLVER_HOSTS: &[&str] = &["doi.org", "dx.doi.org"];

fn push_unique(out: &mut Vec<String>, doi: String) {
    if is_valid_doi(&doi) && !out.iter().any(|d| d.eq_ignore_ascii_case(&doi)) {
        out.push(doi);
    }
}

fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// A DOI written as a resolver link (`https://doi.org/10.1038/nclimate2195`)
/// needs no verification: the URL *is* the DOI.
pub fn doi_from_resolver_url(url: &str) -> Option<String> {
    let host = crate::http::host_of(url)?;
    if !RESOLVER_HOSTS.contains(&host.as_str()) {
        return None;
    }
    let doi = strip_artifacts(&normalize_doi(strip_query(url)));
    is_valid_doi(&doi).then_some(doi)
}

/// Candidates from the three URL shapes, most specific first. Every
/// candidate still needs registry verification.
pub fn dois_from_url(url: &str) -> Vec<String> {
    let decoded = normalize_doi(strip_query(url));
    let mut out = Vec::new();
    if let Some(caps) = URL_BASIC.captures(&decoded) {
        push_unique(&mut out, strip_artifacts(&caps[1]));
    }
    if let Some(m) = URL_EXTENDED.find(&decoded) {
        push_unique(&mut out, strip_artifacts(m.as_str()));
    }
    if let Some(m) = URL_FULL.find(&decoded) {
        push_unique(&mut out, strip_artifacts(m.as_str()));
    }
    out
}

/// DOIs declared by the page itself.
///
/// `<meta>` tags whose name mentions "doi" (or whose content is written
/// `doi:...`) win; anchors with a `doi` class linking to a resolver are
/// only consulted when there are none.
pub fn dois_from_metadata(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);

    let mut out = Vec::new();
    for meta in document.select(&META) {
        let name = meta
            .value()
            .attr("name")
            .or_else(|| meta.value().attr("property"))
            .unwrap_or_default()
            .to_lowercase();
        let content = meta.value().attr("content").unwrap_or_default().trim();
        let prefixed = content.to_ascii_lowercase().starts_with("doi:");
        if name.contains("doi") || (name.contains("identifier") && prefixed) {
            push_unique(&mut out, normalize_doi(content));
        }
    }
    if !out.is_empty() {
        return out;
    }

    for anchor in document.select(&DOI_ANCHOR) {
        let class = anchor.value().attr("class").unwrap_or_default().to_lowercase();
        let href = anchor.value().attr("href").unwrap_or_default();
        if class.contains("doi")
            && let Some(doi) = doi_from_resolver_url(href)
        {
            push_unique(&mut out, doi);
        }
    }
    out
}

/// Every DOI-shaped token in `body`, in order of first appearance.
pub fn dois_from_text(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in TEXT_DOI.find_iter(body) {
        push_unique(&mut out, strip_artifacts(m.as_str()));
    }
    out
}

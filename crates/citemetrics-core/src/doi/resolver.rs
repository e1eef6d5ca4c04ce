//! The DOI resolution pipeline.
//!
//! Strategies run in order and short-circuit on the first verified DOI:
//!
//! 1. a resolver link (`doi.org/...`) is taken as-is;
//! 2. DOI shapes embedded in the source URL, confirmed by the handle registry;
//! 3. `<meta>`/anchor DOIs on the fetched page (a single one is trusted);
//! 4. a full-text scan of the page, where every candidate must prove itself;
//! 5. for search-aggregator links only, the title fallback: web search
//!    results, then a Crossref title search.
//!
//! Nothing unverified is ever returned.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CoreError;
use crate::fetcher::ContentFetcher;
use crate::metadata::MetadataSource;
use crate::model::PublicationRecord;
use crate::search::WebSearch;

use super::extract::{doi_from_resolver_url, dois_from_metadata, dois_from_text, dois_from_url};
use super::urls::{last_path_segment, urls_equal};
use super::verify::{DoiVerifier, author_on_landing_page};
use super::{doi_link, normalize_doi};

/// Candidates longer than this are scraping artifacts, not DOIs.
pub const MAX_DOI_LEN: usize = 60;

/// Slugs shorter than this match too many DOIs to mean anything.
const MIN_SLUG_LEN: usize = 3;

/// Hosts whose result links never lead to the publisher page.
pub const SEARCH_AGGREGATOR_HOSTS: &[&str] = &["scholar.google.com"];

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    UrlPattern,
    HtmlMetadata,
    FullTextScan,
    CrossrefTitle,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provenance::UrlPattern => "url-pattern",
            Provenance::HtmlMetadata => "html-metadata",
            Provenance::FullTextScan => "full-text-scan",
            Provenance::CrossrefTitle => "crossref-title",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateState {
    Pending,
    Verified,
    Rejected(&'static str),
}

/// A DOI-shaped string under consideration for one publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoiCandidate {
    pub doi: String,
    pub provenance: Provenance,
    pub state: CandidateState,
}

impl DoiCandidate {
    fn new(doi: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            doi: doi.into(),
            provenance,
            state: CandidateState::Pending,
        }
    }

    fn verify(mut self) -> VerifiedDoi {
        self.state = CandidateState::Verified;
        tracing::info!(doi = %self.doi, provenance = %self.provenance, "DOI verified");
        VerifiedDoi {
            doi: self.doi,
            provenance: self.provenance,
        }
    }

    fn reject(&mut self, reason: &'static str) {
        tracing::debug!(doi = %self.doi, provenance = %self.provenance, reason, "DOI candidate rejected");
        self.state = CandidateState::Rejected(reason);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDoi {
    pub doi: String,
    pub provenance: Provenance,
}

/// Result of resolving one publication. "No DOI" and "could not ask" are
/// kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoiOutcome {
    Verified(VerifiedDoi),
    NotFound,
    TransportError(String),
}

impl DoiOutcome {
    pub fn doi(&self) -> Option<&str> {
        match self {
            DoiOutcome::Verified(v) => Some(&v.doi),
            _ => None,
        }
    }
}

/// The DOI-derived fields of a publication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoiFields {
    pub doi: String,
    pub doi_link: String,
    pub doi_short: String,
    pub doi_short_link: String,
    pub doi_resolved_link: String,
}

impl DoiFields {
    pub fn apply_to(self, publication: &mut PublicationRecord) {
        publication.doi = self.doi;
        publication.doi_link = self.doi_link;
        publication.doi_short = self.doi_short;
        publication.doi_short_link = self.doi_short_link;
        publication.doi_resolved_link = self.doi_resolved_link;
    }
}

/// Running state of one resolution: remembers the first transport failure
/// so that "nothing verified" can be reported honestly.
#[derive(Default)]
struct Attempt {
    transport_error: Option<String>,
}

impl Attempt {
    /// Fold a check result into a yes/no, remembering transport failures.
    fn check(&mut self, doi: &str, step: &str, result: Result<bool, CoreError>) -> bool {
        match result {
            Ok(passed) => passed,
            Err(e) => {
                tracing::warn!(doi = %doi, step, error = %e, "DOI check failed");
                if matches!(e, CoreError::Transport { .. }) && self.transport_error.is_none() {
                    self.transport_error = Some(e.to_string());
                }
                false
            }
        }
    }

    fn finish(self) -> DoiOutcome {
        match self.transport_error {
            Some(message) => DoiOutcome::TransportError(message),
            None => DoiOutcome::NotFound,
        }
    }
}

pub struct DoiResolver {
    fetcher: Arc<dyn ContentFetcher>,
    verifier: DoiVerifier,
    search: Option<Arc<dyn WebSearch>>,
    metadata: Option<Arc<MetadataSource>>,
    invocations: AtomicU64,
}

impl DoiResolver {
    pub fn new(fetcher: Arc<dyn ContentFetcher>, verifier: DoiVerifier) -> Self {
        Self {
            fetcher,
            verifier,
            search: None,
            metadata: None,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<MetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Number of [`resolve`](Self::resolve) calls so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Find the verified DOI of the publication at `url`.
    ///
    /// `surname` is the disambiguating author's surname, looked for on
    /// landing pages when weaker evidence needs backing up.
    pub async fn resolve(&self, url: &str, title: &str, surname: &str) -> DoiOutcome {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let on_aggregator = crate::http::host_of(url)
            .is_some_and(|host| SEARCH_AGGREGATOR_HOSTS.contains(&host.as_str()));
        let title = title.trim();

        if !on_aggregator || title.is_empty() {
            return self.resolve_url(url, surname).await;
        }
        tracing::debug!(url = %url, "source URL is a search aggregator, resolving by title");
        self.resolve_title(title, surname).await
    }

    /// The URL-based strategies only.
    pub async fn resolve_url(&self, url: &str, surname: &str) -> DoiOutcome {
        let url = url.trim();
        if url.is_empty() {
            return DoiOutcome::NotFound;
        }
        let mut attempt = Attempt::default();

        if let Some(doi) = doi_from_resolver_url(url) {
            return DoiOutcome::Verified(DoiCandidate::new(doi, Provenance::UrlPattern).verify());
        }

        for doi in dois_from_url(url) {
            let mut candidate = DoiCandidate::new(doi, Provenance::UrlPattern);
            let passed = self.verifier.via_api(&candidate.doi, url).await;
            if attempt.check(&candidate.doi, "api", passed) {
                return DoiOutcome::Verified(candidate.verify());
            }
            candidate.reject("registry does not point at the source URL");
        }

        let page = match self.fetcher.fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "could not fetch publication page");
                if matches!(e, CoreError::Transport { .. }) {
                    attempt.transport_error.get_or_insert(e.to_string());
                }
                return attempt.finish();
            }
        };

        let declared = dois_from_metadata(&page.body);
        if let [only] = declared.as_slice() {
            return DoiOutcome::Verified(DoiCandidate::new(only.clone(), Provenance::HtmlMetadata).verify());
        }
        for doi in declared {
            let mut candidate = DoiCandidate::new(doi, Provenance::HtmlMetadata);
            let passed = self.verifier.via_api(&candidate.doi, url).await;
            if attempt.check(&candidate.doi, "api", passed) {
                return DoiOutcome::Verified(candidate.verify());
            }
            candidate.reject("one of several page DOIs, not confirmed by the registry");
        }

        if let Some(verified) = self.scan_text(url, &page.body, surname, &mut attempt).await {
            return DoiOutcome::Verified(verified);
        }

        tracing::warn!(url = %url, "no verified DOI found");
        attempt.finish()
    }

    async fn scan_text(
        &self,
        url: &str,
        body: &str,
        surname: &str,
        attempt: &mut Attempt,
    ) -> Option<VerifiedDoi> {
        let slug = last_path_segment(url).to_lowercase();
        for doi in dois_from_text(body) {
            let mut candidate = DoiCandidate::new(doi, Provenance::FullTextScan);
            if candidate.doi.len() > MAX_DOI_LEN {
                candidate.reject("too long");
                continue;
            }
            if slug.len() >= MIN_SLUG_LEN && candidate.doi.to_lowercase().contains(&slug) {
                return Some(candidate.verify());
            }

            let api = self.verifier.via_api(&candidate.doi, url).await;
            if !attempt.check(&candidate.doi, "api", api) {
                candidate.reject("registry does not point at the source URL");
                continue;
            }
            let redirect = self.verifier.via_redirect(&candidate.doi, url, surname).await;
            if !attempt.check(&candidate.doi, "redirect", redirect) {
                candidate.reject("doi.org redirect does not confirm");
                continue;
            }
            let author = author_on_landing_page(
                self.verifier.registry(),
                self.fetcher.as_ref(),
                &candidate.doi,
                surname,
            )
            .await;
            if !attempt.check(&candidate.doi, "author", author) {
                candidate.reject("author not on landing page");
                continue;
            }
            return Some(candidate.verify());
        }
        None
    }

    /// Title fallback: web search results through the URL strategies, then
    /// Crossref's title search.
    pub async fn resolve_title(&self, title: &str, surname: &str) -> DoiOutcome {
        let mut attempt = Attempt::default();

        if let Some(search) = &self.search {
            match search.search(title).await {
                Ok(urls) => {
                    for result in urls {
                        tracing::debug!(title = %title, url = %result, "trying search result");
                        match self.resolve_url(&result, surname).await {
                            DoiOutcome::Verified(v) => return DoiOutcome::Verified(v),
                            DoiOutcome::TransportError(e) => {
                                attempt.transport_error.get_or_insert(e);
                            }
                            DoiOutcome::NotFound => {}
                        }
                    }
                }
                Err(e) => tracing::warn!(title = %title, error = %e, "web search failed"),
            }
        }

        if let Some(metadata) = &self.metadata
            && !surname.is_empty()
        {
            match metadata.find_by_title(title, surname).await {
                Ok(Some(work)) => {
                    let doi = normalize_doi(&work.doi);
                    return DoiOutcome::Verified(DoiCandidate::new(doi, Provenance::CrossrefTitle).verify());
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(title = %title, error = %e, "Crossref title search failed");
                    if matches!(e, CoreError::Transport { .. }) {
                        attempt.transport_error.get_or_insert(e.to_string());
                    }
                }
            }
        }

        attempt.finish()
    }

    /// Registry-derived fields for a verified DOI. Lookups that fail leave
    /// their field empty.
    pub async fn derive_fields(&self, doi: &str, source_url: &str) -> DoiFields {
        let registry = self.verifier.registry();
        let mut fields = DoiFields {
            doi: doi.to_string(),
            ..DoiFields::default()
        };

        match registry.resolved_link(doi).await {
            Ok(Some(resolved)) => {
                if !source_url.is_empty() && !urls_equal(source_url, &resolved) {
                    tracing::warn!(doi = %doi, url = %source_url, resolved = %resolved, "resolved DOI link does not match publication URL");
                }
                fields.doi_link = doi_link(doi);
                fields.doi_resolved_link = resolved;
            }
            Ok(None) => tracing::warn!(doi = %doi, "DOI not registered in handle system"),
            Err(e) => tracing::warn!(doi = %doi, error = %e, "handle lookup failed"),
        }

        match registry.short_doi(doi).await {
            Ok(Some(short)) => {
                fields.doi_short_link = doi_link(&short);
                fields.doi_short = short;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(doi = %doi, error = %e, "shortDOI lookup failed"),
        }
        fields
    }
}

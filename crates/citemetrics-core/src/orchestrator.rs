//! End-to-end enrichment of one author's coauthors and publications.
//!
//! Items are processed one at a time, in provider order. After every item
//! the resume marker advances and the whole author record is written, so an
//! interrupted run loses at most the item in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::ProgressEvent;
use crate::authors;
use crate::doi::{DoiOutcome, DoiResolver};
use crate::error::CoreError;
use crate::matching::normalize_title;
use crate::metrics::{MetricOutcome, MetricResult, MetricsService};
use crate::model::{AuthorRecord, Coauthor, PublicationRecord, ResumeMarker};
use crate::profile::{AuthorProfile, ProfileProvider};
use crate::store::{AuthorStore, check_author_id};

/// Journal-name fragments that mark a conference contribution.
pub const CONFERENCE_MARKERS: &[&str] = &["symposium", "conference", "workshop", "annual meeting"];

pub fn is_conference(journal: &str) -> bool {
    let journal = journal.to_lowercase();
    CONFERENCE_MARKERS.iter().any(|m| journal.contains(m))
}

/// Where a publication is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    FetchingMetadata,
    ResolvingDoi,
    ResolvingMetrics,
    Saved,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// A complete record younger than this is left alone.
    pub fresh_data: Duration,
    pub coauthor_delay: Duration,
    pub publication_delay: Duration,
    /// Ignore the freshness check.
    pub force: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            fresh_data: Duration::from_secs(7 * 24 * 60 * 60),
            coauthor_delay: Duration::from_secs(2),
            publication_delay: Duration::from_secs(1),
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub coauthors: usize,
    pub publications: usize,
    /// Items kept from an interrupted run without reprocessing.
    pub resumed: usize,
    pub dois_resolved: usize,
    pub dois_reused: usize,
    pub dois_missing: usize,
    pub conference_skipped: usize,
    pub metrics_found: usize,
    pub save_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The stored record was fresh and complete; nothing was fetched.
    AlreadyFresh,
    Completed(RunSummary),
}

pub struct Orchestrator {
    profiles: Arc<dyn ProfileProvider>,
    resolver: Arc<DoiResolver>,
    metrics: Arc<MetricsService>,
    store: AuthorStore,
    settings: RunSettings,
}

/// What a previous run left behind, and what of it may be reused.
struct Previous {
    /// Honored only when the previous run was interrupted.
    resume: ResumeMarker,
    coauthors: Vec<Coauthor>,
    publications: Vec<PublicationRecord>,
    by_title: HashMap<String, PublicationRecord>,
}

impl Previous {
    fn from_record(record: Option<AuthorRecord>) -> Self {
        let Some(record) = record else {
            return Self {
                resume: ResumeMarker::default(),
                coauthors: Vec::new(),
                publications: Vec::new(),
                by_title: HashMap::new(),
            };
        };
        let resume = if record.is_complete() {
            ResumeMarker::default()
        } else {
            record.resume
        };
        let by_title = record
            .publications
            .iter()
            .filter(|p| !p.title.trim().is_empty())
            .map(|p| (normalize_title(&p.title), p.clone()))
            .collect();
        Self {
            resume,
            coauthors: record.coauthors,
            publications: record.publications,
            by_title,
        }
    }

    fn resumed_coauthor(&self, index: usize) -> Option<&Coauthor> {
        if !self.resume.covers_coauthor(index) {
            return None;
        }
        self.coauthors.get(index)
    }

    fn resumed_publication(&self, index: usize) -> Option<&PublicationRecord> {
        if !self.resume.covers_publication(index) {
            return None;
        }
        self.publications.get(index)
    }

    fn matching(&self, title: &str) -> Option<&PublicationRecord> {
        self.by_title.get(&normalize_title(title))
    }
}

impl Orchestrator {
    pub fn new(
        profiles: Arc<dyn ProfileProvider>,
        resolver: Arc<DoiResolver>,
        metrics: Arc<MetricsService>,
        store: AuthorStore,
        settings: RunSettings,
    ) -> Self {
        Self {
            profiles,
            resolver,
            metrics,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &AuthorStore {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<DoiResolver> {
        &self.resolver
    }

    /// Enrich and persist `author_id`.
    ///
    /// Only a failed profile fetch is an error; per-item failures are logged
    /// and leave that item's enrichment fields empty.
    pub async fn run(
        &self,
        author_id: &str,
        progress: impl Fn(ProgressEvent) + Send + Sync,
    ) -> Result<RunOutcome, CoreError> {
        check_author_id(author_id)?;
        let stored = self.store.load(author_id);
        if let Some(record) = &stored
            && !self.settings.force
            && record.is_complete()
            && self.store.is_fresh(record, self.settings.fresh_data)
        {
            tracing::info!(author_id = %author_id, "author data already fresh, nothing to do");
            progress(ProgressEvent::AlreadyFresh {
                author_id: author_id.to_string(),
            });
            return Ok(RunOutcome::AlreadyFresh);
        }

        let profile = self.profiles.fetch_author(author_id).await?;
        progress(ProgressEvent::ProfileLoaded {
            name: profile.name.clone(),
            coauthors: profile.coauthors.len(),
            publications: profile.publications.len(),
        });

        let previous = Previous::from_record(stored);
        if previous.resume != ResumeMarker::default() {
            tracing::info!(
                author_id = %author_id,
                coauthor = previous.resume.last_successful_coauthor_index,
                publication = previous.resume.last_successful_publication_index,
                "resuming interrupted run"
            );
        }

        let mut record = start_record(author_id, &profile, &previous);
        let mut summary = RunSummary {
            coauthors: profile.coauthors.len(),
            publications: profile.publications.len(),
            ..RunSummary::default()
        };

        self.process_coauthors(&mut record, &profile, &previous, &mut summary, &progress)
            .await;
        self.process_publications(&mut record, &profile, &previous, &mut summary, &progress)
            .await;

        if record.coauthors.is_empty() && record.publications.is_empty() {
            self.persist(&mut record, &mut summary);
        }

        tracing::info!(
            author_id = %author_id,
            publications = summary.publications,
            resumed = summary.resumed,
            resolved = summary.dois_resolved,
            reused = summary.dois_reused,
            missing = summary.dois_missing,
            "author run complete"
        );
        Ok(RunOutcome::Completed(summary))
    }

    async fn process_coauthors(
        &self,
        record: &mut AuthorRecord,
        profile: &AuthorProfile,
        previous: &Previous,
        summary: &mut RunSummary,
        progress: &(impl Fn(ProgressEvent) + Send + Sync),
    ) {
        let total = profile.coauthors.len();
        for (index, stub) in profile.coauthors.iter().enumerate() {
            if let Some(done) = previous.resumed_coauthor(index) {
                record.coauthors[index] = done.clone();
                summary.resumed += 1;
                continue;
            }
            progress(ProgressEvent::Coauthor {
                index,
                total,
                name: stub.name.clone(),
            });

            let coauthor = match self.profiles.fill_coauthor(stub).await {
                Ok(filled) => filled,
                Err(e) => {
                    tracing::warn!(coauthor = %stub.name, id = %stub.id, error = %e, "coauthor fill failed, keeping stub");
                    stub.clone()
                }
            };
            record.coauthors[index] = coauthor;
            record.resume.advance_coauthor(index);
            self.persist(record, summary);
            pause(self.settings.coauthor_delay).await;
        }
    }

    async fn process_publications(
        &self,
        record: &mut AuthorRecord,
        profile: &AuthorProfile,
        previous: &Previous,
        summary: &mut RunSummary,
        progress: &(impl Fn(ProgressEvent) + Send + Sync),
    ) {
        let surname = authors::surname(&profile.name);
        let total = profile.publications.len();

        for (index, stub) in profile.publications.iter().enumerate() {
            if let Some(done) = previous.resumed_publication(index) {
                record.publications[index] = done.clone();
                summary.resumed += 1;
                continue;
            }
            let step = |state| {
                progress(ProgressEvent::Publication {
                    index,
                    total,
                    title: stub.title.clone(),
                    state,
                })
            };
            step(ItemState::Pending);

            step(ItemState::FetchingMetadata);
            let mut publication = match self.profiles.fill_publication(stub).await {
                Ok(filled) => filled,
                Err(e) => {
                    tracing::warn!(index, title = %stub.title, error = %e, "publication fill failed, keeping stub");
                    stub.clone()
                }
            };
            publication.index = index;
            publication.authors_standardised = authors::standardise_authors(&publication.authors);

            if is_conference(&publication.journal) {
                tracing::info!(index, journal = %publication.journal, "conference contribution, skipping DOI and metrics");
                publication.clear_doi_fields();
                publication.citation_count = None;
                publication.impact_metric_score = None;
                summary.conference_skipped += 1;
            } else {
                step(ItemState::ResolvingDoi);
                let earlier = previous.matching(&publication.title);
                self.resolve_doi(&mut publication, earlier, &surname, summary)
                    .await;

                if publication.has_doi() {
                    step(ItemState::ResolvingMetrics);
                    self.attach_metrics(&mut publication, earlier, summary).await;
                }
            }

            record.publications[index] = publication;
            record.resume.advance_publication(index);
            self.persist(record, summary);
            step(ItemState::Saved);
            pause(self.settings.publication_delay).await;
        }
    }

    /// Reuse a DOI found by an earlier run, or resolve a new one.
    async fn resolve_doi(
        &self,
        publication: &mut PublicationRecord,
        earlier: Option<&PublicationRecord>,
        surname: &str,
        summary: &mut RunSummary,
    ) {
        if let Some(earlier) = earlier.filter(|p| p.has_doi()) {
            publication.reuse_doi_fields(earlier);
            summary.dois_reused += 1;
            return;
        }

        publication.clear_doi_fields();
        match self
            .resolver
            .resolve(&publication.source_url, &publication.title, surname)
            .await
        {
            DoiOutcome::Verified(verified) => {
                tracing::info!(
                    index = publication.index,
                    doi = %verified.doi,
                    provenance = %verified.provenance,
                    "DOI verified"
                );
                self.resolver
                    .derive_fields(&verified.doi, &publication.source_url)
                    .await
                    .apply_to(publication);
                summary.dois_resolved += 1;
            }
            DoiOutcome::NotFound => {
                tracing::info!(index = publication.index, title = %publication.title, "no DOI found");
                summary.dois_missing += 1;
            }
            DoiOutcome::TransportError(e) => {
                tracing::warn!(
                    index = publication.index,
                    url = %publication.source_url,
                    error = %e,
                    "DOI resolution hit transport errors"
                );
                summary.dois_missing += 1;
            }
        }
    }

    /// A blocked source keeps whatever value the earlier run recorded.
    async fn attach_metrics(
        &self,
        publication: &mut PublicationRecord,
        earlier: Option<&PublicationRecord>,
        summary: &mut RunSummary,
    ) {
        let metrics = self.metrics.lookup_all(&publication.doi, false).await;

        publication.impact_metric_score = metric_value(
            &metrics.altmetric,
            earlier.and_then(|p| p.impact_metric_score),
        );
        publication.citation_count = metric_value(
            &metrics.scholar,
            earlier.and_then(|p| p.citation_count.map(|n| n as f64)),
        )
        .map(|n| n as u64);

        summary.metrics_found += [&metrics.altmetric, &metrics.scholar]
            .iter()
            .filter(|m| m.found())
            .count();
    }

    fn persist(&self, record: &mut AuthorRecord, summary: &mut RunSummary) {
        if let Err(e) = self.store.save(record) {
            tracing::error!(
                author_id = %record.author_id,
                error = %e,
                "failed to save author record"
            );
            summary.save_failures += 1;
        }
    }
}

fn metric_value(result: &MetricResult, earlier: Option<f64>) -> Option<f64> {
    match result.outcome() {
        MetricOutcome::Found => result.value(),
        MetricOutcome::Blocked => earlier,
        MetricOutcome::Denied => None,
    }
}

/// The record for this run: provider stubs in every slot, filled in as
/// items complete, with the previous marker carried over.
fn start_record(author_id: &str, profile: &AuthorProfile, previous: &Previous) -> AuthorRecord {
    let mut record = AuthorRecord::new(author_id, profile.name.clone());
    record.affiliation = profile.affiliation.clone();
    record.coauthors = profile.coauthors.clone();
    record.publications = profile
        .publications
        .iter()
        .enumerate()
        .map(|(index, p)| PublicationRecord { index, ..p.clone() })
        .collect();
    record.resume = previous.resume;
    record
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

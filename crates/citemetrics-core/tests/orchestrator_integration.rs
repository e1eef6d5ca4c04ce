//! End-to-end runs of the [`Orchestrator`] over a scripted transport and a
//! scripted profile provider. Nothing here touches the network.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use citemetrics_core::Clock;
use citemetrics_core::clock::ManualClock;
use citemetrics_core::http::mock::{MockReply, MockTransport};
use citemetrics_core::metrics::altmetric::DETAILS_BASE;
use citemetrics_core::metrics::scholar::SCHOLAR_BASE;
use citemetrics_core::metrics::{AltmetricSource, MetricKind, MetricOutcome, ScholarSource};
use citemetrics_core::profile::{AuthorProfile, ProfileProvider};
use citemetrics_core::{
    AuthorRecord, CacheStore, Coauthor, Config, CoreError, Engine, PublicationRecord, RunOutcome,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ── scripted profile provider ──────────────────────────────────────────

struct ScriptedProfiles {
    profile: Option<AuthorProfile>,
    fetches: AtomicUsize,
    fills: AtomicUsize,
    /// Publication index whose fill fails.
    failing_fill: Option<usize>,
}

impl ScriptedProfiles {
    fn new(profile: AuthorProfile) -> Arc<Self> {
        Arc::new(Self {
            profile: Some(profile),
            fetches: AtomicUsize::new(0),
            fills: AtomicUsize::new(0),
            failing_fill: None,
        })
    }

    fn missing() -> Arc<Self> {
        Arc::new(Self {
            profile: None,
            fetches: AtomicUsize::new(0),
            fills: AtomicUsize::new(0),
            failing_fill: None,
        })
    }

    fn failing_fill(profile: AuthorProfile, index: usize) -> Arc<Self> {
        Arc::new(Self {
            profile: Some(profile),
            fetches: AtomicUsize::new(0),
            fills: AtomicUsize::new(0),
            failing_fill: Some(index),
        })
    }
}

impl ProfileProvider for ScriptedProfiles {
    fn fetch_author<'a>(
        &'a self,
        author_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<AuthorProfile, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.profile
                .clone()
                .ok_or_else(|| CoreError::Profile(format!("author {author_id} not found")))
        })
    }

    fn fill_publication<'a>(
        &'a self,
        stub: &'a PublicationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublicationRecord, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.fills.fetch_add(1, Ordering::SeqCst);
            if self.failing_fill == Some(stub.index) {
                return Err(CoreError::Fetch("provider timed out".into()));
            }
            let mut filled = stub.clone();
            if filled.authors.is_empty() {
                filled.authors = "Jodie L. Rummer and Philip L. Munday".into();
            }
            Ok(filled)
        })
    }

    fn fill_coauthor<'a>(
        &'a self,
        stub: &'a Coauthor,
    ) -> Pin<Box<dyn Future<Output = Result<Coauthor, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(Coauthor {
                affiliation: "James Cook University".into(),
                ..stub.clone()
            })
        })
    }
}

// ── fixtures ───────────────────────────────────────────────────────────

const AUTHOR: &str = "rummer01";
const DOI: &str = "10.1111/gcb.12455";

const ALTMETRIC_PAGE: &str = r#"
    <html><head><link rel="canonical" href="https://www.altmetric.com/details/1960871"></head>
    <body>
      <div class="document-header"><h1>Life in the fast lane</h1></div>
      <table class="document-details-table">
        <tr><th>Published in</th><td>Global Change Biology, January 2014</td></tr>
      </table>
      <div class="score-panel"><img src="https://badges.altmetric.com/?size=180&score=42"></div>
    </body></html>"#;
const SCHOLAR_PAGE: &str = r#"<div class="gs_r"><a href="/scholar?cites=1">Cited by 87</a></div>"#;
const CHALLENGE_PAGE: &str = "<html><title>Just a moment...</title><div id=\"cf-challenge\"></div></html>";
const CAPTCHA_PAGE: &str = "<div id=\"gs_captcha_ccl\">Our systems have detected unusual traffic</div>";

struct Harness {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    mock: Arc<MockTransport>,
    engine: Engine,
}

fn harness(profiles: Arc<ScriptedProfiles>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()));
    let mock = Arc::new(MockTransport::new());
    let engine = engine_in(dir.path(), mock.clone(), clock.clone()).with_profiles(profiles);
    Harness {
        _dir: dir,
        clock,
        mock,
        engine,
    }
}

fn engine_in(dir: &Path, mock: Arc<MockTransport>, clock: Arc<ManualClock>) -> Engine {
    let config = Config {
        data_dir: dir.join("data"),
        cache_dir: dir.join("cache"),
        coauthor_delay: Duration::ZERO,
        publication_delay: Duration::ZERO,
        browser_render_url: None,
        tor_proxy: Some("127.0.0.1:9050".into()),
        tor_repeats: 1,
        socks5_proxies: Some("s1.example:1080".into()),
        ..Config::default()
    };
    let cache = Arc::new(CacheStore::in_memory(clock.clone()));
    Engine::with_cache(config, mock, clock, cache)
}

fn profile(publications: Vec<PublicationRecord>) -> AuthorProfile {
    AuthorProfile {
        author_id: AUTHOR.into(),
        name: "Jodie L. Rummer".into(),
        affiliation: "James Cook University".into(),
        publications,
        coauthors: vec![Coauthor {
            name: "Philip Munday".into(),
            id: "pm01".into(),
            ..Coauthor::default()
        }],
    }
}

fn doi_publications(count: usize) -> Vec<PublicationRecord> {
    (0..count)
        .map(|i| {
            let mut p = PublicationRecord::new(i, format!("Paper number {i}"), format!("https://doi.org/10.1000/p{i}"));
            p.journal = "Journal of Experimental Biology".into();
            p
        })
        .collect()
}

fn crossref_work(doi: &str, family: &str) -> MockReply {
    MockReply::json(json!({
        "message": {
            "DOI": doi,
            "title": ["Life in the fast lane"],
            "container-title": ["Global Change Biology"],
            "author": [{"given": "J. L.", "family": family}],
            "issued": {"date-parts": [[2014, 1]]}
        }
    }))
}

fn completed(outcome: RunOutcome) -> citemetrics_core::RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::AlreadyFresh => panic!("expected a completed run"),
    }
}

// ── resume ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn resume_skips_covered_publications() {
    let publications = doi_publications(5);
    let profiles = ScriptedProfiles::new(profile(publications.clone()));
    let h = harness(profiles.clone());

    let store = h.engine.store();
    let mut interrupted = AuthorRecord::new(AUTHOR, "Jodie L. Rummer");
    interrupted.coauthors = profile(Vec::new()).coauthors;
    interrupted.publications = publications
        .iter()
        .map(|p| {
            let mut p = p.clone();
            if p.index <= 2 {
                p.doi = format!("10.1000/old{}", p.index);
            }
            p
        })
        .collect();
    interrupted.resume.last_successful_coauthor_index = 0;
    interrupted.resume.last_successful_publication_index = 2;
    store.save(&mut interrupted).unwrap();

    let summary = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());

    assert_eq!(h.engine.resolver.invocations(), 2);
    assert_eq!(profiles.fills.load(Ordering::SeqCst), 2);
    assert_eq!(summary.resumed, 4);
    assert_eq!(h.mock.calls_to("https://doi.org/api/handles/10.1000/p0"), 0);
    assert_eq!(h.mock.calls_to("https://doi.org/api/handles/10.1000/p3"), 1);
    assert_eq!(h.mock.calls_to("https://doi.org/api/handles/10.1000/p4"), 1);

    let saved = store.load(AUTHOR).unwrap();
    let dois: Vec<&str> = saved.publications.iter().map(|p| p.doi.as_str()).collect();
    assert_eq!(
        dois,
        ["10.1000/old0", "10.1000/old1", "10.1000/old2", "10.1000/p3", "10.1000/p4"]
    );
    assert_eq!(saved.resume.last_successful_publication_index, 4);
    assert!(saved.is_complete());
    assert_eq!(saved.last_fetched, Some(h.clock.now()));
}

#[tokio::test(start_paused = true)]
async fn failed_item_keeps_stub_and_run_continues() {
    let mut publications = doi_publications(3);
    publications[1].source_url = String::new();
    let profiles = ScriptedProfiles::failing_fill(profile(publications), 1);
    let h = harness(profiles);

    let summary = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(summary.dois_resolved, 2);
    assert_eq!(summary.dois_missing, 1);

    let saved = h.engine.store().load(AUTHOR).unwrap();
    assert_eq!(saved.publications[1].doi, "");
    assert_eq!(saved.publications[1].authors, "");
    assert_eq!(saved.publications[2].authors_standardised, "Rummer, J. L., Munday, P. L.");
    assert_eq!(saved.coauthors[0].affiliation, "James Cook University");

    let raw = std::fs::read_to_string(h.engine.store().path_for(AUTHOR).unwrap()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["publications"][1]["citation_count"], json!(""));
    assert_eq!(value["last_successful_publication_index"], json!(2));
}

// ── freshness ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fresh_complete_record_is_left_alone() {
    let profiles = ScriptedProfiles::new(profile(doi_publications(2)));
    let h = harness(profiles.clone());

    completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(profiles.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.resolver.invocations(), 2);

    h.clock.advance(DAY);
    let again = h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap();
    assert_eq!(again, RunOutcome::AlreadyFresh);
    assert_eq!(profiles.fetches.load(Ordering::SeqCst), 1);

    let forced = completed(h.engine.orchestrator(true).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(profiles.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(forced.dois_reused, 2);
    assert_eq!(h.engine.resolver.invocations(), 2);

    h.clock.advance(8 * DAY);
    let stale = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(stale.resumed, 0);
    assert_eq!(stale.dois_reused, 2);
    assert_eq!(h.engine.resolver.invocations(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_profile_is_fatal() {
    let h = harness(ScriptedProfiles::missing());
    let err = h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap_err();
    assert!(matches!(err, CoreError::Profile(_)));
    assert!(h.engine.store().load(AUTHOR).is_none());
}

#[tokio::test(start_paused = true)]
async fn path_like_author_ids_are_rejected_before_any_work() {
    let profiles = ScriptedProfiles::new(profile(doi_publications(1)));
    let h = harness(profiles.clone());
    let err = h.engine.orchestrator(false).run("../escape", |_| {}).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidAuthorId(_)));
    assert_eq!(profiles.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(h.mock.call_count(), 0);
}

// ── conference skip ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn conference_papers_skip_resolution_and_metrics() {
    let mut publications = doi_publications(2);
    publications[0].journal = "Society for Experimental Biology Annual Meeting".into();
    let h = harness(ScriptedProfiles::new(profile(publications)));

    let summary = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(summary.conference_skipped, 1);
    assert_eq!(h.engine.resolver.invocations(), 1);
    assert_eq!(h.mock.calls_to(&h.engine.metadata.work_url("10.1000/p0")), 0);

    let saved = h.engine.store().load(AUTHOR).unwrap();
    assert_eq!(saved.publications[0].doi, "");
    assert_eq!(saved.publications[0].doi_link, "");
    assert_eq!(saved.publications[0].impact_metric_score, None);
    assert_eq!(saved.publications[1].doi, "10.1000/p1");
}

// ── metrics ────────────────────────────────────────────────────────────

fn metrics_publication() -> Vec<PublicationRecord> {
    vec![PublicationRecord {
        journal: "Global Change Biology".into(),
        ..PublicationRecord::new(0, "Life in the fast lane", format!("https://doi.org/{DOI}"))
    }]
}

#[tokio::test(start_paused = true)]
async fn gate_failures_are_cached_without_metric_requests() {
    let h = harness(ScriptedProfiles::new(profile(metrics_publication())));
    h.mock.on(&h.engine.metadata.work_url(DOI), crossref_work(DOI, "Smith"));

    let first = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(first.metrics_found, 0);
    let (record, _) = h.engine.metrics.cached(MetricKind::Altmetric, DOI).unwrap();
    assert_eq!(record.outcome, MetricOutcome::Denied);

    h.clock.advance(13 * DAY);
    completed(h.engine.orchestrator(true).run(AUTHOR, |_| {}).await.unwrap());

    assert_eq!(h.mock.calls_to(DETAILS_BASE), 0);
    assert_eq!(h.mock.calls_to(SCHOLAR_BASE), 0);
    assert_eq!(h.mock.calls_to(&h.engine.metadata.work_url(DOI)), 1);
    let saved = h.engine.store().load(AUTHOR).unwrap();
    assert_eq!(saved.publications[0].citation_count, None);
}

#[tokio::test(start_paused = true)]
async fn blocked_metrics_keep_previous_values() {
    let h = harness(ScriptedProfiles::new(profile(metrics_publication())));
    let details_url = AltmetricSource::details_url(DOI);
    let scholar_url = ScholarSource::search_url(DOI);
    h.mock.on(&h.engine.metadata.work_url(DOI), crossref_work(DOI, "Rummer"));
    h.mock.on(&details_url, MockReply::html(ALTMETRIC_PAGE));
    h.mock.on(&scholar_url, MockReply::html(SCHOLAR_PAGE));

    let first = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(first.metrics_found, 2);
    let saved = h.engine.store().load(AUTHOR).unwrap();
    assert_eq!(saved.publications[0].impact_metric_score, Some(42.0));
    assert_eq!(saved.publications[0].citation_count, Some(87));
    let (_, good_entry) = h.engine.metrics.cached(MetricKind::Altmetric, DOI).unwrap();

    h.clock.advance(15 * DAY);
    h.mock.on(&details_url, MockReply::html(CHALLENGE_PAGE));
    h.mock.on(&scholar_url, MockReply::html(CAPTCHA_PAGE));
    let details_before = h.mock.calls_to(&details_url);

    let second = completed(h.engine.orchestrator(false).run(AUTHOR, |_| {}).await.unwrap());
    assert_eq!(second.metrics_found, 0);
    assert_eq!(h.mock.calls_to(&details_url) - details_before, 2);

    let saved = h.engine.store().load(AUTHOR).unwrap();
    assert_eq!(saved.publications[0].impact_metric_score, Some(42.0));
    assert_eq!(saved.publications[0].citation_count, Some(87));

    let (record, entry) = h.engine.metrics.cached(MetricKind::Altmetric, DOI).unwrap();
    assert_eq!(record.outcome, MetricOutcome::Found);
    assert_eq!(record.value, Some(42.0));
    assert_eq!(entry, good_entry);

    let again = h.engine.metrics.lookup(MetricKind::ScholarCitations, DOI, false).await;
    assert!(!again.found());
}

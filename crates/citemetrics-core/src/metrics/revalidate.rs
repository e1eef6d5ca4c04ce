//! Periodic revalidation of the metrics cache.
//!
//! Missing and blocked entries are retried on every sweep. Successful
//! entries are refreshed once they are older than `stale_after`, and so are
//! gate denials when `recheck_denied` is set, so a grown allowlist is picked
//! up without clearing the cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{MetricKind, MetricOutcome, MetricRecord, MetricsService};
use crate::cache::CacheEntry;

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationPolicy {
    pub stale_after: Duration,
    pub recheck_denied: bool,
}

impl Default for RevalidationPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(7 * DAY),
            recheck_denied: true,
        }
    }
}

/// Why (or whether) an entry is due for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    Missing,
    Blocked,
    StaleFound,
    StaleDenied,
    NotDue,
}

impl Due {
    pub fn is_due(&self) -> bool {
        !matches!(self, Self::NotDue)
    }
}

impl RevalidationPolicy {
    pub fn classify(&self, cached: Option<&(MetricRecord, CacheEntry)>, now: DateTime<Utc>) -> Due {
        let Some((record, entry)) = cached else {
            return Due::Missing;
        };
        let stale = entry.age(now) >= self.stale_after;
        match record.outcome {
            MetricOutcome::Blocked => Due::Blocked,
            MetricOutcome::Found if stale => Due::StaleFound,
            MetricOutcome::Denied if stale && self.recheck_denied => Due::StaleDenied,
            _ => Due::NotDue,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub scholar_disabled: bool,
}

/// Refresh every due metric of `dois`. Once Scholar blocks, it is left
/// alone for the rest of the sweep; Altmetric carries on.
pub async fn sweep(service: &MetricsService, dois: &[String], policy: &RevalidationPolicy) -> SweepReport {
    let mut report = SweepReport::default();
    tracing::info!(dois = dois.len(), "revalidating metrics cache");

    for doi in dois {
        for kind in MetricKind::ALL {
            if kind == MetricKind::ScholarCitations && report.scholar_disabled {
                report.skipped += 1;
                continue;
            }
            let cached = service.cached(kind, doi);
            let due = policy.classify(cached.as_ref(), service.cache().now());
            if !due.is_due() {
                report.skipped += 1;
                continue;
            }

            tracing::debug!(doi = %doi, metric = %kind, due = ?due, "refreshing metric");
            let result = service.lookup(kind, doi, true).await;
            if result.outcome() == MetricOutcome::Blocked {
                report.blocked += 1;
                if kind == MetricKind::ScholarCitations {
                    tracing::warn!(doi = %doi, "Scholar is blocking, skipping it for the rest of the sweep");
                    report.scholar_disabled = true;
                }
            } else {
                report.refreshed += 1;
            }
        }
    }

    tracing::info!(
        refreshed = report.refreshed,
        skipped = report.skipped,
        blocked = report.blocked,
        scholar_disabled = report.scholar_disabled,
        "revalidation complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheDomain, CacheStore};
    use crate::clock::{Clock, ManualClock};
    use crate::http::PoliteClient;
    use crate::http::mock::{MockReply, MockTransport};
    use crate::metadata::MetadataSource;
    use crate::metrics::AuthorGate;
    use crate::metrics::test_support::ScriptedSource;
    use crate::resilience::{RateLimiter, ThrottlePolicy};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn record(outcome: MetricOutcome) -> MetricRecord {
        MetricRecord {
            doi: "10.1/x".into(),
            kind: MetricKind::Altmetric,
            outcome,
            value: None,
            details: None,
        }
    }

    fn entry(age_days: i64, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: "altmetric:10.1/x".into(),
            payload: json!({}),
            fetched_at: now - chrono::Duration::days(age_days),
            expires_at: None,
        }
    }

    // ── classification ─────────────────────────────────────────────────

    #[test]
    fn classification() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let policy = RevalidationPolicy::default();
        let at = |outcome, age| policy.classify(Some(&(record(outcome), entry(age, now))), now);

        assert_eq!(policy.classify(None, now), Due::Missing);
        assert_eq!(at(MetricOutcome::Blocked, 0), Due::Blocked);
        assert_eq!(at(MetricOutcome::Found, 3), Due::NotDue);
        assert_eq!(at(MetricOutcome::Found, 8), Due::StaleFound);
        assert_eq!(at(MetricOutcome::Denied, 3), Due::NotDue);
        assert_eq!(at(MetricOutcome::Denied, 8), Due::StaleDenied);

        let strict = RevalidationPolicy {
            recheck_denied: false,
            ..policy
        };
        assert_eq!(
            strict.classify(Some(&(record(MetricOutcome::Denied), entry(30, now))), now),
            Due::NotDue
        );
    }

    // ── sweep ──────────────────────────────────────────────────────────

    struct Fixture {
        clock: Arc<ManualClock>,
        service: MetricsService,
        altmetric: Arc<ScriptedSource>,
        scholar: Arc<ScriptedSource>,
    }

    fn fixture(scholar: Arc<ScriptedSource>, dois: &[&str]) -> Fixture {
        let mock = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
        let cache = Arc::new(CacheStore::in_memory(clock.clone() as Arc<dyn Clock>));
        let client = PoliteClient::new(mock.clone(), Arc::new(RateLimiter::new(ThrottlePolicy::default())));
        let metadata = Arc::new(MetadataSource::new(client, cache.clone(), None));
        for doi in dois {
            mock.on(
                &metadata.work_url(doi),
                MockReply::json(json!({
                    "message": {"DOI": doi, "title": ["T"], "author": [{"given": "J.", "family": "Rummer"}]}
                })),
            );
        }
        let altmetric = ScriptedSource::value(MetricKind::Altmetric, 5.0);
        let service = MetricsService::new(cache, metadata, AuthorGate::default())
            .with_source(altmetric.clone())
            .with_source(scholar.clone());
        Fixture {
            clock,
            service,
            altmetric,
            scholar,
        }
    }

    #[tokio::test]
    async fn fresh_entries_are_skipped_and_stale_ones_refreshed() {
        let dois = ["10.1000/a", "10.1000/b"];
        let f = fixture(ScriptedSource::value(MetricKind::ScholarCitations, 3.0), &dois);
        let dois: Vec<String> = dois.iter().map(|d| d.to_string()).collect();

        let first = sweep(&f.service, &dois, &RevalidationPolicy::default()).await;
        assert_eq!(first.refreshed, 4);

        f.clock.advance(Duration::from_secs(2 * DAY));
        let second = sweep(&f.service, &dois, &RevalidationPolicy::default()).await;
        assert_eq!(second.refreshed, 0);
        assert_eq!(second.skipped, 4);

        f.clock.advance(Duration::from_secs(6 * DAY));
        let third = sweep(&f.service, &dois, &RevalidationPolicy::default()).await;
        assert_eq!(third.refreshed, 4);
        assert_eq!(f.altmetric.calls(), 4);
    }

    #[tokio::test]
    async fn scholar_block_disables_it_for_the_sweep() {
        let dois = ["10.1000/a", "10.1000/b", "10.1000/c"];
        let f = fixture(ScriptedSource::blocked(MetricKind::ScholarCitations), &dois);
        let dois: Vec<String> = dois.iter().map(|d| d.to_string()).collect();

        let report = sweep(&f.service, &dois, &RevalidationPolicy::default()).await;
        assert!(report.scholar_disabled);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.refreshed, 3);
        assert_eq!(f.scholar.calls(), 1);
        assert_eq!(f.altmetric.calls(), 3);
    }

    #[tokio::test]
    async fn stale_denials_are_rechecked() {
        let f = fixture(ScriptedSource::value(MetricKind::ScholarCitations, 3.0), &[]);
        let dois = vec!["10.1000/unknown".to_string()];
        let policy = RevalidationPolicy::default();

        sweep(&f.service, &dois, &policy).await;
        let (record, _) = f.service.cached(MetricKind::Altmetric, &dois[0]).unwrap();
        assert_eq!(record.outcome, MetricOutcome::Denied);
        assert!(f.service.cache().get(CacheDomain::Metrics, "altmetric:10.1000/unknown").is_some());

        f.clock.advance(Duration::from_secs(8 * DAY));
        let report = sweep(&f.service, &dois, &policy).await;
        assert_eq!(report.refreshed, 2);

        f.clock.advance(Duration::from_secs(8 * DAY));
        let report = sweep(
            &f.service,
            &dois,
            &RevalidationPolicy {
                recheck_denied: false,
                ..policy
            },
        )
        .await;
        assert_eq!(report.skipped, 2);
    }
}

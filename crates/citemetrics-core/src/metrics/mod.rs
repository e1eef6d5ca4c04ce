//! Citation and attention metrics behind the author allowlist gate.
//!
//! Every lookup goes through the metrics cache domain under
//! `<kind>:<doi>`. Three outcomes are stored:
//!
//! - `found`: the gate passed and the source answered (the value may
//!   still be empty).
//! - `denied`: the gate failed, or the authoritative metadata was
//!   unavailable. Kept for the full TTL so the DOI is not re-queried.
//! - `blocked`: every proxy was blocked or failed. Written only when no
//!   earlier `found` entry exists, and never served as a cache hit.

pub mod altmetric;
pub mod gate;
pub mod revalidate;
pub mod scholar;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use altmetric::AltmetricSource;
pub use gate::AuthorGate;
pub use revalidate::{RevalidationPolicy, SweepReport};
pub use scholar::ScholarSource;

use crate::cache::{CacheDomain, CacheEntry, CacheStore};
use crate::doi::normalize_doi;
use crate::error::CoreError;
use crate::metadata::{MetadataSource, WorkMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Altmetric,
    ScholarCitations,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [Self::Altmetric, Self::ScholarCitations];

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Altmetric => "altmetric",
            Self::ScholarCitations => "scholar",
        }
    }

    pub fn cache_key(&self, doi: &str) -> String {
        format!("{}:{}", self.prefix(), doi.trim().to_lowercase())
    }

    /// Inverse of [`cache_key`](Self::cache_key).
    pub fn parse_key(key: &str) -> Option<(MetricKind, &str)> {
        let (prefix, doi) = key.split_once(':')?;
        let kind = Self::ALL.into_iter().find(|k| k.prefix() == prefix)?;
        Some((kind, doi))
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOutcome {
    Found,
    Denied,
    Blocked,
}

/// Payload of a metrics cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub doi: String,
    pub kind: MetricKind,
    pub outcome: MetricOutcome,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl MetricRecord {
    pub fn from_entry(entry: &CacheEntry) -> Option<Self> {
        serde_json::from_value(entry.payload.clone()).ok()
    }
}

/// Result of one metric lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub record: MetricRecord,
    pub fetched_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl MetricResult {
    pub fn found(&self) -> bool {
        self.record.outcome == MetricOutcome::Found
    }

    pub fn outcome(&self) -> MetricOutcome {
        self.record.outcome
    }

    /// The metric value, only for a `found` outcome.
    pub fn value(&self) -> Option<f64> {
        self.found().then_some(self.record.value).flatten()
    }
}

/// What a source returned for a DOI that passed the gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceReading {
    pub value: Option<f64>,
    pub details: Option<Value>,
}

/// A remote metrics source. Implementations do the network work only;
/// caching and gating live in [`MetricsService`].
pub trait MetricSource: Send + Sync {
    fn kind(&self) -> MetricKind;

    fn fetch<'a>(
        &'a self,
        doi: &'a str,
        work: &'a WorkMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<SourceReading, CoreError>> + Send + 'a>>;
}

/// Altmetric score and Scholar citations for a DOI.
#[derive(Debug, Clone, PartialEq)]
pub struct DoiMetrics {
    pub altmetric: MetricResult,
    pub scholar: MetricResult,
}

pub struct MetricsService {
    cache: Arc<CacheStore>,
    metadata: Arc<MetadataSource>,
    gate: AuthorGate,
    sources: Vec<Arc<dyn MetricSource>>,
    ttl: Duration,
}

impl MetricsService {
    pub fn new(cache: Arc<CacheStore>, metadata: Arc<MetadataSource>, gate: AuthorGate) -> Self {
        Self {
            cache,
            metadata,
            gate,
            sources: Vec::new(),
            ttl: CacheDomain::Metrics
                .default_ttl()
                .unwrap_or(Duration::from_secs(14 * 24 * 60 * 60)),
        }
    }

    /// Register a source. A later source of the same kind replaces the earlier one.
    pub fn with_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.sources.retain(|s| s.kind() != source.kind());
        self.sources.push(source);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn gate(&self) -> &AuthorGate {
        &self.gate
    }

    fn source(&self, kind: MetricKind) -> Option<&Arc<dyn MetricSource>> {
        self.sources.iter().find(|s| s.kind() == kind)
    }

    /// Cached record for `kind` and `doi`, expired or not.
    pub fn cached(&self, kind: MetricKind, doi: &str) -> Option<(MetricRecord, CacheEntry)> {
        let entry = self.cache.get_any(CacheDomain::Metrics, &kind.cache_key(doi))?;
        MetricRecord::from_entry(&entry).map(|record| (record, entry))
    }

    /// Both metrics for `doi`.
    pub async fn lookup_all(&self, doi: &str, force_refresh: bool) -> DoiMetrics {
        DoiMetrics {
            altmetric: self.lookup(MetricKind::Altmetric, doi, force_refresh).await,
            scholar: self.lookup(MetricKind::ScholarCitations, doi, force_refresh).await,
        }
    }

    /// One metric for `doi`: cache, then gate, then source.
    ///
    /// Never fails; network trouble surfaces as a `blocked` outcome.
    pub async fn lookup(&self, kind: MetricKind, doi: &str, force_refresh: bool) -> MetricResult {
        let doi = normalize_doi(doi);
        let key = kind.cache_key(&doi);

        if !force_refresh
            && let Some(entry) = self.cache.get(CacheDomain::Metrics, &key)
            && let Some(record) = MetricRecord::from_entry(&entry)
            && record.outcome != MetricOutcome::Blocked
        {
            tracing::debug!(doi = %doi, metric = %kind, outcome = ?record.outcome, "metric served from cache");
            return MetricResult {
                record,
                fetched_at: entry.fetched_at,
                from_cache: true,
            };
        }

        let work = match self.metadata.work(&doi, false).await {
            Ok(Some(work)) => work,
            Ok(None) => {
                tracing::warn!(doi = %doi, metric = %kind, "metric denied: no authoritative metadata");
                return self.store(kind, &doi, MetricOutcome::Denied, SourceReading::default());
            }
            Err(e) => {
                tracing::warn!(doi = %doi, metric = %kind, error = %e, "metric denied: metadata unavailable");
                return self.store(kind, &doi, MetricOutcome::Denied, SourceReading::default());
            }
        };
        let Some(surname) = self.gate.admits(&work) else {
            tracing::warn!(
                doi = %doi,
                metric = %kind,
                authors = ?work.family_names.iter().take(10).collect::<Vec<_>>(),
                "metric denied: no allowlisted author"
            );
            return self.store(kind, &doi, MetricOutcome::Denied, SourceReading::default());
        };
        tracing::debug!(doi = %doi, metric = %kind, surname = %surname, "metric gate passed");

        let Some(source) = self.source(kind) else {
            tracing::warn!(doi = %doi, metric = %kind, "no source registered");
            return self.unavailable(kind, &doi);
        };
        match source.fetch(&doi, &work).await {
            Ok(reading) => {
                tracing::info!(doi = %doi, metric = %kind, value = ?reading.value, "metric fetched");
                self.store(kind, &doi, MetricOutcome::Found, reading)
            }
            Err(e) => {
                tracing::warn!(doi = %doi, metric = %kind, error = %e, "metric unavailable this run");
                self.unavailable(kind, &doi)
            }
        }
    }

    fn store(&self, kind: MetricKind, doi: &str, outcome: MetricOutcome, reading: SourceReading) -> MetricResult {
        let record = MetricRecord {
            doi: doi.to_string(),
            kind,
            outcome,
            value: reading.value,
            details: reading.details,
        };
        let fetched_at = match serde_json::to_value(&record)
            .map_err(CoreError::from)
            .and_then(|payload| {
                self.cache
                    .put(CacheDomain::Metrics, &kind.cache_key(doi), payload, Some(self.ttl))
            }) {
            Ok(entry) => entry.fetched_at,
            Err(e) => {
                tracing::warn!(doi = %doi, metric = %kind, error = %e, "failed to cache metric");
                self.cache.now()
            }
        };
        MetricResult {
            record,
            fetched_at,
            from_cache: false,
        }
    }

    /// Blocked this run. An earlier `found` entry stays untouched, even if
    /// it has expired.
    fn unavailable(&self, kind: MetricKind, doi: &str) -> MetricResult {
        let has_found = self
            .cached(kind, doi)
            .is_some_and(|(record, _)| record.outcome == MetricOutcome::Found);
        if has_found {
            tracing::debug!(doi = %doi, metric = %kind, "keeping previous metric");
            return MetricResult {
                record: MetricRecord {
                    doi: doi.to_string(),
                    kind,
                    outcome: MetricOutcome::Blocked,
                    value: None,
                    details: None,
                },
                fetched_at: self.cache.now(),
                from_cache: false,
            };
        }
        self.store(kind, doi, MetricOutcome::Blocked, SourceReading::default())
    }

    /// Every DOI with a metrics entry of any kind or outcome, sorted.
    pub fn cached_dois(&self) -> Vec<String> {
        let mut dois: Vec<String> = self
            .cache
            .entries(CacheDomain::Metrics)
            .iter()
            .filter_map(|entry| MetricKind::parse_key(&entry.key).map(|(_, doi)| doi.to_string()))
            .collect();
        dois.sort();
        dois.dedup();
        dois
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A scripted source that counts its calls.
    pub struct ScriptedSource {
        pub kind: MetricKind,
        pub replies: Mutex<Vec<Result<SourceReading, CoreError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSource {
        /// Replies are consumed in order; the last one repeats.
        pub fn new(kind: MetricKind, replies: Vec<Result<SourceReading, CoreError>>) -> Arc<Self> {
            let mut replies = replies;
            replies.reverse();
            Arc::new(Self {
                kind,
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn value(kind: MetricKind, value: f64) -> Arc<Self> {
            Self::new(
                kind,
                vec![Ok(SourceReading {
                    value: Some(value),
                    details: None,
                })],
            )
        }

        pub fn blocked(kind: MetricKind) -> Arc<Self> {
            Self::new(
                kind,
                vec![Err(CoreError::Blocked {
                    url: format!("https://{}.example/", kind.prefix()),
                })],
            )
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn replay(reply: &Result<SourceReading, CoreError>) -> Result<SourceReading, CoreError> {
        match reply {
            Ok(reading) => Ok(reading.clone()),
            Err(CoreError::Blocked { url }) => Err(CoreError::Blocked { url: url.clone() }),
            Err(e) => Err(CoreError::Fetch(e.to_string())),
        }
    }

    impl MetricSource for ScriptedSource {
        fn kind(&self) -> MetricKind {
            self.kind
        }

        fn fetch<'a>(
            &'a self,
            _doi: &'a str,
            _work: &'a WorkMetadata,
        ) -> Pin<Box<dyn Future<Output = Result<SourceReading, CoreError>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 {
                    replies.pop()
                } else {
                    replies.first().map(replay)
                }
            };
            Box::pin(async move { reply.unwrap_or_else(|| Ok(SourceReading::default())) })
        }
    }
}

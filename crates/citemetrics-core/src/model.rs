//! Persisted author, coauthor, and publication records.
//!
//! Enrichment fields are always present in the serialized form: unresolved
//! strings are `""` and unresolved numbers are written as `""` too, so
//! downstream consumers see one stable schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk schema of an [`AuthorRecord`].
pub const SCHEMA_VERSION: u32 = 1;

/// A single publication of an author, as supplied by the profile provider
/// and enriched by this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    /// Position within the author's publication list.
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "pub_url")]
    pub source_url: String,
    #[serde(default)]
    pub journal: String,
    /// Raw author string, `"A. One and B. Two"`.
    #[serde(default, alias = "author")]
    pub authors: String,
    #[serde(default)]
    pub authors_standardised: String,

    #[serde(default)]
    pub doi: String,
    #[serde(default)]
    pub doi_link: String,
    #[serde(default)]
    pub doi_short: String,
    #[serde(default)]
    pub doi_short_link: String,
    #[serde(default)]
    pub doi_resolved_link: String,
    #[serde(default, with = "empty_as_none")]
    pub citation_count: Option<u64>,
    #[serde(default, with = "empty_as_none")]
    pub impact_metric_score: Option<f64>,

    /// Provider fields this crate does not interpret, carried through verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PublicationRecord {
    pub fn new(index: usize, title: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    pub fn has_doi(&self) -> bool {
        !self.doi.is_empty()
    }

    /// Reset every DOI-derived field to its unresolved value.
    pub fn clear_doi_fields(&mut self) {
        self.doi.clear();
        self.doi_link.clear();
        self.doi_short.clear();
        self.doi_short_link.clear();
        self.doi_resolved_link.clear();
    }

    /// Copy the DOI-derived fields from a previous run's record.
    pub fn reuse_doi_fields(&mut self, previous: &PublicationRecord) {
        self.doi = previous.doi.clone();
        self.doi_link = previous.doi_link.clone();
        self.doi_short = previous.doi_short.clone();
        self.doi_short_link = previous.doi_short_link.clone();
        self.doi_resolved_link = previous.doi_resolved_link.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coauthor {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "scholar_id")]
    pub id: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Last fully processed index of each phase. `-1` means nothing processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    #[serde(default = "unset_index")]
    pub last_successful_coauthor_index: i64,
    #[serde(default = "unset_index")]
    pub last_successful_publication_index: i64,
}

fn unset_index() -> i64 {
    -1
}

impl Default for ResumeMarker {
    fn default() -> Self {
        Self {
            last_successful_coauthor_index: -1,
            last_successful_publication_index: -1,
        }
    }
}

impl ResumeMarker {
    pub fn covers_coauthor(&self, index: usize) -> bool {
        (index as i64) <= self.last_successful_coauthor_index
    }

    pub fn covers_publication(&self, index: usize) -> bool {
        (index as i64) <= self.last_successful_publication_index
    }

    /// Never moves backwards.
    pub fn advance_coauthor(&mut self, index: usize) {
        self.last_successful_coauthor_index = self.last_successful_coauthor_index.max(index as i64);
    }

    /// Never moves backwards.
    pub fn advance_publication(&mut self, index: usize) {
        self.last_successful_publication_index =
            self.last_successful_publication_index.max(index as i64);
    }

    /// Whether both phases reached the end of lists of the given lengths.
    pub fn is_complete(&self, coauthors: usize, publications: usize) -> bool {
        self.last_successful_coauthor_index + 1 >= coauthors as i64
            && self.last_successful_publication_index + 1 >= publications as i64
    }
}

/// The whole persisted state for one author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorRecord {
    pub author_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub coauthors: Vec<Coauthor>,
    #[serde(default)]
    pub publications: Vec<PublicationRecord>,
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub last_fetched: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub resume: ResumeMarker,
}

fn current_schema() -> u32 {
    SCHEMA_VERSION
}

impl AuthorRecord {
    pub fn new(author_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            name: name.into(),
            affiliation: String::new(),
            coauthors: Vec::new(),
            publications: Vec::new(),
            schema_version: SCHEMA_VERSION,
            last_fetched: None,
            resume: ResumeMarker::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.resume
            .is_complete(self.coauthors.len(), self.publications.len())
    }
}

/// Serialize `None` as `""` and accept `""`, `null`, or a value on the way in.
pub mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(v) => v.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            Value(T),
            Text(String),
        }

        match Option::<Raw<T>>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Value(v)) => Ok(Some(v)),
            Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Raw::Text(s)) => Err(serde::de::Error::custom(format!(
                "expected a number or an empty string, got {s:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_fields_serialize_as_empty_strings() {
        let publication = PublicationRecord::new(0, "A Paper", "https://example.org/a");
        let json = serde_json::to_value(&publication).unwrap();
        assert_eq!(json["doi"], "");
        assert_eq!(json["doi_short_link"], "");
        assert_eq!(json["citation_count"], "");
        assert_eq!(json["impact_metric_score"], "");
    }

    #[test]
    fn numeric_fields_round_trip() {
        let mut publication = PublicationRecord::new(3, "A Paper", "");
        publication.citation_count = Some(42);
        publication.impact_metric_score = Some(12.5);
        let json = serde_json::to_string(&publication).unwrap();
        let back: PublicationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.citation_count, Some(42));
        assert_eq!(back.impact_metric_score, Some(12.5));
    }

    #[test]
    fn null_and_missing_metrics_deserialize_as_none() {
        let back: PublicationRecord =
            serde_json::from_str(r#"{"title":"x","citation_count":null}"#).unwrap();
        assert_eq!(back.citation_count, None);
        assert_eq!(back.impact_metric_score, None);
    }

    #[test]
    fn provider_fields_are_preserved() {
        let raw = r#"{"title":"x","pub_url":"https://a.org/1","num_citations":7,"bib":{"pages":"1-2"}}"#;
        let publication: PublicationRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(publication.source_url, "https://a.org/1");
        assert_eq!(publication.extra["num_citations"], 7);
        let json = serde_json::to_value(&publication).unwrap();
        assert_eq!(json["bib"]["pages"], "1-2");
    }

    #[test]
    fn resume_marker_defaults_to_unset() {
        let record: AuthorRecord = serde_json::from_str(r#"{"author_id":"abc"}"#).unwrap();
        assert_eq!(record.resume, ResumeMarker::default());
        assert_eq!(record.resume.last_successful_publication_index, -1);
        assert_eq!(record.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn resume_marker_is_flattened() {
        let mut record = AuthorRecord::new("abc", "Jodie Rummer");
        record.resume.advance_publication(4);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["last_successful_publication_index"], 4);
        assert_eq!(json["last_successful_coauthor_index"], -1);
    }

    #[test]
    fn resume_marker_never_moves_backwards() {
        let mut marker = ResumeMarker::default();
        marker.advance_publication(3);
        marker.advance_publication(1);
        assert_eq!(marker.last_successful_publication_index, 3);
        assert!(marker.covers_publication(3));
        assert!(!marker.covers_publication(4));
    }

    #[test]
    fn marker_completeness() {
        let mut marker = ResumeMarker::default();
        assert!(marker.is_complete(0, 0));
        assert!(!marker.is_complete(0, 2));
        marker.advance_publication(1);
        assert!(marker.is_complete(0, 2));
        assert!(!marker.is_complete(1, 2));
    }
}

//! Academic profile source: the author's publication and coauthor lists.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::matching::normalize_title;
use crate::model::{Coauthor, PublicationRecord};
use crate::store::check_author_id;

/// An author with stub publication and coauthor entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorProfile {
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub publications: Vec<PublicationRecord>,
    #[serde(default)]
    pub coauthors: Vec<Coauthor>,
}

/// Source of author profiles. `fetch_author` failing aborts a run; the
/// fill calls may fail per item.
pub trait ProfileProvider: Send + Sync {
    fn fetch_author<'a>(
        &'a self,
        author_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<AuthorProfile, CoreError>> + Send + 'a>>;

    /// Full detail for one publication stub.
    fn fill_publication<'a>(
        &'a self,
        stub: &'a PublicationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublicationRecord, CoreError>> + Send + 'a>>;

    /// Full detail for one coauthor stub.
    fn fill_coauthor<'a>(
        &'a self,
        stub: &'a Coauthor,
    ) -> Pin<Box<dyn Future<Output = Result<Coauthor, CoreError>> + Send + 'a>>;
}

/// On-disk profile export.
#[derive(Debug, Clone, Default, Deserialize)]
struct ProfileExport {
    #[serde(default)]
    name: String,
    #[serde(default)]
    affiliation: String,
    #[serde(default)]
    publications: Vec<PublicationRecord>,
    #[serde(default)]
    coauthors: Vec<Coauthor>,
    /// Filled publications, matched to stubs by normalized title.
    #[serde(default)]
    publication_details: Vec<PublicationRecord>,
    /// Filled coauthors, matched to stubs by id.
    #[serde(default)]
    coauthor_details: Vec<Coauthor>,
}

#[derive(Default)]
struct Details {
    publications: HashMap<String, PublicationRecord>,
    coauthors: HashMap<String, Coauthor>,
}

/// Reads `<dir>/<author_id>.json` exports.
pub struct JsonProfileProvider {
    dir: PathBuf,
    details: Mutex<Details>,
}

impl JsonProfileProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            details: Mutex::new(Details::default()),
        }
    }

    pub fn path_for(&self, author_id: &str) -> Result<PathBuf, CoreError> {
        check_author_id(author_id)?;
        Ok(self.dir.join(format!("{author_id}.json")))
    }

    fn load(&self, author_id: &str) -> Result<AuthorProfile, CoreError> {
        let path = self.path_for(author_id)?;
        let export = read_export(&path)
            .map_err(|e| CoreError::Profile(format!("author {author_id} ({}): {e}", path.display())))?;

        if let Ok(mut details) = self.details.lock() {
            details.publications = export
                .publication_details
                .into_iter()
                .map(|p| (normalize_title(&p.title), p))
                .collect();
            details.coauthors = export
                .coauthor_details
                .into_iter()
                .filter(|c| !c.id.is_empty())
                .map(|c| (c.id.clone(), c))
                .collect();
        }

        let publications = export
            .publications
            .into_iter()
            .enumerate()
            .map(|(index, publication)| PublicationRecord { index, ..publication })
            .collect();
        Ok(AuthorProfile {
            author_id: author_id.to_string(),
            name: export.name,
            affiliation: export.affiliation,
            publications,
            coauthors: export.coauthors,
        })
    }
}

fn read_export(path: &Path) -> Result<ProfileExport, CoreError> {
    if !path.is_file() {
        return Err(CoreError::NotFound("profile not found".into()));
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

impl ProfileProvider for JsonProfileProvider {
    fn fetch_author<'a>(
        &'a self,
        author_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<AuthorProfile, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let profile = self.load(author_id)?;
            tracing::info!(
                author_id = %author_id,
                name = %profile.name,
                publications = profile.publications.len(),
                coauthors = profile.coauthors.len(),
                "author profile loaded"
            );
            Ok(profile)
        })
    }

    fn fill_publication<'a>(
        &'a self,
        stub: &'a PublicationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublicationRecord, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let key = normalize_title(&stub.title);
            let filled = self
                .details
                .lock()
                .ok()
                .and_then(|details| details.publications.get(&key).cloned());
            Ok(match filled {
                Some(detail) => PublicationRecord {
                    index: stub.index,
                    ..detail
                },
                None => stub.clone(),
            })
        })
    }

    fn fill_coauthor<'a>(
        &'a self,
        stub: &'a Coauthor,
    ) -> Pin<Box<dyn Future<Output = Result<Coauthor, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let filled = self
                .details
                .lock()
                .ok()
                .and_then(|details| details.coauthors.get(&stub.id).cloned());
            Ok(filled.unwrap_or_else(|| stub.clone()))
        })
    }
}

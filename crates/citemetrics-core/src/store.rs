//! Per-author JSON persistence.
//!
//! Each author lives in `<data_dir>/<author_id>.json`. Saves write a temp
//! file in the same directory and rename it over the target, so readers see
//! either the previous record or the new one.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::model::{AuthorRecord, SCHEMA_VERSION};

pub struct AuthorStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl AuthorStore {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    pub fn path_for(&self, author_id: &str) -> Result<PathBuf, CoreError> {
        check_author_id(author_id)?;
        Ok(self.dir.join(format!("{author_id}.json")))
    }

    /// The stored record, or `None` when there is none or it is unreadable.
    pub fn load(&self, author_id: &str) -> Option<AuthorRecord> {
        let path = match self.path_for(author_id) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "not loading author record");
                return None;
            }
        };
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable author record");
                None
            }
        }
    }

    /// Stamp `schema_version` and `last_fetched`, then replace the file.
    pub fn save(&self, record: &mut AuthorRecord) -> Result<PathBuf, CoreError> {
        record.schema_version = SCHEMA_VERSION;
        record.last_fetched = Some(self.clock.now());

        let path = self.path_for(&record.author_id)?;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(record)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| CoreError::Io(e.error))?;

        tracing::debug!(path = %path.display(), "saved author record");
        Ok(path)
    }

    /// Fetched within `fresh_for` of now. Timestamps in the future are not fresh.
    pub fn is_fresh(&self, record: &AuthorRecord, fresh_for: Duration) -> bool {
        let Some(last) = record.last_fetched else {
            return false;
        };
        let age = self.clock.now() - last;
        chrono::Duration::from_std(fresh_for).is_ok_and(|fresh| age >= chrono::Duration::zero() && age <= fresh)
    }
}

/// Author ids become file names, so they must stay a single path component.
pub fn check_author_id(author_id: &str) -> Result<(), CoreError> {
    let invalid = author_id.trim().is_empty()
        || author_id.contains(['/', '\\', '\0'])
        || author_id.contains("..");
    if invalid {
        return Err(CoreError::InvalidAuthorId(author_id.to_string()));
    }
    Ok(())
}

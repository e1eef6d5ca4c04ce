//! DOI handle registry and the shortDOI service.

use serde::Deserialize;

use crate::error::CoreError;
use crate::http::{HttpRequest, PoliteClient};

pub const HANDLE_API: &str = "https://doi.org/api/handles";
pub const SHORT_DOI_API: &str = "https://shortdoi.org";

#[derive(Debug, Deserialize)]
struct HandleRecord {
    #[serde(rename = "responseCode", default)]
    response_code: i64,
    #[serde(default)]
    values: Vec<HandleValue>,
}

#[derive(Debug, Deserialize)]
struct HandleValue {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: HandleData,
}

#[derive(Debug, Default, Deserialize)]
struct HandleData {
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ShortDoiRecord {
    #[serde(rename = "ShortDOI", default)]
    short_doi: String,
}

/// Handle response code for "handle not found".
const HANDLE_NOT_FOUND: i64 = 100;

/// The registered target URL in a handle API response body.
fn registered_url(body: &[u8]) -> Result<Option<String>, CoreError> {
    let record: HandleRecord = serde_json::from_slice(body)?;
    if record.response_code == HANDLE_NOT_FOUND {
        return Ok(None);
    }
    Ok(record
        .values
        .iter()
        .rev()
        .find(|v| v.kind.eq_ignore_ascii_case("URL"))
        .and_then(|v| v.data.value.as_str())
        .map(str::to_string))
}

/// Lookups against `doi.org/api/handles` and `shortdoi.org`. Responses are
/// replayed from the HTTP cache domain.
#[derive(Clone)]
pub struct DoiRegistry {
    client: PoliteClient,
}

impl DoiRegistry {
    pub fn new(client: PoliteClient) -> Self {
        Self { client }
    }

    /// The URL the DOI is registered to, or `None` for an unknown DOI.
    pub async fn resolved_link(&self, doi: &str) -> Result<Option<String>, CoreError> {
        let url = format!("{HANDLE_API}/{doi}");
        let resp = self.client.get_cached(&HttpRequest::get(url.clone())).await?;
        match resp.status {
            404 => Ok(None),
            s if !(200..300).contains(&s) => Err(CoreError::Http { url, status: s }),
            _ => registered_url(&resp.body),
        }
    }

    /// `https://doi.org/<doi>` when the handle is registered.
    pub async fn doi_link(&self, doi: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .resolved_link(doi)
            .await?
            .map(|_| super::doi_link(doi)))
    }

    /// The short form (`10/gbcdef`) of a DOI.
    pub async fn short_doi(&self, doi: &str) -> Result<Option<String>, CoreError> {
        let url = format!("{SHORT_DOI_API}/{doi}?format=json");
        let resp = self.client.get_cached(&HttpRequest::get(url.clone())).await?;
        match resp.status {
            400 | 404 => Ok(None),
            s if !(200..300).contains(&s) => Err(CoreError::Http { url, status: s }),
            _ => {
                let record: ShortDoiRecord = resp.json()?;
                Ok(Some(record.short_doi).filter(|s| !s.is_empty()))
            }
        }
    }
}

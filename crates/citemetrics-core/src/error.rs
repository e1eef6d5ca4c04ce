use crate::http::HttpError;

/// Errors produced by the core library.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error for {url}: {message}")]
    Transport {
        url: String,
        message: String,
        transient: bool,
    },

    #[error("blocked by {url}")]
    Blocked { url: String },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("profile error: {0}")]
    Profile(String),

    #[error("invalid author id {0:?}")]
    InvalidAuthorId(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("PDF extraction error: {0}")]
    Pdf(String),
}

impl CoreError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<HttpError> for CoreError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Blocked { url } => CoreError::Blocked { url },
            HttpError::Status { url, status } => CoreError::Http { url, status },
            HttpError::RateLimited { url, .. } => CoreError::Http { url, status: 429 },
            other => {
                let transient = other.is_transient();
                CoreError::Transport {
                    url: other.url().to_string(),
                    message: other.to_string(),
                    transient,
                }
            }
        }
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} timed out")]
    TimedOut(String),

    #[error("{0}")]
    Process(String),

    #[error("http error: {0}")]
    Http(String),

    /// Error reported by the backend itself, message passed through as-is.
    #[error("{0}")]
    Api(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("{0}")]
    MissingCredentials(String),

    #[error("{0}")]
    InvalidCredential(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("{0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::TimedOut("http request".to_string());
        }
        Self::Http(e.without_url().to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

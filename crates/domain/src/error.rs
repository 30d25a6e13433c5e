/// Shared error type used across all Parlor crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is an authentication/authorization failure that
    /// should surface a re-authentication prompt rather than a synthetic
    /// failure message.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthRequired(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

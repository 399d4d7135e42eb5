use rapport_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CsrfError {
    #[error("Invalid CSRF token")]
    InvalidToken,

    #[error("Missing CSRF token")]
    MissingToken,

    #[error("Invalid session id: {0}")]
    InvalidSession(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CsrfError {
    /// HTTP status a handler should answer with.
    ///
    /// Token failures are 403: the client should refresh the page and retry.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidToken | Self::MissingToken => 403,
            Self::InvalidSession(_) => 400,
            Self::Store(_) => 503,
            Self::Config(_) | Self::SerializationError(_) | Self::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, CsrfError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no credentials stored for user {0}")]
    UnknownUser(String),

    #[error("refresh credential rejected for {0}, re-authorization required")]
    CredentialRevoked(String),

    #[error("upstream rate limited, retry-after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("upstream fetch failed: {0}")]
    Fetch(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Transient upstream failures that are safe to retry on the next
    /// poll tick. Revoked credentials and missing users are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::RateLimited { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Error types for credential operations

/// Errors from credential operations.
///
/// `Clone` so that a failed attempt can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("no provider registered for account: {0}")]
    UnknownAccount(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;

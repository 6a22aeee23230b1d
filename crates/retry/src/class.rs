//! Error classification for retry decisions
//!
//! Upstream failures are bucketed into a small set of classes. The backoff
//! calculator treats `RateLimit` and `Timeout` specially; the correlation
//! analyzer and metrics collector only care that classes compare equal.

use std::fmt;

/// Class of an upstream failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorClass {
    /// Upstream refused the call for rate reasons (429)
    RateLimit,
    /// Request or gateway timed out (408/504, client-side timeouts)
    Timeout,
    /// Credentials rejected (401/403)
    Auth,
    /// Upstream 5xx other than gateway timeout
    Server,
    /// Connection-level failure before a response arrived
    Network,
    /// Anything else, labelled by the caller
    Other(String),
}

impl ErrorClass {
    /// Stable label used in metrics and logs.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Auth => "auth",
            ErrorClass::Server => "server",
            ErrorClass::Network => "network",
            ErrorClass::Other(label) => label,
        }
    }

    /// Parse a label back into a class. Unknown labels become `Other`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "rate_limit" => ErrorClass::RateLimit,
            "timeout" => ErrorClass::Timeout,
            "auth" => ErrorClass::Auth,
            "server" => ErrorClass::Server,
            "network" => ErrorClass::Network,
            other => ErrorClass::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorClass {
    fn from(label: &str) -> Self {
        ErrorClass::from_label(label)
    }
}

/// Classify an upstream HTTP status code.
///
/// 429 is a rate limit, 408/504 are timeouts, 401/403 are credential
/// failures, remaining 5xx are server errors. Any other status is returned
/// as `Other("http_<status>")` so distinct codes stay distinguishable in the
/// correlation window.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimit,
        408 | 504 => ErrorClass::Timeout,
        401 | 403 => ErrorClass::Auth,
        500..=599 => ErrorClass::Server,
        other => ErrorClass::Other(format!("http_{other}")),
    }
}

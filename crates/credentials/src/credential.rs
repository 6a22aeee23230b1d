//! Credential value type

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// An account's credential as issued by its provider.
///
/// Never mutated in place: a refresh produces a new value that replaces the
/// old one in the store. `expires_at` is absolute (RFC 3339 on disk); a
/// credential without one never expires.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub account_key: String,
}

impl Credential {
    /// Bearer credential without expiry or refresh token.
    pub fn new(account_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_at: None,
            refresh_token: None,
            account_key: account_key.into(),
        }
    }

    pub fn with_expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }

    /// Expire `lifetime` from now.
    pub fn with_lifetime(self, lifetime: Duration) -> Self {
        let expires_at = TimeDelta::from_std(lifetime)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta));
        Self { expires_at, ..self }
    }

    pub fn with_refresh_token(self, refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: Some(refresh_token.into()),
            ..self
        }
    }

    /// True once the current time has passed `expires_at`.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    /// True if the credential expires within `window` from now (or already has).
    pub fn expires_within(&self, window: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        Utc::now()
            .checked_add_signed(window)
            .is_none_or(|horizon| horizon > expires_at)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Value for an `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_key", &self.account_key)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

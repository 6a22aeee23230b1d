//! Credential lifecycle for external accounts
//!
//! Each external account gets a `CredentialProvider` that knows how to
//! obtain and refresh its credentials. `CredentialManager` sits in front of
//! the providers and makes sure that, per account, at most one
//! authentication or refresh runs at a time: concurrent callers wait for
//! the in-flight attempt and all receive its result.
//!
//! Credential flow:
//! 1. Caller registers a provider for an account key
//! 2. `get_valid_token` returns the cached credential while it is unexpired
//! 3. An expired credential with a refresh token is refreshed; failure
//!    discards it and surfaces the error
//! 4. Otherwise the provider authenticates from scratch
//! 5. Every new credential is written through `CredentialStore`
//! 6. An optional background task refreshes credentials before they expire

pub mod credential;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod provider;
pub mod store;

pub use credential::Credential;
pub use error::{Error, Result};
pub use manager::CredentialManager;
pub use oauth::{OAuthClientProvider, TokenResponse};
pub use provider::CredentialProvider;
pub use store::CredentialStore;

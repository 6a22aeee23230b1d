//! Provider abstraction for obtaining credentials

use std::future::Future;
use std::pin::Pin;

use crate::credential::Credential;
use crate::error::Result;

/// Source of credentials for one external account.
///
/// `CredentialManager` calls at most one of these at a time per account, so
/// implementations need no coordination of their own. Uses
/// `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialProvider>`).
pub trait CredentialProvider: Send + Sync {
    /// Obtain a fresh credential from scratch.
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + '_>>;

    /// Exchange `current` (expired, with a refresh token) for a new credential.
    fn refresh<'a>(
        &'a self,
        current: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;
}

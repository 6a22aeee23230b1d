//! OAuth2 token-endpoint provider
//!
//! `authenticate` runs the client-credentials grant and `refresh` the
//! refresh-token grant, both as form POSTs to the configured token endpoint
//! with the client id and secret in HTTP Basic auth.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::provider::CredentialProvider;

/// Token endpoint response for both grants.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// Build the credential for `account_key`. A missing refresh token falls
    /// back to `previous_refresh`; endpoints often omit it when it did not
    /// rotate.
    pub fn into_credential(self, account_key: &str, previous_refresh: Option<String>) -> Credential {
        let mut credential = Credential::new(account_key, self.access_token);
        if let Some(token_type) = self.token_type {
            credential.token_type = token_type;
        }
        if let Some(secs) = self.expires_in {
            credential = credential.with_lifetime(Duration::from_secs(secs));
        }
        credential.refresh_token = self.refresh_token.or(previous_refresh);
        credential
    }
}

/// Provider for one account against an OAuth2 token endpoint.
pub struct OAuthClientProvider {
    client: reqwest::Client,
    account_key: String,
    token_endpoint: String,
    client_id: String,
    client_secret: Secret<String>,
    scopes: Vec<String>,
}

impl OAuthClientProvider {
    pub fn new(
        client: reqwest::Client,
        account_key: impl Into<String>,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Secret<String>,
    ) -> Self {
        Self {
            client,
            account_key: account_key.into(),
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret,
            scopes: Vec::new(),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn account_key(&self) -> &str {
        &self.account_key
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<reqwest::Response> {
        self.client
            .post(&self.token_endpoint)
            .basic_auth(&self.client_id, Some(self.client_secret.expose()))
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token request failed: {e}")))
    }

    async fn client_credentials(&self) -> Result<Credential> {
        let scope = self.scopes.join(" ");
        let mut form = vec![("grant_type", "client_credentials")];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self.post_form(&form).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Authentication(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Authentication(format!("invalid token response: {e}")))?;
        debug!(account_key = %self.account_key, "client credentials grant succeeded");
        Ok(token.into_credential(&self.account_key, None))
    }

    async fn refresh_grant(&self, current: &Credential) -> Result<Credential> {
        let refresh = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Refresh("credential has no refresh token".into()))?;

        let response = self
            .post_form(&[("grant_type", "refresh_token"), ("refresh_token", refresh)])
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 400/401/403 mean the refresh token is revoked or invalid
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::Refresh(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }
            return Err(Error::Http(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Refresh(format!("invalid refresh response: {e}")))?;
        debug!(account_key = %self.account_key, "refresh grant succeeded");
        Ok(token.into_credential(&self.account_key, Some(refresh.to_string())))
    }
}

impl CredentialProvider for OAuthClientProvider {
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + '_>> {
        Box::pin(self.client_credentials())
    }

    fn refresh<'a>(
        &'a self,
        current: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(self.refresh_grant(current))
    }
}

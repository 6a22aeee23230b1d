//! Single-flight credential manager
//!
//! One slot per registered account holds the provider and a tokio Mutex.
//! Every authentication or refresh for the account runs while holding that
//! lock, so concurrent callers queue behind the in-flight attempt.
//!
//! Callers remember how many attempts had completed before they started
//! waiting. If the counter moved while they waited and the last attempt
//! failed, they get that failure instead of starting another attempt. If it
//! succeeded, the fresh credential is already cached and returned.
//!
//! Slots are created only by `register_provider`; asking for an account
//! without one fails with `UnknownAccount` and never allocates a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::provider::CredentialProvider;
use crate::store::CredentialStore;

#[derive(Clone, Copy)]
enum AttemptKind {
    Authenticate,
    Refresh,
}

impl AttemptKind {
    fn label(self) -> &'static str {
        match self {
            AttemptKind::Authenticate => "authenticate",
            AttemptKind::Refresh => "refresh",
        }
    }
}

struct AccountSlot {
    provider: Arc<dyn CredentialProvider>,
    /// Completed attempts, bumped while holding `last_failure`.
    attempts: AtomicU64,
    /// The per-account lock. Holds the error of the most recent attempt.
    last_failure: Mutex<Option<Error>>,
}

impl AccountSlot {
    fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    fn completed(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    fn finish(&self, last_failure: &mut Option<Error>, result: &Result<Credential>) {
        *last_failure = result.as_ref().err().cloned();
        self.attempts.fetch_add(1, Ordering::Release);
    }
}

/// Per-account credential lifecycle with deduplicated auth/refresh.
pub struct CredentialManager {
    store: CredentialStore,
    slots: Mutex<HashMap<String, Arc<AccountSlot>>>,
}

impl CredentialManager {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Register (or replace) the provider for `account_key`.
    pub async fn register_provider(
        &self,
        account_key: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
    ) {
        let account_key = account_key.into();
        info!(account_key, "registered credential provider");
        self.slots
            .lock()
            .await
            .insert(account_key, Arc::new(AccountSlot::new(provider)));
    }

    pub async fn is_registered(&self, account_key: &str) -> bool {
        self.slots.lock().await.contains_key(account_key)
    }

    pub async fn account_keys(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }

    async fn slot(&self, account_key: &str) -> Result<Arc<AccountSlot>> {
        self.slots
            .lock()
            .await
            .get(account_key)
            .cloned()
            .ok_or_else(|| Error::UnknownAccount(account_key.to_string()))
    }

    /// Return a valid credential for `account_key`.
    ///
    /// Order: cached and unexpired, else refresh an expired credential that
    /// has a refresh token (a failed refresh discards it and returns the
    /// error without falling back), else authenticate.
    pub async fn get_valid_token(&self, account_key: &str) -> Result<Credential> {
        let slot = self.slot(account_key).await?;
        let seen = slot.completed();
        let mut last_failure = slot.last_failure.lock().await;

        if slot.completed() != seen
            && let Some(err) = last_failure.as_ref()
        {
            debug!(account_key, error = %err, "sharing result of concurrent attempt");
            return Err(err.clone());
        }

        let cached = self.store.get(account_key).await;
        let result = match cached {
            Some(credential) if !credential.is_expired() => return Ok(credential),
            Some(credential) if credential.can_refresh() => {
                self.refresh_locked(&slot, account_key, credential).await
            }
            _ => self.authenticate_locked(&slot, account_key).await,
        };
        slot.finish(&mut last_failure, &result);
        result
    }

    /// Remove the stored credential for `account_key`. The provider stays
    /// registered, so the next `get_valid_token` authenticates again.
    pub async fn revoke(&self, account_key: &str) -> Result<Option<Credential>> {
        let removed = self.store.remove(account_key).await?;
        if removed.is_some() {
            info!(account_key, "revoked credential");
        }
        Ok(removed)
    }

    /// Refresh every registered credential that expires within `threshold`
    /// and has a refresh token. Returns the number refreshed successfully.
    pub async fn refresh_expiring(&self, threshold: Duration) -> usize {
        let mut refreshed = 0;
        for account_key in self.account_keys().await {
            let Ok(slot) = self.slot(&account_key).await else {
                continue;
            };
            let mut last_failure = slot.last_failure.lock().await;

            let Some(credential) = self.store.get(&account_key).await else {
                continue;
            };
            if !credential.can_refresh() || !credential.expires_within(threshold) {
                continue;
            }

            debug!(account_key, "credential expiring within threshold, refreshing");
            let result = self.refresh_locked(&slot, &account_key, credential).await;
            slot.finish(&mut last_failure, &result);
            if result.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Spawn a task that calls `refresh_expiring(threshold)` every `interval`.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        threshold: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; credentials were just loaded.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let refreshed = manager.refresh_expiring(threshold).await;
                if refreshed > 0 {
                    info!(refreshed, "background credential refresh cycle complete");
                }
            }
        })
    }

    async fn authenticate_locked(&self, slot: &AccountSlot, account_key: &str) -> Result<Credential> {
        debug!(account_key, "authenticating");
        match slot.provider.authenticate().await {
            Ok(credential) => {
                record_attempt(AttemptKind::Authenticate, true);
                info!(account_key, "authenticated");
                Ok(self.keep(account_key, credential).await)
            }
            Err(e) => {
                record_attempt(AttemptKind::Authenticate, false);
                warn!(account_key, error = %e, "authentication failed");
                Err(e)
            }
        }
    }

    async fn refresh_locked(
        &self,
        slot: &AccountSlot,
        account_key: &str,
        stale: Credential,
    ) -> Result<Credential> {
        debug!(account_key, "refreshing expired credential");
        match slot.provider.refresh(&stale).await {
            Ok(credential) => {
                record_attempt(AttemptKind::Refresh, true);
                info!(account_key, "credential refreshed");
                Ok(self.keep(account_key, credential).await)
            }
            Err(e) => {
                record_attempt(AttemptKind::Refresh, false);
                warn!(account_key, error = %e, "refresh failed, discarding stale credential");
                if let Err(store_err) = self.store.remove(account_key).await {
                    warn!(account_key, error = %store_err, "failed to persist credential removal");
                }
                Err(e)
            }
        }
    }

    /// Store a provider-issued credential under `account_key`.
    ///
    /// A failed write is logged; the credential is still cached in memory
    /// and returned.
    async fn keep(&self, account_key: &str, credential: Credential) -> Credential {
        let credential = Credential {
            account_key: account_key.to_string(),
            ..credential
        };
        if let Err(e) = self.store.put(credential.clone()).await {
            warn!(account_key, error = %e, "failed to persist credential");
        }
        credential
    }
}

fn record_attempt(kind: AttemptKind, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("credential_attempts_total", "kind" => kind.label(), "outcome" => outcome)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;

    /// Provider that counts calls and can be told to fail.
    #[derive(Default)]
    struct FakeProvider {
        authenticate_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        fail_authenticate: bool,
        fail_refresh: bool,
        lifetime_secs: Option<i64>,
        delay: Duration,
    }

    impl FakeProvider {
        fn authenticated(&self) -> usize {
            self.authenticate_calls.load(Ordering::SeqCst)
        }

        fn refreshed(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        fn issue(&self, access: String) -> Credential {
            let credential = Credential::new("ignored", access).with_refresh_token("rt");
            match self.lifetime_secs {
                Some(secs) => credential.with_expires_at(Utc::now() + TimeDelta::seconds(secs)),
                None => credential,
            }
        }
    }

    impl CredentialProvider for FakeProvider {
        fn authenticate(&self) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + '_>> {
            Box::pin(async move {
                let n = self.authenticate_calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                if self.fail_authenticate {
                    return Err(Error::Authentication(format!("attempt {n} rejected")));
                }
                Ok(self.issue(format!("at_auth_{n}")))
            })
        }

        fn refresh<'a>(
            &'a self,
            current: &'a Credential,
        ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                if self.fail_refresh {
                    return Err(Error::Refresh("refresh token revoked".into()));
                }
                assert!(current.can_refresh());
                Ok(self.issue(format!("at_refresh_{n}")))
            })
        }
    }

    async fn manager(dir: &tempfile::TempDir) -> Arc<CredentialManager> {
        let store = CredentialStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();
        Arc::new(CredentialManager::new(store))
    }

    fn expired(account_key: &str) -> Credential {
        Credential::new(account_key, "at_old")
            .with_expires_at(Utc::now() - TimeDelta::seconds(10))
            .with_refresh_token("rt_old")
    }

    #[tokio::test]
    async fn unknown_account_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let result = manager.get_valid_token("nobody").await;
        assert!(matches!(result, Err(Error::UnknownAccount(key)) if key == "nobody"));
        assert!(!manager.is_registered("nobody").await);
    }

    #[tokio::test]
    async fn authenticates_once_then_serves_cache() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider::default());
        manager.register_provider("acct", provider.clone()).await;

        let first = manager.get_valid_token("acct").await.unwrap();
        let second = manager.get_valid_token("acct").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.account_key, "acct");
        assert_eq!(provider.authenticated(), 1);
        assert_eq!(manager.store().get("acct").await, Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(50),
            ..FakeProvider::default()
        });
        manager.register_provider("acct", provider.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_valid_token("acct").await
            }));
        }
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(provider.authenticated(), 1);
        assert!(tokens.iter().all(|t| *t == tokens[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(50),
            fail_authenticate: true,
            ..FakeProvider::default()
        });
        manager.register_provider("acct", provider.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_valid_token("acct").await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "authentication failed: attempt 1 rejected");
        }
        assert_eq!(provider.authenticated(), 1);

        // A later, non-concurrent call makes a fresh attempt.
        let err = manager.get_valid_token("acct").await.unwrap_err();
        assert_eq!(err.to_string(), "authentication failed: attempt 2 rejected");
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            lifetime_secs: Some(3600),
            ..FakeProvider::default()
        });
        manager.register_provider("acct", provider.clone()).await;
        manager.store().put(expired("acct")).await.unwrap();

        let credential = manager.get_valid_token("acct").await.unwrap();
        assert_eq!(credential.access_token, "at_refresh_1");
        assert_eq!(provider.refreshed(), 1);
        assert_eq!(provider.authenticated(), 0);
        assert_eq!(manager.store().get("acct").await, Some(credential));
    }

    #[tokio::test]
    async fn refresh_failure_discards_credential_then_reauthenticates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            fail_refresh: true,
            ..FakeProvider::default()
        });
        manager.register_provider("acct", provider.clone()).await;
        manager.store().put(expired("acct")).await.unwrap();

        let err = manager.get_valid_token("acct").await.unwrap_err();
        assert!(matches!(err, Error::Refresh(_)));
        assert_eq!(provider.authenticated(), 0, "no fallback to authenticate");
        assert!(manager.store().get("acct").await.is_none());

        let credential = manager.get_valid_token("acct").await.unwrap();
        assert_eq!(credential.access_token, "at_auth_1");
        assert_eq!(provider.authenticated(), 1);
    }

    #[tokio::test]
    async fn expired_without_refresh_token_authenticates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider::default());
        manager.register_provider("acct", provider.clone()).await;
        let stale = Credential::new("acct", "at_old")
            .with_expires_at(Utc::now() - TimeDelta::seconds(1));
        manager.store().put(stale).await.unwrap();

        let credential = manager.get_valid_token("acct").await.unwrap();
        assert_eq!(credential.access_token, "at_auth_1");
        assert_eq!(provider.refreshed(), 0);
    }

    #[tokio::test]
    async fn revoke_removes_credential_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider::default());
        manager.register_provider("acct", provider.clone()).await;

        manager.get_valid_token("acct").await.unwrap();
        assert!(manager.revoke("acct").await.unwrap().is_some());
        assert!(manager.store().get("acct").await.is_none());
        assert!(manager.is_registered("acct").await);
        assert!(manager.revoke("acct").await.unwrap().is_none());

        manager.get_valid_token("acct").await.unwrap();
        assert_eq!(provider.authenticated(), 2);
    }

    #[tokio::test]
    async fn provider_account_key_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        manager
            .register_provider("timeline", Arc::new(FakeProvider::default()))
            .await;

        let credential = manager.get_valid_token("timeline").await.unwrap();
        assert_eq!(credential.account_key, "timeline");
        assert_eq!(manager.store().account_keys().await, vec!["timeline".to_string()]);
    }

    #[tokio::test]
    async fn refresh_expiring_only_touches_soon_to_expire() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            lifetime_secs: Some(3600),
            ..FakeProvider::default()
        });
        manager.register_provider("soon", provider.clone()).await;
        manager.register_provider("later", provider.clone()).await;

        let soon = Credential::new("soon", "at_soon")
            .with_expires_at(Utc::now() + TimeDelta::seconds(60))
            .with_refresh_token("rt");
        let later = Credential::new("later", "at_later")
            .with_expires_at(Utc::now() + TimeDelta::seconds(7200))
            .with_refresh_token("rt");
        manager.store().put(soon).await.unwrap();
        manager.store().put(later).await.unwrap();

        let refreshed = manager.refresh_expiring(Duration::from_secs(600)).await;
        assert_eq!(refreshed, 1);
        assert_eq!(provider.refreshed(), 1);
        assert_eq!(
            manager.store().get("soon").await.unwrap().access_token,
            "at_refresh_1"
        );
        assert_eq!(
            manager.store().get("later").await.unwrap().access_token,
            "at_later"
        );
    }

    #[tokio::test]
    async fn refresh_expiring_failure_discards_credential() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            fail_refresh: true,
            ..FakeProvider::default()
        });
        manager.register_provider("acct", provider.clone()).await;
        manager.store().put(expired("acct")).await.unwrap();

        assert_eq!(manager.refresh_expiring(Duration::from_secs(600)).await, 0);
        assert!(manager.store().get("acct").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_refreshes_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let provider = Arc::new(FakeProvider {
            lifetime_secs: Some(3600),
            ..FakeProvider::default()
        });
        manager.register_provider("acct", provider.clone()).await;
        manager.store().put(expired("acct")).await.unwrap();

        let handle = manager.spawn_refresh_task(Duration::from_secs(300), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.refreshed(), 0, "first tick is skipped");

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(provider.refreshed(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn attempts_are_counted_by_kind() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        manager
            .register_provider("acct", Arc::new(FakeProvider::default()))
            .await;
        manager.get_valid_token("acct").await.unwrap();

        let output = handle.render();
        assert!(output.contains("credential_attempts_total"), "output: {output}");
        assert!(output.contains("kind=\"authenticate\""));
        assert!(output.contains("outcome=\"success\""));
    }
}

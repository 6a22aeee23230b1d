//! Tollgate
//!
//! Single-binary service that shares rate limits and OAuth credentials
//! between processes:
//! 1. Loads named sliding-window limiters, optionally persisted to disk
//! 2. Registers an OAuth client-credentials provider per external account
//! 3. Refreshes expiring credentials in the background
//! 4. Serves admissions and tokens over HTTP until SIGTERM/SIGINT

mod api;
mod config;
mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use credentials::{CredentialManager, CredentialStore, OAuthClientProvider};
use throttle::{FileStateStore, RateLimiter, StateStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, build_router};
use crate::config::{Config, CredentialsConfig};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for token endpoint requests.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One limiter per `[[limiters]]` entry, keyed by name. With `[state]`
/// configured every limiter persists to `{dir}/{name}.json`.
fn build_limiters(config: &Config) -> Result<HashMap<String, Arc<RateLimiter>>> {
    let store: Option<Arc<dyn StateStore>> = config
        .state
        .as_ref()
        .map(|state| Arc::new(FileStateStore::new(&state.dir)) as Arc<dyn StateStore>);

    let mut limiters = HashMap::new();
    for limiter_config in &config.limiters {
        let mut limiter = RateLimiter::new(limiter_config.calls, limiter_config.period())
            .with_context(|| format!("invalid limiter {}", limiter_config.name))?
            .with_key(limiter_config.name.clone());
        if let Some(store) = &store {
            limiter = limiter.with_store(Arc::clone(store));
        }
        info!(
            name = %limiter_config.name,
            calls = limiter_config.calls,
            period_secs = limiter_config.period_secs,
            "limiter configured"
        );
        limiters.insert(limiter_config.name.clone(), Arc::new(limiter));
    }
    Ok(limiters)
}

/// Load the credential store and register one OAuth provider per account.
async fn build_credentials(
    config: &CredentialsConfig,
    client: &reqwest::Client,
) -> Result<Arc<CredentialManager>> {
    let store = CredentialStore::load(config.path.clone())
        .await
        .with_context(|| format!("failed to load credentials from {}", config.path.display()))?;
    let manager = Arc::new(CredentialManager::new(store));

    for account in &config.accounts {
        let secret = account
            .client_secret
            .clone()
            .with_context(|| format!("account {} has no client secret", account.account_key))?;
        let provider = OAuthClientProvider::new(
            client.clone(),
            account.account_key.clone(),
            account.token_endpoint.clone(),
            account.client_id.clone(),
            secret,
        )
        .with_scopes(account.scopes.clone());
        manager
            .register_provider(account.account_key.clone(), Arc::new(provider))
            .await;
    }

    Ok(manager)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting tollgate");

    // Install before any limiter or manager emits metrics
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        limiters = config.limiters.len(),
        accounts = config.credentials.as_ref().map_or(0, |c| c.accounts.len()),
        persisted = config.state.is_some(),
        "configuration loaded"
    );

    let limiters = Arc::new(build_limiters(&config)?);

    let client = reqwest::Client::builder()
        .timeout(TOKEN_REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let (credentials, refresh_task) = match &config.credentials {
        Some(credentials_config) => {
            let manager = build_credentials(credentials_config, &client).await?;
            let task = manager.spawn_refresh_task(
                credentials_config.refresh_interval(),
                credentials_config.refresh_threshold(),
            );
            (Some(manager), Some(task))
        }
        None => (None, None),
    };

    let app_state = AppState {
        limiters: Arc::clone(&limiters),
        credentials,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(task) = refresh_task {
        task.abort();
    }

    // Final window flush for every limiter
    for (name, limiter) in limiters.iter() {
        if let Err(e) = limiter.close().await {
            warn!(name = %name, error = %e, "failed to persist limiter on shutdown");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

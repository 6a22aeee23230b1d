//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > `tollgate.toml`.
//! Client secrets are never stored in the TOML: each account names an env
//! var (`client_secret_env`) or a file (`client_secret_file`), env winning.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub state: Option<StateConfig>,
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where limiter windows are persisted. Absent means in-memory only.
#[derive(Debug, Deserialize)]
pub struct StateConfig {
    pub dir: PathBuf,
}

/// One named sliding-window limiter
#[derive(Debug, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    pub calls: usize,
    pub period_secs: f64,
}

impl LimiterConfig {
    /// Only call on a validated config; `validate` rejects out-of-range periods.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_secs)
    }
}

/// Credential store and the accounts it manages
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    pub path: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl CredentialsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }
}

/// OAuth2 client registration for one external account
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    pub account_key: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Resolved from `client_secret_env` / `client_secret_file` at load time
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    600
}

/// Limiter names double as state file names.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Config {
    /// Load configuration from a TOML file, validate it and resolve secrets.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(credentials) = config.credentials.as_mut() {
            for account in &mut credentials.accounts {
                let secret = Secret::resolve(
                    account.client_secret_env.as_deref(),
                    account.client_secret_file.as_deref(),
                )?;
                if secret.is_none() {
                    return Err(common::Error::Config(format!(
                        "account {}: no client secret (set client_secret_env or client_secret_file)",
                        account.account_key
                    )));
                }
                account.client_secret = secret;
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let mut names = HashSet::new();
        for limiter in &self.limiters {
            if !valid_name(&limiter.name) {
                return Err(common::Error::Config(format!(
                    "limiter name must be non-empty and use only [A-Za-z0-9_-], got: {:?}",
                    limiter.name
                )));
            }
            if !names.insert(limiter.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate limiter name: {}",
                    limiter.name
                )));
            }
            if limiter.calls == 0 {
                return Err(common::Error::Config(format!(
                    "limiter {}: calls must be greater than 0",
                    limiter.name
                )));
            }
            if !Duration::try_from_secs_f64(limiter.period_secs).is_ok_and(|d| !d.is_zero()) {
                return Err(common::Error::Config(format!(
                    "limiter {}: period_secs must be a positive number of seconds, got: {}",
                    limiter.name, limiter.period_secs
                )));
            }
        }

        if let Some(credentials) = &self.credentials {
            if credentials.refresh_interval_secs == 0 {
                return Err(common::Error::Config(
                    "refresh_interval_secs must be greater than 0".into(),
                ));
            }
            let mut keys = HashSet::new();
            for account in &credentials.accounts {
                if account.account_key.is_empty() {
                    return Err(common::Error::Config("account_key must not be empty".into()));
                }
                if !keys.insert(account.account_key.as_str()) {
                    return Err(common::Error::Config(format!(
                        "duplicate account_key: {}",
                        account.account_key
                    )));
                }
                if !account.token_endpoint.starts_with("http://")
                    && !account.token_endpoint.starts_with("https://")
                {
                    return Err(common::Error::Config(format!(
                        "account {}: token_endpoint must start with http:// or https://, got: {}",
                        account.account_key, account.token_endpoint
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("tollgate.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("tollgate.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn load_str(contents: &str) -> common::Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        Config::load(&write_config(&dir, contents))
    }

    const MINIMAL: &str = r#"
[server]
listen_addr = "127.0.0.1:8700"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = load_str(MINIMAL).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8700);
        assert_eq!(config.server.max_connections, 1000);
        assert!(config.state.is_none());
        assert!(config.limiters.is_empty());
        assert!(config.credentials.is_none());
    }

    #[test]
    fn limiters_parse() {
        let config = load_str(
            r#"
[server]
listen_addr = "127.0.0.1:8700"
max_connections = 64

[state]
dir = "/var/lib/tollgate/limits"

[[limiters]]
name = "timeline-post"
calls = 300
period_secs = 900.0

[[limiters]]
name = "search"
calls = 1
period_secs = 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(
            config.state.unwrap().dir,
            PathBuf::from("/var/lib/tollgate/limits")
        );
        assert_eq!(config.limiters.len(), 2);
        assert_eq!(config.limiters[0].name, "timeline-post");
        assert_eq!(config.limiters[0].period(), Duration::from_secs(900));
        assert_eq!(config.limiters[1].period(), Duration::from_millis(500));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/nonexistent/tollgate.toml")).is_err());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(matches!(
            load_str("not valid {{{{ toml"),
            Err(common::Error::Toml(_))
        ));
    }

    fn assert_config_error(contents: &str, needle: &str) {
        match load_str(contents) {
            Err(common::Error::Config(msg)) => {
                assert!(msg.contains(needle), "expected {needle:?} in {msg:?}")
            }
            Err(other) => panic!("expected config error, got {other}"),
            Ok(_) => panic!("expected config error containing {needle:?}"),
        }
    }

    #[test]
    fn zero_max_connections_rejected() {
        assert_config_error(
            r#"
[server]
listen_addr = "127.0.0.1:8700"
max_connections = 0
"#,
            "max_connections",
        );
    }

    #[test]
    fn limiter_validation() {
        let limiter = |name: &str, calls: usize, period: &str| {
            format!(
                "{MINIMAL}\n[[limiters]]\nname = \"{name}\"\ncalls = {calls}\nperiod_secs = {period}\n"
            )
        };
        assert_config_error(&limiter("", 1, "1.0"), "limiter name");
        assert_config_error(&limiter("../up", 1, "1.0"), "limiter name");
        assert_config_error(&limiter("ok", 0, "1.0"), "calls must be greater than 0");
        assert_config_error(&limiter("ok", 1, "0.0"), "period_secs");
        assert_config_error(&limiter("ok", 1, "-5.0"), "period_secs");
        assert_config_error(&limiter("ok", 1, "nan"), "period_secs");
        assert_config_error(&limiter("ok", 1, "1e300"), "period_secs");
        assert_config_error(&limiter("ok", 1, "inf"), "period_secs");

        let twice = format!(
            "{}{}",
            limiter("dup", 1, "1.0"),
            "\n[[limiters]]\nname = \"dup\"\ncalls = 2\nperiod_secs = 2.0\n"
        );
        assert_config_error(&twice, "duplicate limiter name");
    }

    fn account_toml(secret_line: &str) -> String {
        format!(
            r#"{MINIMAL}
[credentials]
path = "/tmp/tokens.json"

[[credentials.accounts]]
account_key = "timeline"
token_endpoint = "https://auth.example.com/oauth2/token"
client_id = "abc"
scopes = ["tweet.read", "offline.access"]
{secret_line}
"#
        )
    }

    #[test]
    fn client_secret_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("TOLLGATE_TEST_SECRET_ENV", "s3cret-env") };

        let config = load_str(&account_toml(
            "client_secret_env = \"TOLLGATE_TEST_SECRET_ENV\"",
        ))
        .unwrap();
        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.refresh_interval(), Duration::from_secs(300));
        assert_eq!(credentials.refresh_threshold(), Duration::from_secs(600));
        let account = &credentials.accounts[0];
        assert_eq!(account.scopes, vec!["tweet.read", "offline.access"]);
        assert_eq!(
            account.client_secret.as_ref().unwrap().expose(),
            "s3cret-env"
        );

        unsafe { remove_env("TOLLGATE_TEST_SECRET_ENV") };
    }

    #[test]
    fn client_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "s3cret-file\n").unwrap();

        let config = load_str(&account_toml(&format!(
            "client_secret_file = \"{}\"",
            secret_path.display()
        )))
        .unwrap();
        let account = &config.credentials.unwrap().accounts[0];
        assert_eq!(
            account.client_secret.as_ref().unwrap().expose(),
            "s3cret-file"
        );
    }

    #[test]
    fn missing_client_secret_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("TOLLGATE_TEST_SECRET_UNSET") };
        assert_config_error(
            &account_toml("client_secret_env = \"TOLLGATE_TEST_SECRET_UNSET\""),
            "no client secret",
        );
    }

    #[test]
    fn token_endpoint_needs_scheme() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("TOLLGATE_TEST_SECRET_SCHEME", "x") };
        let contents = account_toml("client_secret_env = \"TOLLGATE_TEST_SECRET_SCHEME\"")
            .replace("https://auth.example.com", "auth.example.com");
        assert_config_error(&contents, "token_endpoint must start with http");
        unsafe { remove_env("TOLLGATE_TEST_SECRET_SCHEME") };
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("TOLLGATE_TEST_SECRET_DEBUG", "do-not-print") };
        let config = load_str(&account_toml(
            "client_secret_env = \"TOLLGATE_TEST_SECRET_DEBUG\"",
        ))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("do-not-print"));
        unsafe { remove_env("TOLLGATE_TEST_SECRET_DEBUG") };
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("tollgate.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}

//! Turns a [`ConnectionConfig`] into a MySQL connection string.
//!
//! The string is scheme-less (`user:pass@host:port/db?params`); drivers add
//! their own scheme when opening it.

use sqlbatch_secrets::SecretFetcher;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::ConnectionConfig;
use crate::error::ConfigError;

const SCHEME_PREFIX: &str = "mysql://";

/// Resolves credentials, consulting the secret fetcher only when needed.
#[derive(Clone)]
pub struct CredentialResolver {
    fetcher: SecretFetcher,
}

impl CredentialResolver {
    pub fn new(fetcher: SecretFetcher) -> Self {
        Self { fetcher }
    }

    /// Resolver sharing the process-wide SSM-backed fetcher.
    pub fn global() -> Self {
        Self::new(SecretFetcher::global().clone())
    }

    /// Build the connection string for `config`.
    ///
    /// An explicit DSN is returned verbatim (minus any `mysql://` prefix)
    /// without touching the secret store. Cancelling `cancel` abandons the
    /// wait for a remote password; a fetch shared with other callers keeps
    /// running for them.
    pub async fn resolve(
        &self,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<String, ConfigError> {
        if let Some(dsn) = config.dsn.as_deref().filter(|d| !d.is_empty()) {
            debug!("using explicit dsn");
            return Ok(dsn.strip_prefix(SCHEME_PREFIX).unwrap_or(dsn).to_string());
        }

        let password = if config.needs_remote_password() {
            let name = config.password_ssm_parameter_name.as_deref().unwrap_or_default();
            let json_key = config.password_ssm_parameter_json_key.as_deref();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConfigError::Cancelled),
                fetched = self.fetcher.fetch(name, json_key) => fetched?,
            }
        } else {
            config.password.clone().unwrap_or_default()
        };

        compose(config, &password)
    }
}

/// Assemble a percent-encoded connection string from structured fields.
fn compose(config: &ConnectionConfig, password: &str) -> Result<String, ConfigError> {
    let invalid = |what: &str| ConfigError::InvalidDsn(format!("{what} rejected for host `{}`", config.host));

    let mut url = Url::parse(&format!("{}{}:{}/", SCHEME_PREFIX, config.host, config.port))
        .map_err(|e| ConfigError::InvalidDsn(e.to_string()))?;
    url.set_username(&config.user).map_err(|_| invalid("user"))?;
    if !password.is_empty() {
        url.set_password(Some(password)).map_err(|_| invalid("password"))?;
    }
    url.set_path(&config.database);
    if let Some(location) = config.location.as_deref().filter(|l| !l.is_empty()) {
        url.query_pairs_mut().append_pair("timezone", location);
    }

    let full = url.to_string();
    Ok(full.strip_prefix(SCHEME_PREFIX).unwrap_or(&full).to_string())
}

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix shared by every environment variable this crate reads.
const ENV_PREFIX: &str = "MYSQLBATCH_";

const DEFAULT_USER: &str = "root";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3306;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── ConnectionConfig ──────────────────────────────────────────

/// Where and as whom to connect.
///
/// An explicit `dsn` always wins over the structured fields. Without one,
/// the password is taken literally when present, otherwise resolved from
/// the SSM parameter named by `password_ssm_parameter_name`.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub dsn: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Session time zone, e.g. `Asia/Tokyo` or `+09:00`.
    pub location: Option<String>,
    pub password_ssm_parameter_name: Option<String>,
    /// Field to extract when the SSM parameter holds a JSON object.
    pub password_ssm_parameter_json_key: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            user: DEFAULT_USER.to_string(),
            password: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: String::new(),
            location: None,
            password_ssm_parameter_name: None,
            password_ssm_parameter_json_key: None,
        }
    }
}

impl ConnectionConfig {
    /// Build config from `MYSQLBATCH_*` environment variables (call
    /// [`load_dotenv`] first). Empty values count as unset.
    pub fn from_env() -> Self {
        Self {
            dsn: env_opt("DSN"),
            user: env_or("USER", DEFAULT_USER),
            password: env_opt("PASSWORD"),
            host: env_or("HOST", DEFAULT_HOST),
            port: env_u16("PORT", DEFAULT_PORT),
            database: env_or("DATABASE", ""),
            location: env_opt("LOCATION"),
            password_ssm_parameter_name: env_opt("PASSWORD_SSM_PARAMETER_NAME"),
            password_ssm_parameter_json_key: env_opt("PASSWORD_SSM_PARAMETER_JSON_KEY"),
        }
    }

    /// A copy of this config with every set override applied.
    ///
    /// `self` is left untouched so one base config can serve many invocations.
    pub fn with_overrides(&self, overrides: &ConnectionOverrides) -> Self {
        let mut cfg = self.clone();
        if let Some(dsn) = &overrides.dsn {
            cfg.dsn = Some(dsn.clone());
        }
        if let Some(user) = &overrides.user {
            cfg.user = user.clone();
        }
        if let Some(password) = &overrides.password {
            cfg.password = Some(password.clone());
        }
        if let Some(host) = &overrides.host {
            cfg.host = host.clone();
        }
        if let Some(port) = overrides.port {
            cfg.port = port;
        }
        if let Some(database) = &overrides.database {
            cfg.database = database.clone();
        }
        if let Some(location) = &overrides.location {
            cfg.location = Some(location.clone());
        }
        if let Some(name) = &overrides.password_ssm_parameter_name {
            cfg.password_ssm_parameter_name = Some(name.clone());
        }
        if let Some(key) = &overrides.password_ssm_parameter_json_key {
            cfg.password_ssm_parameter_json_key = Some(key.clone());
        }
        cfg
    }

    /// True when the password has to come from the secret store.
    pub fn needs_remote_password(&self) -> bool {
        self.password.as_deref().map_or(true, str::is_empty)
            && self
                .password_ssm_parameter_name
                .as_deref()
                .is_some_and(|name| !name.is_empty())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        if self.dsn.is_some() {
            tracing::info!("connection: explicit dsn");
            return;
        }
        tracing::info!(
            user = %self.user,
            host = %self.host,
            port = self.port,
            database = %self.database,
            location = self.location.as_deref().unwrap_or("(server default)"),
            password_source = if self.needs_remote_password() { "ssm" } else { "literal" },
            "connection settings"
        );
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("dsn", &self.dsn.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("location", &self.location)
            .field("password_ssm_parameter_name", &self.password_ssm_parameter_name)
            .field("password_ssm_parameter_json_key", &self.password_ssm_parameter_json_key)
            .finish()
    }
}

/// Per-invocation replacements for [`ConnectionConfig`] fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionOverrides {
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub password_ssm_parameter_name: Option<String>,
    #[serde(default)]
    pub password_ssm_parameter_json_key: Option<String>,
}

// ── Tests ────────────────────────────────────────────────────────

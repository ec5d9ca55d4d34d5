use thiserror::Error;

use sqlbatch_secrets::SecretError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("resolve password failed: {0}")]
    Secret(#[from] SecretError),

    #[error("invalid connection settings: {0}")]
    InvalidDsn(String),

    #[error("credential resolution cancelled")]
    Cancelled,
}

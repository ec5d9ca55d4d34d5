use sqlbatch_core::ConfigError;

use crate::session::SessionError;
use crate::template::TemplateError;

/// Errors surfaced by a batch run.
///
/// Nothing is retried internally; the caller decides what a failure means.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The script could not be read.
    #[error("read query input failed: {0}")]
    Scan(#[from] std::io::Error),

    /// Rendering failed; no statement was executed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Credential resolution failed; no connection was opened.
    #[error(transparent)]
    Config(ConfigError),

    #[error("mysql connect failed: {0}")]
    Connect(#[source] SessionError),

    /// A statement failed. Statements before it stay applied.
    #[error("execute query `{statement}` failed: {source}")]
    StatementExecution {
        statement: String,
        #[source]
        source: SessionError,
    },

    /// The caller cancelled the batch.
    #[error("batch cancelled")]
    Cancelled,

    /// The closing server-time query failed or returned something unparseable.
    #[error("get db time failed: {0}")]
    TimeCheck(String),

    #[error("close db failed: {0}")]
    Close(#[source] SessionError),

    #[error("executer is closed")]
    Closed,
}

impl From<ConfigError> for BatchError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Cancelled => BatchError::Cancelled,
            other => BatchError::Config(other),
        }
    }
}

impl BatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BatchError::Cancelled)
    }
}

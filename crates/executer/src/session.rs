//! Database session boundary and its MySQL implementation.
//!
//! A [`Session`] is one exclusive connection. Statements go over MySQL's
//! text protocol so every cell comes back as text, without typed decoding.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlConnection, MySqlQueryResult, MySqlRow};
use sqlx::{Column, Connection, Executor, Row, ValueRef};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised by the database layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// The statement was abandoned because the caller cancelled.
    #[error("statement cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Column names plus NULL-aware textual rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Command result of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// One exclusive database connection.
#[async_trait]
pub trait Session: Send {
    /// Run a statement that returns rows and materialize all of them.
    ///
    /// Returns [`SessionError::Cancelled`] if `cancel` fires first.
    async fn query(&mut self, sql: &str, cancel: &CancellationToken) -> Result<RowSet, SessionError>;

    /// Run a statement for its side effects.
    ///
    /// Returns [`SessionError::Cancelled`] if `cancel` fires first.
    async fn exec(&mut self, sql: &str, cancel: &CancellationToken) -> Result<ExecSummary, SessionError>;

    /// Close the connection.
    async fn close(self: Box<Self>) -> Result<(), SessionError>;
}

/// Opens sessions from a scheme-less connection string.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, connection_string: &str) -> Result<Box<dyn Session>, SessionError>;
}

/// Connects to MySQL through sqlx.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnector;

#[async_trait]
impl Connector for MySqlConnector {
    async fn open(&self, connection_string: &str) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(MySqlSession::open(connection_string).await?))
    }
}

/// A single MySQL connection; there is no pool.
///
/// A statement dropped mid-flight leaves the wire protocol out of step, so
/// after a cancel the session refuses further work and is dropped on close.
pub struct MySqlSession {
    conn: MySqlConnection,
    abandoned: bool,
}

impl MySqlSession {
    pub async fn open(connection_string: &str) -> Result<Self, SessionError> {
        let bare = connection_string
            .strip_prefix("mysql://")
            .unwrap_or(connection_string);
        let conn = MySqlConnection::connect(&format!("mysql://{bare}")).await?;
        info!("MySQL session opened");
        Ok(Self { conn, abandoned: false })
    }

    fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.abandoned {
            return Err(SessionError::Other(
                "session unusable after a cancelled statement".into(),
            ));
        }
        Ok(())
    }

    /// Column names for a statement that returned no rows.
    async fn describe_columns(&mut self, sql: &str) -> Vec<String> {
        match (&mut self.conn).describe(sql).await {
            Ok(described) => described
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            Err(e) => {
                debug!(error = %e, "could not describe empty result, reporting no columns");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn query(&mut self, sql: &str, cancel: &CancellationToken) -> Result<RowSet, SessionError> {
        self.ensure_usable()?;
        let work: BoxFuture<'_, Result<Vec<MySqlRow>, sqlx::Error>> =
            (&mut self.conn).fetch_all(sqlx::raw_sql(sql));
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            rows = work => Some(rows),
        };
        let Some(rows) = fetched else {
            self.abandoned = true;
            return Err(SessionError::Cancelled);
        };
        let rows = rows?;

        let columns = match rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => self.describe_columns(sql).await,
        };
        let rows = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| cell_text(row, i))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, SessionError>>()?;

        Ok(RowSet { columns, rows })
    }

    async fn exec(&mut self, sql: &str, cancel: &CancellationToken) -> Result<ExecSummary, SessionError> {
        self.ensure_usable()?;
        let work: BoxFuture<'_, Result<MySqlQueryResult, sqlx::Error>> =
            (&mut self.conn).execute(sqlx::raw_sql(sql));
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            done = work => Some(done),
        };
        let Some(done) = executed else {
            self.abandoned = true;
            return Err(SessionError::Cancelled);
        };
        let done = done?;
        Ok(ExecSummary {
            rows_affected: done.rows_affected(),
            last_insert_id: done.last_insert_id(),
        })
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        if self.abandoned {
            warn!("dropping MySQL session abandoned mid-statement");
            return Ok(());
        }
        self.conn.close().await?;
        info!("MySQL session closed");
        Ok(())
    }
}

/// Text-protocol cell as a string; `None` for SQL NULL.
fn cell_text(row: &MySqlRow, idx: usize) -> Result<Option<String>, SessionError> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(None);
    }
    let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

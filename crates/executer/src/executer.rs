//! Sequential batch execution over one exclusive database session.
//!
//! A batch goes through rendering, scanning and execution, then a closing
//! server-time query. Only one batch runs per [`Executer`] at a time; a
//! second caller waits for the first to finish.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use sqlbatch_core::{ConnectionConfig, CredentialResolver};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BatchError;
use crate::hooks::{ExecuteObserver, PrefixClassifier, SelectObserver, StatementClassifier};
use crate::outcome::{BatchResult, ExecutionOutcome, ReadOutcome, WriteOutcome};
use crate::scanner::QueryScanner;
use crate::session::{Connector, MySqlConnector, Session, SessionError};
use crate::template::{RenderOptions, TemplateRenderer};

/// Query used to read the server clock after a batch: the session's wall
/// clock, then the same moment as Unix epoch seconds.
pub const DEFAULT_TIME_CHECK_QUERY: &str = "SELECT NOW(6), UNIX_TIMESTAMP(NOW(6))";

/// Server clock reading taken after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTime {
    /// Wall clock in the session time zone.
    pub local: NaiveDateTime,
    /// The same instant in milliseconds since the Unix epoch.
    pub unix_milli: i64,
}

struct State {
    session: Option<Box<dyn Session>>,
    last_execute_time: Option<ServerTime>,
}

/// Runs templated SQL batches against a single session. There is no parallelism.
pub struct Executer {
    state: Mutex<State>,
    renderer: TemplateRenderer,
    select_observer: Option<Box<dyn SelectObserver>>,
    execute_observer: Option<Box<dyn ExecuteObserver>>,
    classifier: Box<dyn StatementClassifier>,
    time_check_query: String,
    dump_sql: bool,
}

impl Executer {
    /// Resolve credentials through the process-wide secret fetcher and connect to MySQL.
    pub async fn connect(config: &ConnectionConfig, cancel: &CancellationToken) -> Result<Self, BatchError> {
        Self::connect_with(config, &CredentialResolver::global(), &MySqlConnector, cancel).await
    }

    pub async fn connect_with(
        config: &ConnectionConfig,
        resolver: &CredentialResolver,
        connector: &dyn Connector,
        cancel: &CancellationToken,
    ) -> Result<Self, BatchError> {
        let connection_string = resolver.resolve(config, cancel).await?;
        Self::open_with(connector, &connection_string).await
    }

    /// Connect to MySQL with an already resolved connection string.
    pub async fn open(connection_string: &str) -> Result<Self, BatchError> {
        Self::open_with(&MySqlConnector, connection_string).await
    }

    pub async fn open_with(connector: &dyn Connector, connection_string: &str) -> Result<Self, BatchError> {
        let session = connector
            .open(connection_string)
            .await
            .map_err(BatchError::Connect)?;
        Ok(Self::with_session(session))
    }

    /// Wrap an open session.
    pub fn with_session(session: Box<dyn Session>) -> Self {
        Self {
            state: Mutex::new(State {
                session: Some(session),
                last_execute_time: None,
            }),
            renderer: TemplateRenderer::default(),
            select_observer: None,
            execute_observer: None,
            classifier: Box::new(PrefixClassifier::default()),
            time_check_query: DEFAULT_TIME_CHECK_QUERY.to_string(),
            dump_sql: false,
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn set_select_observer(&mut self, observer: impl SelectObserver + 'static) {
        self.select_observer = Some(Box::new(observer));
    }

    pub fn set_execute_observer(&mut self, observer: impl ExecuteObserver + 'static) {
        self.execute_observer = Some(Box::new(observer));
    }

    /// Replace the built-in `SELECT` / `SHOW` / `\` prefix check entirely.
    pub fn set_classifier(&mut self, classifier: impl StatementClassifier + 'static) {
        self.classifier = Box::new(classifier);
    }

    /// Server-time query for databases without `NOW()`.
    ///
    /// The first column is the wall clock. An optional second column holds
    /// Unix epoch seconds; without it the wall clock is taken as UTC.
    pub fn set_time_check_query(&mut self, query: impl Into<String>) {
        self.time_check_query = query.into();
    }

    pub fn set_render_options(&mut self, options: RenderOptions) {
        self.renderer = TemplateRenderer::new(options);
    }

    /// Log every rendered script before it is split into statements.
    pub fn set_sql_dump(&mut self, enabled: bool) {
        self.dump_sql = enabled;
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Read the whole script from `reader`, then run it like [`Executer::execute`].
    pub async fn execute_reader<R>(
        &self,
        cancel: &CancellationToken,
        mut reader: R,
        vars: &HashMap<String, String>,
    ) -> Result<BatchResult, BatchError>
    where
        R: AsyncRead + Unpin,
    {
        let mut script = String::new();
        reader.read_to_string(&mut script).await?;
        self.execute(cancel, &script, vars).await
    }

    /// Render `script`, run each statement in order, then record the server time.
    ///
    /// `cancel` is checked before every statement and handed to the session,
    /// which abandons a statement still running when it fires. Statements
    /// that already completed stay applied. The closing time check is not
    /// cancellable: once the last statement succeeds the batch succeeds.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        script: &str,
        vars: &HashMap<String, String>,
    ) -> Result<BatchResult, BatchError> {
        let mut state = self.state.lock().await;
        let State {
            session,
            last_execute_time,
        } = &mut *state;
        let session = session.as_deref_mut().ok_or(BatchError::Closed)?;

        let outcomes = self.run(session, cancel, script, vars).await?;
        let executed_at = self.server_time(session).await?;
        *last_execute_time = Some(executed_at);

        info!(
            statements = outcomes.len(),
            last_execute_time = %executed_at.local,
            last_execute_unix_milli = executed_at.unix_milli,
            "batch complete"
        );
        Ok(BatchResult {
            outcomes,
            last_execute_time: executed_at.local,
            last_execute_unix_milli: executed_at.unix_milli,
        })
    }

    /// Server time recorded by the last successful batch.
    pub async fn last_execute_time(&self) -> Option<NaiveDateTime> {
        self.state.lock().await.last_execute_time.map(|t| t.local)
    }

    /// [`Executer::last_execute_time`] as milliseconds since the Unix epoch.
    pub async fn last_execute_unix_milli(&self) -> Option<i64> {
        self.state.lock().await.last_execute_time.map(|t| t.unix_milli)
    }

    /// Close the session. Later batches fail with [`BatchError::Closed`].
    pub async fn close(&self) -> Result<(), BatchError> {
        let session = self.state.lock().await.session.take();
        match session {
            Some(session) => session.close().await.map_err(BatchError::Close),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn run(
        &self,
        session: &mut dyn Session,
        cancel: &CancellationToken,
        script: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Vec<ExecutionOutcome>, BatchError> {
        let rendered = self.renderer.render(script, vars)?;
        if self.dump_sql {
            info!(sql = %rendered, "rendered sql");
        }

        let mut outcomes = Vec::new();
        for statement in QueryScanner::new(&rendered) {
            if statement.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                warn!(executed = outcomes.len(), "batch cancelled");
                return Err(BatchError::Cancelled);
            }

            let outcome = if self.classifier.is_read(&statement) {
                self.read(session, cancel, statement).await?
            } else {
                self.write(session, cancel, statement).await?
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn read(
        &self,
        session: &mut dyn Session,
        cancel: &CancellationToken,
        statement: String,
    ) -> Result<ExecutionOutcome, BatchError> {
        debug!(statement = %statement, "query");
        let row_set = match session.query(&statement, cancel).await {
            Ok(row_set) => row_set,
            Err(source) => return Err(statement_failed(statement, source)),
        };

        let rows = row_set
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(Option::unwrap_or_default).collect())
            .collect();
        let outcome = ReadOutcome {
            statement,
            columns: row_set.columns,
            rows,
        };
        if let Some(observer) = &self.select_observer {
            observer.on_select(&outcome.statement, &outcome.columns, &outcome.rows);
        }
        Ok(ExecutionOutcome::Read(outcome))
    }

    async fn write(
        &self,
        session: &mut dyn Session,
        cancel: &CancellationToken,
        statement: String,
    ) -> Result<ExecutionOutcome, BatchError> {
        debug!(statement = %statement, "exec");
        let summary = match session.exec(&statement, cancel).await {
            Ok(summary) => summary,
            Err(source) => return Err(statement_failed(statement, source)),
        };

        if let Some(observer) = &self.execute_observer {
            observer.on_execute(&statement, summary.rows_affected, summary.last_insert_id);
        }
        Ok(ExecutionOutcome::Write(WriteOutcome {
            statement,
            rows_affected: summary.rows_affected,
            last_insert_id: summary.last_insert_id,
        }))
    }

    /// Read the server clock. Runs outside the batch's cancellation.
    async fn server_time(&self, session: &mut dyn Session) -> Result<ServerTime, BatchError> {
        let row_set = session
            .query(&self.time_check_query, &CancellationToken::new())
            .await
            .map_err(|e| BatchError::TimeCheck(e.to_string()))?;

        let row = row_set.rows.first();
        let raw = row
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_deref())
            .ok_or_else(|| {
                BatchError::TimeCheck(format!("`{}` returned no value", self.time_check_query))
            })?;
        let local = parse_server_time(raw)
            .ok_or_else(|| BatchError::TimeCheck(format!("scan db time `{raw}` failed")))?;

        let unix_milli = match row.and_then(|row| row.get(1)).and_then(|cell| cell.as_deref()) {
            Some(epoch) => parse_unix_millis(epoch)
                .ok_or_else(|| BatchError::TimeCheck(format!("scan db epoch `{epoch}` failed")))?,
            None => local.and_utc().timestamp_millis(),
        };
        Ok(ServerTime { local, unix_milli })
    }
}

fn statement_failed(statement: String, source: SessionError) -> BatchError {
    match source {
        SessionError::Cancelled => {
            warn!(statement = %statement, "statement abandoned on cancel");
            BatchError::Cancelled
        }
        source => BatchError::StatementExecution { statement, source },
    }
}

/// Parse a server timestamp as MySQL prints it, or as RFC 3339.
///
/// Offsets are dropped: the result is the server's wall-clock reading.
pub fn parse_server_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.naive_local());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Parse `UNIX_TIMESTAMP()` output, e.g. `1714557600.123456`, into milliseconds.
pub fn parse_unix_millis(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds: i64 = whole.parse().ok()?;
    let millis: i64 = format!("{fraction:0<3}")[..3].parse().ok()?;
    let millis = if whole.starts_with('-') { -millis } else { millis };
    seconds.checked_mul(1000)?.checked_add(millis)
}

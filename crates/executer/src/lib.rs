//! Templated SQL batch execution.
//!
//! A script is rendered once through minijinja, split on `;`, and each
//! statement is sent to the session as either a query (rows materialized as
//! text) or a command (rows affected, last insert id). Observers see every
//! result in order; the server clock is read after the last statement.

pub mod error;
pub mod executer;
pub mod hooks;
pub mod invocation;
pub mod outcome;
pub mod scanner;
pub mod session;
pub mod template;

pub use error::BatchError;
pub use executer::{parse_server_time, parse_unix_millis, Executer, ServerTime, DEFAULT_TIME_CHECK_QUERY};
pub use hooks::{ExecuteObserver, PrefixClassifier, SelectObserver, StatementClassifier, TableSelectObserver};
pub use invocation::{InvocationHandler, InvocationRequest, InvocationResponse, QueryResults};
pub use outcome::{BatchResult, ExecutionOutcome, ReadOutcome, WriteOutcome};
pub use scanner::QueryScanner;
pub use session::{Connector, ExecSummary, MySqlConnector, MySqlSession, RowSet, Session, SessionError};
pub use template::{render, RenderOptions, TemplateError, TemplateRenderer};

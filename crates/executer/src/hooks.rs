//! Observer and classifier capabilities plugged into the executer.
//!
//! Each is optional. Observers run synchronously, in statement order, on the
//! task driving the batch.

use crate::outcome::ReadOutcome;

/// Receives the complete result of every read statement.
pub trait SelectObserver: Send + Sync {
    fn on_select(&self, statement: &str, columns: &[String], rows: &[Vec<String>]);
}

/// Receives the command result of every write statement.
pub trait ExecuteObserver: Send + Sync {
    fn on_execute(&self, statement: &str, rows_affected: u64, last_insert_id: u64);
}

/// Decides whether a statement is a read (query) or a write (command).
pub trait StatementClassifier: Send + Sync {
    fn is_read(&self, statement: &str) -> bool;
}

impl<F> SelectObserver for F
where
    F: Fn(&str, &[String], &[Vec<String>]) + Send + Sync,
{
    fn on_select(&self, statement: &str, columns: &[String], rows: &[Vec<String>]) {
        self(statement, columns, rows)
    }
}

impl<F> ExecuteObserver for F
where
    F: Fn(&str, u64, u64) + Send + Sync,
{
    fn on_execute(&self, statement: &str, rows_affected: u64, last_insert_id: u64) {
        self(statement, rows_affected, last_insert_id)
    }
}

impl<F> StatementClassifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_read(&self, statement: &str) -> bool {
        self(statement)
    }
}

/// Built-in classifier: a statement is a read when it starts with one of a
/// set of keywords, compared case-insensitively after trimming whitespace.
///
/// Defaults to `SELECT`, `SHOW` and `\` (client-style meta commands).
#[derive(Debug, Clone)]
pub struct PrefixClassifier {
    prefixes: Vec<String>,
}

impl PrefixClassifier {
    /// Add another read prefix, e.g. `DESCRIBE` or `EXPLAIN`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefixes.push(prefix.to_uppercase());
        self
    }
}

impl Default for PrefixClassifier {
    fn default() -> Self {
        Self {
            prefixes: vec!["SELECT".into(), "SHOW".into(), "\\".into()],
        }
    }
}

impl StatementClassifier for PrefixClassifier {
    fn is_read(&self, statement: &str) -> bool {
        let upper = statement.trim().to_uppercase();
        self.prefixes.iter().any(|p| upper.starts_with(p.as_str()))
    }
}

/// Adapts a `(statement, table)` callback into a [`SelectObserver`] by
/// rendering each result as an aligned text table.
pub struct TableSelectObserver<F> {
    callback: F,
}

impl<F> TableSelectObserver<F>
where
    F: Fn(&str, &str) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> SelectObserver for TableSelectObserver<F>
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn on_select(&self, statement: &str, columns: &[String], rows: &[Vec<String>]) {
        let table = ReadOutcome {
            statement: statement.to_string(),
            columns: columns.to_vec(),
            rows: rows.to_vec(),
        }
        .to_string();
        (self.callback)(statement, &table)
    }
}

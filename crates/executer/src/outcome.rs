use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Result of a write statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub statement: String,
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// Fully materialized result of a read statement.
///
/// Every cell is text; SQL NULL becomes the empty string.
/// Column ordering in each row matches the `columns` vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOutcome {
    pub statement: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Outcome of one statement, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Write(WriteOutcome),
    Read(ReadOutcome),
}

impl ExecutionOutcome {
    pub fn statement(&self) -> &str {
        match self {
            ExecutionOutcome::Write(w) => &w.statement,
            ExecutionOutcome::Read(r) => &r.statement,
        }
    }

    pub fn as_read(&self) -> Option<&ReadOutcome> {
        match self {
            ExecutionOutcome::Read(r) => Some(r),
            ExecutionOutcome::Write(_) => None,
        }
    }
}

/// Everything a successful batch produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub outcomes: Vec<ExecutionOutcome>,
    /// Database server time captured after the last statement, as the
    /// session's wall clock.
    pub last_execute_time: NaiveDateTime,
    /// The same moment in milliseconds since the Unix epoch.
    pub last_execute_unix_milli: i64,
}

impl BatchResult {
    pub fn reads(&self) -> impl Iterator<Item = &ReadOutcome> {
        self.outcomes.iter().filter_map(ExecutionOutcome::as_read)
    }
}

impl ReadOutcome {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at `row` under column `col`, if both exist.
    pub fn get_value(&self, row: usize, col: &str) -> Option<&str> {
        let col_idx = self.column_index(col)?;
        self.rows.get(row)?.get(col_idx).map(String::as_str)
    }
}

impl fmt::Display for ReadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return write!(f, "(empty result set)");
        }

        // Column widths, minimum = header length.
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.chars().count());
                }
            }
        }

        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{:<width$}", col, width = widths[i])?;
        }
        writeln!(f)?;

        for (i, w) in widths.iter().enumerate() {
            if i > 0 {
                write!(f, "-+-")?;
            }
            write!(f, "{}", "-".repeat(*w))?;
        }
        writeln!(f)?;

        for row in &self.rows {
            for (i, cell) in row.iter().enumerate().take(widths.len()) {
                if i > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{:<width$}", cell, width = widths[i])?;
            }
            writeln!(f)?;
        }

        write!(f, "{} rows in set", self.rows.len())
    }
}

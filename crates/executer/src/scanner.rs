//! Splits a rendered script into statements on `;`.
//!
//! The scanner knows nothing about SQL: a `;` inside a string literal or a
//! comment still ends the statement.

/// Lazily yields one statement per `;`-terminated span.
///
/// Text after the last `;` is yielded as a final statement, which may be
/// empty once trimmed; consumers are expected to skip empty statements.
/// Nothing is yielded for an empty remainder.
#[derive(Debug, Clone)]
pub struct QueryScanner<'a> {
    rest: &'a str,
}

impl<'a> QueryScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { rest: text }
    }
}

impl Iterator for QueryScanner<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.rest.is_empty() {
            return None;
        }
        let token = match self.rest.find(';') {
            Some(idx) => {
                let token = &self.rest[..idx];
                self.rest = &self.rest[idx + 1..];
                token
            }
            None => std::mem::take(&mut self.rest),
        };
        Some(normalize(token))
    }
}

/// Collapse each line break to one space and trim spaces and tabs.
pub fn normalize(raw: &str) -> String {
    raw.replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
        .trim_matches([' ', '\t'])
        .to_string()
}

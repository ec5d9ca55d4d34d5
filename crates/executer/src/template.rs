//! Minijinja rendering of SQL scripts.
//!
//! A script is rendered once, as a whole, before it is split into
//! statements. Only a fixed set of globals is registered:
//!
//! - `var(key, default)` / `must_var(key)` read caller-supplied variables
//! - `env(key, default)` / `must_env(key)` read the process environment
//! - `range(stop)`, `range(start, stop)`, `range(start, stop, step)`
//!
//! Rendered values are inserted verbatim unless [`RenderOptions::auto_escape`]
//! is set; callers feeding untrusted variables own the injection risk.

use std::collections::HashMap;
use std::sync::Arc;

use minijinja::value::Rest;
use minijinja::{AutoEscape, Environment, ErrorKind};

/// Errors raised while rendering a script.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("variable {0} is not defined")]
    MissingVariable(String),

    #[error("environment variable {0} is not defined")]
    MissingEnv(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("parse query template failed: {0}")]
    Syntax(String),

    #[error("execute query template failed: {0}")]
    Render(String),
}

/// Per-call rendering switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// HTML-escape every `{{ ... }}` output. Off by default: SQL is not HTML.
    pub auto_escape: bool,
}

/// Renders scripts against a variable mapping and the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer {
    options: RenderOptions,
}

impl TemplateRenderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Render `script` with `vars` bound for `var` / `must_var`.
    pub fn render(&self, script: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
        let env = build_env(Arc::new(vars.clone()), self.options);
        env.render_str(script, minijinja::context! {}).map_err(classify)
    }
}

/// Render with default options.
pub fn render(script: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    TemplateRenderer::default().render(script, vars)
}

fn build_env(vars: Arc<HashMap<String, String>>, options: RenderOptions) -> Environment<'static> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_auto_escape_callback(move |_| {
        if options.auto_escape {
            AutoEscape::Html
        } else {
            AutoEscape::None
        }
    });

    let lookup = Arc::clone(&vars);
    env.add_function("var", move |key: String, default: String| -> String {
        lookup.get(&key).cloned().unwrap_or(default)
    });
    let lookup = vars;
    env.add_function("must_var", move |key: String| -> Result<String, minijinja::Error> {
        lookup
            .get(&key)
            .cloned()
            .ok_or_else(|| fault(TemplateError::MissingVariable(key)))
    });
    env.add_function("env", env_function);
    env.add_function("must_env", must_env_function);
    env.add_function("range", range_function);

    env
}

fn env_function(key: String, default: String) -> String {
    std::env::var(&key).unwrap_or(default)
}

fn must_env_function(key: String) -> Result<String, minijinja::Error> {
    std::env::var(&key).map_err(|_| fault(TemplateError::MissingEnv(key)))
}

fn range_function(args: Rest<i64>) -> Result<Vec<i64>, minijinja::Error> {
    range_sequence(&args).map_err(fault)
}

/// Integer sequence over a half-open interval, walking in the step's direction.
pub fn range_sequence(args: &[i64]) -> Result<Vec<i64>, TemplateError> {
    let (start, stop, step) = match *args {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        [] => {
            return Err(TemplateError::InvalidRange(
                "range requires at least 1 argument, got 0".into(),
            ))
        }
        _ => {
            return Err(TemplateError::InvalidRange(format!(
                "range requires at most 3 arguments, got {}",
                args.len()
            )))
        }
    };

    if step == 0 {
        return Err(TemplateError::InvalidRange("range requires step != 0".into()));
    }
    if (step > 0 && start > stop) || (step < 0 && start < stop) {
        return Err(TemplateError::InvalidRange(
            "range requires start <= stop when step > 0, or start >= stop when step < 0".into(),
        ));
    }

    let mut seq = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        seq.push(i);
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(seq)
}

/// Wrap a typed failure so it survives the trip through minijinja.
fn fault(err: TemplateError) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, err.to_string()).with_source(err)
}

/// Recover the typed failure from a minijinja error, if one is attached.
fn classify(err: minijinja::Error) -> TemplateError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = source {
        if let Some(typed) = e.downcast_ref::<TemplateError>() {
            return typed.clone();
        }
        source = e.source();
    }
    match err.kind() {
        ErrorKind::SyntaxError => TemplateError::Syntax(err.to_string()),
        _ => TemplateError::Render(err.to_string()),
    }
}

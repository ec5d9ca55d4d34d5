//! Request/response adapter for running one batch per invocation, e.g. from a
//! function-as-a-service runtime.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlbatch_core::{ConnectionConfig, ConnectionOverrides, CredentialResolver};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::BatchError;
use crate::executer::Executer;
use crate::outcome::ReadOutcome;
use crate::session::{Connector, MySqlConnector};

/// One batch to run. `file` takes precedence over `sql`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, alias = "Location", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_ssm_parameter_name: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl InvocationRequest {
    pub fn overrides(&self) -> ConnectionOverrides {
        ConnectionOverrides {
            dsn: self.dsn.clone(),
            user: self.user.clone(),
            port: self.port,
            host: self.host.clone(),
            database: self.database.clone(),
            location: self.location.clone(),
            password_ssm_parameter_name: self.password_ssm_parameter_name.clone(),
            ..ConnectionOverrides::default()
        }
    }
}

/// Rows returned by one read statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResults {
    pub query: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl From<&ReadOutcome> for QueryResults {
    fn from(read: &ReadOutcome) -> Self {
        Self {
            query: read.statement.clone(),
            columns: read.columns.clone(),
            rows: read.rows.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_results: Vec<QueryResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execute_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_execute_unix_milli: i64,
}

/// Runs each request against a fresh executer derived from a shared base config.
pub struct InvocationHandler {
    base: ConnectionConfig,
    resolver: CredentialResolver,
    connector: Arc<dyn Connector>,
}

impl InvocationHandler {
    /// Handler connecting to MySQL with the process-wide secret fetcher.
    pub fn new(base: ConnectionConfig) -> Self {
        Self::with_parts(base, CredentialResolver::global(), Arc::new(MySqlConnector))
    }

    pub fn with_parts(base: ConnectionConfig, resolver: CredentialResolver, connector: Arc<dyn Connector>) -> Self {
        Self {
            base,
            resolver,
            connector,
        }
    }

    pub fn base(&self) -> &ConnectionConfig {
        &self.base
    }

    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, BatchError> {
        let script = match (non_empty(&request.file), non_empty(&request.sql)) {
            (Some(path), _) => tokio::fs::read_to_string(path).await?,
            (None, Some(sql)) => sql.to_string(),
            (None, None) => {
                info!("nothing to do");
                return Ok(InvocationResponse::default());
            }
        };

        let config = self.base.with_overrides(&request.overrides());
        let executer = Executer::connect_with(&config, &self.resolver, self.connector.as_ref(), cancel).await?;

        let result = executer.execute(cancel, &script, &request.vars).await;
        if let Err(e) = executer.close().await {
            warn!(error = %e, "close after invocation failed");
        }
        let result = result?;

        Ok(InvocationResponse {
            query_results: result.reads().map(QueryResults::from).collect(),
            last_execute_time: Some(result.last_execute_time),
            last_execute_unix_milli: result.last_execute_unix_milli,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

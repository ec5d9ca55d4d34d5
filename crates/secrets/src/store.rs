//! Secret store boundary and the AWS SSM Parameter Store backend.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ssm::error::DisplayErrorContext;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::SecretError;

/// A remote store that maps a secret name to its raw string value.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the raw value stored under `name`.
    async fn get_secret(&self, name: &str) -> Result<String, SecretError>;

    /// Human-readable backend name for logs.
    fn store_name(&self) -> &str;
}

/// Reads `SecureString` parameters from AWS SSM Parameter Store.
///
/// The SDK client is built lazily on first use from the default AWS
/// credential chain, so constructing the store never touches the network.
pub struct SsmParameterStore {
    region: Option<String>,
    client: OnceCell<aws_sdk_ssm::Client>,
}

impl SsmParameterStore {
    /// Use the region from the default AWS config chain.
    pub fn new() -> Self {
        Self {
            region: None,
            client: OnceCell::new(),
        }
    }

    /// Pin the SSM region instead of relying on the environment.
    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            client: OnceCell::new(),
        }
    }

    /// Wrap an already configured SDK client.
    pub fn from_client(client: aws_sdk_ssm::Client) -> Self {
        Self {
            region: None,
            client: OnceCell::from(client),
        }
    }

    async fn client(&self) -> &aws_sdk_ssm::Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.region {
                    loader = loader.region(aws_sdk_ssm::config::Region::new(region.clone()));
                }
                let aws_cfg = loader.load().await;
                info!(region = ?aws_cfg.region(), "SSM client initialised");
                aws_sdk_ssm::Client::new(&aws_cfg)
            })
            .await
    }
}

impl Default for SsmParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for SsmParameterStore {
    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        debug!(parameter = %name, "GetParameter");
        let output = self
            .client()
            .await
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| SecretError::FetchFailed {
                name: name.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        output
            .parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| SecretError::FetchFailed {
                name: name.to_string(),
                reason: "parameter has no value".into(),
            })
    }

    fn store_name(&self) -> &str {
        "ssm"
    }
}

pub mod config;
pub mod error;
pub mod resolver;

pub use config::{load_dotenv, ConnectionConfig, ConnectionOverrides};
pub use error::ConfigError;
pub use resolver::CredentialResolver;

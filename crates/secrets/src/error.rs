/// Errors that can occur while resolving a secret.
///
/// `Clone` because a single coalesced fetch hands the same outcome to every
/// caller that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    /// The remote store rejected the request (network, auth, missing parameter).
    #[error("fetch secret `{name}` failed: {reason}")]
    FetchFailed { name: String, reason: String },

    /// The remote store did not answer within the fetch timeout.
    #[error("fetch secret `{name}` timed out after {seconds}s")]
    FetchTimeout { name: String, seconds: u64 },

    /// The secret is a JSON object but the requested key is unusable.
    #[error("secret `{name}` is json, but `{key}` {problem}")]
    BadSecretShape {
        name: String,
        key: String,
        problem: String,
    },
}

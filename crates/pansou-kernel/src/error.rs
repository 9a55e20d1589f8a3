//! Error types for the execution kernel and for plugins.

use thiserror::Error;

/// Errors a plugin may return from its search implementation.
///
/// The aggregator swallows every one of these after logging — plugin
/// failure only ever surfaces as degraded coverage, never as a failed
/// request.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// Transport-level failure (network, 5xx after retries, challenge).
    #[error(transparent)]
    Transport(#[from] pansou_transport::TransportError),

    /// The upstream answered but the payload did not parse as expected.
    /// Usually means the upstream changed its markup or API shape.
    #[error("failed to parse upstream response: {0}")]
    Parse(String),

    /// The upstream rejected the request at the application level.
    #[error("upstream rejected request: {0}")]
    Upstream(String),

    /// The caller is not allowed to use this plugin (e.g. referer not on
    /// the allow-list).
    #[error("request refused: {0}")]
    Refused(String),

    /// The synchronous search budget elapsed.
    #[error("search timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl PluginError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors raised while assembling the kernel itself.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A plugin could not build its HTTP client.
    #[error("plugin '{plugin}' construction failed: {reason}")]
    PluginConstruction {
        /// Plugin name.
        plugin: String,
        /// Reason for failure.
        reason: String,
    },
}
